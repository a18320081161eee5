use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;

use approx::assert_abs_diff_eq;
use smartnote_core::ratelimit::{
    MemoryStore, RateLimitStore, RateLimiter, SqliteStore, Tier, TierLimit, TierLimits,
};

fn temp_db(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!(
        "smartnote-it-{tag}-{}-{nanos}.db",
        std::process::id()
    ))
}

fn cleanup(path: &PathBuf) {
    for suffix in ["", "-wal", "-shm"] {
        let mut p = path.clone().into_os_string();
        p.push(suffix);
        let _ = std::fs::remove_file(p);
    }
}

fn five_per_minute(store: &dyn RateLimitStore) {
    for i in 0..5 {
        let out = store.allow("client:heavy", 5, 60.0, 0.0).expect("allow");
        assert!(out.allowed, "call {i} should pass");
        assert_eq!(out.remaining, 4 - i);
    }

    let sixth = store.allow("client:heavy", 5, 60.0, 0.0).expect("allow");
    assert!(!sixth.allowed);
    assert_eq!(sixth.remaining, 0);
    assert_abs_diff_eq!(sixth.retry_after, 60.0, epsilon = 1e-6);

    // Still inside the window.
    assert!(!store.allow("client:heavy", 5, 60.0, 59.0).expect("allow").allowed);

    let later = store.allow("client:heavy", 5, 60.0, 61.0).expect("allow");
    assert!(later.allowed);
    assert_eq!(later.remaining, 4);
}

#[test]
fn memory_store_five_per_minute() {
    five_per_minute(&MemoryStore::new());
}

#[test]
fn sqlite_store_five_per_minute() {
    let path = temp_db("window");
    let store = SqliteStore::new(&path).expect("open store");
    five_per_minute(&store);
    cleanup(&path);
}

#[test]
fn rejection_ends_when_oldest_hit_leaves_window() {
    let store = MemoryStore::new();
    for t in [0.0, 10.0, 20.0] {
        assert!(store.allow("k", 3, 30.0, t).expect("allow").allowed);
    }
    let rejected = store.allow("k", 3, 30.0, 25.0).expect("allow");
    assert!(!rejected.allowed);
    assert_abs_diff_eq!(rejected.retry_after, 5.0, epsilon = 1e-9);

    // Exactly at oldest + window the oldest hit is evicted.
    assert!(store.allow("k", 3, 30.0, 30.0).expect("allow").allowed);
    assert!(!store.allow("k", 3, 30.0, 30.5).expect("allow").allowed);
}

#[test]
fn concurrent_threads_never_over_admit_memory() {
    let store = Arc::new(MemoryStore::new());
    let barrier = Arc::new(Barrier::new(20));
    let handles: Vec<_> = (0..20)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.allow("shared", 5, 60.0, 1.0).expect("allow").allowed
            })
        })
        .collect();
    let allowed = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .filter(|&a| a)
        .count();
    assert_eq!(allowed, 5);
}

#[test]
fn concurrent_connections_never_over_admit_sqlite() {
    let path = temp_db("race");
    // Schema is created once up front; each thread then opens its own store
    // handle and connection, as separate processes would.
    SqliteStore::new(&path).expect("init store");

    let barrier = Arc::new(Barrier::new(20));
    let handles: Vec<_> = (0..20)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = SqliteStore::new(&path).expect("open store");
                barrier.wait();
                store.allow("shared", 5, 60.0, 1.0).expect("allow").allowed
            })
        })
        .collect();
    let allowed = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .filter(|&a| a)
        .count();
    assert_eq!(allowed, 5);
    cleanup(&path);
}

#[test]
fn limiter_applies_tier_limits_and_renders_headers() {
    let mut limits = TierLimits::default();
    limits.set(Tier::Heavy, TierLimit::new(2, 60));
    let limiter = RateLimiter::new(true, limits, Box::new(MemoryStore::new()));

    for _ in 0..2 {
        let d = limiter
            .check_at("127.0.0.1", "POST", "/summarize-stream", 100.0)
            .expect("check")
            .expect("limited");
        assert!(d.allowed);
        assert_eq!(d.tier, Tier::Heavy);
    }
    let rejected = limiter
        .check_at("127.0.0.1", "POST", "/summarize-rag", 130.5)
        .expect("check")
        .expect("limited");
    assert!(!rejected.allowed);
    assert_abs_diff_eq!(rejected.retry_after, 29.5, epsilon = 1e-9);

    let headers = rejected.headers();
    assert!(headers.contains(&("X-RateLimit-Limit", "2".to_string())));
    assert!(headers.contains(&("X-RateLimit-Remaining", "0".to_string())));
    assert!(headers.contains(&("Retry-After", "30".to_string())));
    assert!(rejected.into_result().is_err());

    // Light tier is untouched.
    assert!(limiter
        .check_at("127.0.0.1", "GET", "/health", 130.5)
        .expect("check")
        .is_some_and(|d| d.allowed && d.limit == 120));
}

//! Sliding-window rate limiting per client and traffic tier.
//!
//! Requests are classified into a [`Tier`] by path, then admitted against the
//! bucket `"{client}:{tier}"`. The bucket store is pluggable:
//! [`MemoryStore`] for a single process, [`SqliteStore`] when several
//! processes on one machine must share a budget.

pub mod window;
#[cfg(feature = "sqlite-store")]
pub mod sqlite;

pub use window::{MemoryStore, SlidingWindow};
#[cfg(feature = "sqlite-store")]
pub use sqlite::SqliteStore;

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SmartNoteError};

/// Result of one evict-check-record step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowOutcome {
    pub allowed: bool,
    pub remaining: u32,
    /// Seconds until the oldest hit leaves the window; `0.0` when allowed.
    pub retry_after: f64,
}

/// Bucket storage. `allow` must be atomic per bucket.
pub trait RateLimitStore: Send + Sync {
    fn allow(
        &self,
        bucket_key: &str,
        max_requests: u32,
        window_secs: f64,
        now: f64,
    ) -> Result<WindowOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Heavy,
    Moderate,
    Light,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Heavy, Tier::Moderate, Tier::Light];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Heavy => "heavy",
            Tier::Moderate => "moderate",
            Tier::Light => "light",
        }
    }

    pub fn env_key(self) -> &'static str {
        match self {
            Tier::Heavy => "RATE_LIMIT_HEAVY",
            Tier::Moderate => "RATE_LIMIT_MODERATE",
            Tier::Light => "RATE_LIMIT_LIGHT",
        }
    }

    pub fn default_limit(self) -> TierLimit {
        match self {
            Tier::Heavy => TierLimit::new(6, 60),
            Tier::Moderate => TierLimit::new(30, 60),
            Tier::Light => TierLimit::new(120, 60),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Longest prefix wins, so the more specific routes come first.
const TIER_PREFIXES: &[(&str, Tier)] = &[
    ("/summarize-stream-rag", Tier::Heavy),
    ("/summarize-stream", Tier::Heavy),
    ("/summarize-rag", Tier::Heavy),
    ("/summarize", Tier::Heavy),
    ("/transcribe", Tier::Heavy),
    ("/consultations/", Tier::Moderate),
    ("/setup/download", Tier::Moderate),
    ("/rag/", Tier::Moderate),
];

/// Map a request path to its tier by longest matching prefix.
pub fn classify(path: &str) -> Tier {
    TIER_PREFIXES
        .iter()
        .filter(|(prefix, _)| path.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|&(_, tier)| tier)
        .unwrap_or(Tier::Light)
}

/// `max_requests` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl TierLimit {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl FromStr for TierLimit {
    type Err = String;

    /// Parse `"N/S"`, e.g. `"6/60"`. Both parts must be positive.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (n, w) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("expected N/SECONDS, got '{s}'"))?;
        let max_requests: u32 = n
            .trim()
            .parse()
            .map_err(|e| format!("bad request count '{n}': {e}"))?;
        let window_secs: u64 = w
            .trim()
            .parse()
            .map_err(|e| format!("bad window '{w}': {e}"))?;
        if max_requests == 0 || window_secs == 0 {
            return Err(format!("limit must be positive, got '{s}'"));
        }
        Ok(Self::new(max_requests, window_secs))
    }
}

impl fmt::Display for TierLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.window_secs)
    }
}

/// Limits for all three tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub heavy: TierLimit,
    pub moderate: TierLimit,
    pub light: TierLimit,
}

impl TierLimits {
    pub fn get(&self, tier: Tier) -> TierLimit {
        match tier {
            Tier::Heavy => self.heavy,
            Tier::Moderate => self.moderate,
            Tier::Light => self.light,
        }
    }

    pub fn set(&mut self, tier: Tier, limit: TierLimit) {
        match tier {
            Tier::Heavy => self.heavy = limit,
            Tier::Moderate => self.moderate = limit,
            Tier::Light => self.light = limit,
        }
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            heavy: Tier::Heavy.default_limit(),
            moderate: Tier::Moderate.default_limit(),
            light: Tier::Light.default_limit(),
        }
    }
}

/// A limiter verdict, ready to be rendered as response headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub tier: Tier,
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after: f64,
}

impl RateLimitDecision {
    /// `Retry-After` in whole seconds: floor plus one, so a client that
    /// honours it never arrives early.
    pub fn retry_after_header(&self) -> u64 {
        self.retry_after.max(0.0).floor() as u64 + 1
    }

    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_header().to_string()));
        }
        headers
    }

    /// `Ok(self)` when allowed, otherwise `SmartNoteError::RateLimited`.
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(SmartNoteError::RateLimited {
                tier: self.tier.to_string(),
                retry_after: Duration::from_secs_f64(self.retry_after.max(0.0)),
            })
        }
    }
}

/// Per-client, per-tier admission in front of every command.
pub struct RateLimiter {
    enabled: bool,
    limits: TierLimits,
    store: Box<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(enabled: bool, limits: TierLimits, store: Box<dyn RateLimitStore>) -> Self {
        Self {
            enabled,
            limits,
            store,
        }
    }

    /// Enabled limiter with default tiers and a process-local store.
    pub fn in_memory() -> Self {
        Self::new(true, TierLimits::default(), Box::new(MemoryStore::new()))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limits(&self) -> &TierLimits {
        &self.limits
    }

    /// Check a request at the current wall-clock time.
    ///
    /// Returns `None` when the request bypasses limiting (limiter disabled,
    /// or a CORS preflight).
    pub fn check(&self, client: &str, method: &str, path: &str) -> Result<Option<RateLimitDecision>> {
        self.check_at(client, method, path, unix_now())
    }

    pub fn check_at(
        &self,
        client: &str,
        method: &str,
        path: &str,
        now: f64,
    ) -> Result<Option<RateLimitDecision>> {
        if !self.enabled || method.eq_ignore_ascii_case("OPTIONS") {
            return Ok(None);
        }
        let tier = classify(path);
        let limit = self.limits.get(tier);
        let key = format!("{client}:{tier}");
        let outcome = self
            .store
            .allow(&key, limit.max_requests, limit.window_secs as f64, now)?;

        if outcome.allowed {
            debug!(client, %tier, remaining = outcome.remaining, "request admitted");
        } else {
            warn!(
                client,
                %tier,
                path,
                retry_after = outcome.retry_after,
                "rate limit exceeded"
            );
        }
        Ok(Some(RateLimitDecision {
            tier,
            allowed: outcome.allowed,
            limit: limit.max_requests,
            remaining: outcome.remaining,
            retry_after: outcome.retry_after,
        }))
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.enabled)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Seconds since the Unix epoch. Wall clock, so that separate processes
/// sharing a store agree on timestamps.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

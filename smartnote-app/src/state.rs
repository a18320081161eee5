//! Host application state.
//!
//! One `AppState` is built at startup and shared by every command handler.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use smartnote_core::{RateLimiter, SmartNoteEngine, SystemStatus};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::settings::AppSettings;

/// Shared application state, available in every command handler.
pub struct AppState {
    /// The core engine.
    pub engine: Arc<SmartNoteEngine>,
    /// Per-client, per-tier admission applied before any engine call.
    pub limiter: Arc<RateLimiter>,
    /// Persisted app settings cache.
    pub settings: Arc<Mutex<AppSettings>>,
    /// Absolute path to `settings.json`.
    pub settings_path: PathBuf,
    /// Rolling per-command latency metrics.
    pub perf_metrics: Arc<Mutex<PerfMetrics>>,
    /// Requests turned away by the limiter.
    pub rate_limited: Arc<AtomicUsize>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        engine: Arc<SmartNoteEngine>,
        limiter: Arc<RateLimiter>,
        settings: AppSettings,
        settings_path: PathBuf,
    ) -> Self {
        Self {
            engine,
            limiter,
            settings: Arc::new(Mutex::new(settings)),
            settings_path,
            perf_metrics: Arc::new(Mutex::new(PerfMetrics::default())),
            rate_limited: Arc::new(AtomicUsize::new(0)),
            started_at: Utc::now(),
        }
    }

    pub fn record_latency(&self, command: CommandKind, elapsed_ms: f64) {
        self.perf_metrics.lock().record(command, elapsed_ms);
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            workers: self.engine.status(),
            latency: self.perf_metrics.lock().snapshot(),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0),
        }
    }
}

/// Commands with latency windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Summarize,
    SummarizeRag,
    SummarizeStream,
    Transcribe,
}

impl CommandKind {
    const COUNT: usize = 4;

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub workers: SystemStatus,
    pub latency: PerfMetricsSnapshot,
    pub rate_limited: usize,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

/// Latency of one command: lifetime count, mean and max, plus nearest-rank
/// percentiles over the most recent samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfStageSnapshot {
    pub count: usize,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfMetricsSnapshot {
    pub summarize_ms: PerfStageSnapshot,
    pub summarize_rag_ms: PerfStageSnapshot,
    pub summarize_stream_ms: PerfStageSnapshot,
    pub transcribe_ms: PerfStageSnapshot,
}

/// Samples kept per command for the percentiles.
const LATENCY_SAMPLES: usize = 512;

#[derive(Debug, Default)]
pub struct PerfMetrics {
    rings: [LatencyRing; CommandKind::COUNT],
}

impl PerfMetrics {
    pub fn record(&mut self, command: CommandKind, elapsed_ms: f64) {
        self.rings[command.slot()].push(elapsed_ms);
    }

    pub fn snapshot(&self) -> PerfMetricsSnapshot {
        let of = |kind: CommandKind| self.rings[kind.slot()].summary();
        PerfMetricsSnapshot {
            summarize_ms: of(CommandKind::Summarize),
            summarize_rag_ms: of(CommandKind::SummarizeRag),
            summarize_stream_ms: of(CommandKind::SummarizeStream),
            transcribe_ms: of(CommandKind::Transcribe),
        }
    }
}

/// Fixed ring that overwrites its oldest sample once full.
#[derive(Debug, Default)]
struct LatencyRing {
    ring: Vec<f64>,
    next: usize,
    total: usize,
    sum_ms: f64,
    max_ms: f64,
}

impl LatencyRing {
    fn push(&mut self, elapsed_ms: f64) {
        // NaN and negative readings count as zero.
        let ms = if elapsed_ms.is_finite() { elapsed_ms.max(0.0) } else { 0.0 };
        if self.ring.len() < LATENCY_SAMPLES {
            self.ring.push(ms);
        } else {
            self.ring[self.next] = ms;
        }
        self.next = (self.next + 1) % LATENCY_SAMPLES;
        self.total += 1;
        self.sum_ms += ms;
        self.max_ms = self.max_ms.max(ms);
    }

    fn summary(&self) -> PerfStageSnapshot {
        if self.total == 0 {
            return PerfStageSnapshot::default();
        }
        let mut sorted = self.ring.clone();
        sorted.sort_by(f64::total_cmp);
        PerfStageSnapshot {
            count: self.total,
            mean_ms: self.sum_ms / self.total as f64,
            p50_ms: nearest_rank(&sorted, 0.50),
            p95_ms: nearest_rank(&sorted, 0.95),
            p99_ms: nearest_rank(&sorted, 0.99),
            max_ms: self.max_ms,
        }
    }
}

/// `sorted` must be non-empty and ascending.
fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    let last = sorted.len() - 1;
    let idx = (last as f64 * p).round() as usize;
    sorted[idx.min(last)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_reports_zeroes() {
        let snap = LatencyRing::default().summary();
        assert_eq!(snap, PerfStageSnapshot::default());
    }

    #[test]
    fn percentiles_follow_sorted_samples() {
        let mut ring = LatencyRing::default();
        for v in (1..=100).rev() {
            ring.push(v as f64);
        }
        let snap = ring.summary();
        assert_eq!(snap.count, 100);
        assert_eq!(snap.p50_ms, 51.0);
        assert_eq!(snap.p95_ms, 95.0);
        assert_eq!(snap.p99_ms, 99.0);
        assert_eq!(snap.max_ms, 100.0);
        assert!((snap.mean_ms - 50.5).abs() < 1e-9);
    }

    #[test]
    fn ring_overwrites_oldest_once_full() {
        let mut ring = LatencyRing::default();
        ring.push(900.0);
        for _ in 0..LATENCY_SAMPLES {
            ring.push(1.0);
        }
        ring.push(f64::NAN);
        assert_eq!(ring.ring.len(), LATENCY_SAMPLES);
        assert_eq!(ring.total, LATENCY_SAMPLES + 2);
        // The 900 ms sample left the percentiles but still counts as max.
        let snap = ring.summary();
        assert_eq!(snap.p99_ms, 1.0);
        assert_eq!(snap.max_ms, 900.0);
    }

    #[test]
    fn commands_have_separate_windows() {
        let mut m = PerfMetrics::default();
        m.record(CommandKind::Transcribe, 40.0);
        m.record(CommandKind::Summarize, 10.0);
        m.record(CommandKind::Summarize, 20.0);
        let snap = m.snapshot();
        assert_eq!(snap.summarize_ms.count, 2);
        assert_eq!(snap.transcribe_ms.max_ms, 40.0);
        assert_eq!(snap.summarize_stream_ms.count, 0);
    }
}

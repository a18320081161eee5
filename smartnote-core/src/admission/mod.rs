//! Admission control for the local language model.
//!
//! ```text
//! acquire(priority, timeout, flag)
//!     │
//!     ├─ running < max ──────────────► GatePermit (slot held)
//!     │
//!     └─ enqueue (priority, sequence) ─► wait ─┬─ granted by release ─► GatePermit
//!                                              ├─ timeout ─► remove self ─► Busy
//!                                              └─ skipped (flag set) ─► Cancelled
//! ```
//!
//! Dropping a `GatePermit` releases its slot and hands it to the next
//! eligible waiter. Cancellation of queued waiters is lazy: the flag is only
//! inspected when a release scans the queue.

pub mod gate;
pub mod queue;

pub use gate::{GatePermit, GateStatus, InferenceGate};

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};

/// Request class. Lower rank is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// A user is watching: streaming or one-shot summarization.
    Interactive,
    /// Background or chunked work.
    Batch,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Priority::Interactive => 0,
            Priority::Batch => 1,
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Interactive => f.write_str("interactive"),
            Priority::Batch => f.write_str("batch"),
        }
    }
}

/// Shared, advisory cancellation signal.
///
/// Clones observe the same flag. Checked by the gate when a release scans
/// the queue, and by the token loop of an in-flight streaming generation.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_sorts_before_batch() {
        assert!(Priority::Interactive < Priority::Batch);
        let mut v = vec![Priority::Batch, Priority::Interactive, Priority::Batch];
        v.sort();
        assert_eq!(v[0], Priority::Interactive);
    }

    #[test]
    fn cancellation_flag_is_shared_between_clones() {
        let flag = CancellationFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());
        flag.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn priority_serializes_lowercase() {
        let json = serde_json::to_string(&Priority::Interactive).expect("serialize priority");
        assert_eq!(json, r#""interactive""#);
    }
}

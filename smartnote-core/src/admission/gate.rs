//! `InferenceGate`: priority-ordered admission to N model slots.
//!
//! All state (`running`, the waiter queue) lives behind one
//! `parking_lot::Mutex` that is never held across an `.await`. Waiters park
//! on a `oneshot` receiver; a release resolves the sender of the first
//! eligible waiter while still holding the lock, so a grant and a timeout
//! withdrawal can never both claim the same entry.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::queue::{WaiterKey, WaiterQueue};
use super::{CancellationFlag, Priority};
use crate::error::{Result, SmartNoteError};

/// Point-in-time view of the gate.
///
/// `waiting` includes cancelled entries that no release has swept yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStatus {
    pub max_concurrency: usize,
    pub running: usize,
    pub waiting: usize,
    pub is_busy: bool,
}

struct Waiter {
    cancel: CancellationFlag,
    grant: oneshot::Sender<()>,
}

struct GateState {
    running: usize,
    waiters: WaiterQueue<Waiter>,
}

struct GateInner {
    max_concurrency: usize,
    state: Mutex<GateState>,
}

impl GateInner {
    /// Free one slot and pass it to the first non-cancelled waiter.
    fn release_slot(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.running > 0, "release without a held slot");
        state.running = state.running.saturating_sub(1);

        while let Some((key, waiter)) = state.waiters.pop_front() {
            if waiter.cancel.is_cancelled() {
                debug!(
                    priority = %key.priority,
                    sequence = key.sequence,
                    "skipping cancelled waiter"
                );
                continue;
            }
            if waiter.grant.send(()).is_ok() {
                state.running += 1;
                debug!(
                    priority = %key.priority,
                    sequence = key.sequence,
                    running = state.running,
                    waiting = state.waiters.len(),
                    "slot handed to waiter"
                );
                return;
            }
            debug!(sequence = key.sequence, "waiter dropped before grant");
        }

        debug!(running = state.running, "slot freed, no eligible waiter");
    }
}

/// Admission gate shared by every caller of the language model.
///
/// Cheap to clone; clones share the same slots and queue.
#[derive(Clone)]
pub struct InferenceGate {
    inner: Arc<GateInner>,
}

impl InferenceGate {
    /// Create a gate with `max_concurrency` slots (at least one).
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                max_concurrency: max_concurrency.max(1),
                state: Mutex::new(GateState {
                    running: 0,
                    waiters: WaiterQueue::new(),
                }),
            }),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Wait for a slot.
    ///
    /// # Errors
    /// - `SmartNoteError::Busy` if no slot was granted within `timeout`. The
    ///   queue entry is removed before returning, so the slot can never be
    ///   granted to this caller afterwards.
    /// - `SmartNoteError::Cancelled` if `cancel` was set and a release skipped
    ///   this waiter.
    pub async fn acquire(
        &self,
        priority: Priority,
        timeout: Duration,
        cancel: &CancellationFlag,
    ) -> Result<GatePermit> {
        let (key, rx) = {
            let mut state = self.inner.state.lock();
            if state.running < self.inner.max_concurrency {
                state.running += 1;
                debug!(
                    %priority,
                    running = state.running,
                    "slot granted immediately"
                );
                return Ok(GatePermit::new(Arc::clone(&self.inner)));
            }

            let (tx, rx) = oneshot::channel();
            let key = state.waiters.push(
                priority,
                Waiter {
                    cancel: cancel.clone(),
                    grant: tx,
                },
            );
            debug!(
                %priority,
                sequence = key.sequence,
                running = state.running,
                waiting = state.waiters.len(),
                "all slots busy, queued"
            );
            (key, rx)
        };

        let mut pending = PendingAdmission {
            gate: &self.inner,
            key,
            rx,
            settled: false,
        };

        let outcome = tokio::time::timeout(timeout, &mut pending.rx).await;
        match outcome {
            Ok(Ok(())) => {
                pending.settled = true;
                Ok(GatePermit::new(Arc::clone(&self.inner)))
            }
            Ok(Err(_)) => {
                pending.settled = true;
                Err(SmartNoteError::Cancelled)
            }
            Err(_) => match pending.withdraw() {
                Withdrawal::Removed => {
                    warn!(
                        %priority,
                        sequence = key.sequence,
                        timeout_ms = timeout.as_millis() as u64,
                        "admission timed out"
                    );
                    Err(SmartNoteError::busy(
                        "llm",
                        format!(
                            "all {} inference slot(s) occupied for >{:?}",
                            self.inner.max_concurrency, timeout
                        ),
                    ))
                }
                // The grant landed between the timer firing and the withdrawal.
                Withdrawal::Granted => Ok(GatePermit::new(Arc::clone(&self.inner))),
                Withdrawal::Skipped => Err(SmartNoteError::Cancelled),
            },
        }
    }

    /// Snapshot taken under the state lock.
    pub fn status(&self) -> GateStatus {
        let state = self.inner.state.lock();
        GateStatus {
            max_concurrency: self.inner.max_concurrency,
            running: state.running,
            waiting: state.waiters.len(),
            is_busy: state.running >= self.inner.max_concurrency,
        }
    }
}

impl std::fmt::Debug for InferenceGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceGate")
            .field("status", &self.status())
            .finish()
    }
}

/// A held inference slot. Dropping it releases the slot.
#[must_use = "dropping the permit releases the slot immediately"]
pub struct GatePermit {
    gate: Arc<GateInner>,
}

impl GatePermit {
    fn new(gate: Arc<GateInner>) -> Self {
        Self { gate }
    }

    /// Release explicitly; equivalent to dropping.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release_slot();
    }
}

impl std::fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePermit").finish_non_exhaustive()
    }
}

enum Withdrawal {
    /// Entry was still queued and is now gone.
    Removed,
    /// A release granted the slot before we got the lock.
    Granted,
    /// A release discarded the entry because it was cancelled.
    Skipped,
}

/// Queue entry owned by an in-progress `acquire`.
///
/// If the `acquire` future is dropped mid-wait, `Drop` withdraws the entry
/// and gives back any slot that was granted in the meantime.
struct PendingAdmission<'a> {
    gate: &'a Arc<GateInner>,
    key: WaiterKey,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl PendingAdmission<'_> {
    fn withdraw(&mut self) -> Withdrawal {
        self.settled = true;
        {
            let mut state = self.gate.state.lock();
            if state.waiters.remove(&self.key).is_some() {
                return Withdrawal::Removed;
            }
        }
        // Entry was popped by a release, which resolved the sender under the lock.
        match self.rx.try_recv() {
            Ok(()) => Withdrawal::Granted,
            Err(_) => Withdrawal::Skipped,
        }
    }
}

impl Drop for PendingAdmission<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Withdrawal::Granted = self.withdraw() {
            debug!(sequence = self.key.sequence, "abandoned waiter returns granted slot");
            self.gate.release_slot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_waiting(gate: &InferenceGate, expected: usize) {
        for _ in 0..500 {
            if gate.status().waiting == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "gate never reached waiting={expected}, status={:?}",
            gate.status()
        );
    }

    #[tokio::test]
    async fn immediate_admission_when_slot_free() {
        let gate = InferenceGate::new(1);
        let flag = CancellationFlag::new();
        let permit = gate
            .acquire(Priority::Batch, Duration::from_millis(10), &flag)
            .await
            .expect("free slot");
        assert_eq!(
            gate.status(),
            GateStatus {
                max_concurrency: 1,
                running: 1,
                waiting: 0,
                is_busy: true,
            }
        );
        drop(permit);
        assert_eq!(gate.status().running, 0);
        assert!(!gate.status().is_busy);
    }

    #[tokio::test]
    async fn zero_concurrency_is_clamped_to_one() {
        let gate = InferenceGate::new(0);
        assert_eq!(gate.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn timeout_removes_waiter_and_reports_busy() {
        let gate = InferenceGate::new(1);
        let flag = CancellationFlag::new();
        let _held = gate
            .acquire(Priority::Interactive, Duration::from_secs(1), &flag)
            .await
            .expect("first slot");

        let err = gate
            .acquire(Priority::Interactive, Duration::from_millis(20), &flag)
            .await
            .expect_err("gate is full");
        assert!(matches!(err, SmartNoteError::Busy { .. }));
        assert_eq!(gate.status().waiting, 0);
    }

    #[tokio::test]
    async fn release_with_only_cancelled_waiters_frees_slot() {
        let gate = InferenceGate::new(1);
        let holder_flag = CancellationFlag::new();
        let held = gate
            .acquire(Priority::Interactive, Duration::from_secs(1), &holder_flag)
            .await
            .expect("first slot");

        let cancelled = CancellationFlag::new();
        let waiter = {
            let gate = gate.clone();
            let cancelled = cancelled.clone();
            tokio::spawn(async move {
                gate.acquire(Priority::Batch, Duration::from_secs(5), &cancelled)
                    .await
            })
        };
        wait_for_waiting(&gate, 1).await;
        cancelled.cancel();
        // Lazy: still counted until a release sweeps it.
        assert_eq!(gate.status().waiting, 1);

        drop(held);
        let outcome = waiter.await.expect("waiter task");
        assert!(matches!(outcome, Err(SmartNoteError::Cancelled)));
        assert_eq!(gate.status().running, 0);
        assert_eq!(gate.status().waiting, 0);
    }

    #[tokio::test]
    async fn dropped_acquire_future_leaves_no_ghost_waiter() {
        let gate = InferenceGate::new(1);
        let flag = CancellationFlag::new();
        let held = gate
            .acquire(Priority::Interactive, Duration::from_secs(1), &flag)
            .await
            .expect("first slot");

        let waiter = {
            let gate = gate.clone();
            let flag = flag.clone();
            tokio::spawn(async move {
                gate.acquire(Priority::Interactive, Duration::from_secs(30), &flag)
                    .await
                    .map(|_| ())
            })
        };
        wait_for_waiting(&gate, 1).await;
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(gate.status().waiting, 0);
        drop(held);
        assert_eq!(gate.status().running, 0);
    }
}

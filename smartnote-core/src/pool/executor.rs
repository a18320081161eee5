//! Fixed-size thread executor fed by a `crossbeam_channel`.
//!
//! Each named pool owns one executor so blocking work of one category
//! (transcription, retrieval) never occupies threads of another, nor the
//! Tokio runtime's blocking pool.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{Result, SmartNoteError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Outcome delivered back to the submitter; `Err` carries a panic payload.
pub type JobOutcome<T> = thread::Result<T>;

pub struct ThreadExecutor {
    name: String,
    workers: usize,
    /// `None` once shut down; workers exit when the channel drains.
    sender: Mutex<Option<Sender<Job>>>,
}

impl ThreadExecutor {
    /// Spawn `workers` threads named `pool-<name>-<i>`.
    ///
    /// # Errors
    /// Returns `SmartNoteError::Io` if the OS refuses to spawn a thread.
    pub fn new(name: &str, workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = unbounded::<Job>();
        for i in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            thread::Builder::new()
                .name(format!("pool-{name}-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })?;
        }
        debug!(pool = name, workers, "executor threads started");
        Ok(Self {
            name: name.to_string(),
            workers,
            sender: Mutex::new(Some(tx)),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queue `f` on a worker thread. The returned receiver resolves with the
    /// closure's value, or with the panic payload if it panicked.
    pub fn submit<F, T>(&self, f: F) -> Result<oneshot::Receiver<JobOutcome<T>>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let name = self.name.clone();
        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f));
            if outcome.is_err() {
                error!(pool = %name, "worker task panicked");
            }
            let _ = tx.send(outcome);
        });

        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(SmartNoteError::Other(anyhow::anyhow!(
                "executor for pool '{}' is shut down",
                self.name
            )));
        };
        sender.send(job).map_err(|_| {
            SmartNoteError::Other(anyhow::anyhow!(
                "executor for pool '{}' has no live workers",
                self.name
            ))
        })?;
        Ok(rx)
    }

    /// Stop accepting work. Already-queued jobs still run; does not wait.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            debug!(pool = %self.name, "executor shut down");
        }
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadExecutor")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .finish()
    }
}

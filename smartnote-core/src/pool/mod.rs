//! Named worker pools for blocking, non-LLM work.
//!
//! Each pool pairs a counting semaphore (admission, FIFO) with its own
//! `ThreadExecutor` (execution), plus counters behind a separate lock for
//! status reporting. The semaphore permit and the `running` accounting move
//! into the job itself, so they are released when the work finishes on the
//! worker thread even if the awaiting caller has gone away.

pub mod executor;

pub use executor::ThreadExecutor;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{Result, SmartNoteError};

/// Construction parameters for one pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub name: String,
    pub description: String,
    pub concurrency: usize,
    /// Default admission wait when `run` is called without one.
    pub timeout: Duration,
}

impl PoolConfig {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            concurrency: concurrency.max(1),
            timeout,
        }
    }
}

/// Status of a single pool, as reported under its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub description: String,
    pub concurrency: usize,
    pub running: usize,
    pub queued: usize,
    pub total_processed: u64,
    pub total_errors: u64,
    pub is_busy: bool,
}

#[derive(Debug, Default)]
struct PoolCounters {
    running: usize,
    queued: usize,
    total_processed: u64,
    total_errors: u64,
}

type SharedCounters = Arc<Mutex<PoolCounters>>;

/// Holds one `queued` count while waiting for the semaphore.
struct QueuedGuard {
    counters: SharedCounters,
    armed: bool,
}

impl QueuedGuard {
    fn enter(counters: &SharedCounters) -> Self {
        counters.lock().queued += 1;
        Self {
            counters: Arc::clone(counters),
            armed: true,
        }
    }

    /// Move from queued to running in one step under the counters lock.
    fn admit(mut self) -> RunningGuard {
        self.armed = false;
        {
            let mut c = self.counters.lock();
            c.queued = c.queued.saturating_sub(1);
            c.running += 1;
            c.total_processed += 1;
        }
        RunningGuard {
            counters: Arc::clone(&self.counters),
            failed: false,
        }
    }
}

impl Drop for QueuedGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut c = self.counters.lock();
            c.queued = c.queued.saturating_sub(1);
        }
    }
}

/// Holds one `running` count for the lifetime of the job.
struct RunningGuard {
    counters: SharedCounters,
    failed: bool,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut c = self.counters.lock();
        c.running = c.running.saturating_sub(1);
        if self.failed || std::thread::panicking() {
            c.total_errors += 1;
        }
    }
}

/// One bounded-concurrency pool with its own executor threads.
pub struct WorkerPool {
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    executor: ThreadExecutor,
    counters: SharedCounters,
}

impl WorkerPool {
    /// # Errors
    /// Fails only if the executor threads cannot be spawned.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let executor = ThreadExecutor::new(&config.name, config.concurrency)?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            executor,
            counters: Arc::new(Mutex::new(PoolCounters::default())),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    /// Run blocking `f` on this pool, waiting at most `timeout` (or the
    /// pool default) for a slot.
    ///
    /// # Errors
    /// - `SmartNoteError::Busy` when no slot frees up in time.
    /// - Whatever `f` returns; a panic inside `f` becomes `Other`.
    pub async fn run<F, T>(&self, f: F, timeout: Option<Duration>) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let timeout = timeout.unwrap_or(self.config.timeout);
        let queued = QueuedGuard::enter(&self.counters);

        let permit =
            match tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(SmartNoteError::busy(
                        format!("worker pool '{}'", self.config.name),
                        "pool is closed",
                    ))
                }
                Err(_) => {
                    warn!(
                        pool = %self.config.name,
                        concurrency = self.config.concurrency,
                        timeout_ms = timeout.as_millis() as u64,
                        "worker pool admission timed out"
                    );
                    return Err(SmartNoteError::busy(
                        format!("worker pool '{}'", self.config.name),
                        format!(
                            "all {} slot(s) occupied for >{:?}",
                            self.config.concurrency, timeout
                        ),
                    ));
                }
            };

        let running = queued.admit();
        debug!(pool = %self.config.name, "task admitted");

        let rx = match self.executor.submit(move || {
            let _permit = permit;
            // Bind the whole guard so it drops here, on the worker thread.
            let mut running = running;
            let result = f();
            if result.is_err() {
                running.failed = true;
            }
            result
        }) {
            Ok(rx) => rx,
            Err(e) => {
                // The job (and its guards) was dropped without running.
                self.counters.lock().total_errors += 1;
                return Err(e);
            }
        };

        match rx.await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(SmartNoteError::Other(anyhow::anyhow!(
                "task in worker pool '{}' panicked",
                self.config.name
            ))),
            Err(_) => Err(SmartNoteError::Other(anyhow::anyhow!(
                "worker pool '{}' dropped the task before it ran",
                self.config.name
            ))),
        }
    }

    pub fn status(&self) -> PoolStatus {
        let c = self.counters.lock();
        PoolStatus {
            description: self.config.description.clone(),
            concurrency: self.config.concurrency,
            running: c.running,
            queued: c.queued,
            total_processed: c.total_processed,
            total_errors: c.total_errors,
            is_busy: c.running >= self.config.concurrency,
        }
    }

    /// Stop accepting work and close admission. Does not wait for running
    /// tasks.
    pub fn shutdown(&self) {
        self.semaphore.close();
        self.executor.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.config.name)
            .field("status", &self.status())
            .finish()
    }
}

/// Registry of named pools.
#[derive(Debug, Default)]
pub struct WorkerPools {
    pools: BTreeMap<String, WorkerPool>,
}

impl WorkerPools {
    /// Build every pool in `configs`. A later config with a duplicate name
    /// replaces the earlier one.
    pub fn new(configs: impl IntoIterator<Item = PoolConfig>) -> Result<Self> {
        let mut pools = BTreeMap::new();
        for config in configs {
            let pool = WorkerPool::new(config)?;
            pools.insert(pool.name().to_string(), pool);
        }
        let summary: Vec<String> = pools
            .values()
            .map(|p| format!("{}={}", p.name(), p.concurrency()))
            .collect();
        info!(pools = %summary.join(", "), "worker pools ready");
        Ok(Self { pools })
    }

    pub fn get(&self, name: &str) -> Result<&WorkerPool> {
        self.pools
            .get(name)
            .ok_or_else(|| SmartNoteError::UnknownPool(name.to_string()))
    }

    /// Run `f` on the pool called `pool`.
    ///
    /// # Errors
    /// `UnknownPool` if no such pool exists; otherwise as `WorkerPool::run`.
    pub async fn run<F, T>(&self, pool: &str, f: F, timeout: Option<Duration>) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.get(pool)?.run(f, timeout).await
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    /// Status of every pool keyed by name.
    pub fn status(&self) -> BTreeMap<String, PoolStatus> {
        self.pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.status()))
            .collect()
    }

    pub fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.shutdown();
        }
        info!("worker pools shut down");
    }
}

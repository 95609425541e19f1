//! Builder-style configuration for the polling machinery.
//!
//! For a default configuration, `Builder::new().build(driver)` is all you need!

use std::sync::Arc;
use std::time::Duration;

use crate::driver::{Driver, MAX_CONTEXTS_PER_THREAD};
use crate::pool::WorkerPool;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BuildError {
    /// A worker can't multiplex more than [`MAX_CONTEXTS_PER_THREAD`] contexts, nor zero.
    #[error("contexts per worker must be within 1..={max}, got {0}", max = MAX_CONTEXTS_PER_THREAD)]
    ContextLimit(usize),
    /// The pool would give up before trying a single worker.
    #[error("acquire retries must be nonzero")]
    ZeroRetries,
}

/// Validated settings shared by a [`WorkerPool`] and all of its workers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Moves starting less than this many ticks after a cached batch's first sample join it.
    pub coalesce_window: u32,
    /// How recent, in ticks, an in-range event must be for
    /// [`ContextGroup::consider_in_range`](crate::group::ContextGroup::consider_in_range).
    pub in_range_window: u32,
    /// Idle wait before the out-of-range sweep.
    pub wait_timeout: Duration,
    /// Wait bound while a move batch is cached.
    pub flush_delay: Duration,
    pub max_contexts_per_worker: usize,
    pub acquire_retries: u32,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            coalesce_window: 8,
            in_range_window: 500,
            wait_timeout: Duration::from_millis(100),
            flush_delay: Duration::from_millis(8),
            max_contexts_per_worker: MAX_CONTEXTS_PER_THREAD,
            acquire_retries: 10,
        }
    }
}

/// Pre-construction configuration for a [`WorkerPool`].
#[derive(Default)]
pub struct Builder {
    config: Config,
}

/// # Configuration
impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// Ticks from a batch's first move within which later moves are merged. Defaults to 8.
    /// Zero disables coalescing.
    #[must_use]
    pub fn coalesce_window(mut self, ticks: u32) -> Self {
        self.config.coalesce_window = ticks;
        self
    }
    /// Defaults to 500 ticks.
    #[must_use]
    pub fn in_range_window(mut self, ticks: u32) -> Self {
        self.config.in_range_window = ticks;
        self
    }
    /// How long an idle worker waits before forcing every context out of range. Defaults to
    /// 100ms.
    #[must_use]
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = timeout;
        self
    }
    /// Longest a coalesced move batch may sit waiting for more samples. Defaults to 8ms.
    #[must_use]
    pub fn flush_delay(mut self, delay: Duration) -> Self {
        self.config.flush_delay = delay;
        self
    }
    /// Lower the per-thread context capacity. It can't be raised above the platform limit.
    #[must_use]
    pub fn max_contexts_per_worker(mut self, max: usize) -> Self {
        self.config.max_contexts_per_worker = max;
        self
    }
    /// How many workers the pool tries before giving up on a context. Defaults to 10.
    #[must_use]
    pub fn acquire_retries(mut self, retries: u32) -> Self {
        self.config.acquire_retries = retries;
        self
    }
}
/// # Finishing
impl Builder {
    /// Validate the configuration and create an empty pool over `driver`. No threads are
    /// started until the first context or group asks for one.
    // Silly clippy, it's a self-describing err type!
    #[allow(clippy::missing_errors_doc)]
    pub fn build(self, driver: Arc<dyn Driver>) -> Result<Arc<WorkerPool>, BuildError> {
        let config = self.config;
        if !(1..=MAX_CONTEXTS_PER_THREAD).contains(&config.max_contexts_per_worker) {
            return Err(BuildError::ContextLimit(config.max_contexts_per_worker));
        }
        if config.acquire_retries == 0 {
            return Err(BuildError::ZeroRetries);
        }
        Ok(WorkerPool::new(driver, config))
    }
}

//! Process-wide set of polling threads.
//!
//! Workers are reused until full. The pool only holds them weakly: a worker lives as long as
//! some context or group is attached to it, and disposed workers are forgotten on the next
//! scan.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use smallvec::SmallVec;

use crate::builder::Config;
use crate::context::DeviceContext;
use crate::driver::Driver;
use crate::worker::{AddOutcome, PenWorker, WorkerId};

pub struct WorkerPool {
    workers: Mutex<Vec<Weak<PenWorker>>>,
    driver: Arc<dyn Driver>,
    config: Config,
}

impl WorkerPool {
    pub(crate) fn new(driver: Arc<dyn Driver>, config: Config) -> Arc<Self> {
        Arc::new(Self {
            workers: Mutex::new(Vec::new()),
            driver,
            config,
        })
    }
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Find a worker for `context` and register it there, spawning a worker if every live one
    /// is full. With `None`, any live worker will do (or a fresh one).
    ///
    /// Gives up after [`Config::acquire_retries`] refusals.
    pub fn acquire(&self, context: Option<&Arc<DeviceContext>>) -> Option<Arc<PenWorker>> {
        let mut rejected: SmallVec<[WorkerId; 4]> = SmallVec::new();
        for _ in 0..self.config.acquire_retries {
            let worker = match self.select(&rejected) {
                Some(worker) => worker,
                None => self.spawn()?,
            };
            let Some(context) = context else {
                return Some(worker);
            };
            match worker.add_context(context) {
                Ok(AddOutcome::Added) => {
                    log::debug!("{} placed on worker {}", context.id(), worker.id().0);
                    return Some(worker);
                }
                Ok(AddOutcome::Full) => {
                    log::debug!("worker {} full, refused {}", worker.id().0, context.id());
                }
                Ok(AddOutcome::Refused) => {
                    // Another thread won't get a different answer from the driver.
                    log::warn!("{} refused by the driver", context.id());
                    return None;
                }
                Err(e) => {
                    log::warn!("worker {} failed to take {}: {e}", worker.id().0, context.id());
                }
            }
            rejected.push(worker.id());
        }
        log::error!(
            "no polling thread accepted a context after {} attempts",
            self.config.acquire_retries
        );
        None
    }

    /// Most recently spawned live worker with room, not in `rejected`. Prunes on the way.
    fn select(&self, rejected: &[WorkerId]) -> Option<Arc<PenWorker>> {
        let mut workers = self.workers();
        let mut found = None;
        // Newest first, the older ones are likely full.
        for index in (0..workers.len()).rev() {
            let Some(worker) = workers[index]
                .upgrade()
                .filter(|worker| !worker.is_disposed())
            else {
                workers.swap_remove(index);
                continue;
            };
            if found.is_none()
                && !rejected.contains(&worker.id())
                && worker.live_count() < self.config.max_contexts_per_worker
            {
                found = Some(worker);
            }
        }
        found
    }

    fn spawn(&self) -> Option<Arc<PenWorker>> {
        // Spawning blocks until the thread is up, keep that outside the lock.
        match PenWorker::spawn(self.driver.clone(), self.config.clone()) {
            Ok(worker) => {
                self.workers().push(Arc::downgrade(&worker));
                Some(worker)
            }
            Err(e) => {
                log::error!("failed to start polling thread: {e}");
                None
            }
        }
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, Vec<Weak<PenWorker>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Live, undisposed workers right now.
    #[must_use]
    pub fn live_workers(&self) -> Vec<Arc<PenWorker>> {
        self.workers()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|worker| !worker.is_disposed())
            .collect()
    }
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.live_workers().len()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.worker_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

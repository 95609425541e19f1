//! Dedicated polling threads.
//!
//! Each [`PenWorker`] owns one OS thread, which loops over
//! * draining every queued [work request](request) in submission order, then
//! * waiting on all registered device handles plus its own wake event.
//!
//! All driver calls happen on that thread and nowhere else. The consumer thread only ever
//! blocks on a request's completion.

use std::sync::{atomic, Arc, Mutex, OnceLock, PoisonError, Weak};
use std::thread::{self, ThreadId};

use crate::builder::Config;
use crate::context::{ContextId, DeviceContext};
use crate::driver::{
    packet, CommHandle, CursorInfo, Driver, DriverError, EventKind, Geometry, LockToken,
    NativeContext, RawEvent, TabletInfo, TargetId, WaitOutcome, WakeEvent,
};
use crate::events::PacketData;

use smallvec::SmallVec;

mod coalesce;
pub(crate) mod request;
mod table;

use coalesce::{MoveBatch, MoveCache};
use request::{reply_channel, Execute, Reply, WorkQueue, WorkRequest};
use table::ContextTable;

/// Process-unique id of a [`PenWorker`].
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct WorkerId(pub u32);
impl WorkerId {
    fn next() -> Self {
        static NEXT: atomic::AtomicU32 = atomic::AtomicU32::new(1);
        Self(NEXT.fetch_add(1, atomic::Ordering::Relaxed))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    /// The worker has shut down (or is shutting down) and takes no new work.
    #[error("worker is disposed")]
    Disposed,
    /// A blocking request was issued from the worker's own thread.
    #[error("request issued from the worker's own thread")]
    Reentrant,
    /// The request's handler failed without producing output.
    #[error("request failed on the worker thread")]
    RequestFailed,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Result of asking a worker to drop a context.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Gone, lock released and channel closed.
    Removed,
    /// A pointer is still in range. The context stays registered until it leaves.
    Deferred,
    /// The worker doesn't hold this context (already removed, or never added).
    NotFound,
}

/// Result of asking a worker to take a context.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Registered, or already registered here.
    Added,
    /// The worker has no room. Another worker may take it.
    Full,
    /// The driver refused the context's lock, or its channel is already closed. No worker
    /// will do better.
    Refused,
}

impl AddOutcome {
    #[must_use]
    pub fn is_added(self) -> bool {
        self == Self::Added
    }
}

/// State visible to both the worker thread and handles to it.
struct Shared {
    id: WorkerId,
    queue: WorkQueue,
    disposed: atomic::AtomicBool,
    driver: Arc<dyn Driver>,
    wake: OnceLock<WakeEvent>,
    thread: OnceLock<ThreadId>,
    live: atomic::AtomicUsize,
}
impl Shared {
    fn raise(&self) {
        if let Some(&wake) = self.wake.get() {
            self.driver.raise_wake_event(wake);
        }
    }
    fn is_disposed(&self) -> bool {
        self.disposed.load(atomic::Ordering::Acquire)
    }
}

/// Handle to one polling thread. The thread shuts down once the last handle drops.
pub struct PenWorker {
    shared: Arc<Shared>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PenWorker {
    /// Start a polling thread and wait until it's ready to take work.
    ///
    /// # Errors
    /// If the thread couldn't be spawned, or failed to set up its wake event.
    pub fn spawn(driver: Arc<dyn Driver>, config: Config) -> Result<Arc<Self>, WorkerError> {
        let shared = Arc::new(Shared {
            id: WorkerId::next(),
            queue: WorkQueue::default(),
            disposed: atomic::AtomicBool::new(false),
            driver,
            wake: OnceLock::new(),
            thread: OnceLock::new(),
            live: atomic::AtomicUsize::new(0),
        });
        // Queued before the thread exists, so it's the first thing it runs. No wake needed.
        let (reply, started) = reply_channel();
        if shared.queue.push(request::Start { reply }.into()).is_err() {
            return Err(WorkerError::Disposed);
        }

        let handle = thread::Builder::new()
            .name(format!("pen-worker-{}", shared.id.0))
            .spawn({
                let shared = shared.clone();
                move || run(&shared, &config)
            })
            .map_err(WorkerError::Spawn)?;
        let worker = Arc::new(Self {
            shared,
            join: Mutex::new(Some(handle)),
        });

        if started.wait() == Some(true) {
            log::debug!("worker {} started", worker.id().0);
            Ok(worker)
        } else {
            // Dropping `worker` disposes and joins.
            Err(WorkerError::RequestFailed)
        }
    }
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.shared.id
    }
    /// Number of contexts registered, including ones awaiting deferred removal.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.shared.live.load(atomic::Ordering::Acquire)
    }
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }
    /// Whether the caller is running on this worker's polling thread.
    #[must_use]
    pub fn is_current_thread(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }
    /// Ask the thread to exit. It finishes any in-flight dispatch first.
    pub fn dispose(&self) {
        if !self.shared.disposed.swap(true, atomic::Ordering::AcqRel) {
            log::debug!("worker {} disposing", self.id().0);
        }
        self.shared.raise();
    }
    /// [`Self::dispose`], but only if no contexts remain.
    pub fn dispose_if_idle(&self) {
        if self.live_count() == 0 {
            self.dispose();
        }
    }

    /// Submit a request and block until the worker has run it.
    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> WorkRequest) -> Result<T, WorkerError> {
        if self.is_disposed() {
            return Err(WorkerError::Disposed);
        }
        if self.is_current_thread() {
            return Err(WorkerError::Reentrant);
        }
        let (reply, pending) = reply_channel();
        if self.shared.queue.push(make(reply)).is_err() {
            return Err(WorkerError::Disposed);
        }
        self.shared.raise();
        pending.wait().ok_or_else(|| {
            if self.is_disposed() {
                WorkerError::Disposed
            } else {
                WorkerError::RequestFailed
            }
        })
    }

    /// # Errors
    /// See [`WorkerError`]. Expected driver failures yield an empty list instead.
    pub fn enumerate_tablets(&self) -> Result<Vec<TabletInfo>, WorkerError> {
        self.call(|reply| request::Enumerate { reply }.into())
    }
    /// # Errors
    /// See [`WorkerError`]. Expected driver failures yield `None` instead.
    pub fn tablet_info(&self, index: usize) -> Result<Option<TabletInfo>, WorkerError> {
        self.call(|reply| request::QueryTablet { index, reply }.into())
    }
    /// # Errors
    /// See [`WorkerError`]. Expected driver failures yield `None` instead.
    pub fn create_context(
        &self,
        target: TargetId,
        tablet: usize,
    ) -> Result<Option<NativeContext>, WorkerError> {
        self.call(|reply| {
            request::CreateContext {
                target,
                tablet,
                reply,
            }
            .into()
        })
    }
    /// Take a native lock outside of any context. Must be paired with [`Self::release_lock`].
    /// # Errors
    /// See [`WorkerError`]. Expected driver failures yield `false` instead.
    pub fn acquire_lock(&self, token: LockToken) -> Result<bool, WorkerError> {
        self.call(|reply| request::AcquireLock { token, reply }.into())
    }
    /// Shut down a channel that was never registered with any worker.
    /// # Errors
    /// See [`WorkerError`]. Expected driver failures yield `false` instead.
    pub fn close_context(&self, comm: CommHandle) -> Result<bool, WorkerError> {
        self.call(|reply| request::CloseContext { comm, reply }.into())
    }
    /// # Errors
    /// See [`WorkerError`]. Expected driver failures yield `false` instead.
    pub fn release_lock(&self, token: LockToken) -> Result<bool, WorkerError> {
        self.call(|reply| request::ReleaseLock { token, reply }.into())
    }
    /// # Errors
    /// See [`WorkerError`]. Expected driver failures yield an empty list instead.
    pub fn refresh_cursors(&self, tablet: usize) -> Result<Vec<CursorInfo>, WorkerError> {
        self.call(|reply| request::RefreshCursors { tablet, reply }.into())
    }
    /// # Errors
    /// See [`WorkerError`]. Expected driver failures yield `None` instead.
    pub fn updated_geometry(&self, tablet: usize) -> Result<Option<Geometry>, WorkerError> {
        self.call(|reply| request::UpdatedGeometry { tablet, reply }.into())
    }
    /// Register `context`.
    /// # Errors
    /// [`WorkerError::Disposed`] fails fast rather than hanging.
    pub fn add_context(&self, context: &Arc<DeviceContext>) -> Result<AddOutcome, WorkerError> {
        self.call(|reply| {
            request::AddContext {
                context: context.clone(),
                reply,
            }
            .into()
        })
    }
    /// Unregister a context. Safe to call any number of times, later calls see
    /// [`RemoveOutcome::NotFound`]. On a disposed worker this is a successful no-op.
    /// # Errors
    /// See [`WorkerError`].
    pub fn remove_context(&self, id: ContextId) -> Result<RemoveOutcome, WorkerError> {
        match self.call(|reply| request::RemoveContext { id, reply }.into()) {
            Err(WorkerError::Disposed) => Ok(RemoveOutcome::NotFound),
            other => other,
        }
    }
}

impl Drop for PenWorker {
    fn drop(&mut self) {
        self.dispose();
        // Can't join ourselves. The loop exits on its own once it sees the flag.
        if self.is_current_thread() {
            return;
        }
        let handle = self
            .join
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("worker {} thread panicked", self.shared.id.0);
            }
        }
    }
}

impl std::fmt::Debug for PenWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PenWorker")
            .field("id", &self.id())
            .field("live", &self.live_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// The driver, usable only from the thread that bound it.
struct BoundDriver {
    driver: Arc<dyn Driver>,
    owner: ThreadId,
}
impl BoundDriver {
    fn bind(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            owner: thread::current().id(),
        }
    }
    fn get(&self) -> &dyn Driver {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "driver called off its polling thread"
        );
        &*self.driver
    }
}

/// Everything owned by the polling thread.
pub(crate) struct WorkerState {
    shared: Arc<Shared>,
    driver: BoundDriver,
    wake: Option<WakeEvent>,
    table: ContextTable,
    cache: MoveCache<Weak<DeviceContext>>,
    max_contexts: usize,
}

impl WorkerState {
    fn new(shared: Arc<Shared>, config: &Config) -> Self {
        Self {
            driver: BoundDriver::bind(shared.driver.clone()),
            shared,
            wake: None,
            table: ContextTable::default(),
            cache: MoveCache::new(config.coalesce_window),
            max_contexts: config.max_contexts_per_worker,
        }
    }
    pub(crate) fn driver(&self) -> &dyn Driver {
        self.driver.get()
    }
    /// Adopt the wake event made by the `Start` request. Only the first call sticks.
    pub(crate) fn set_wake(&mut self, wake: WakeEvent) -> bool {
        if self.wake.is_some() || self.shared.wake.set(wake).is_err() {
            self.driver().destroy_wake_event(wake);
            return false;
        }
        self.wake = Some(wake);
        true
    }
    fn publish(&mut self, table: ContextTable) {
        self.shared.live.store(table.len(), atomic::Ordering::Release);
        self.table = table;
    }

    pub(crate) fn add_context(
        &mut self,
        context: &Arc<DeviceContext>,
    ) -> Result<AddOutcome, DriverError> {
        let id = context.id();
        if self.table.position(id).is_some() {
            // Still here awaiting deferred removal. Cancel it, the lock is still held.
            context
                .removal_pending
                .store(false, atomic::Ordering::Release);
            log::debug!("worker {} kept {id}, removal cancelled", self.shared.id.0);
            return Ok(AddOutcome::Added);
        }
        // Evicted while this request sat in the queue. Its lock and channel are gone.
        if context.is_destroyed() {
            log::debug!("worker {} refusing destroyed {id}", self.shared.id.0);
            return Ok(AddOutcome::Refused);
        }
        self.prune()?;
        if self.table.len() >= self.max_contexts {
            log::debug!(
                "worker {} at capacity ({}), refusing {id}",
                self.shared.id.0,
                self.table.len()
            );
            return Ok(AddOutcome::Full);
        }
        let lock = context.native().lock;
        let locked = request::recover(self.driver().acquire_lock(lock), "acquiring context lock")?;
        if locked.is_none() {
            return Ok(AddOutcome::Refused);
        }
        let table = self.table.with(context);
        self.publish(table);
        log::debug!(
            "worker {} added {id} ({} live)",
            self.shared.id.0,
            self.table.len()
        );
        Ok(AddOutcome::Added)
    }

    pub(crate) fn remove_context(
        &mut self,
        id: ContextId,
    ) -> Result<RemoveOutcome, DriverError> {
        let Some(index) = self.table.position(id) else {
            return Ok(RemoveOutcome::NotFound);
        };
        if let Some(context) = self.table.live(index) {
            if context.is_in_range(0) {
                context
                    .removal_pending
                    .store(true, atomic::Ordering::Release);
                log::debug!(
                    "worker {} deferring removal of {id}, pointer in range",
                    self.shared.id.0
                );
                return Ok(RemoveOutcome::Deferred);
            }
        }
        self.evict(&[index])?;
        Ok(RemoveOutcome::Removed)
    }

    /// Drop slots from the table, then release what they held. The table is rebuilt first
    /// so a slot can never be released twice.
    fn evict(&mut self, indices: &[usize]) -> Result<(), DriverError> {
        if indices.is_empty() {
            return Ok(());
        }
        let survivors: SmallVec<[Arc<DeviceContext>; 4]> = indices
            .iter()
            .filter_map(|&index| self.table.live(index))
            .collect();
        let (table, evicted) = self.table.without(indices);
        self.publish(table);
        for context in &survivors {
            // Destroyed first, so a racing `enable` never sees "not pending, not destroyed".
            context.mark_destroyed();
            context.removal_pending.store(false, atomic::Ordering::Release);
        }

        let mut fatal = None;
        for slot in evicted {
            if let Err(e) = self.driver().release_lock(slot.lock) {
                log::warn!("releasing lock of {} failed: {e}", slot.id);
                if !e.is_expected() {
                    fatal.get_or_insert(e);
                }
            }
            if let Err(e) = self.driver().close_context(slot.handle) {
                log::warn!("closing channel of {} failed: {e}", slot.id);
                if !e.is_expected() {
                    fatal.get_or_insert(e);
                }
            }
            log::debug!("worker {} removed {}", self.shared.id.0, slot.id);
        }
        // Contexts upgraded here may be the last strong references. Let them go while the
        // table no longer names them.
        drop(survivors);
        fatal.map_or(Ok(()), Err)
    }

    /// Remove contexts whose owner dropped them.
    fn prune(&mut self) -> Result<(), DriverError> {
        let dead = self.table.dead();
        if !dead.is_empty() {
            log::debug!(
                "worker {} pruning {} dropped contexts",
                self.shared.id.0,
                dead.len()
            );
        }
        self.evict(&dead)
    }

    /// Finish a deferred removal once nothing on `context` is in range.
    fn settle(&mut self, context: &DeviceContext) -> Result<(), DriverError> {
        if context.removal_pending.load(atomic::Ordering::Acquire) && !context.is_in_range(0) {
            if let Some(index) = self.table.position(context.id()) {
                self.evict(&[index])?;
            }
        }
        Ok(())
    }

    /// Run every request queued right now, in order. A failure in one never stops the next.
    /// Returns `false` if any failed fatally.
    fn drain_queue(&mut self) -> bool {
        let mut healthy = true;
        for request in self.shared.queue.take_all() {
            let name = request.name();
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| request.execute(self)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!(
                        "worker {} request `{name}` failed fatally: {e}",
                        self.shared.id.0
                    );
                    healthy = false;
                }
                Err(_) => {
                    log::error!("worker {} request `{name}` panicked", self.shared.id.0);
                    healthy = false;
                }
            }
        }
        healthy
    }

    fn handle_event(&mut self, index: usize, event: &RawEvent) -> Result<(), DriverError> {
        let Some(context) = self.table.live(index) else {
            log::trace!("event for dropped context at slot {index}");
            return Ok(());
        };
        let data = if packet::carries_packets(event.kind) {
            match packet::decode(event) {
                Ok(data) => data,
                Err(e) => {
                    log::error!("{} dropped {} event: {e}", context.id(), event.kind);
                    return Ok(());
                }
            }
        } else {
            PacketData::empty()
        };
        let description = context.describe(self.driver());
        if !context.is_remap_pending()
            && description.is_some_and(|description| description.mapping_changed(&data))
        {
            log::debug!("{} screen mapping changed", context.id());
            context.mark_remap_pending();
        }

        let pointer = event.pointer_id;
        let timestamp = event.timestamp;
        if event.kind.is_move() {
            let displaced = self.cache.offer(
                context.id(),
                Arc::downgrade(&context),
                pointer,
                timestamp,
                &data,
            );
            if let Some(batch) = displaced {
                self.dispatch_batch(batch)?;
            }
            return Ok(());
        }

        // Anything else ends a run of moves, and must come after it.
        self.flush_cache()?;
        match event.kind {
            EventKind::PenInRange => context.fire_in_range(pointer, data, timestamp),
            EventKind::PenOutOfRange => context.fire_out_of_range(pointer, timestamp),
            EventKind::PenDown => {
                context.ensure_in_range(pointer, timestamp);
                context.fire_pen_down(pointer, data, timestamp);
            }
            EventKind::PenUp => {
                context.ensure_in_range(pointer, timestamp);
                context.fire_pen_up(pointer, data, timestamp);
            }
            EventKind::SystemEvent => context.fire_system_gesture(pointer, data, timestamp),
            EventKind::Packets | EventKind::Timeout => {
                log::trace!("{} ignoring stray {} event", context.id(), event.kind);
            }
        }
        self.settle(&context)
    }

    fn dispatch_batch(&mut self, batch: MoveBatch<Weak<DeviceContext>>) -> Result<(), DriverError> {
        let Some(context) = batch.context.upgrade() else {
            return Ok(());
        };
        context.ensure_in_range(batch.pointer_id, batch.start);
        context.fire_move(batch.pointer_id, batch.data, batch.start);
        self.settle(&context)
    }

    fn flush_cache(&mut self) -> Result<(), DriverError> {
        match self.cache.take() {
            Some(batch) => self.dispatch_batch(batch),
            None => Ok(()),
        }
    }

    /// Force every registered context out of range. Guards against drivers that send a
    /// stray move after out-of-range and never follow up with a terminal event.
    fn sweep_out_of_range(&mut self) -> Result<(), DriverError> {
        let live: Vec<_> = self.table.iter_live().collect();
        for context in live {
            let now = context.last_timestamp().unwrap_or_default();
            context.fire_out_of_range(0, now);
            self.settle(&context)?;
        }
        Ok(())
    }

    /// One pass of the outer loop after the queue has drained. `Err` ends the loop.
    fn poll(&mut self, config: &Config) -> Result<(), DriverError> {
        self.prune()?;
        let Some(wake) = self.wake else {
            return Err(DriverError::Fatal("worker has no wake event".into()));
        };
        // Pending moves shouldn't sit out a full idle timeout.
        let caching = !self.cache.is_empty();
        let timeout = if caching {
            config.flush_delay
        } else {
            config.wait_timeout
        };
        let handles = self.table.handles.clone();
        let outcome = match self.driver().wait_for_event(&handles, wake, timeout) {
            Ok(outcome) => outcome,
            Err(e) if e.is_expected() => {
                log::warn!("worker {} wait failed: {e}", self.shared.id.0);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match outcome {
            WaitOutcome::Event { index, event } => self.handle_event(index, &event),
            // No sweep here. Work requests wake the thread often, and forcing pointers out of
            // range then would cut off pens that are still hovering. Idle timeouts sweep.
            WaitOutcome::Woken => self.flush_cache(),
            WaitOutcome::Timeout if caching => self.flush_cache(),
            WaitOutcome::Timeout => {
                self.flush_cache()?;
                self.sweep_out_of_range()
            }
        }
    }

    /// Release every lock still held, exactly once each, and the wake event.
    fn teardown(&mut self) {
        // Whatever is still queued will never run. Dropping it disconnects the issuers.
        drop(self.shared.queue.close());
        drop(self.cache.take());
        let all: Vec<usize> = (0..self.table.len()).collect();
        if let Err(e) = self.evict(&all) {
            log::error!("worker {} teardown: {e}", self.shared.id.0);
        }
        if let Some(wake) = self.wake.take() {
            self.driver().destroy_wake_event(wake);
        }
    }
}

fn run(shared: &Arc<Shared>, config: &Config) {
    let _ = shared.thread.set(thread::current().id());
    let mut state = WorkerState::new(shared.clone(), config);
    loop {
        if shared.is_disposed() {
            break;
        }
        if !state.drain_queue() {
            shared.disposed.store(true, atomic::Ordering::Release);
            break;
        }
        // A failed `Start` leaves us with nothing to wait on.
        if shared.is_disposed() || state.wake.is_none() {
            break;
        }
        if let Err(e) = state.poll(config) {
            log::error!("worker {} stopping: {e}", shared.id.0);
            shared.disposed.store(true, atomic::Ordering::Release);
            break;
        }
    }
    shared.disposed.store(true, atomic::Ordering::Release);
    state.teardown();
    log::debug!("worker {} exited", shared.id.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{CommHandle, PacketDescription};
    use crate::testing::NullDriver;
    use std::time::Duration;

    /// Fails the way a broken driver would, on top of [`NullDriver`].
    struct Faulty;
    impl Driver for Faulty {
        fn enumerate_tablets(&self) -> Result<Vec<TabletInfo>, DriverError> {
            NullDriver.enumerate_tablets()
        }
        fn tablet_info(&self, _: usize) -> Result<TabletInfo, DriverError> {
            panic!("driver bug")
        }
        fn create_context(&self, t: TargetId, i: usize) -> Result<NativeContext, DriverError> {
            NullDriver.create_context(t, i)
        }
        fn close_context(&self, comm: CommHandle) -> Result<(), DriverError> {
            NullDriver.close_context(comm)
        }
        fn packet_description(&self, comm: CommHandle) -> Result<PacketDescription, DriverError> {
            NullDriver.packet_description(comm)
        }
        fn acquire_lock(&self, token: LockToken) -> Result<(), DriverError> {
            NullDriver.acquire_lock(token)
        }
        fn release_lock(&self, token: LockToken) -> Result<(), DriverError> {
            NullDriver.release_lock(token)
        }
        fn refresh_cursors(&self, _: usize) -> Result<Vec<CursorInfo>, DriverError> {
            Err(DriverError::Fatal("E_UNEXPECTED".into()))
        }
        fn updated_geometry(&self, tablet: usize) -> Result<Geometry, DriverError> {
            NullDriver.updated_geometry(tablet)
        }
        fn create_wake_event(&self) -> Result<WakeEvent, DriverError> {
            NullDriver.create_wake_event()
        }
        fn destroy_wake_event(&self, wake: WakeEvent) {
            NullDriver.destroy_wake_event(wake);
        }
        fn raise_wake_event(&self, wake: WakeEvent) {
            NullDriver.raise_wake_event(wake);
        }
        fn wait_for_event(
            &self,
            handles: &[CommHandle],
            wake: WakeEvent,
            timeout: Duration,
        ) -> Result<WaitOutcome, DriverError> {
            NullDriver.wait_for_event(handles, wake, timeout)
        }
    }

    fn spawn(driver: impl Driver) -> Arc<PenWorker> {
        PenWorker::spawn(Arc::new(driver), Config::default()).unwrap()
    }

    fn wait_disposed(worker: &PenWorker) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !worker.is_disposed() {
            assert!(std::time::Instant::now() < deadline, "worker never disposed");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn expected_failures_leave_empty_output() {
        let worker = spawn(NullDriver);
        assert!(worker.enumerate_tablets().unwrap().is_empty());
        assert_eq!(worker.tablet_info(0).unwrap(), None);
        assert_eq!(worker.create_context(TargetId(1), 0).unwrap(), None);
        assert!(!worker.acquire_lock(LockToken(1)).unwrap());
        assert_eq!(worker.updated_geometry(0).unwrap(), None);
        assert!(!worker.is_disposed());
        assert!(!worker.is_current_thread());
        assert_eq!(worker.live_count(), 0);
    }

    #[test]
    fn disposed_worker_rejects_work() {
        let worker = spawn(NullDriver);
        worker.dispose();
        assert!(matches!(
            worker.enumerate_tablets(),
            Err(WorkerError::Disposed)
        ));
        assert_eq!(
            worker.remove_context(ContextId(1)).unwrap(),
            RemoveOutcome::NotFound
        );
    }

    #[test]
    fn panicking_request_takes_worker_down() {
        let worker = spawn(Faulty);
        assert!(matches!(
            worker.tablet_info(0),
            Err(WorkerError::Disposed | WorkerError::RequestFailed)
        ));
        wait_disposed(&worker);
        assert!(matches!(
            worker.enumerate_tablets(),
            Err(WorkerError::Disposed)
        ));
    }

    #[test]
    fn fatal_driver_error_takes_worker_down() {
        let worker = spawn(Faulty);
        assert!(worker.enumerate_tablets().unwrap().is_empty());
        assert!(worker.refresh_cursors(0).is_err());
        wait_disposed(&worker);
    }

    #[test]
    fn each_worker_gets_its_own_thread() {
        let a = spawn(NullDriver);
        let b = spawn(NullDriver);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.shared.thread.get(), b.shared.thread.get());
    }
}

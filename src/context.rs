//! One open channel to one physical digitizer, for one target.
//!
//! A [`DeviceContext`] is uniquely owned by its [`ContextGroup`](crate::group::ContextGroup).
//! The polling thread it's registered with only holds it weakly and notices when it's gone.

use std::sync::{atomic, Arc, Mutex, OnceLock, PoisonError};

use smallvec::SmallVec;

use crate::driver::{Driver, NativeContext, PacketDescription, TabletInfo};
use crate::events::{InRangeTicket, PacketData, PenEvent, PenEventKind};
use crate::group::GroupShared;
use crate::pool::WorkerPool;
use crate::util::Tick;
use crate::worker::{AddOutcome, PenWorker, RemoveOutcome, WorkerError};

/// Process-unique id of a [`DeviceContext`].
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct ContextId(pub u32);
impl ContextId {
    fn next() -> Self {
        static NEXT: atomic::AtomicU32 = atomic::AtomicU32::new(1);
        Self(NEXT.fetch_add(1, atomic::Ordering::Relaxed))
    }
}
impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Soft state, only mutated from the polling thread.
#[derive(Default)]
struct PointerState {
    /// Pointers currently in range. Empty = none.
    in_range: SmallVec<[u32; 4]>,
    /// Subset of `in_range` that is touching the surface.
    contacts: SmallVec<[u32; 4]>,
    /// Last timestamp reported upward.
    last: Option<Tick>,
    /// Last raw in-range timestamp.
    last_in_range: Option<Tick>,
}
impl PointerState {
    /// Fix up `raw` against the last reported tick, and remember the result.
    fn stamp(&mut self, raw: Tick) -> Tick {
        let stamped = match self.last {
            Some(last) => Tick::normalize(last, raw),
            None => raw,
        };
        self.last = Some(stamped);
        stamped
    }
}

/// Which worker, if any, this context is registered with.
enum Link {
    Detached,
    Attached(Arc<PenWorker>),
    /// Removal was requested, but deferred by the worker until the pointer leaves range.
    Detaching(Arc<PenWorker>),
}

pub struct DeviceContext {
    id: ContextId,
    native: NativeContext,
    tablet: TabletInfo,
    group: Arc<GroupShared>,
    pool: Arc<WorkerPool>,
    state: Mutex<PointerState>,
    queued_in_range: Arc<atomic::AtomicU32>,
    remap_pending: atomic::AtomicBool,
    pub(crate) removal_pending: atomic::AtomicBool,
    /// The native channel has been closed. Set once, never cleared.
    destroyed: atomic::AtomicBool,
    description: OnceLock<PacketDescription>,
    link: Mutex<Link>,
}

impl DeviceContext {
    pub(crate) fn new(
        native: NativeContext,
        tablet: TabletInfo,
        group: Arc<GroupShared>,
        pool: Arc<WorkerPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ContextId::next(),
            native,
            tablet,
            group,
            pool,
            state: Mutex::new(PointerState::default()),
            queued_in_range: Arc::new(atomic::AtomicU32::new(0)),
            remap_pending: atomic::AtomicBool::new(false),
            removal_pending: atomic::AtomicBool::new(false),
            destroyed: atomic::AtomicBool::new(false),
            description: OnceLock::new(),
            link: Mutex::new(Link::Detached),
        })
    }
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }
    #[must_use]
    pub fn native(&self) -> NativeContext {
        self.native
    }
    #[must_use]
    pub fn tablet(&self) -> &TabletInfo {
        &self.tablet
    }
    /// The worker this context is currently registered with, if any.
    #[must_use]
    pub fn worker(&self) -> Option<Arc<PenWorker>> {
        match &*self.link() {
            Link::Attached(worker) | Link::Detaching(worker) => Some(worker.clone()),
            Link::Detached => None,
        }
    }
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        matches!(&*self.link(), Link::Attached(worker) if !worker.is_disposed())
    }
    /// Whether the native channel is closed. A destroyed context can't be enabled again.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(atomic::Ordering::Acquire)
    }
    pub(crate) fn mark_destroyed(&self) {
        self.destroyed.store(true, atomic::Ordering::Release);
    }

    fn link(&self) -> std::sync::MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
    fn state(&self) -> std::sync::MutexGuard<'_, PointerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register with a polling thread. No-op if already enabled.
    ///
    /// Returns `false` if no worker could take this context, or it's been destroyed.
    pub fn enable(self: &Arc<Self>) -> bool {
        if self.is_destroyed() {
            return false;
        }
        let pending = match &*self.link() {
            Link::Attached(worker) if !worker.is_disposed() => return true,
            Link::Attached(_) => None,
            Link::Detaching(worker) => Some(worker.clone()),
            Link::Detached => None,
        };
        // Still registered but on its way out - cancel that rather than registering twice.
        if let Some(worker) = pending {
            if self.removal_pending.load(atomic::Ordering::Acquire)
                && matches!(worker.add_context(self), Ok(AddOutcome::Added))
            {
                log::debug!("{} re-enabled before deferred removal completed", self.id);
                *self.link() = Link::Attached(worker);
                return true;
            }
            // The removal completed while we asked.
            if self.is_destroyed() {
                *self.link() = Link::Detached;
                return false;
            }
        }

        let Some(worker) = self.pool.acquire(Some(self)) else {
            log::warn!("{} could not be placed on any polling thread", self.id);
            *self.link() = Link::Detached;
            return false;
        };
        *self.link() = Link::Attached(worker);
        true
    }

    /// Unregister from the polling thread. If the worker confirms removal and
    /// `shutdown_worker` is set, the worker is shut down once it holds no other contexts.
    ///
    /// Returns `false` if the context was not enabled.
    pub fn disable(&self, shutdown_worker: bool) -> bool {
        let worker = {
            let mut link = self.link();
            match std::mem::replace(&mut *link, Link::Detached) {
                Link::Attached(worker) => worker,
                prior @ Link::Detaching(_) => {
                    *link = prior;
                    return false;
                }
                Link::Detached => return false,
            }
        };

        match worker.remove_context(self.id) {
            Ok(RemoveOutcome::Removed | RemoveOutcome::NotFound) => {
                if shutdown_worker {
                    worker.dispose_if_idle();
                }
            }
            Ok(RemoveOutcome::Deferred) => {
                *self.link() = Link::Detaching(worker);
            }
            Err(WorkerError::Reentrant) => {
                // Called from a sink on the polling thread itself. The worker picks this up
                // after the current dispatch returns.
                self.removal_pending.store(true, atomic::Ordering::Release);
                *self.link() = Link::Detaching(worker);
            }
            Err(WorkerError::Disposed) => {}
            Err(e) => log::warn!("{} removal failed: {e}", self.id),
        }
        true
    }

    /// Whether `pointer_id` is in range. `0` asks whether *any* pointer is.
    #[must_use]
    pub fn is_in_range(&self, pointer_id: u32) -> bool {
        let state = self.state();
        if pointer_id == 0 {
            !state.in_range.is_empty()
        } else {
            state.in_range.contains(&pointer_id)
        }
    }
    /// Whether `pointer_id` is touching the surface.
    #[must_use]
    pub fn is_down(&self, pointer_id: u32) -> bool {
        self.state().contacts.contains(&pointer_id)
    }
    /// In-range events delivered but not yet consumed.
    #[must_use]
    pub fn queued_in_range(&self) -> u32 {
        self.queued_in_range.load(atomic::Ordering::Acquire)
    }
    /// Raw timestamp of the most recent in-range event, if any.
    #[must_use]
    pub fn last_in_range(&self) -> Option<Tick> {
        self.state().last_in_range
    }
    /// Most recent timestamp reported upward.
    #[must_use]
    pub fn last_timestamp(&self) -> Option<Tick> {
        self.state().last
    }

    #[must_use]
    pub fn is_remap_pending(&self) -> bool {
        self.remap_pending.load(atomic::Ordering::Acquire)
    }
    pub(crate) fn mark_remap_pending(&self) {
        self.remap_pending.store(true, atomic::Ordering::Release);
    }
    /// Service a pending screen remap. Returns whether one was pending.
    pub fn take_remap_pending(&self) -> bool {
        self.remap_pending.swap(false, atomic::Ordering::AcqRel)
    }

    /// The packet shape, if it has been fetched yet.
    #[must_use]
    pub fn packet_description(&self) -> Option<&PacketDescription> {
        self.description.get()
    }
    /// Fetch the packet shape on first use. Polling thread only.
    pub(crate) fn describe(&self, driver: &dyn Driver) -> Option<&PacketDescription> {
        if let Some(description) = self.description.get() {
            return Some(description);
        }
        match driver.packet_description(self.native.comm) {
            Ok(description) => Some(self.description.get_or_init(|| description)),
            Err(e) => {
                log::warn!("{} packet description unavailable: {e}", self.id);
                None
            }
        }
    }

    fn route(&self, pointer_id: u32, kind: PenEventKind, data: PacketData, timestamp: Tick) {
        let ticket = (kind == PenEventKind::InRange)
            .then(|| InRangeTicket::issue(&self.queued_in_range));
        log::trace!("{} {kind} p{pointer_id} {timestamp}", self.id);
        self.group.route(PenEvent {
            context: self.id,
            target: self.group.target(),
            pointer_id,
            timestamp,
            kind,
            data,
            ticket,
        });
    }

    /// Driver in-range signals are authoritative: the timestamp resets to the raw value.
    pub fn fire_in_range(&self, pointer_id: u32, data: PacketData, timestamp: Tick) {
        {
            let mut state = self.state();
            state.last = Some(timestamp);
            state.last_in_range = Some(timestamp);
            if pointer_id != 0 && !state.in_range.contains(&pointer_id) {
                state.in_range.push(pointer_id);
            }
        }
        self.route(pointer_id, PenEventKind::InRange, data, timestamp);
    }
    /// Synthesize an in-range for `pointer_id` unless it's already tracked.
    pub(crate) fn ensure_in_range(&self, pointer_id: u32, timestamp: Tick) {
        if !self.is_in_range(pointer_id) {
            self.fire_in_range(pointer_id, PacketData::empty(), timestamp);
        }
    }
    /// `pointer_id == 0` flushes every tracked pointer, one event each.
    pub fn fire_out_of_range(&self, pointer_id: u32, timestamp: Tick) {
        let mut out: SmallVec<[(u32, Tick); 4]> = SmallVec::new();
        {
            let mut state = self.state();
            if pointer_id == 0 {
                let pointers = std::mem::take(&mut state.in_range);
                state.contacts.clear();
                for pointer in pointers {
                    let stamped = state.stamp(timestamp);
                    out.push((pointer, stamped));
                }
            } else {
                state.in_range.retain(|p| *p != pointer_id);
                state.contacts.retain(|p| *p != pointer_id);
                out.push((pointer_id, state.stamp(timestamp)));
            }
        }
        for (pointer, stamped) in out {
            self.route(pointer, PenEventKind::OutOfRange, PacketData::empty(), stamped);
        }
    }
    pub fn fire_pen_down(&self, pointer_id: u32, data: PacketData, timestamp: Tick) {
        let stamped = {
            let mut state = self.state();
            if !state.contacts.contains(&pointer_id) {
                state.contacts.push(pointer_id);
            }
            state.stamp(timestamp)
        };
        self.route(pointer_id, PenEventKind::Down, data, stamped);
    }
    pub fn fire_pen_up(&self, pointer_id: u32, data: PacketData, timestamp: Tick) {
        let stamped = {
            let mut state = self.state();
            state.contacts.retain(|p| *p != pointer_id);
            state.stamp(timestamp)
        };
        self.route(pointer_id, PenEventKind::Up, data, stamped);
    }
    pub fn fire_packets(&self, pointer_id: u32, data: PacketData, timestamp: Tick) {
        let stamped = self.state().stamp(timestamp);
        self.route(pointer_id, PenEventKind::Packets, data, stamped);
    }
    pub fn fire_in_air_packets(&self, pointer_id: u32, data: PacketData, timestamp: Tick) {
        let stamped = self.state().stamp(timestamp);
        self.route(pointer_id, PenEventKind::InAirPackets, data, stamped);
    }
    pub fn fire_system_gesture(&self, pointer_id: u32, data: PacketData, timestamp: Tick) {
        let stamped = self.state().stamp(timestamp);
        self.route(pointer_id, PenEventKind::SystemGesture, data, stamped);
    }
    /// Movement, as hover or contact depending on the pointer's current state.
    pub(crate) fn fire_move(&self, pointer_id: u32, data: PacketData, timestamp: Tick) {
        if self.is_down(pointer_id) {
            self.fire_packets(pointer_id, data, timestamp);
        } else {
            self.fire_in_air_packets(pointer_id, data, timestamp);
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // On the polling thread the worker notices the dead reference by itself, and
        // blocking on it here would deadlock.
        let on_worker = self
            .worker()
            .is_some_and(|worker| worker.is_current_thread());
        if !on_worker {
            self.disable(false);
        }
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id)
            .field("native", &self.native)
            .field("tablet", &self.tablet.name)
            .finish_non_exhaustive()
    }
}

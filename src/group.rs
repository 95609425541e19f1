//! All device contexts for one target, typically one window.

use std::sync::{atomic, Arc, Mutex, PoisonError};

use crate::context::{ContextId, DeviceContext};
use crate::driver::{CursorInfo, Geometry, TabletInfo, TargetId};
use crate::events::{EventSink, PenEvent};
use crate::pool::WorkerPool;
use crate::util::Tick;
use crate::worker::{PenWorker, WorkerError};

#[derive(thiserror::Error, Debug)]
pub enum GroupError {
    /// The pool couldn't provide a polling thread to talk to the driver through.
    #[error("no polling thread available")]
    NoWorker,
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Last known screen position of the target, in physical pixels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ScreenPoint {
    pub x: i32,
    pub y: i32,
}

/// The part of a group its contexts route through. Outlives the group if a worker is still
/// dispatching when it drops.
pub(crate) struct GroupShared {
    target: TargetId,
    sink: Arc<dyn EventSink>,
}
impl GroupShared {
    pub(crate) fn new(target: TargetId, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self { target, sink })
    }
    pub(crate) fn target(&self) -> TargetId {
        self.target
    }
    pub(crate) fn route(&self, event: PenEvent) {
        self.sink.deliver(event);
    }
}

pub struct ContextGroup {
    shared: Arc<GroupShared>,
    pool: Arc<WorkerPool>,
    /// Worker used for driver calls that aren't tied to a registered context.
    admin: Mutex<Arc<PenWorker>>,
    /// Replaced wholesale on change, so readers can iterate a snapshot without holding
    /// the lock.
    contexts: Mutex<Arc<[Arc<DeviceContext>]>>,
    disabled: atomic::AtomicBool,
    location: Mutex<Option<ScreenPoint>>,
}

impl ContextGroup {
    /// Open a context for every tablet the driver currently reports. Contexts start
    /// disabled, call [`Self::enable`] to start receiving events.
    ///
    /// Tablets whose context can't be opened are skipped with a warning.
    /// # Errors
    /// If no polling thread could be started, or it went away mid-setup.
    pub fn new(
        pool: &Arc<WorkerPool>,
        target: TargetId,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, GroupError> {
        let admin = pool.acquire(None).ok_or(GroupError::NoWorker)?;
        let shared = GroupShared::new(target, sink);
        let mut contexts = Vec::new();
        for tablet in admin.enumerate_tablets()? {
            if let Some(context) = open(&admin, &shared, pool, tablet)? {
                contexts.push(context);
            }
        }
        log::debug!("group for {target:?} opened {} contexts", contexts.len());
        Ok(Self {
            shared,
            pool: pool.clone(),
            admin: Mutex::new(admin),
            contexts: Mutex::new(contexts.into()),
            disabled: atomic::AtomicBool::new(true),
            location: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn target(&self) -> TargetId {
        self.shared.target()
    }
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
    /// Snapshot of the current contexts, in device order.
    #[must_use]
    pub fn contexts(&self) -> Arc<[Arc<DeviceContext>]> {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
    #[must_use]
    pub fn context(&self, id: ContextId) -> Option<Arc<DeviceContext>> {
        self.contexts().iter().find(|context| context.id() == id).cloned()
    }
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.disabled.load(atomic::Ordering::Acquire)
    }

    fn admin(&self) -> Result<Arc<PenWorker>, GroupError> {
        let mut admin = self.admin.lock().unwrap_or_else(PoisonError::into_inner);
        if admin.is_disposed() {
            *admin = self.pool.acquire(None).ok_or(GroupError::NoWorker)?;
        }
        Ok(admin.clone())
    }
    fn swap_contexts(&self, edit: impl FnOnce(&mut Vec<Arc<DeviceContext>>)) {
        let mut contexts = self.contexts.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = contexts.to_vec();
        edit(&mut next);
        *contexts = next.into();
    }

    /// Enable every context, reopening any whose channel was closed.
    ///
    /// Returns `true` if all of them could be placed on a polling thread.
    pub fn enable(&self) -> bool {
        self.disabled.store(false, atomic::Ordering::Release);
        let mut all = true;
        for (position, context) in self.contexts().iter().enumerate() {
            let context = if context.is_destroyed() {
                match self.reopen(position, context) {
                    Some(fresh) => fresh,
                    None => {
                        all = false;
                        continue;
                    }
                }
            } else {
                context.clone()
            };
            all &= context.enable();
        }
        all
    }
    fn reopen(
        &self,
        position: usize,
        stale: &Arc<DeviceContext>,
    ) -> Option<Arc<DeviceContext>> {
        let fresh = self
            .admin()
            .and_then(|admin| {
                open(&admin, &self.shared, &self.pool, stale.tablet().clone()).map_err(Into::into)
            })
            .inspect_err(|e| log::warn!("reopening {} failed: {e}", stale.id()))
            .ok()
            .flatten()?;
        log::debug!("{} reopened as {}", stale.id(), fresh.id());
        self.swap_contexts(|contexts| {
            if let Some(slot) = contexts
                .get_mut(position)
                .filter(|slot| slot.id() == stale.id())
            {
                *slot = fresh.clone();
            }
        });
        Some(fresh)
    }

    /// Disable every context. Every one is visited even if some fail.
    ///
    /// Returns `true` if any context was enabled before.
    pub fn disable(&self, shutdown_worker: bool) -> bool {
        self.disabled.store(true, atomic::Ordering::Release);
        let mut changed = false;
        for context in self.contexts().iter() {
            changed |= context.disable(shutdown_worker);
        }
        changed
    }

    /// A tablet appeared at driver position `index`. It's inserted at the same position here,
    /// translating between the two is up to the caller.
    ///
    /// Returns `false` if the driver no longer knows the tablet or refused a context.
    /// # Errors
    /// If the administrative worker went away.
    pub fn add_device_at(&self, index: usize) -> Result<bool, GroupError> {
        let admin = self.admin()?;
        let Some(tablet) = admin.tablet_info(index)? else {
            return Ok(false);
        };
        let Some(context) = open(&admin, &self.shared, &self.pool, tablet)? else {
            return Ok(false);
        };
        if self.is_enabled() && !context.enable() {
            log::warn!("{} added but could not be enabled", context.id());
        }
        self.swap_contexts(|contexts| {
            let at = index.min(contexts.len());
            contexts.insert(at, context);
        });
        Ok(true)
    }

    /// The tablet at position `index` went away. Returns its context, already disabled
    /// and, unless a pointer is still in range, closed.
    pub fn remove_device_at(&self, index: usize) -> Option<Arc<DeviceContext>> {
        let mut removed = None;
        self.swap_contexts(|contexts| {
            if index < contexts.len() {
                removed = Some(contexts.remove(index));
            }
        });
        let removed = removed?;
        self.retire(&removed);
        Some(removed)
    }

    /// Disable `context` and make sure its channel gets closed by someone.
    fn retire(&self, context: &DeviceContext) {
        context.disable(false);
        // Registered contexts are closed by their worker. This one never was.
        if context.is_destroyed() || context.worker().is_some() {
            return;
        }
        match self
            .admin()
            .and_then(|admin| Ok(admin.close_context(context.native().comm)?))
        {
            Ok(_) => context.mark_destroyed(),
            Err(e) => log::warn!("closing unregistered {} failed: {e}", context.id()),
        }
    }

    /// Whether a pointer event at `timestamp` is plausibly part of a hover on this target:
    /// some in-range event is still unconsumed, or one arrived within the recency window.
    #[must_use]
    pub fn consider_in_range(&self, timestamp: Tick) -> bool {
        let window = self.pool.config().in_range_window;
        self.contexts().iter().any(|context| {
            context.queued_in_range() > 0
                || context
                    .last_in_range()
                    .is_some_and(|last| last.within(timestamp, window))
        })
    }

    pub fn set_location(&self, location: ScreenPoint) {
        *self.location.lock().unwrap_or_else(PoisonError::into_inner) = Some(location);
    }
    /// Last location given to [`Self::set_location`]. Survives disabling, for mapping
    /// late events.
    #[must_use]
    pub fn last_location(&self) -> Option<ScreenPoint> {
        *self.location.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Query the current tablet and display extents for device `device`, holding the tablet's
    /// lock around the query. `Ok(None)` if there's no such device or the driver refused.
    /// # Errors
    /// If the administrative worker went away.
    pub fn refresh_geometry(&self, device: usize) -> Result<Option<Geometry>, GroupError> {
        let Some(tablet) = self.tablet_at(device) else {
            return Ok(None);
        };
        self.with_tablet_lock(&tablet, |admin| admin.updated_geometry(tablet.index))
            .map(Option::flatten)
    }
    /// # Errors
    /// If the administrative worker went away.
    pub fn refresh_cursors(&self, device: usize) -> Result<Vec<CursorInfo>, GroupError> {
        let Some(tablet) = self.tablet_at(device) else {
            return Ok(Vec::new());
        };
        self.with_tablet_lock(&tablet, |admin| admin.refresh_cursors(tablet.index))
            .map(Option::unwrap_or_default)
    }
    fn tablet_at(&self, device: usize) -> Option<TabletInfo> {
        self.contexts()
            .get(device)
            .map(|context| context.tablet().clone())
    }
    fn with_tablet_lock<T>(
        &self,
        tablet: &TabletInfo,
        query: impl FnOnce(&PenWorker) -> Result<T, WorkerError>,
    ) -> Result<Option<T>, GroupError> {
        let admin = self.admin()?;
        if !admin.acquire_lock(tablet.lock)? {
            return Ok(None);
        }
        let result = query(&admin);
        // Release regardless of how the query went.
        let released = admin.release_lock(tablet.lock);
        let value = result?;
        if !released? {
            log::warn!("releasing lock of tablet {} failed", tablet.index);
        }
        Ok(Some(value))
    }
}

/// Open a context for `tablet` through `admin`. `Ok(None)` if the driver refused.
fn open(
    admin: &PenWorker,
    shared: &Arc<GroupShared>,
    pool: &Arc<WorkerPool>,
    tablet: TabletInfo,
) -> Result<Option<Arc<DeviceContext>>, WorkerError> {
    let Some(native) = admin.create_context(shared.target(), tablet.index)? else {
        log::warn!("no context for tablet {} ({})", tablet.index, tablet.name);
        return Ok(None);
    };
    Ok(Some(DeviceContext::new(
        native,
        tablet,
        shared.clone(),
        pool.clone(),
    )))
}

impl Drop for ContextGroup {
    fn drop(&mut self) {
        self.disable(false);
        for context in self.contexts().iter() {
            self.retire(context);
        }
    }
}

impl std::fmt::Debug for ContextGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextGroup")
            .field("target", &self.target())
            .field("contexts", &self.contexts().len())
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

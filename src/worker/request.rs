//! Synchronous work requests, marshalled onto a polling thread.
//!
//! Every driver call an outside thread needs goes through here: the request is queued, the
//! worker's wake event is raised, and the issuer blocks on the [`Pending`] half until the
//! worker has run it. A request whose handler fails or unwinds drops its [`Reply`] without
//! sending, which the issuer observes as a disconnected channel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::context::{ContextId, DeviceContext};
use crate::driver::{
    CommHandle, CursorInfo, DriverError, Geometry, LockToken, NativeContext, TabletInfo, TargetId,
};

use super::{AddOutcome, RemoveOutcome, WorkerState};

/// Sending half of a request's output slot. Dropping it unsent signals failure.
pub(crate) struct Reply<T>(crossbeam_channel::Sender<T>);
impl<T> Reply<T> {
    pub(crate) fn send(self, value: T) {
        // The issuer only goes away if it panicked, nobody left to tell.
        let _ = self.0.send(value);
    }
}

/// Receiving half, held by the issuing thread.
pub(crate) struct Pending<T>(crossbeam_channel::Receiver<T>);
impl<T> Pending<T> {
    /// Block until the request has run. `None` if it failed without producing output.
    pub(crate) fn wait(self) -> Option<T> {
        self.0.recv().ok()
    }
}

pub(crate) fn reply_channel<T>() -> (Reply<T>, Pending<T>) {
    // Rendezvous-ish: exactly one value ever crosses.
    let (tx, rx) = crossbeam_channel::bounded(1);
    (Reply(tx), Pending(rx))
}

/// Turn an expected driver failure into `None`, logged. Anything else is passed through and
/// takes the worker down.
pub(crate) fn recover<T>(
    result: Result<T, DriverError>,
    what: &str,
) -> Result<Option<T>, DriverError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_expected() => {
            log::warn!("{what} failed: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[enum_dispatch::enum_dispatch]
pub(crate) trait Execute {
    /// Run on the polling thread. The reply must be sent before returning `Ok`.
    fn execute(self, state: &mut WorkerState) -> Result<(), DriverError>;
    fn name(&self) -> &'static str;
}

#[enum_dispatch::enum_dispatch(Execute)]
pub(crate) enum WorkRequest {
    Start,
    Enumerate,
    QueryTablet,
    CreateContext,
    CloseContext,
    AcquireLock,
    ReleaseLock,
    RefreshCursors,
    UpdatedGeometry,
    AddContext,
    RemoveContext,
}

/// First request every worker runs. Sets up the wake event on the worker's own thread.
pub(crate) struct Start {
    pub reply: Reply<bool>,
}
impl Execute for Start {
    fn execute(self, state: &mut WorkerState) -> Result<(), DriverError> {
        let wake = recover(state.driver().create_wake_event(), "creating wake event")?;
        let started = wake.is_some_and(|wake| state.set_wake(wake));
        self.reply.send(started);
        Ok(())
    }
    fn name(&self) -> &'static str {
        "start"
    }
}

pub(crate) struct Enumerate {
    pub reply: Reply<Vec<TabletInfo>>,
}
impl Execute for Enumerate {
    fn execute(self, state: &mut WorkerState) -> Result<(), DriverError> {
        let tablets = recover(state.driver().enumerate_tablets(), "enumerating tablets")?;
        self.reply.send(tablets.unwrap_or_default());
        Ok(())
    }
    fn name(&self) -> &'static str {
        "enumerate"
    }
}

pub(crate) struct QueryTablet {
    pub index: usize,
    pub reply: Reply<Option<TabletInfo>>,
}
impl Execute for QueryTablet {
    fn execute(self, state: &mut WorkerState) -> Result<(), DriverError> {
        let info = recover(state.driver().tablet_info(self.index), "querying tablet")?;
        self.reply.send(info);
        Ok(())
    }
    fn name(&self) -> &'static str {
        "tablet info"
    }
}

pub(crate) struct CreateContext {
    pub target: TargetId,
    pub tablet: usize,
    pub reply: Reply<Option<NativeContext>>,
}
impl Execute for CreateContext {
    fn execute(self, state: &mut WorkerState) -> Result<(), DriverError> {
        let native = recover(
            state.driver().create_context(self.target, self.tablet),
            "creating context",
        )?;
        self.reply.send(native);
        Ok(())
    }
    fn name(&self) -> &'static str {
        "create context"
    }
}

pub(crate) struct CloseContext {
    pub comm: CommHandle,
    pub reply: Reply<bool>,
}
impl Execute for CloseContext {
    fn execute(self, state: &mut WorkerState) -> Result<(), DriverError> {
        let closed = recover(state.driver().close_context(self.comm), "closing context")?;
        self.reply.send(closed.is_some());
        Ok(())
    }
    fn name(&self) -> &'static str {
        "close context"
    }
}

pub(crate) struct AcquireLock {
    pub token: LockToken,
    pub reply: Reply<bool>,
}
impl Execute for AcquireLock {
    fn execute(self, state: &mut WorkerState) -> Result<(), DriverError> {
        let locked = recover(state.driver().acquire_lock(self.token), "acquiring lock")?;
        self.reply.send(locked.is_some());
        Ok(())
    }
    fn name(&self) -> &'static str {
        "acquire lock"
    }
}

pub(crate) struct ReleaseLock {
    pub token: LockToken,
    pub reply: Reply<bool>,
}
impl Execute for ReleaseLock {
    fn execute(self, state: &mut WorkerState) -> Result<(), DriverError> {
        let released = recover(state.driver().release_lock(self.token), "releasing lock")?;
        self.reply.send(released.is_some());
        Ok(())
    }
    fn name(&self) -> &'static str {
        "release lock"
    }
}

pub(crate) struct RefreshCursors {
    pub tablet: usize,
    pub reply: Reply<Vec<CursorInfo>>,
}
impl Execute for RefreshCursors {
    fn execute(self, state: &mut WorkerState) -> Result<(), DriverError> {
        let cursors = recover(state.driver().refresh_cursors(self.tablet), "refreshing cursors")?;
        self.reply.send(cursors.unwrap_or_default());
        Ok(())
    }
    fn name(&self) -> &'static str {
        "refresh cursors"
    }
}

pub(crate) struct UpdatedGeometry {
    pub tablet: usize,
    pub reply: Reply<Option<Geometry>>,
}
impl Execute for UpdatedGeometry {
    fn execute(self, state: &mut WorkerState) -> Result<(), DriverError> {
        let geometry = recover(state.driver().updated_geometry(self.tablet), "querying geometry")?;
        self.reply.send(geometry);
        Ok(())
    }
    fn name(&self) -> &'static str {
        "updated geometry"
    }
}

pub(crate) struct AddContext {
    pub context: Arc<DeviceContext>,
    pub reply: Reply<AddOutcome>,
}
impl Execute for AddContext {
    fn execute(self, state: &mut WorkerState) -> Result<(), DriverError> {
        let added = state.add_context(&self.context)?;
        self.reply.send(added);
        Ok(())
    }
    fn name(&self) -> &'static str {
        "add context"
    }
}

pub(crate) struct RemoveContext {
    pub id: ContextId,
    pub reply: Reply<RemoveOutcome>,
}
impl Execute for RemoveContext {
    fn execute(self, state: &mut WorkerState) -> Result<(), DriverError> {
        let outcome = state.remove_context(self.id)?;
        self.reply.send(outcome);
        Ok(())
    }
    fn name(&self) -> &'static str {
        "remove context"
    }
}

#[derive(Default)]
struct QueueInner {
    requests: VecDeque<WorkRequest>,
    /// Set once the worker has exited. Nothing queued after this would ever run.
    closed: bool,
}

/// Internally locked FIFO of requests for one worker.
#[derive(Default)]
pub(crate) struct WorkQueue {
    inner: Mutex<QueueInner>,
}
impl WorkQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
    /// Append a request. Hands it back if the worker is gone.
    pub(crate) fn push(&self, request: WorkRequest) -> Result<(), WorkRequest> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(request);
        }
        inner.requests.push_back(request);
        Ok(())
    }
    /// Everything queued right now, in submission order.
    pub(crate) fn take_all(&self) -> VecDeque<WorkRequest> {
        std::mem::take(&mut self.lock().requests)
    }
    /// Refuse further requests and return whatever was still queued.
    pub(crate) fn close(&self) -> VecDeque<WorkRequest> {
        let mut inner = self.lock();
        inner.closed = true;
        std::mem::take(&mut inner.requests)
    }
}

//! The native digitizer driver, as consumed by the polling threads.
//!
//! Nothing here talks to hardware - a platform binding implements [`Driver`] and hands it to
//! [`crate::Builder::build`]. Every method except [`Driver::raise_wake_event`] is only ever
//! invoked on the polling thread that issued [`Driver::create_wake_event`] for it, and this
//! is asserted at runtime.

use crate::util::Tick;

pub mod packet;
pub use packet::{PacketDescription, PacketProperty, PacketStatus, PropertyKind};

/// Platform limit on how many objects a single wait call may multiplex.
pub const WAIT_OBJECT_LIMIT: usize = 64;
/// How many device contexts one polling thread can hold. Each context costs two wait
/// slots, and one slot is reserved for the thread's own wake event.
pub const MAX_CONTEXTS_PER_THREAD: usize = (WAIT_OBJECT_LIMIT - 1) / 2;

/// Opaque identity of the top-level target (usually a window) a context delivers for.
#[derive(Copy, Clone, Hash, PartialEq, Eq, Debug)]
pub struct TargetId(pub u64);
impl TargetId {
    /// Derive a target id from a windowing library's handle. `None` for handle kinds that
    /// carry no stable window identity.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn from_window_handle(handle: raw_window_handle::RawWindowHandle) -> Option<Self> {
        use raw_window_handle::RawWindowHandle as Raw;
        // Bitwise reinterpretation is intended, we only care about uniqueness.
        let id = match handle {
            Raw::Win32(h) => h.hwnd.get() as u64,
            Raw::Xlib(h) => u64::from(h.window),
            Raw::Xcb(h) => u64::from(h.window.get()),
            Raw::Wayland(h) => h.surface.as_ptr() as usize as u64,
            Raw::AppKit(h) => h.ns_view.as_ptr() as usize as u64,
            _ => return None,
        };
        Some(Self(id))
    }
}

/// Native communication handle for one open context. Platform pointer-sized.
#[derive(Copy, Clone, Hash, PartialEq, Eq, Debug)]
pub struct CommHandle(pub usize);

/// Opaque native lock token. Acquire and release must be balanced exactly.
#[derive(Copy, Clone, Hash, PartialEq, Eq, Debug)]
pub struct LockToken(pub u64);

/// A wake/reset event owned by one polling thread.
#[derive(Copy, Clone, Hash, PartialEq, Eq, Debug)]
pub struct WakeEvent(pub usize);

/// What the driver hands back from [`Driver::create_context`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NativeContext {
    /// Driver-assigned context id.
    pub id: u32,
    pub comm: CommHandle,
    pub lock: LockToken,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum DeviceKind {
    Pen,
    Touch,
    Mouse,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabletInfo {
    /// Position in the driver's enumeration order.
    pub index: usize,
    /// Stable driver id, if the driver has one.
    pub id: u32,
    pub name: String,
    pub plug_and_play_id: String,
    pub kind: DeviceKind,
    /// Maximum simultaneous contacts, 1 for a plain pen.
    pub max_contacts: u32,
    /// Lock held while this tablet is queried outside of a context.
    pub lock: LockToken,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorInfo {
    pub id: u32,
    pub name: String,
    /// Eraser end of a stylus.
    pub inverted: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

/// Result of [`Driver::updated_geometry`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Geometry {
    /// Tablet extents, in tablet units.
    pub tablet: Size,
    /// Display extents, in pixels.
    pub display: Size,
}

/// Event kinds reported by [`Driver::wait_for_event`].
///
/// Discriminants are the driver's own codes, and are preserved for binary compatibility.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
#[repr(i32)]
pub enum EventKind {
    Timeout = 1,
    PenInRange = 707,
    PenOutOfRange = 708,
    PenDown = 709,
    PenUp = 710,
    Packets = 711,
    SystemEvent = 714,
}
impl EventKind {
    /// Steady movement, the only kind eligible for coalescing.
    #[must_use]
    pub fn is_move(self) -> bool {
        self == Self::Packets
    }
}

/// One raw event, as read off a device handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub pointer_id: u32,
    /// Driver tick at which the event was produced.
    pub timestamp: Tick,
    pub packet_count: u32,
    pub bytes_per_packet: u32,
    /// `packet_count * bytes_per_packet` bytes of native-endian `i32` properties.
    pub buffer: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Nothing happened within the timeout.
    Timeout,
    /// The wake event was raised (work was queued or disposal requested).
    Woken,
    /// A device handle was signalled. `index` refers to the handle slice given to the wait.
    Event { index: usize, event: RawEvent },
}

/// Driver failure categories.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("access denied")]
    AccessDenied,
    #[error("object does not support the requested interface")]
    BadCast,
    #[error("driver communication failure")]
    Communication,
    /// Anything the driver reports outside the categories above. Fatal to the worker.
    #[error("unexpected driver failure: {0}")]
    Fatal(String),
}
impl DriverError {
    /// Expected failures are recovered where they occur; the rest take the worker down.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// The native tablet manager.
///
/// Calls may block for a long time and may pump messages internally, which is why they are
/// confined to dedicated polling threads. Implementations are shared between those threads.
pub trait Driver: Send + Sync + 'static {
    #[allow(clippy::missing_errors_doc)]
    fn enumerate_tablets(&self) -> Result<Vec<TabletInfo>, DriverError>;
    #[allow(clippy::missing_errors_doc)]
    fn tablet_info(&self, index: usize) -> Result<TabletInfo, DriverError>;
    /// Open a communication channel to tablet `tablet` for `target`.
    #[allow(clippy::missing_errors_doc)]
    fn create_context(&self, target: TargetId, tablet: usize)
        -> Result<NativeContext, DriverError>;
    /// Shut down a channel previously opened with [`Driver::create_context`].
    #[allow(clippy::missing_errors_doc)]
    fn close_context(&self, comm: CommHandle) -> Result<(), DriverError>;
    #[allow(clippy::missing_errors_doc)]
    fn packet_description(&self, comm: CommHandle) -> Result<PacketDescription, DriverError>;
    #[allow(clippy::missing_errors_doc)]
    fn acquire_lock(&self, token: LockToken) -> Result<(), DriverError>;
    #[allow(clippy::missing_errors_doc)]
    fn release_lock(&self, token: LockToken) -> Result<(), DriverError>;
    #[allow(clippy::missing_errors_doc)]
    fn refresh_cursors(&self, tablet: usize) -> Result<Vec<CursorInfo>, DriverError>;
    #[allow(clippy::missing_errors_doc)]
    fn updated_geometry(&self, tablet: usize) -> Result<Geometry, DriverError>;

    #[allow(clippy::missing_errors_doc)]
    fn create_wake_event(&self) -> Result<WakeEvent, DriverError>;
    fn destroy_wake_event(&self, wake: WakeEvent);
    /// Signal `wake`. The only method that may be called from any thread.
    fn raise_wake_event(&self, wake: WakeEvent);
    /// Block until one of `handles` has an event, `wake` is raised, or `timeout` elapses.
    /// Raising `wake` is consumed (auto-reset) by the wait that observes it.
    #[allow(clippy::missing_errors_doc)]
    fn wait_for_event(
        &self,
        handles: &[CommHandle],
        wake: WakeEvent,
        timeout: std::time::Duration,
    ) -> Result<WaitOutcome, DriverError>;
}

//! # Off-thread [digitizer](driver) event polling 🖊️🧵
//!
//! Native pen and touch drivers are slow, block for long stretches, and are hostile to being
//! called from a UI thread. This crate keeps every driver call on a small set of dedicated
//! [polling threads](worker), each multiplexing up to [`driver::MAX_CONTEXTS_PER_THREAD`]
//! device channels, and hands decoded events back to a single consumer thread through a
//! [`DispatchQueue`](dispatch::DispatchQueue).
//!
//! The platform binding itself is not part of this crate. Implement [`driver::Driver`] over
//! it and hand it to a [`Builder`].
//!
//! ## Overview
//! * A [`WorkerPool`](pool::WorkerPool) owns the polling threads and places contexts on them.
//! * A [`ContextGroup`](group::ContextGroup) holds one [`DeviceContext`](context::DeviceContext)
//!   per tablet for a single target window, and routes their events to an
//!   [`EventSink`](events::EventSink).
//! * Per device, reported timestamps strictly increase (even as the hardware clock wraps),
//!   and high-rate moves are coalesced without dropping or reordering samples.
//!
//! ```no_run
//! # fn get_driver() -> std::sync::Arc<dyn penflow::driver::Driver> { unimplemented!() }
//! use std::sync::Arc;
//! use penflow::{dispatch::DispatchQueue, driver::TargetId, group::ContextGroup};
//!
//! let pool = penflow::Builder::new().build(get_driver())?;
//! let queue = DispatchQueue::new(Arc::new(|| { /* poke the event loop */ }));
//! let group = ContextGroup::new(&pool, TargetId(0x1234), queue.clone())?;
//! group.enable();
//!
//! // Later, on the event loop:
//! queue.process_pending(|event| println!("{:?} {}", event.kind, event.timestamp));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! **Note:** quirky drivers exist. Out-of-range is forced for every tracked pointer whenever a
//! worker sits idle, so a driver that forgets the terminal event still produces one.

#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod builder;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod events;
pub mod group;
pub mod pool;
pub mod util;
pub mod worker;
pub use builder::Builder;

#[cfg(test)]
pub(crate) mod testing {
    //! Stand-ins for unit tests that don't exercise the driver.

    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    use crate::driver::{
        CommHandle, CursorInfo, DeviceKind, Driver, DriverError, Geometry, LockToken,
        NativeContext, PacketDescription, TabletInfo, TargetId, WaitOutcome, WakeEvent,
    };
    use crate::events::PenEvent;
    use crate::group::GroupShared;

    /// A driver with no tablets that refuses everything but wake events.
    pub(crate) struct NullDriver;
    impl NullDriver {
        pub(crate) fn tablet(index: usize) -> TabletInfo {
            TabletInfo {
                index,
                id: u32::try_from(index).unwrap_or_default(),
                name: format!("null tablet {index}"),
                plug_and_play_id: String::new(),
                kind: DeviceKind::Pen,
                max_contacts: 1,
                lock: LockToken(index as u64),
            }
        }
    }
    impl Driver for NullDriver {
        fn enumerate_tablets(&self) -> Result<Vec<TabletInfo>, DriverError> {
            Ok(Vec::new())
        }
        fn tablet_info(&self, _: usize) -> Result<TabletInfo, DriverError> {
            Err(DriverError::InvalidArgument)
        }
        fn create_context(&self, _: TargetId, _: usize) -> Result<NativeContext, DriverError> {
            Err(DriverError::InvalidArgument)
        }
        fn close_context(&self, _: CommHandle) -> Result<(), DriverError> {
            Ok(())
        }
        fn packet_description(&self, _: CommHandle) -> Result<PacketDescription, DriverError> {
            Err(DriverError::Communication)
        }
        fn acquire_lock(&self, _: LockToken) -> Result<(), DriverError> {
            Err(DriverError::AccessDenied)
        }
        fn release_lock(&self, _: LockToken) -> Result<(), DriverError> {
            Err(DriverError::AccessDenied)
        }
        fn refresh_cursors(&self, _: usize) -> Result<Vec<CursorInfo>, DriverError> {
            Err(DriverError::Communication)
        }
        fn updated_geometry(&self, _: usize) -> Result<Geometry, DriverError> {
            Err(DriverError::Communication)
        }
        fn create_wake_event(&self) -> Result<WakeEvent, DriverError> {
            Ok(WakeEvent(0))
        }
        fn destroy_wake_event(&self, _: WakeEvent) {}
        fn raise_wake_event(&self, _: WakeEvent) {}
        fn wait_for_event(
            &self,
            _: &[CommHandle],
            _: WakeEvent,
            timeout: Duration,
        ) -> Result<WaitOutcome, DriverError> {
            // Never actually woken, keep disposal latency low.
            std::thread::sleep(timeout.min(Duration::from_millis(2)));
            Ok(WaitOutcome::Timeout)
        }
    }

    /// Everything a group routed, in order.
    #[derive(Clone, Default)]
    pub(crate) struct Recorded(Arc<Mutex<Vec<PenEvent>>>);
    impl Recorded {
        pub(crate) fn take(&self) -> Vec<PenEvent> {
            std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
        }
    }

    pub(crate) fn recording_group() -> (Arc<GroupShared>, Recorded) {
        let recorded = Recorded::default();
        let sink = recorded.clone();
        let group = GroupShared::new(
            TargetId(1),
            Arc::new(move |event: PenEvent| {
                sink.0
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(event);
            }),
        );
        (group, recorded)
    }
}

//! Events delivered out of the polling threads.
//!
//! A [`PenEvent`] is produced on a polling thread by a
//! [`DeviceContext`](crate::context::DeviceContext), routed through its
//! [`ContextGroup`](crate::group::ContextGroup), and handed to whatever [`EventSink`] the
//! group was built with. Usually that's a [`DispatchQueue`](crate::dispatch::DispatchQueue)
//! feeding the application's event loop.

use std::sync::{atomic, Arc};

use smallvec::SmallVec;

use crate::context::ContextId;
use crate::driver::TargetId;
use crate::util::Tick;

/// Raw packet words, `stride` words per packet.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct PacketData {
    values: SmallVec<[i32; 32]>,
    stride: usize,
}
impl PacketData {
    #[must_use]
    pub fn new(values: SmallVec<[i32; 32]>, stride: usize) -> Self {
        Self { values, stride }
    }
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
    #[must_use]
    pub fn values(&self) -> &[i32] {
        &self.values
    }
    /// Words per packet.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.values.len().checked_div(self.stride).unwrap_or(0)
    }
    /// Iterate over whole packets. A trailing partial packet is never yielded.
    pub fn packets(&self) -> impl Iterator<Item = &[i32]> + '_ {
        // `chunks_exact` panics on zero.
        self.values.chunks_exact(self.stride.max(1))
    }
    /// Concatenate `other` onto the end of this buffer. Order is preserved, nothing is dropped.
    pub fn append(&mut self, other: &PacketData) {
        if self.values.is_empty() {
            self.stride = other.stride;
        }
        debug_assert!(
            other.is_empty() || other.stride == self.stride,
            "appending packets of a different shape"
        );
        self.values.extend_from_slice(&other.values);
    }
}
impl std::fmt::Debug for PacketData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketData")
            .field("packets", &self.packet_count())
            .field("stride", &self.stride)
            .finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum PenEventKind {
    InRange,
    OutOfRange,
    Down,
    Up,
    /// Movement while touching the surface.
    Packets,
    /// Movement while hovering.
    InAirPackets,
    SystemGesture,
}
impl PenEventKind {
    #[must_use]
    pub fn is_move(self) -> bool {
        matches!(self, Self::Packets | Self::InAirPackets)
    }
}

/// Holds one unit of a context's queued-in-range count until the consumer is done with
/// the in-range event carrying it.
#[derive(Debug)]
pub struct InRangeTicket(Arc<atomic::AtomicU32>);
impl InRangeTicket {
    pub(crate) fn issue(counter: &Arc<atomic::AtomicU32>) -> Self {
        counter.fetch_add(1, atomic::Ordering::AcqRel);
        Self(counter.clone())
    }
}
impl Drop for InRangeTicket {
    fn drop(&mut self) {
        self.0.fetch_sub(1, atomic::Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub struct PenEvent {
    pub context: ContextId,
    pub target: TargetId,
    pub pointer_id: u32,
    /// Normalized: strictly increasing per context, except that in-range resets.
    pub timestamp: Tick,
    pub kind: PenEventKind,
    pub data: PacketData,
    /// Present on [`PenEventKind::InRange`] only.
    pub ticket: Option<InRangeTicket>,
}

/// Receives every event a [`ContextGroup`](crate::group::ContextGroup) routes. Called on
/// polling threads, so this must never block on the consumer thread.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: PenEvent);
}
impl<F> EventSink for F
where
    F: Fn(PenEvent) + Send + Sync,
{
    fn deliver(&self, event: PenEvent) {
        self(event);
    }
}

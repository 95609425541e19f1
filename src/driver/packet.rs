//! Packet layout descriptions and raw buffer decoding.

use smallvec::SmallVec;

use super::{EventKind, RawEvent};
use crate::events::PacketData;

/// Packet properties a driver may report. X and Y are always present and always first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::Display)]
pub enum PropertyKind {
    X,
    Y,
    Z,
    NormalPressure,
    ButtonPressure,
    XTiltOrientation,
    YTiltOrientation,
    TwistOrientation,
    Width,
    Height,
    TimerTick,
    /// Always reported last, regardless of where it was requested.
    PacketStatus,
    /// A vendor property this crate doesn't interpret. Still occupies a slot.
    Other,
}

/// One slot in a packet.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PacketProperty {
    pub kind: PropertyKind,
    /// Quirks: Sometimes < 0 for units where that's meaningless
    pub min: i32,
    pub max: i32,
    /// Points per unit. Quirks: Sometimes zero
    pub resolution: f32,
}

bitflags::bitflags! {
    /// Bits of the [`PropertyKind::PacketStatus`] property.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct PacketStatus: i32 {
        const CONTACT = 0x01;
        const INVERTED = 0x02;
        const BARREL_BUTTON = 0x08;
        /// The digitizer to screen mapping changed and must be re-queried.
        const SCREEN_MAPPING_CHANGED = 0x10;
    }
}

/// The shape of packets produced by one context. Built lazily, since asking the driver
/// is expensive.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct PacketDescription {
    /// In packet order. Every property is one `i32` wide.
    pub properties: SmallVec<[PacketProperty; 12]>,
    /// Number of buttons reported in the trailing button bitfield, if any.
    pub buttons: u32,
}
impl PacketDescription {
    /// Number of `i32` words in one packet.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.properties.len()
    }
    /// Index of the status word within a packet.
    #[must_use]
    pub fn status_index(&self) -> Option<usize> {
        self.properties
            .iter()
            .position(|prop| prop.kind == PropertyKind::PacketStatus)
    }
    /// Whether any packet in `data` carries [`PacketStatus::SCREEN_MAPPING_CHANGED`].
    #[must_use]
    pub fn mapping_changed(&self, data: &PacketData) -> bool {
        let Some(status) = self.status_index() else {
            return false;
        };
        data.packets().any(|packet| {
            packet.get(status).is_some_and(|&word| {
                PacketStatus::from_bits_retain(word).contains(PacketStatus::SCREEN_MAPPING_CHANGED)
            })
        })
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// `packet_count * bytes_per_packet` isn't a whole number of `i32`s. Also raised when
    /// only the total is, since packets wouldn't start on word boundaries.
    #[error("{packet_count} packets of {bytes_per_packet} bytes is not a whole number of words")]
    Misaligned {
        packet_count: u32,
        bytes_per_packet: u32,
    },
    #[error("packet buffer holds {actual} bytes, header claims {expected}")]
    Truncated { expected: usize, actual: usize },
}

const WORD: usize = std::mem::size_of::<i32>();

/// Decode the packet buffer of `event`. No partial decode is ever attempted.
///
/// # Errors
/// If the header disagrees with the buffer in any way.
pub fn decode(event: &RawEvent) -> Result<PacketData, ProtocolError> {
    let misaligned = ProtocolError::Misaligned {
        packet_count: event.packet_count,
        bytes_per_packet: event.bytes_per_packet,
    };
    // u32 * u32 fits u64 always. Only the conversion to usize can fail.
    let total = u64::from(event.packet_count) * u64::from(event.bytes_per_packet);
    let total = usize::try_from(total).map_err(|_| misaligned)?;
    if total % WORD != 0 || (event.bytes_per_packet as usize) % WORD != 0 {
        return Err(misaligned);
    }
    let bytes = event.buffer.get(..total).ok_or(ProtocolError::Truncated {
        expected: total,
        actual: event.buffer.len(),
    })?;

    let values = bytes
        .chunks_exact(WORD)
        .map(|word| {
            // Infallible, `chunks_exact` yields exactly `WORD` bytes.
            let mut raw = [0; WORD];
            raw.copy_from_slice(word);
            i32::from_ne_bytes(raw)
        })
        .collect();
    Ok(PacketData::new(values, event.bytes_per_packet as usize / WORD))
}

/// Whether `kind` carries packets worth decoding.
#[must_use]
pub fn carries_packets(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::PenDown | EventKind::PenUp | EventKind::Packets | EventKind::SystemEvent
    )
}

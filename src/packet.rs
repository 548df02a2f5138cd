//! Move-only wrappers around the two packet shapes crossing the proxy.
//!
//! Packets heading for the controller carry their framing type embedded as
//! the first byte of the buffer ([`H4Packet`]). Packets heading for the host
//! carry the type out of band next to a plain HCI span ([`HciPacket`]).
//! Ownership transfers into the sink on hand-off; the sink is the last place
//! the contents may be inspected.

use crate::packet_pool::PoolPacket;
use crate::types::H4PacketType;

/// A full H4 frame on its way to the controller.
pub enum H4Packet<'a, 'd> {
    /// A caller-owned frame being passed through.
    Borrowed(&'a mut [u8]),
    /// A proxy-originated frame backed by the buffer pool. Releases its pool
    /// slot when dropped.
    Pooled(PoolPacket<'d>),
}

impl H4Packet<'_, '_> {
    /// The framing type from the first byte. A zero-length frame has no byte
    /// to store one and reads as [`H4PacketType::Unknown`].
    pub fn h4_type(&self) -> H4PacketType {
        self.as_ref().first().map(|b| H4PacketType::from(*b)).unwrap_or(H4PacketType::Unknown)
    }

    /// The HCI packet, i.e. everything after the framing type byte.
    pub fn hci_span(&self) -> &[u8] {
        let data = self.as_ref();
        if data.is_empty() {
            data
        } else {
            &data[1..]
        }
    }
}

impl AsRef<[u8]> for H4Packet<'_, '_> {
    fn as_ref(&self) -> &[u8] {
        match self {
            H4Packet::Borrowed(data) => data,
            H4Packet::Pooled(packet) => packet.as_ref(),
        }
    }
}

/// An HCI packet on its way to the host, with its H4 type alongside.
pub struct HciPacket<'a> {
    kind: H4PacketType,
    data: &'a mut [u8],
}

impl<'a> HciPacket<'a> {
    pub fn new(kind: H4PacketType, data: &'a mut [u8]) -> Self {
        Self { kind, data }
    }

    pub fn h4_type(&self) -> H4PacketType {
        self.kind
    }
}

impl AsRef<[u8]> for HciPacket<'_> {
    fn as_ref(&self) -> &[u8] {
        &*self.data
    }
}

impl AsMut<[u8]> for HciPacket<'_> {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut *self.data
    }
}

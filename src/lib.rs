#![no_std]

//! A transparent, in-line proxy sitting on the HCI transport between a host
//! stack and a Bluetooth controller.
//!
//! The proxy intercepts H4-framed HCI packets flowing in both directions. It
//! may inspect, rewrite or originate packets; everything else is passed
//! through unmodified and without copying. On top of the pass-through it
//! reserves a slice of the controller's ACL send credits for itself, which
//! lets it transmit L2CAP traffic (GATT notifications, connection-oriented
//! channel data) without the host stack ever noticing.
//!
//! The container owns the transport. It feeds packets in through
//! [`ProxyHost::handle_h4_from_host`] and [`ProxyHost::handle_h4_from_controller`]
//! and receives the (possibly rewritten) traffic through the two sink
//! callbacks supplied at construction.

// This mod MUST go first, so that the others see its macros.
mod fmt;

mod acl;
mod channel_manager;
mod codec;
mod cursor;
mod hci;
mod l2cap;

pub mod config;
pub mod host;
pub mod packet;
pub mod packet_pool;
pub mod status;
pub mod types;

pub use host::{ProxyHost, ProxyResources};
pub use l2cap::{ChannelHandle, CocConfig, L2capChannelEvent};
pub use packet::{H4Packet, HciPacket};
pub use packet_pool::PoolPacket;
pub use status::{L2capConnectionInfo, L2capStatusDelegate};
pub use types::{H4PacketType, Transport};

/// Errors returned by the proxy.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A client request was malformed (oversized payload, invalid handle, ...).
    InvalidArgument,
    /// A transient resource (buffer, credit, queue slot) is exhausted. The
    /// caller is expected to retry once resources are signalled free again.
    Unavailable,
    /// The operation requires a channel in the `Running` state.
    FailedPrecondition,
    /// No matching entry was found.
    NotFound,
    /// The operation conflicts with current internal state.
    InvalidState,
    /// A buffer was too small for the data written into it.
    InsufficientSpace,
}

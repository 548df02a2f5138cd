//! L2CAP channel types exposed to proxy clients.

pub(crate) mod sar;

/// Handle to a registered L2CAP channel.
///
/// Handles are generation-tagged: once the channel is closed, the handle goes
/// stale and every use of it returns `InvalidArgument`, even if the slot has
/// been reused for a new channel.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHandle {
    pub(crate) index: u8,
    pub(crate) generation: u16,
}

/// Parameters for one direction of packet flow on a credit-based
/// (connection-oriented) channel.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct CocConfig {
    /// Channel identifier of the endpoint.
    /// For Rx: local CID. For Tx: remote CID.
    pub cid: u16,
    /// Maximum SDU size the endpoint accepts.
    pub mtu: u16,
    /// Maximum PDU payload size the endpoint accepts.
    pub mps: u16,
    /// Initial K-frame credits for this direction.
    pub credits: u16,
}

/// Asynchronous events delivered through a channel's event callback.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelEvent {
    /// A previous write returned `Unavailable`; queue space or buffers are
    /// available again.
    WriteAvailable,
    /// A packet arrived while the channel was stopped and was dropped.
    RxWhileStopped,
    /// An invalid packet arrived. The channel has been stopped.
    RxInvalid,
    /// An inbound fragment or segmented SDU could not be delivered and was
    /// dropped.
    RxFragmentDropped,
    /// The L2CAP connection was closed by the other side (or the link went
    /// down). The channel has been deregistered.
    ChannelClosedByOther,
    /// The proxy was reset and the channel has been deregistered.
    Reset,
}

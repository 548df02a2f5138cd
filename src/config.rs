//! Compile-time configuration.
//!
//! All registries in this crate are statically sized. The constants below
//! bound the amount of state the proxy keeps; adjust them to the deployment
//! before building.

/// Max number of simultaneous ACL connections the proxy tracks per transport.
///
/// This bounds both the in-flight credit bookkeeping and the inbound
/// recombination state. Traffic on additional connections is still passed
/// through, the proxy just cannot originate packets on them.
///
/// Default: 4.
pub const MAX_ACL_CONNECTIONS: usize = 4;

/// Max number of L2CAP channels that can be registered at one time.
///
/// Default: 8.
pub const MAX_CHANNELS: usize = 8;

/// Per-channel outbound queue depth.
///
/// A write on a channel whose queue is full returns `Unavailable` and latches
/// a `WriteAvailable` event for when space frees up.
///
/// Default: 5.
pub const L2CAP_TX_QUEUE_SIZE: usize = 5;

/// Max number of registered [`L2capStatusDelegate`](crate::L2capStatusDelegate)s.
///
/// Default: 4.
pub const MAX_STATUS_DELEGATES: usize = 4;

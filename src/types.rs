//! Wire-level constants and tags shared across the crate.
//!
//! Everything on the wire is little endian, per the Bluetooth Core
//! Specification.

/// H4 framing type, the one-byte prefix on every packet on the transport.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H4PacketType {
    Command,
    AclData,
    Sync,
    Event,
    Iso,
    /// Anything we do not recognize, including a zero-length frame that has
    /// no byte to carry a type at all.
    Unknown,
}

impl From<u8> for H4PacketType {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Command,
            0x02 => Self::AclData,
            0x03 => Self::Sync,
            0x04 => Self::Event,
            0x05 => Self::Iso,
            _ => Self::Unknown,
        }
    }
}

impl H4PacketType {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::Command => 0x01,
            Self::AclData => 0x02,
            Self::Sync => 0x03,
            Self::Event => 0x04,
            Self::Iso => 0x05,
            Self::Unknown => 0x00,
        }
    }
}

/// Logical link transport an ACL connection runs on.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Le,
    BrEdr,
}

/// Largest valid ACL connection handle.
pub const MAX_VALID_CONN_HANDLE: u16 = 0x0EFF;

// HCI event codes the proxy acts on. All other events pass through.
pub(crate) const EVT_DISCONNECTION_COMPLETE: u8 = 0x05;
pub(crate) const EVT_COMMAND_COMPLETE: u8 = 0x0E;
pub(crate) const EVT_NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
pub(crate) const EVT_LE_META: u8 = 0x3E;

// Command opcodes whose Command_Complete return parameters are rewritten.
pub(crate) const OPCODE_READ_BUFFER_SIZE: u16 = 0x1005;
pub(crate) const OPCODE_LE_READ_BUFFER_SIZE_V1: u16 = 0x2002;
pub(crate) const OPCODE_LE_READ_BUFFER_SIZE_V2: u16 = 0x2060;

pub(crate) const STATUS_SUCCESS: u8 = 0x00;

// Fixed L2CAP channel identifiers.
pub(crate) const L2CAP_CID_ATT: u16 = 0x0004;
pub(crate) const L2CAP_CID_LE_U_SIGNAL: u16 = 0x0005;

// L2CAP signaling.
pub(crate) const L2CAP_FLOW_CONTROL_CREDIT_IND: u8 = 0x16;

// ATT opcodes.
pub(crate) const ATT_HANDLE_VALUE_NTF: u8 = 0x1B;

//! Typed views over raw HCI event and data structures.
//!
//! Every view checks structural completeness when it is constructed, so field
//! access on an existing view cannot run out of bounds. A buffer too short
//! for its view fails construction and the caller passes it through untouched
//! instead of parsing it.

use crate::cursor::ReadCursor;
use crate::Error;

/// Event packet header: event code plus parameter total length.
pub(crate) struct EventHeader {
    pub code: u8,
    #[allow(dead_code)]
    pub params_len: u8,
}

impl EventHeader {
    pub const SIZE: usize = 2;

    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut r = ReadCursor::new(data);
        Ok(Self {
            code: r.read()?,
            params_len: r.read()?,
        })
    }
}

/// Command_Complete event prefix, up to and including the command opcode.
pub(crate) struct CommandComplete {
    pub opcode: u16,
}

impl CommandComplete {
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut r = ReadCursor::new(data);
        let _header: u16 = r.read()?;
        let _num_hci_command_packets: u8 = r.read()?;
        Ok(Self { opcode: r.read()? })
    }
}

/// Which buffer-size command a Command_Complete event answers. The three
/// layouts differ in total size and in the width of the packet-count field.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferSizeLayout {
    LeV1,
    LeV2,
    BrEdr,
}

impl BufferSizeLayout {
    fn min_size(self) -> usize {
        match self {
            // header(2) + num_packets(1) + opcode(2) + status(1) + fields
            BufferSizeLayout::LeV1 => 9,
            BufferSizeLayout::LeV2 => 12,
            BufferSizeLayout::BrEdr => 13,
        }
    }

    fn total_offset(self) -> usize {
        match self {
            // status(1) + le_acl_data_packet_length(2)
            BufferSizeLayout::LeV1 | BufferSizeLayout::LeV2 => 8,
            // status(1) + acl_data_packet_length(2) + sco_data_packet_length(1)
            BufferSizeLayout::BrEdr => 9,
        }
    }
}

/// Writer over a (LE_)Read_Buffer_Size Command_Complete event. The proxy
/// rewrites the total-packets field in place so the host only sees its own
/// share of the controller's buffers.
pub(crate) struct ReadBufferSizeComplete<'a> {
    data: &'a mut [u8],
    layout: BufferSizeLayout,
}

impl<'a> ReadBufferSizeComplete<'a> {
    pub fn new(layout: BufferSizeLayout, data: &'a mut [u8]) -> Result<Self, Error> {
        if data.len() < layout.min_size() {
            return Err(Error::InsufficientSpace);
        }
        Ok(Self { data, layout })
    }

    pub fn status(&self) -> u8 {
        self.data[5]
    }

    pub fn controller_total(&self) -> u16 {
        let at = self.layout.total_offset();
        match self.layout {
            BufferSizeLayout::LeV1 | BufferSizeLayout::LeV2 => self.data[at] as u16,
            BufferSizeLayout::BrEdr => u16::from_le_bytes([self.data[at], self.data[at + 1]]),
        }
    }

    pub fn set_controller_total(&mut self, total: u16) {
        let at = self.layout.total_offset();
        match self.layout {
            BufferSizeLayout::LeV1 | BufferSizeLayout::LeV2 => self.data[at] = total as u8,
            BufferSizeLayout::BrEdr => self.data[at..at + 2].copy_from_slice(&total.to_le_bytes()),
        }
    }
}

/// Writer over a Number_Of_Completed_Packets event. Entries are rewritten in
/// place as the proxy reclaims its own share of the completions.
pub(crate) struct NumberOfCompletedPackets<'a> {
    data: &'a mut [u8],
    num_handles: usize,
}

impl<'a> NumberOfCompletedPackets<'a> {
    const ENTRY_SIZE: usize = 4;

    pub fn new(data: &'a mut [u8]) -> Result<Self, Error> {
        if data.len() < EventHeader::SIZE + 1 {
            return Err(Error::InsufficientSpace);
        }
        let num_handles = data[2] as usize;
        if data.len() < EventHeader::SIZE + 1 + num_handles * Self::ENTRY_SIZE {
            return Err(Error::InsufficientSpace);
        }
        Ok(Self { data, num_handles })
    }

    pub fn num_handles(&self) -> usize {
        self.num_handles
    }

    fn entry_offset(i: usize) -> usize {
        EventHeader::SIZE + 1 + i * Self::ENTRY_SIZE
    }

    pub fn connection_handle(&self, i: usize) -> u16 {
        let at = Self::entry_offset(i);
        u16::from_le_bytes([self.data[at], self.data[at + 1]]) & 0x0FFF
    }

    pub fn num_completed_packets(&self, i: usize) -> u16 {
        let at = Self::entry_offset(i) + 2;
        u16::from_le_bytes([self.data[at], self.data[at + 1]])
    }

    pub fn set_num_completed_packets(&mut self, i: usize, value: u16) {
        let at = Self::entry_offset(i) + 2;
        self.data[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }
}

/// Disconnection_Complete event.
pub(crate) struct DisconnectionComplete {
    pub status: u8,
    pub connection_handle: u16,
    #[allow(dead_code)]
    pub reason: u8,
}

impl DisconnectionComplete {
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut r = ReadCursor::new(data);
        let _header: u16 = r.read()?;
        let status: u8 = r.read()?;
        let handle: u16 = r.read()?;
        Ok(Self {
            status,
            connection_handle: handle & 0x0FFF,
            reason: r.read()?,
        })
    }
}

/// Packet boundary flag of an ACL data frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoundaryFlag {
    FirstNonFlushable,
    Continuing,
    FirstFlushable,
    Complete,
}

impl BoundaryFlag {
    pub fn is_continuation(self) -> bool {
        matches!(self, BoundaryFlag::Continuing)
    }
}

/// Read view of an ACL data frame: handle, flags, length, payload.
pub(crate) struct AclFrame<'a> {
    handle: u16,
    boundary: BoundaryFlag,
    data_total_length: u16,
    payload: &'a [u8],
}

impl<'a> AclFrame<'a> {
    pub const HEADER_SIZE: usize = 4;

    pub fn parse(data: &'a [u8]) -> Result<Self, Error> {
        if data.len() < Self::HEADER_SIZE {
            return Err(Error::InsufficientSpace);
        }
        let raw_handle = u16::from_le_bytes([data[0], data[1]]);
        let boundary = match (raw_handle >> 12) & 0b11 {
            0b00 => BoundaryFlag::FirstNonFlushable,
            0b01 => BoundaryFlag::Continuing,
            0b10 => BoundaryFlag::FirstFlushable,
            _ => BoundaryFlag::Complete,
        };
        Ok(Self {
            handle: raw_handle & 0x0FFF,
            boundary,
            data_total_length: u16::from_le_bytes([data[2], data[3]]),
            payload: &data[Self::HEADER_SIZE..],
        })
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn boundary(&self) -> BoundaryFlag {
        self.boundary
    }

    /// The frame payload carries exactly as many bytes as the header claims.
    pub fn is_consistent(&self) -> bool {
        self.payload.len() == self.data_total_length as usize
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }
}

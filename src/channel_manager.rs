//! Registry of the L2CAP channels the proxy manages, and the round-robin
//! machinery that drains their outbound queues across the shared ACL credit
//! budget.

use heapless::Deque;

use crate::acl::AclDataChannel;
use crate::config::{L2CAP_TX_QUEUE_SIZE, MAX_ACL_CONNECTIONS, MAX_CHANNELS};
use crate::cursor::{ReadCursor, WriteCursor};
use crate::hci::BoundaryFlag;
use crate::l2cap::sar::{copy_into_slot, AppendOutcome, AssemblyKind, AssemblyState};
use crate::l2cap::{ChannelHandle, L2capChannelEvent};
use crate::packet_pool::{BufferPool, PoolPacket};
use crate::types::{Transport, H4PacketType, L2CAP_CID_LE_U_SIGNAL, L2CAP_FLOW_CONTROL_CREDIT_IND};
use crate::Error;

const ACL_HEADER_SIZE: usize = 4;
const L2CAP_HEADER_SIZE: usize = 4;
const SDU_LENGTH_SIZE: usize = 2;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Free,
    Running,
    /// Stopped after an error; still registered, inbound packets are dropped.
    Stopped,
}

/// Flow-control state of a credit-based (connection-oriented) channel.
pub(crate) struct CocState {
    pub psm: u16,
    pub tx_mtu: u16,
    pub tx_mps: u16,
    pub tx_credits: u16,
    pub rx_credits: u16,
    /// Bytes of a segmented SDU still to discard. Desegmentation is not
    /// supported; oversized SDUs are dropped whole.
    pub rx_sdu_remaining: usize,
}

pub(crate) enum ChannelKind {
    Basic,
    CreditBased(CocState),
}

/// One arena slot of the channel registry.
pub(crate) struct ChannelStorage {
    pub state: ChannelState,
    pub generation: u16,
    pub conn_handle: u16,
    pub transport: Transport,
    pub local_cid: u16,
    pub remote_cid: u16,
    pub kind: ChannelKind,
    /// Outbound PDUs, already framed, each owning its pool slot.
    pub queue: Deque<QueuedPdu, L2CAP_TX_QUEUE_SIZE>,
    /// Set when a write failed for lack of resources; cleared when the
    /// `WriteAvailable` event fires.
    pub write_available_latched: bool,
}

/// A framed PDU parked in a channel queue. Owns the pool slot until it is
/// dequeued into a [`PoolPacket`] or the queue is torn down.
pub(crate) struct QueuedPdu {
    pub slot: usize,
    pub len: usize,
}

impl ChannelStorage {
    pub const FREE: ChannelStorage = ChannelStorage {
        state: ChannelState::Free,
        generation: 0,
        conn_handle: 0,
        transport: Transport::Le,
        local_cid: 0,
        remote_cid: 0,
        kind: ChannelKind::Basic,
        queue: Deque::new(),
        write_available_latched: false,
    };

    fn can_accept_write(&self, pool: &dyn BufferPool) -> bool {
        if self.state != ChannelState::Running || self.queue.is_full() || pool.free_slots() == 0 {
            return false;
        }
        match &self.kind {
            ChannelKind::Basic => true,
            ChannelKind::CreditBased(coc) => coc.tx_credits > 0,
        }
    }
}

/// What [`ChannelManager::dequeue_round_robin`] produced for one step of the
/// drain loop.
pub(crate) enum DrainStep<'d> {
    /// A PDU was dequeued with a credit; transmit it outside the lock.
    Send { packet: PoolPacket<'d> },
    /// The cursor advanced without dequeuing anything.
    Idle,
    /// The registry is empty.
    Empty,
}

/// Where an inbound ACL frame ended up.
pub(crate) enum InboundDisposition<'d> {
    /// Not ours; forward to the host untouched.
    PassThrough,
    /// Consumed (buffered fragment, or discarded data).
    Consume,
    /// A complete PDU payload for a managed channel.
    Deliver {
        channel: usize,
        generation: u16,
        source: InboundSource<'d>,
    },
    /// Consumed, and an event must be delivered to the channel's client.
    Event {
        channel: usize,
        generation: u16,
        event: L2capChannelEvent,
    },
}

pub(crate) enum InboundSource<'d> {
    /// Payload lives inside the inbound ACL frame payload at this range.
    Frame { offset: usize, len: usize },
    /// Payload was recombined into a pool packet; deliver from `offset`.
    Assembled { packet: PoolPacket<'d>, offset: usize },
}

pub(crate) struct ChannelParams {
    pub conn_handle: u16,
    pub transport: Transport,
    pub local_cid: u16,
    pub remote_cid: u16,
    pub kind: ChannelKind,
}

pub(crate) struct ChannelManager<'d> {
    pool: &'d dyn BufferPool,
    channels: &'d mut [ChannelStorage; MAX_CHANNELS],
    sar: &'d mut [AssemblyState; MAX_ACL_CONNECTIONS],
    /// Least-recently-drained cursor into the registry.
    lrd: Option<usize>,
    /// One full round-robin sweep without progress ends here.
    terminus: Option<usize>,
    next_generation: u16,
    next_signal_id: u8,
}

impl<'d> ChannelManager<'d> {
    pub fn new(
        pool: &'d dyn BufferPool,
        channels: &'d mut [ChannelStorage; MAX_CHANNELS],
        sar: &'d mut [AssemblyState; MAX_ACL_CONNECTIONS],
    ) -> Self {
        Self {
            pool,
            channels,
            sar,
            lrd: None,
            terminus: None,
            next_generation: 1,
            next_signal_id: 1,
        }
    }

    pub fn register(&mut self, params: ChannelParams) -> Result<(usize, u16), Error> {
        if self
            .find_by_local_cid(params.conn_handle, params.local_cid)
            .is_some()
        {
            warn!(
                "[l2cap] channel {:04x} on connection {:02x} already registered",
                params.local_cid, params.conn_handle
            );
            return Err(Error::InvalidArgument);
        }
        for (index, storage) in self.channels.iter_mut().enumerate() {
            if storage.state == ChannelState::Free {
                let generation = self.next_generation;
                self.next_generation = self.next_generation.wrapping_add(1);
                *storage = ChannelStorage {
                    state: ChannelState::Running,
                    generation,
                    conn_handle: params.conn_handle,
                    transport: params.transport,
                    local_cid: params.local_cid,
                    remote_cid: params.remote_cid,
                    kind: params.kind,
                    queue: Deque::new(),
                    write_available_latched: false,
                };
                if self.lrd.is_none() {
                    self.lrd = Some(index);
                }
                return Ok((index, generation));
            }
        }
        Err(Error::Unavailable)
    }

    pub fn deregister(&mut self, index: usize) {
        let storage = &mut self.channels[index];
        while let Some(pdu) = storage.queue.pop_front() {
            self.pool.free(pdu.slot);
        }
        *storage = ChannelStorage::FREE;

        // Drop any recombination in progress for this channel.
        for entry in self.sar.iter_mut() {
            if let AssemblyKind::Assembling { channel, slot, .. } = entry.kind {
                if channel == index {
                    self.pool.free(slot);
                    entry.kind = AssemblyKind::Idle;
                }
            }
        }

        if self.channels.iter().all(|c| c.state == ChannelState::Free) {
            self.lrd = None;
            self.terminus = None;
            return;
        }
        if self.lrd == Some(index) {
            self.lrd = Some(self.next_occupied(index));
        }
        if self.terminus == Some(index) {
            self.terminus = Some(self.next_occupied(index));
        }
    }

    pub fn lookup(&self, handle: ChannelHandle) -> Result<usize, Error> {
        let index = handle.index as usize;
        if index >= MAX_CHANNELS {
            return Err(Error::InvalidArgument);
        }
        let storage = &self.channels[index];
        if storage.state == ChannelState::Free || storage.generation != handle.generation {
            return Err(Error::InvalidArgument);
        }
        Ok(index)
    }

    pub fn find_by_local_cid(&self, conn_handle: u16, local_cid: u16) -> Option<usize> {
        self.channels.iter().position(|c| {
            c.state != ChannelState::Free && c.conn_handle == conn_handle && c.local_cid == local_cid
        })
    }

    fn find_by_remote_cid(&self, conn_handle: u16, remote_cid: u16) -> Option<usize> {
        self.channels.iter().position(|c| {
            c.state != ChannelState::Free && c.conn_handle == conn_handle && c.remote_cid == remote_cid
        })
    }

    /// The next occupied slot after `from`, wrapping. Must not be called on an
    /// empty registry.
    fn next_occupied(&self, from: usize) -> usize {
        for step in 1..=MAX_CHANNELS {
            let index = (from + step) % MAX_CHANNELS;
            if self.channels[index].state != ChannelState::Free {
                return index;
            }
        }
        from
    }

    pub fn at_terminus(&self) -> bool {
        self.lrd == self.terminus
    }

    /// One step of the round-robin drain: attempt to reserve a credit for the
    /// least-recently-drained channel and dequeue one PDU from it, then
    /// advance the cursor. The caller transmits outside the registry lock and
    /// keeps looping until a full sweep makes no progress.
    pub fn dequeue_round_robin(&mut self, acl: &mut AclDataChannel) -> DrainStep<'d> {
        let Some(lrd) = self.lrd else {
            return DrainStep::Empty;
        };
        if self.terminus.is_none() {
            self.terminus = Some(lrd);
        }

        let storage = &mut self.channels[lrd];
        let mut packet = None;
        if let Some(credit) = acl.reserve_send_credit(storage.transport) {
            if let Some(pdu) = storage.queue.pop_front() {
                match acl.record_send(credit, storage.conn_handle) {
                    Ok(()) => packet = Some(PoolPacket::new(self.pool, pdu.slot, pdu.len)),
                    Err(_) => {
                        // Tracking table full; the PDU cannot go out now.
                        error!("[l2cap] dropping PDU, cannot track in-flight credit");
                        self.pool.free(pdu.slot);
                    }
                }
            } else {
                acl.give_back(credit);
            }
        }

        let next = self.next_occupied(lrd);
        self.lrd = Some(next);
        match packet {
            Some(packet) => {
                // Keep sweeping until a full loop moves nothing.
                self.terminus = Some(next);
                DrainStep::Send { packet }
            }
            None => DrainStep::Idle,
        }
    }

    /// Channels whose latched writers can make progress again. Clears the
    /// latches; the caller fires the `WriteAvailable` events.
    pub fn take_write_ready(&mut self) -> heapless::Vec<(usize, u16), MAX_CHANNELS> {
        let mut ready = heapless::Vec::new();
        for (index, storage) in self.channels.iter_mut().enumerate() {
            if storage.write_available_latched && storage.can_accept_write(self.pool) {
                storage.write_available_latched = false;
                let _ = ready.push((index, storage.generation));
            }
        }
        ready
    }

    /// Frame `payload` for `index` and park it on the channel queue.
    pub fn queue_write(&mut self, index: usize, payload: &[u8]) -> Result<(), Error> {
        let pool = self.pool;
        let storage = &mut self.channels[index];
        if storage.state != ChannelState::Running {
            return Err(Error::FailedPrecondition);
        }

        let sdu_header = match &storage.kind {
            ChannelKind::Basic => 0,
            ChannelKind::CreditBased(coc) => {
                if payload.len() > coc.tx_mtu as usize {
                    warn!("[l2cap] payload exceeds peer MTU ({} > {})", payload.len(), coc.tx_mtu);
                    return Err(Error::InvalidArgument);
                }
                if payload.len() + SDU_LENGTH_SIZE > coc.tx_mps as usize {
                    // Tx segmentation is not supported.
                    warn!("[l2cap] payload exceeds peer MPS");
                    return Err(Error::InvalidArgument);
                }
                SDU_LENGTH_SIZE
            }
        };
        let pdu_len = payload.len() + sdu_header;
        let frame_len = 1 + ACL_HEADER_SIZE + L2CAP_HEADER_SIZE + pdu_len;
        if frame_len > pool.slot_size() {
            warn!("[l2cap] payload too large for an H4 buffer ({})", payload.len());
            return Err(Error::InvalidArgument);
        }

        if let ChannelKind::CreditBased(coc) = &storage.kind {
            if coc.tx_credits == 0 {
                storage.write_available_latched = true;
                return Err(Error::Unavailable);
            }
        }
        if storage.queue.is_full() {
            storage.write_available_latched = true;
            return Err(Error::Unavailable);
        }
        let Some(slot) = pool.alloc() else {
            storage.write_available_latched = true;
            return Err(Error::Unavailable);
        };

        let mut packet = PoolPacket::new(pool, slot, frame_len);
        let result = (|| {
            let mut w = WriteCursor::new(packet.as_mut());
            w.write(H4PacketType::AclData.to_wire())?;
            w.write(storage.conn_handle & 0x0FFF)?;
            w.write((L2CAP_HEADER_SIZE + pdu_len) as u16)?;
            w.write(pdu_len as u16)?;
            w.write(storage.remote_cid)?;
            if sdu_header != 0 {
                w.write(payload.len() as u16)?;
            }
            w.append(payload)
        })();
        result?;

        if let ChannelKind::CreditBased(coc) = &mut storage.kind {
            coc.tx_credits -= 1;
        }
        let (slot, len) = packet.into_raw();
        unwrap!(storage.queue.push_back(QueuedPdu { slot, len }).ok());
        Ok(())
    }

    /// Queue an L2CAP_FLOW_CONTROL_CREDIT_IND granting the peer `additional`
    /// K-frame credits on this channel.
    pub fn queue_credit_signal(&mut self, index: usize, additional: u16) -> Result<(), Error> {
        let pool = self.pool;
        let signal_id = self.next_signal_id;
        let storage = &mut self.channels[index];
        if storage.state != ChannelState::Running {
            return Err(Error::FailedPrecondition);
        }
        let ChannelKind::CreditBased(_) = &storage.kind else {
            return Err(Error::InvalidArgument);
        };
        if additional == 0 {
            return Err(Error::InvalidArgument);
        }
        if storage.queue.is_full() {
            storage.write_available_latched = true;
            return Err(Error::Unavailable);
        }
        let Some(slot) = pool.alloc() else {
            storage.write_available_latched = true;
            return Err(Error::Unavailable);
        };

        // code + id + length + (cid, credits)
        let signal_len = 4 + 4;
        let frame_len = 1 + ACL_HEADER_SIZE + L2CAP_HEADER_SIZE + signal_len;
        let mut packet = PoolPacket::new(pool, slot, frame_len);
        let result = (|| {
            let mut w = WriteCursor::new(packet.as_mut());
            w.write(H4PacketType::AclData.to_wire())?;
            w.write(storage.conn_handle & 0x0FFF)?;
            w.write((L2CAP_HEADER_SIZE + signal_len) as u16)?;
            w.write(signal_len as u16)?;
            w.write(L2CAP_CID_LE_U_SIGNAL)?;
            w.write(L2CAP_FLOW_CONTROL_CREDIT_IND)?;
            w.write(signal_id)?;
            w.write(4u16)?;
            w.write(storage.local_cid)?;
            w.write(additional)
        })();
        result?;

        self.next_signal_id = match self.next_signal_id.wrapping_add(1) {
            0 => 1,
            id => id,
        };
        if let ChannelKind::CreditBased(coc) = &mut storage.kind {
            coc.rx_credits = coc.rx_credits.saturating_add(additional);
        }
        let (slot, len) = packet.into_raw();
        unwrap!(storage.queue.push_back(QueuedPdu { slot, len }).ok());
        Ok(())
    }

    /// Route one inbound-from-controller ACL frame. Decides between
    /// pass-through, buffering (recombination) and delivery; the caller is
    /// responsible for invoking client callbacks outside the registry lock.
    pub fn route_inbound(
        &mut self,
        conn_handle: u16,
        boundary: BoundaryFlag,
        payload: &[u8],
    ) -> InboundDisposition<'d> {
        let pool = self.pool;

        if boundary.is_continuation() {
            let Some(entry) = find_assembly(self.sar, conn_handle) else {
                return InboundDisposition::PassThrough;
            };
            return match entry.kind {
                AssemblyKind::Idle => InboundDisposition::PassThrough,
                AssemblyKind::Passthrough { remaining } => {
                    let remaining = remaining.saturating_sub(payload.len());
                    entry.kind = if remaining == 0 {
                        AssemblyKind::Idle
                    } else {
                        AssemblyKind::Passthrough { remaining }
                    };
                    InboundDisposition::PassThrough
                }
                AssemblyKind::Assembling { channel, slot, pdu_len, .. } => {
                    match entry.append(pool, payload) {
                        AppendOutcome::Buffered => InboundDisposition::Consume,
                        AppendOutcome::Complete => {
                            entry.kind = AssemblyKind::Idle;
                            let packet = PoolPacket::new(pool, slot, pdu_len);
                            let storage = &mut self.channels[channel];
                            let generation = storage.generation;
                            match accept_pdu(storage, packet.as_ref()) {
                                PduAction::Deliver { skip } => InboundDisposition::Deliver {
                                    channel,
                                    generation,
                                    source: InboundSource::Assembled { packet, offset: skip },
                                },
                                PduAction::Discard => InboundDisposition::Consume,
                                PduAction::Invalid => {
                                    storage.state = ChannelState::Stopped;
                                    InboundDisposition::Event {
                                        channel,
                                        generation,
                                        event: L2capChannelEvent::RxInvalid,
                                    }
                                }
                                PduAction::DiscardSegmented => InboundDisposition::Event {
                                    channel,
                                    generation,
                                    event: L2capChannelEvent::RxFragmentDropped,
                                },
                            }
                        }
                        AppendOutcome::Overflow => {
                            warn!("[l2cap] recombination overflow on connection {:02x}", conn_handle);
                            pool.free(slot);
                            entry.kind = AssemblyKind::Idle;
                            let storage = &mut self.channels[channel];
                            storage.state = ChannelState::Stopped;
                            InboundDisposition::Event {
                                channel,
                                generation: storage.generation,
                                event: L2capChannelEvent::RxInvalid,
                            }
                        }
                    }
                }
            };
        }

        // Start of a new PDU. A fragment still in progress at this point is
        // stale; discard it and carry on with the fresh one.
        if let Some(entry) = find_assembly(self.sar, conn_handle) {
            if !entry.is_idle() {
                warn!(
                    "[l2cap] PDU started while fragment in progress on connection {:02x}",
                    conn_handle
                );
                if let AssemblyKind::Assembling { slot, .. } = entry.kind {
                    pool.free(slot);
                }
                entry.kind = AssemblyKind::Idle;
            }
        }

        if payload.len() < L2CAP_HEADER_SIZE {
            return InboundDisposition::PassThrough;
        }
        let mut r = ReadCursor::new(payload);
        let pdu_len = match r.read::<u16>() {
            Ok(len) => len as usize,
            Err(_) => return InboundDisposition::PassThrough,
        };
        let cid = match r.read::<u16>() {
            Ok(cid) => cid,
            Err(_) => return InboundDisposition::PassThrough,
        };

        if cid == L2CAP_CID_LE_U_SIGNAL {
            // Signaling stays host-owned; the proxy only peeks at credit
            // grants addressed to its own channels.
            self.inspect_signal(conn_handle, &payload[L2CAP_HEADER_SIZE..]);
            return InboundDisposition::PassThrough;
        }

        let body = &payload[L2CAP_HEADER_SIZE..];
        let Some(channel) = self.find_by_local_cid(conn_handle, cid) else {
            if body.len() < pdu_len {
                // An unmanaged PDU spanning frames; let its continuations
                // through as well.
                if let Some(entry) = find_or_claim_assembly(self.sar, conn_handle) {
                    entry.kind = AssemblyKind::Passthrough {
                        remaining: pdu_len - body.len(),
                    };
                }
            }
            return InboundDisposition::PassThrough;
        };

        let storage = &mut self.channels[channel];
        let generation = storage.generation;
        if storage.state != ChannelState::Running {
            return InboundDisposition::Event {
                channel,
                generation,
                event: L2capChannelEvent::RxWhileStopped,
            };
        }

        if body.len() >= pdu_len {
            return match accept_pdu(storage, &body[..pdu_len]) {
                PduAction::Deliver { skip } => InboundDisposition::Deliver {
                    channel,
                    generation,
                    source: InboundSource::Frame {
                        offset: L2CAP_HEADER_SIZE + skip,
                        len: pdu_len - skip,
                    },
                },
                PduAction::Discard => InboundDisposition::Consume,
                PduAction::Invalid => {
                    storage.state = ChannelState::Stopped;
                    InboundDisposition::Event {
                        channel,
                        generation,
                        event: L2capChannelEvent::RxInvalid,
                    }
                }
                PduAction::DiscardSegmented => InboundDisposition::Event {
                    channel,
                    generation,
                    event: L2capChannelEvent::RxFragmentDropped,
                },
            };
        }

        // First fragment of a PDU for a managed channel; start recombining.
        let Some(entry) = find_or_claim_assembly(self.sar, conn_handle) else {
            warn!("[l2cap] no recombination slot for connection {:02x}", conn_handle);
            return InboundDisposition::PassThrough;
        };
        let Some(slot) = pool.alloc() else {
            // Never drop traffic: without a buffer the fragmented PDU is
            // passed through like an unmanaged one.
            warn!("[l2cap] no buffer for recombination, passing fragment through");
            entry.kind = AssemblyKind::Passthrough {
                remaining: pdu_len - body.len(),
            };
            return InboundDisposition::PassThrough;
        };
        copy_into_slot(pool, slot, 0, body);
        entry.kind = AssemblyKind::Assembling {
            channel,
            slot,
            received: body.len(),
            pdu_len,
        };
        InboundDisposition::Consume
    }

    fn inspect_signal(&mut self, conn_handle: u16, signal: &[u8]) {
        let mut r = ReadCursor::new(signal);
        let Ok(code) = r.read::<u8>() else { return };
        if code != L2CAP_FLOW_CONTROL_CREDIT_IND {
            return;
        }
        let Ok(_identifier) = r.read::<u8>() else { return };
        let Ok(length) = r.read::<u16>() else { return };
        if length < 4 || r.available() < 4 {
            return;
        }
        let cid = unwrap!(r.read::<u16>());
        let credits = unwrap!(r.read::<u16>());
        if let Some(index) = self.find_by_remote_cid(conn_handle, cid) {
            if let ChannelKind::CreditBased(coc) = &mut self.channels[index].kind {
                trace!("[l2cap] peer granted {} credits on channel {:04x}", credits, cid);
                coc.tx_credits = coc.tx_credits.saturating_add(credits);
            }
        }
    }

    /// Find one running channel on `conn_handle`, close and deregister it.
    /// Called repeatedly so the caller can fire the close callback with no
    /// lock held between channels.
    pub fn take_one_for_disconnect(&mut self, conn_handle: u16) -> Option<(usize, u16)> {
        let index = self.channels.iter().position(|c| {
            c.state == ChannelState::Running && c.conn_handle == conn_handle
        })?;
        let generation = self.channels[index].generation;
        self.deregister(index);
        Some((index, generation))
    }

    pub fn clear_assembly_for(&mut self, conn_handle: u16) {
        for entry in self.sar.iter_mut() {
            if entry.handle == conn_handle && !entry.is_idle() {
                if let AssemblyKind::Assembling { slot, .. } = entry.kind {
                    self.pool.free(slot);
                }
                entry.kind = AssemblyKind::Idle;
            }
        }
    }

    /// Tear everything down. Returns the channels that were still registered
    /// so their event callbacks can be told.
    pub fn reset(&mut self) -> heapless::Vec<(usize, u16), MAX_CHANNELS> {
        let mut closed = heapless::Vec::new();
        for index in 0..MAX_CHANNELS {
            if self.channels[index].state != ChannelState::Free {
                let _ = closed.push((index, self.channels[index].generation));
                self.deregister(index);
            }
        }
        for entry in self.sar.iter_mut() {
            if let AssemblyKind::Assembling { slot, .. } = entry.kind {
                self.pool.free(slot);
            }
            *entry = AssemblyState::IDLE;
        }
        self.lrd = None;
        self.terminus = None;
        closed
    }
}

enum PduAction {
    Deliver { skip: usize },
    Discard,
    DiscardSegmented,
    Invalid,
}

/// Per-PDU acceptance for a running channel: K-frame bookkeeping for
/// credit-based channels, straight delivery for basic ones.
fn accept_pdu(storage: &mut ChannelStorage, pdu: &[u8]) -> PduAction {
    let ChannelKind::CreditBased(coc) = &mut storage.kind else {
        return PduAction::Deliver { skip: 0 };
    };

    if coc.rx_credits == 0 {
        warn!("[l2cap] peer sent K-frame with no rx credits on {:04x}", storage.local_cid);
    } else {
        coc.rx_credits -= 1;
    }

    if coc.rx_sdu_remaining > 0 {
        // Continuation of a segmented SDU being discarded.
        coc.rx_sdu_remaining = coc.rx_sdu_remaining.saturating_sub(pdu.len());
        return PduAction::Discard;
    }

    if pdu.len() < SDU_LENGTH_SIZE {
        warn!("[l2cap] K-frame too short for SDU length on {:04x}", storage.local_cid);
        return PduAction::Invalid;
    }
    let sdu_len = u16::from_le_bytes([pdu[0], pdu[1]]) as usize;
    let information = pdu.len() - SDU_LENGTH_SIZE;
    if sdu_len > information {
        // Desegmentation is unsupported; drop the whole SDU.
        warn!("[l2cap] segmented SDU ({} > {}) discarded on {:04x}", sdu_len, information, storage.local_cid);
        coc.rx_sdu_remaining = sdu_len - information;
        return PduAction::DiscardSegmented;
    }
    PduAction::Deliver { skip: SDU_LENGTH_SIZE }
}

fn find_assembly<'s>(sar: &'s mut [AssemblyState], conn_handle: u16) -> Option<&'s mut AssemblyState> {
    sar.iter_mut().find(|e| e.handle == conn_handle && !e.is_idle())
}

fn find_or_claim_assembly<'s>(
    sar: &'s mut [AssemblyState],
    conn_handle: u16,
) -> Option<&'s mut AssemblyState> {
    if let Some(index) = sar.iter().position(|e| e.handle == conn_handle && !e.is_idle()) {
        return Some(&mut sar[index]);
    }
    let index = sar.iter().position(|e| e.is_idle())?;
    sar[index].handle = conn_handle;
    Some(&mut sar[index])
}

//! ProxyHost
//!
//! The host module contains the main entry point for the proxy.
//!
//! The container owning the HCI transport constructs a [`ProxyHost`] with two
//! sink callbacks and feeds every H4 packet through it, one at a time. The
//! proxy classifies each packet, updates its credit and channel bookkeeping,
//! and forwards traffic (rewritten in place where needed) to the sinks.
//!
//! Client APIs (channel acquisition, GATT notifications, status delegates)
//! may be called concurrently with packet handling from other threads; a
//! single lock serializes them against the registry. Receive and event
//! callbacks are always invoked with no lock held, but must not register or
//! deregister channels or delegates.

use core::cell::RefCell;

use bt_hci::param::ConnHandle;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::acl::AclDataChannel;
use crate::channel_manager::{
    ChannelKind, ChannelManager, ChannelParams, ChannelStorage, CocState, DrainStep, InboundDisposition, InboundSource,
};
use crate::config::{MAX_ACL_CONNECTIONS, MAX_CHANNELS};
use crate::cursor::WriteCursor;
use crate::hci::{
    AclFrame, BufferSizeLayout, CommandComplete, DisconnectionComplete, EventHeader, NumberOfCompletedPackets,
    ReadBufferSizeComplete,
};
use crate::l2cap::sar::AssemblyState;
use crate::l2cap::{ChannelHandle, CocConfig, L2capChannelEvent};
use crate::packet::{H4Packet, HciPacket};
use crate::packet_pool::{BufferPool, H4BufferPool, PoolPacket};
use crate::status::{L2capConnectionInfo, L2capStatusDelegate, StatusTracker};
use crate::types::{
    H4PacketType, Transport, ATT_HANDLE_VALUE_NTF, EVT_COMMAND_COMPLETE, EVT_DISCONNECTION_COMPLETE, EVT_LE_META,
    EVT_NUMBER_OF_COMPLETED_PACKETS, L2CAP_CID_ATT, MAX_VALID_CONN_HANDLE, OPCODE_LE_READ_BUFFER_SIZE_V1,
    OPCODE_LE_READ_BUFFER_SIZE_V2, OPCODE_READ_BUFFER_SIZE, STATUS_SUCCESS,
};
use crate::Error;

const ACL_HEADER_SIZE: usize = 4;
const L2CAP_HEADER_SIZE: usize = 4;
const ATT_NTF_HEADER_SIZE: usize = 3;

/// ProxyResources holds the statically allocated state used by the proxy:
/// the H4 buffer pool and the channel registry arenas.
///
/// `BUFS` bounds how many proxy-originated sends can be outstanding at once;
/// `MTU` is the full H4 buffer size (type byte included), bounding the
/// largest ACL frame the proxy can originate.
pub struct ProxyResources<M: RawMutex, const BUFS: usize, const MTU: usize> {
    pool: H4BufferPool<M, BUFS, MTU>,
    channels: [ChannelStorage; MAX_CHANNELS],
    sar: [AssemblyState; MAX_ACL_CONNECTIONS],
}

impl<M: RawMutex, const BUFS: usize, const MTU: usize> ProxyResources<M, BUFS, MTU> {
    pub const fn new() -> Self {
        Self {
            pool: H4BufferPool::new(),
            channels: [ChannelStorage::FREE; MAX_CHANNELS],
            sar: [AssemblyState::IDLE; MAX_ACL_CONNECTIONS],
        }
    }
}

impl<M: RawMutex, const BUFS: usize, const MTU: usize> Default for ProxyResources<M, BUFS, MTU> {
    fn default() -> Self {
        Self::new()
    }
}

struct State<'d> {
    acl: AclDataChannel,
    channels: ChannelManager<'d>,
}

struct ChannelCallbacks<'d> {
    generation: u16,
    receive: Option<&'d mut dyn FnMut(&[u8])>,
    event: Option<&'d mut dyn FnMut(L2capChannelEvent)>,
}

impl<'d> ChannelCallbacks<'d> {
    const NONE: ChannelCallbacks<'d> = ChannelCallbacks {
        generation: 0,
        receive: None,
        event: None,
    };
}

struct Sinks<FH, FC> {
    to_host: FH,
    to_controller: FC,
}

/// The proxy coordinator.
///
/// Generic over the lock type `M` and the two container-provided sinks. The
/// sinks take ownership of each packet handed to them; a pooled packet
/// releases its buffer back to the proxy when the sink (or whoever the sink
/// gave it to) drops it.
pub struct ProxyHost<'d, M, FH, FC>
where
    M: RawMutex,
    FH: FnMut(HciPacket<'_>),
    FC: FnMut(H4Packet<'_, 'd>),
{
    pool: &'d dyn BufferPool,
    state: Mutex<M, RefCell<State<'d>>>,
    callbacks: Mutex<M, RefCell<[ChannelCallbacks<'d>; MAX_CHANNELS]>>,
    sinks: Mutex<M, RefCell<Sinks<FH, FC>>>,
    status: StatusTracker<'d, M>,
}

impl<'d, M, FH, FC> ProxyHost<'d, M, FH, FC>
where
    M: RawMutex,
    FH: FnMut(HciPacket<'_>),
    FC: FnMut(H4Packet<'_, 'd>),
{
    /// Create a proxy that will reserve up to `le_acl_credits_to_reserve` LE
    /// and `bredr_acl_credits_to_reserve` BR/EDR send credits out of the
    /// controller's buffer pools once the host queries them.
    pub fn new<const BUFS: usize, const MTU: usize>(
        resources: &'d mut ProxyResources<M, BUFS, MTU>,
        send_to_host: FH,
        send_to_controller: FC,
        le_acl_credits_to_reserve: u16,
        bredr_acl_credits_to_reserve: u16,
    ) -> Self {
        let ProxyResources { pool, channels, sar } = resources;
        let pool: &'d dyn BufferPool = &*pool;
        Self {
            pool,
            state: Mutex::new(RefCell::new(State {
                acl: AclDataChannel::new(le_acl_credits_to_reserve, bredr_acl_credits_to_reserve),
                channels: ChannelManager::new(pool, channels, sar),
            })),
            callbacks: Mutex::new(RefCell::new([ChannelCallbacks::NONE; MAX_CHANNELS])),
            sinks: Mutex::new(RefCell::new(Sinks {
                to_host: send_to_host,
                to_controller: send_to_controller,
            })),
            status: StatusTracker::new(),
        }
    }

    // ##### Container API

    /// Handle one H4 packet travelling from the host towards the controller.
    ///
    /// The proxy currently needs nothing from this direction; every packet is
    /// forwarded to the controller sink unmodified, including frames it does
    /// not recognize. Must be called synchronously, one packet at a time.
    pub fn handle_h4_from_host(&self, packet: H4Packet<'_, 'd>) {
        match packet.h4_type() {
            H4PacketType::Command => trace!("[host] command from host"),
            H4PacketType::AclData => trace!("[host] acl data from host"),
            _ => {}
        }
        self.send_to_controller(packet);
        self.process_pending_work();
    }

    /// Handle one H4 packet travelling from the controller towards the host.
    ///
    /// Events the proxy tracks (buffer-size command completions, number of
    /// completed packets, disconnections) are rewritten in place where the
    /// proxy consumes part of them; ACL frames addressed to managed channels
    /// are delivered to their clients. Everything else is forwarded to the
    /// host sink byte for byte. Must be called synchronously, one packet at a
    /// time.
    pub fn handle_h4_from_controller(&self, packet: HciPacket<'_>) {
        match packet.h4_type() {
            H4PacketType::Event => self.handle_event_from_controller(packet),
            H4PacketType::AclData => self.handle_acl_from_controller(packet),
            _ => self.send_to_host(packet),
        }
        self.process_pending_work();
    }

    /// Reset all credit and channel bookkeeping, e.g. when the Bluetooth
    /// system below is power cycled.
    ///
    /// Registered channels are closed with a [`L2capChannelEvent::Reset`]
    /// event. Buffers owned by in-flight packets survive the reset and are
    /// reclaimed as their owners drop them, so no packet handed to a sink is
    /// ever invalidated.
    pub fn reset(&self) {
        info!("[host] resetting proxy state");
        let closed = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.acl.reset();
            state.channels.reset()
        });
        for (index, generation) in closed {
            self.emit_channel_event(index, generation, L2capChannelEvent::Reset);
            self.clear_callbacks(index, generation);
        }
        let _ = self.pool.take_drain_request();
    }

    // ##### Client APIs

    /// Register for open/close notifications of connection-oriented channels
    /// on the delegate's PSM. The delegate must outlive the proxy.
    pub fn register_status_delegate(&self, delegate: &'d mut dyn L2capStatusDelegate) -> Result<(), Error> {
        self.status.register(delegate)
    }

    /// Unregister a previously registered delegate.
    pub fn unregister_status_delegate(&self, delegate: &dyn L2capStatusDelegate) -> Result<(), Error> {
        self.status.unregister(delegate)
    }

    /// Acquire a basic-mode L2CAP channel bound to `connection_handle` and
    /// the given CID pair. Inbound PDUs addressed to `local_cid` are handed
    /// to `receive` instead of the host.
    pub fn acquire_basic_channel(
        &self,
        connection_handle: u16,
        local_cid: u16,
        remote_cid: u16,
        transport: Transport,
        receive: &'d mut dyn FnMut(&[u8]),
        event: &'d mut dyn FnMut(L2capChannelEvent),
    ) -> Result<ChannelHandle, Error> {
        if !are_valid_channel_parameters(connection_handle, local_cid, remote_cid) {
            return Err(Error::InvalidArgument);
        }
        let (index, generation) = self.state.lock(|state| {
            state.borrow_mut().channels.register(ChannelParams {
                conn_handle: connection_handle,
                transport,
                local_cid,
                remote_cid,
                kind: ChannelKind::Basic,
            })
        })?;
        self.set_callbacks(index, generation, receive, event);
        Ok(ChannelHandle {
            index: index as u8,
            generation,
        })
    }

    /// Acquire a connection-oriented channel in LE credit based flow control
    /// mode. `rx_config` describes the local endpoint (its `cid` is the local
    /// CID), `tx_config` the remote one. Status delegates registered for
    /// `psm` are notified of the new connection.
    pub fn acquire_credit_channel(
        &self,
        connection_handle: u16,
        psm: u16,
        rx_config: CocConfig,
        tx_config: CocConfig,
        receive: &'d mut dyn FnMut(&[u8]),
        event: &'d mut dyn FnMut(L2capChannelEvent),
    ) -> Result<ChannelHandle, Error> {
        if !are_valid_channel_parameters(connection_handle, rx_config.cid, tx_config.cid) || psm == 0 {
            return Err(Error::InvalidArgument);
        }
        if tx_config.mtu == 0 || tx_config.mps == 0 {
            return Err(Error::InvalidArgument);
        }
        let (index, generation) = self.state.lock(|state| {
            state.borrow_mut().channels.register(ChannelParams {
                conn_handle: connection_handle,
                transport: Transport::Le,
                local_cid: rx_config.cid,
                remote_cid: tx_config.cid,
                kind: ChannelKind::CreditBased(CocState {
                    psm,
                    tx_mtu: tx_config.mtu,
                    tx_mps: tx_config.mps,
                    tx_credits: tx_config.credits,
                    rx_credits: rx_config.credits,
                    rx_sdu_remaining: 0,
                }),
            })
        })?;
        self.set_callbacks(index, generation, receive, event);
        self.status.notify_opened(&L2capConnectionInfo {
            psm,
            connection_handle: ConnHandle::new(connection_handle),
            local_cid: rx_config.cid,
            remote_cid: tx_config.cid,
        });
        Ok(ChannelHandle {
            index: index as u8,
            generation,
        })
    }

    /// Queue `payload` for sending on a channel.
    ///
    /// Returns `Unavailable` when the queue, buffer pool or (for
    /// credit-based channels) peer credits are exhausted; the channel's event
    /// callback fires [`L2capChannelEvent::WriteAvailable`] once a retry can
    /// succeed.
    pub fn channel_write(&self, channel: ChannelHandle, payload: &[u8]) -> Result<(), Error> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let index = state.channels.lookup(channel)?;
            state.channels.queue_write(index, payload)
        })?;
        self.drain_channel_queues();
        Ok(())
    }

    /// Grant the peer `additional` K-frame credits on a credit-based channel
    /// by queueing an L2CAP flow control credit indication.
    pub fn send_additional_rx_credits(&self, channel: ChannelHandle, additional: u16) -> Result<(), Error> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let index = state.channels.lookup(channel)?;
            state.channels.queue_credit_signal(index, additional)
        })?;
        self.drain_channel_queues();
        Ok(())
    }

    /// Close a channel and release its registry slot. Pending queued sends
    /// are discarded. The handle is stale afterwards.
    pub fn release_channel(&self, channel: ChannelHandle) -> Result<(), Error> {
        let index = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let index = state.channels.lookup(channel)?;
            state.channels.deregister(index);
            Ok::<usize, Error>(index)
        })?;
        self.clear_callbacks(index, channel.generation);
        self.process_pending_work();
        Ok(())
    }

    /// Send a GATT Handle_Value_Ntf to `connection_handle` (LE transport).
    ///
    /// Consumes one LE send credit and one H4 buffer for the duration of the
    /// send; returns `Unavailable` if either is exhausted.
    pub fn send_gatt_notify(
        &self,
        connection_handle: u16,
        attribute_handle: u16,
        attribute_value: &[u8],
    ) -> Result<(), Error> {
        if connection_handle > MAX_VALID_CONN_HANDLE {
            warn!("[host] connection handle {:02x} out of range", connection_handle);
            return Err(Error::InvalidArgument);
        }
        if attribute_handle == 0 {
            warn!("[host] attribute handle cannot be 0");
            return Err(Error::InvalidArgument);
        }
        let att_len = ATT_NTF_HEADER_SIZE + attribute_value.len();
        let frame_len = 1 + ACL_HEADER_SIZE + L2CAP_HEADER_SIZE + att_len;
        if frame_len > self.pool.slot_size() {
            warn!("[host] attribute too large ({})", attribute_value.len());
            return Err(Error::InvalidArgument);
        }

        let packet = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let Some(credit) = state.acl.reserve_send_credit(Transport::Le) else {
                return Err(Error::Unavailable);
            };
            let Some(slot) = self.pool.alloc() else {
                state.acl.give_back(credit);
                warn!("[host] no buffer available for notification");
                return Err(Error::Unavailable);
            };
            let mut packet = PoolPacket::new(self.pool, slot, frame_len);
            let built = (|| {
                let mut w = WriteCursor::new(packet.as_mut());
                w.write(H4PacketType::AclData.to_wire())?;
                w.write(connection_handle & 0x0FFF)?;
                w.write((L2CAP_HEADER_SIZE + att_len) as u16)?;
                w.write(att_len as u16)?;
                w.write(L2CAP_CID_ATT)?;
                w.write(ATT_HANDLE_VALUE_NTF)?;
                w.write(attribute_handle)?;
                w.append(attribute_value)
            })();
            if let Err(e) = built {
                state.acl.give_back(credit);
                return Err(e);
            }
            state.acl.record_send(credit, connection_handle)?;
            Ok(packet)
        })?;

        self.send_to_controller(H4Packet::Pooled(packet));
        self.process_pending_work();
        Ok(())
    }

    /// Whether the proxy intends to send LE ACL packets. True even before
    /// credits have actually been reserved from the controller.
    pub fn has_send_le_acl_capability(&self) -> bool {
        self.state.lock(|state| state.borrow().acl.has_send_capability(Transport::Le))
    }

    /// Whether the proxy intends to send BR/EDR ACL packets.
    pub fn has_send_bredr_acl_capability(&self) -> bool {
        self.state.lock(|state| state.borrow().acl.has_send_capability(Transport::BrEdr))
    }

    /// Currently available LE send credits. Zero until the host has queried
    /// the controller's LE buffer size.
    pub fn free_le_acl_credits(&self) -> u16 {
        self.state.lock(|state| state.borrow().acl.free_credits(Transport::Le))
    }

    /// Currently available BR/EDR send credits.
    pub fn free_bredr_acl_credits(&self) -> u16 {
        self.state.lock(|state| state.borrow().acl.free_credits(Transport::BrEdr))
    }

    /// Largest HCI packet the proxy can originate (the H4 type byte is not
    /// counted).
    pub fn max_acl_send_size(&self) -> usize {
        self.pool.slot_size() - 1
    }

    /// Max simultaneous ACL connections supported per transport.
    pub const fn max_acl_connections() -> usize {
        MAX_ACL_CONNECTIONS
    }

    // ##### Dispatch

    fn handle_event_from_controller(&self, packet: HciPacket<'_>) {
        let Ok(header) = EventHeader::parse(packet.as_ref()) else {
            // Too short to even carry an event header; not ours to judge.
            return self.send_to_host(packet);
        };
        match header.code {
            EVT_COMMAND_COMPLETE => self.handle_command_complete(packet),
            EVT_NUMBER_OF_COMPLETED_PACKETS => self.handle_number_of_completed_packets(packet),
            EVT_DISCONNECTION_COMPLETE => self.handle_disconnection_complete(packet),
            EVT_LE_META => {
                if let Some(subevent) = packet.as_ref().get(EventHeader::SIZE) {
                    trace!("[host] le meta event {:02x}", *subevent);
                }
                self.send_to_host(packet)
            }
            _ => self.send_to_host(packet),
        }
    }

    fn handle_command_complete(&self, mut packet: HciPacket<'_>) {
        let Ok(complete) = CommandComplete::parse(packet.as_ref()) else {
            return self.send_to_host(packet);
        };
        let layout = match complete.opcode {
            OPCODE_LE_READ_BUFFER_SIZE_V1 => Some((BufferSizeLayout::LeV1, Transport::Le)),
            OPCODE_LE_READ_BUFFER_SIZE_V2 => Some((BufferSizeLayout::LeV2, Transport::Le)),
            OPCODE_READ_BUFFER_SIZE => Some((BufferSizeLayout::BrEdr, Transport::BrEdr)),
            _ => None,
        };
        let mut credits_granted = false;
        if let Some((layout, transport)) = layout {
            if let Ok(mut view) = ReadBufferSizeComplete::new(layout, packet.as_mut()) {
                if view.status() == STATUS_SUCCESS {
                    let total = view.controller_total();
                    let reserved = self
                        .state
                        .lock(|state| state.borrow_mut().acl.reserve_credits(transport, total));
                    if let Some(reserved) = reserved {
                        // The host only gets to see its own share.
                        view.set_controller_total(total - reserved);
                        credits_granted = reserved > 0;
                    }
                }
            }
        }
        self.send_to_host(packet);
        if credits_granted {
            // Sends queued before initialization can go out now.
            self.drain_channel_queues();
        }
    }

    fn handle_number_of_completed_packets(&self, mut packet: HciPacket<'_>) {
        if let Ok(mut nocp) = NumberOfCompletedPackets::new(packet.as_mut()) {
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                for i in 0..nocp.num_handles() {
                    let reported = nocp.num_completed_packets(i);
                    if reported == 0 {
                        continue;
                    }
                    let reclaimed = state.acl.reclaim(nocp.connection_handle(i), reported);
                    if reclaimed > 0 {
                        nocp.set_num_completed_packets(i, reported - reclaimed);
                    }
                }
            });
        }
        self.send_to_host(packet);
        // Reclaimed credits may unblock queued sends.
        self.drain_channel_queues();
    }

    fn handle_disconnection_complete(&self, packet: HciPacket<'_>) {
        let Ok(event) = DisconnectionComplete::parse(packet.as_ref()) else {
            return self.send_to_host(packet);
        };
        if event.status == STATUS_SUCCESS {
            let handle = event.connection_handle;
            info!("[host] disconnection complete on {:02x}", handle);
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                state.acl.process_disconnect(handle);
                state.channels.clear_assembly_for(handle);
            });
            // Close affected channels one at a time, reacquiring the lock
            // around each close so the callback runs without it.
            loop {
                let closed = self
                    .state
                    .lock(|state| state.borrow_mut().channels.take_one_for_disconnect(handle));
                let Some((index, generation)) = closed else {
                    break;
                };
                self.emit_channel_event(index, generation, L2capChannelEvent::ChannelClosedByOther);
                self.clear_callbacks(index, generation);
            }
            if handle <= MAX_VALID_CONN_HANDLE {
                self.status.notify_closed(ConnHandle::new(handle));
            }
        }
        self.send_to_host(packet);
    }

    fn handle_acl_from_controller(&self, packet: HciPacket<'_>) {
        let disposition = {
            let Ok(frame) = AclFrame::parse(packet.as_ref()) else {
                return self.send_to_host(packet);
            };
            if !frame.is_consistent() {
                trace!("[host] acl frame length mismatch, passing through");
                return self.send_to_host(packet);
            }
            let (handle, boundary) = (frame.handle(), frame.boundary());
            self.state
                .lock(|state| state.borrow_mut().channels.route_inbound(handle, boundary, frame.payload()))
        };
        match disposition {
            InboundDisposition::PassThrough => self.send_to_host(packet),
            InboundDisposition::Consume => {}
            InboundDisposition::Deliver {
                channel,
                generation,
                source,
            } => match source {
                InboundSource::Frame { offset, len } => {
                    let start = AclFrame::HEADER_SIZE + offset;
                    self.deliver_payload(channel, generation, &packet.as_ref()[start..start + len]);
                }
                InboundSource::Assembled { packet: pdu, offset } => {
                    self.deliver_payload(channel, generation, &pdu.as_ref()[offset..]);
                }
            },
            InboundDisposition::Event {
                channel,
                generation,
                event,
            } => self.emit_channel_event(channel, generation, event),
        }
        // A peeked credit grant may have unlatched a blocked writer.
        self.notify_write_available();
    }

    // ##### Queue draining

    /// Round-robin over the registered channels, sending one queued PDU per
    /// channel per sweep for as long as credits allow. The transmit step runs
    /// with no lock held; buffer releases during it simply latch another
    /// drain request, which this loop consumes before returning.
    fn drain_channel_queues(&self) {
        loop {
            loop {
                let step = self.state.lock(|state| {
                    let mut state = state.borrow_mut();
                    let State { acl, channels } = &mut *state;
                    channels.dequeue_round_robin(acl)
                });
                match step {
                    DrainStep::Send { packet } => self.send_to_controller(H4Packet::Pooled(packet)),
                    DrainStep::Idle => {
                        if self.state.lock(|state| state.borrow().channels.at_terminus()) {
                            break;
                        }
                    }
                    DrainStep::Empty => break,
                }
            }
            self.notify_write_available();
            if !self.pool.take_drain_request() {
                break;
            }
        }
    }

    /// Entry points end here: consume any buffer-release signal that arrived
    /// since the last drain and re-run the drain loop for it.
    fn process_pending_work(&self) {
        if self.pool.take_drain_request() {
            self.drain_channel_queues();
        }
    }

    fn notify_write_available(&self) {
        let ready = self.state.lock(|state| state.borrow_mut().channels.take_write_ready());
        for (index, generation) in ready {
            self.emit_channel_event(index, generation, L2capChannelEvent::WriteAvailable);
        }
    }

    // ##### Callback plumbing

    fn set_callbacks(
        &self,
        index: usize,
        generation: u16,
        receive: &'d mut dyn FnMut(&[u8]),
        event: &'d mut dyn FnMut(L2capChannelEvent),
    ) {
        self.callbacks.lock(|callbacks| {
            callbacks.borrow_mut()[index] = ChannelCallbacks {
                generation,
                receive: Some(receive),
                event: Some(event),
            };
        });
    }

    fn clear_callbacks(&self, index: usize, generation: u16) {
        self.callbacks.lock(|callbacks| {
            let mut callbacks = callbacks.borrow_mut();
            if callbacks[index].generation == generation {
                callbacks[index] = ChannelCallbacks::NONE;
            }
        });
    }

    /// Invoke a channel's receive callback with no lock held. The callback is
    /// taken out of its slot for the duration of the call so that reentrant
    /// proxy use from inside it cannot alias it.
    fn deliver_payload(&self, index: usize, generation: u16, payload: &[u8]) {
        let taken = self.callbacks.lock(|callbacks| {
            let mut callbacks = callbacks.borrow_mut();
            if callbacks[index].generation == generation {
                callbacks[index].receive.take()
            } else {
                None
            }
        });
        let Some(mut receive) = taken else {
            trace!("[host] no receive callback for channel, dropping payload");
            return;
        };
        receive(payload);
        self.callbacks.lock(|callbacks| {
            let mut callbacks = callbacks.borrow_mut();
            if callbacks[index].generation == generation && callbacks[index].receive.is_none() {
                callbacks[index].receive = Some(receive);
            }
        });
    }

    fn emit_channel_event(&self, index: usize, generation: u16, event: L2capChannelEvent) {
        let taken = self.callbacks.lock(|callbacks| {
            let mut callbacks = callbacks.borrow_mut();
            if callbacks[index].generation == generation {
                callbacks[index].event.take()
            } else {
                None
            }
        });
        let Some(mut event_fn) = taken else {
            return;
        };
        event_fn(event);
        self.callbacks.lock(|callbacks| {
            let mut callbacks = callbacks.borrow_mut();
            if callbacks[index].generation == generation && callbacks[index].event.is_none() {
                callbacks[index].event = Some(event_fn);
            }
        });
    }

    // ##### Sinks

    fn send_to_host(&self, packet: HciPacket<'_>) {
        self.sinks.lock(|sinks| {
            let mut sinks = sinks.borrow_mut();
            (sinks.to_host)(packet);
        });
    }

    fn send_to_controller(&self, packet: H4Packet<'_, 'd>) {
        self.sinks.lock(|sinks| {
            let mut sinks = sinks.borrow_mut();
            (sinks.to_controller)(packet);
        });
    }
}

fn are_valid_channel_parameters(connection_handle: u16, local_cid: u16, remote_cid: u16) -> bool {
    if connection_handle > MAX_VALID_CONN_HANDLE {
        warn!("[host] connection handle {:02x} out of range", connection_handle);
        return false;
    }
    if local_cid == 0 || remote_cid == 0 {
        warn!("[host] channel identifiers cannot be 0");
        return false;
    }
    true
}

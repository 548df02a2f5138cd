//! End-to-end tests driving the proxy through its container API: packets in
//! through the two handle functions, packets out through the two sinks.

use std::cell::{Cell, RefCell};

use bt_hci::param::ConnHandle;
use btproxy::{
    CocConfig, Error, H4Packet, H4PacketType, HciPacket, L2capChannelEvent, L2capConnectionInfo,
    L2capStatusDelegate, ProxyHost, ProxyResources, Transport,
};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;

type Resources<const BUFS: usize> = ProxyResources<NoopRawMutex, BUFS, 40>;

// Pin the closures to the sink signatures so inference picks the
// higher-ranked lifetimes.
fn host_sink<F: for<'a> FnMut(HciPacket<'a>)>(f: F) -> F {
    f
}

fn ctrl_sink<'d, F: for<'a> FnMut(H4Packet<'a, 'd>)>(f: F) -> F {
    f
}

// ##### Event and frame builders (little endian, per Core Spec layouts).

fn le_buffer_size_v1_event(total: u8) -> [u8; 9] {
    // Command_Complete for LE_Read_Buffer_Size [v1] (opcode 0x2002),
    // status success, LE_ACL_Data_Packet_Length 251.
    [0x0E, 0x07, 0x01, 0x02, 0x20, 0x00, 0xFB, 0x00, total]
}

fn le_buffer_size_v2_event(total: u8) -> [u8; 12] {
    [0x0E, 0x0A, 0x01, 0x60, 0x20, 0x00, 0xFB, 0x00, total, 0x47, 0x00, 0x00]
}

fn bredr_buffer_size_event(total: u16) -> [u8; 13] {
    let t = total.to_le_bytes();
    [0x0E, 0x0B, 0x01, 0x05, 0x10, 0x00, 0xFB, 0x03, 0x40, t[0], t[1], 0x08, 0x00]
}

fn nocp_event(entries: &[(u16, u16)]) -> Vec<u8> {
    let mut event = vec![0x13, (1 + 4 * entries.len()) as u8, entries.len() as u8];
    for (handle, completed) in entries {
        event.extend_from_slice(&handle.to_le_bytes());
        event.extend_from_slice(&completed.to_le_bytes());
    }
    event
}

fn disconnection_event(handle: u16) -> [u8; 6] {
    let h = handle.to_le_bytes();
    [0x05, 0x04, 0x00, h[0], h[1], 0x13]
}

const PB_FIRST: u8 = 0b10;
const PB_CONTINUING: u8 = 0b01;

fn acl_frame(handle: u16, pb: u8, payload: &[u8]) -> Vec<u8> {
    let raw = (handle & 0x0FFF) | ((pb as u16) << 12);
    let mut frame = raw.to_le_bytes().to_vec();
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn l2cap_pdu(cid: u16, body: &[u8]) -> Vec<u8> {
    let mut pdu = (body.len() as u16).to_le_bytes().to_vec();
    pdu.extend_from_slice(&cid.to_le_bytes());
    pdu.extend_from_slice(body);
    pdu
}

// ##### Pass-through

#[test]
fn to_controller_passes_equal_buffer() {
    let mut resources: Resources<4> = ProxyResources::new();
    let expected_ptr = Cell::new(0usize);
    let sends = Cell::new(0);
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| {}),
        ctrl_sink(|packet| {
            sends.set(sends.get() + 1);
            assert_eq!(packet.h4_type(), H4PacketType::Command);
            assert_eq!(packet.as_ref(), &[0x01, 0x05, 0x04, 0x01, 0xAA, 0xBB, 0xCC, 0x01]);
            // No copy: same memory location as the input buffer.
            assert_eq!(packet.as_ref().as_ptr() as usize, expected_ptr.get());
        }),
        2,
        0,
    );

    let mut h4 = [0x01, 0x05, 0x04, 0x01, 0xAA, 0xBB, 0xCC, 0x01];
    expected_ptr.set(h4.as_ptr() as usize);
    proxy.handle_h4_from_host(H4Packet::Borrowed(&mut h4));
    assert_eq!(sends.get(), 1);
}

#[test]
fn to_host_passes_equal_buffer() {
    let mut resources: Resources<4> = ProxyResources::new();
    let expected_ptr = Cell::new(0usize);
    let sends = Cell::new(0);
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| {
            sends.set(sends.get() + 1);
            assert_eq!(packet.h4_type(), H4PacketType::Event);
            // Inquiry_Complete, not something the proxy acts on.
            assert_eq!(packet.as_ref(), &[0x01, 0x01, 0x00]);
            assert_eq!(packet.as_ref().as_ptr() as usize, expected_ptr.get());
        }),
        ctrl_sink(|_| {}),
        2,
        0,
    );

    let mut hci = [0x01, 0x01, 0x00];
    expected_ptr.set(hci.as_ptr() as usize);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut hci));
    assert_eq!(sends.get(), 1);
}

#[test]
fn empty_buffers_pass_through() {
    let mut resources: Resources<4> = ProxyResources::new();
    let to_controller = Cell::new(0);
    let to_host = Cell::new(0);
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| {
            to_host.set(to_host.get() + 1);
            // The out-of-band tag survives even with no payload.
            assert_eq!(packet.h4_type(), H4PacketType::Event);
            assert!(packet.as_ref().is_empty());
        }),
        ctrl_sink(|packet| {
            to_controller.set(to_controller.get() + 1);
            // A zero-length frame has no byte to store a type in.
            assert_eq!(packet.h4_type(), H4PacketType::Unknown);
            assert!(packet.as_ref().is_empty());
        }),
        2,
        0,
    );

    let mut empty_h4: [u8; 0] = [];
    proxy.handle_h4_from_host(H4Packet::Borrowed(&mut empty_h4));
    let mut empty_hci: [u8; 0] = [];
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut empty_hci));
    assert_eq!((to_controller.get(), to_host.get()), (1, 1));
}

#[test]
fn short_events_pass_through_unparsed() {
    let mut resources: Resources<4> = ProxyResources::new();
    let seen: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| seen.borrow_mut().push(packet.as_ref().to_vec())),
        ctrl_sink(|_| {}),
        2,
        0,
    );

    // One byte short of an event header.
    let mut tiny = [0x0E];
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut tiny));
    // A Command_Complete truncated before its opcode.
    let mut truncated = [0x0E, 0x04, 0x01];
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut truncated));
    // A buffer-size response truncated one byte before its total field.
    let mut no_total = [0x0E, 0x07, 0x01, 0x02, 0x20, 0x00, 0xFB, 0x00];
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut no_total));

    let seen = seen.borrow();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0], vec![0x0E]);
    assert_eq!(seen[1], vec![0x0E, 0x04, 0x01]);
    assert_eq!(seen[2], vec![0x0E, 0x07, 0x01, 0x02, 0x20, 0x00, 0xFB, 0x00]);
    assert_eq!(proxy.free_le_acl_credits(), 0);
}

#[test]
fn unknown_h4_type_passes_through() {
    let mut resources: Resources<4> = ProxyResources::new();
    let sends = Cell::new(0);
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| {}),
        ctrl_sink(|packet| {
            sends.set(sends.get() + 1);
            assert_eq!(packet.h4_type(), H4PacketType::Unknown);
            assert_eq!(packet.as_ref(), &[0xAB, 0x01, 0x02]);
        }),
        2,
        0,
    );

    let mut h4 = [0xAB, 0x01, 0x02];
    proxy.handle_h4_from_host(H4Packet::Borrowed(&mut h4));
    assert_eq!(sends.get(), 1);
}

// ##### Credit reservation

#[test]
fn reserves_le_credits_with_v1_response() {
    let mut resources: Resources<4> = ProxyResources::new();
    let host_totals: RefCell<Vec<u8>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| host_totals.borrow_mut().push(packet.as_ref()[8])),
        ctrl_sink(|_| {}),
        2,
        0,
    );

    let mut event = le_buffer_size_v1_event(10);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    // 2 reserved out of 10, so the host sees 8.
    assert_eq!(host_totals.borrow()[0], 8);
    assert_eq!(proxy.free_le_acl_credits(), 2);
    assert!(proxy.has_send_le_acl_capability());
}

#[test]
fn reserves_le_credits_with_v2_response() {
    let mut resources: Resources<4> = ProxyResources::new();
    let host_totals: RefCell<Vec<u8>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| host_totals.borrow_mut().push(packet.as_ref()[8])),
        ctrl_sink(|_| {}),
        2,
        0,
    );

    let mut event = le_buffer_size_v2_event(10);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    assert_eq!(host_totals.borrow()[0], 8);
    assert_eq!(proxy.free_le_acl_credits(), 2);
}

#[test]
fn reservation_capped_by_controller_total() {
    let mut resources: Resources<4> = ProxyResources::new();
    let host_totals: RefCell<Vec<u8>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| host_totals.borrow_mut().push(packet.as_ref()[8])),
        ctrl_sink(|_| {}),
        7,
        0,
    );

    let mut event = le_buffer_size_v1_event(5);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    // We wanted 7 but got all 5; nothing left for the host.
    assert_eq!(host_totals.borrow()[0], 0);
    assert_eq!(proxy.free_le_acl_credits(), 5);
}

#[test]
fn zero_reservation_leaves_response_untouched() {
    let mut resources: Resources<4> = ProxyResources::new();
    let host_totals: RefCell<Vec<u8>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| host_totals.borrow_mut().push(packet.as_ref()[8])),
        ctrl_sink(|_| {}),
        0,
        0,
    );

    let mut event = le_buffer_size_v1_event(10);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    assert_eq!(host_totals.borrow()[0], 10);
    assert_eq!(proxy.free_le_acl_credits(), 0);
    assert!(!proxy.has_send_le_acl_capability());
}

#[test]
fn second_buffer_size_response_is_ignored() {
    let mut resources: Resources<4> = ProxyResources::new();
    let host_totals: RefCell<Vec<u8>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| host_totals.borrow_mut().push(packet.as_ref()[8])),
        ctrl_sink(|_| {}),
        2,
        0,
    );

    let mut first = le_buffer_size_v1_event(10);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut first));
    let mut second = le_buffer_size_v1_event(10);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut second));

    // Only the first response is honored; the second passes through intact.
    assert_eq!(&host_totals.borrow()[..], &[8, 10]);
    assert_eq!(proxy.free_le_acl_credits(), 2);
}

#[test]
fn reserves_bredr_credits_with_wide_field() {
    let mut resources: Resources<4> = ProxyResources::new();
    let host_totals: RefCell<Vec<u16>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| {
            let data = packet.as_ref();
            host_totals.borrow_mut().push(u16::from_le_bytes([data[9], data[10]]));
        }),
        ctrl_sink(|_| {}),
        0,
        3,
    );

    let mut event = bredr_buffer_size_event(300);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    assert_eq!(host_totals.borrow()[0], 297);
    assert_eq!(proxy.free_bredr_acl_credits(), 3);
    assert!(proxy.has_send_bredr_acl_capability());
    assert!(!proxy.has_send_le_acl_capability());
}

// ##### GATT notifications

#[test]
fn gatt_notify_builds_exact_packet() {
    let mut resources: Resources<4> = ProxyResources::new();
    let sends: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| {}),
        ctrl_sink(|packet| {
            assert_eq!(packet.h4_type(), H4PacketType::AclData);
            sends.borrow_mut().push(packet.as_ref().to_vec());
        }),
        1,
        0,
    );
    let mut event = le_buffer_size_v1_event(1);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    assert!(proxy.send_gatt_notify(0x0ACB, 0x4321, &[0xFA]).is_ok());

    let sends = sends.borrow();
    assert_eq!(sends.len(), 1);
    // ACL header, L2CAP basic header on the ATT fixed channel, then the
    // Handle_Value_Ntf, all little endian.
    assert_eq!(
        sends[0],
        vec![0x02, 0xCB, 0x0A, 0x08, 0x00, 0x04, 0x00, 0x04, 0x00, 0x1B, 0x21, 0x43, 0xFA]
    );
    assert_eq!(proxy.free_le_acl_credits(), 0);
}

#[test]
fn gatt_notify_rejects_invalid_arguments() {
    let mut resources: Resources<4> = ProxyResources::new();
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| {}),
        ctrl_sink(|_| panic!("nothing must be sent")),
        0,
        0,
    );

    // Connection handle above the valid maximum.
    assert_eq!(proxy.send_gatt_notify(0x0FFF, 0x145, &[0xAB, 0xCD]), Err(Error::InvalidArgument));
    // Attribute handle zero.
    assert_eq!(proxy.send_gatt_notify(0x123, 0, &[0xAB, 0xCD]), Err(Error::InvalidArgument));
    // Attribute value too large for an H4 buffer.
    let oversized = [0u8; 28];
    assert_eq!(proxy.send_gatt_notify(0x123, 0x145, &oversized), Err(Error::InvalidArgument));
}

#[test]
fn gatt_notify_exclusive_while_send_outstanding() {
    // A single H4 buffer: the second send must wait for the first release.
    let mut resources: Resources<1> = ProxyResources::new();
    let released: RefCell<Option<btproxy::PoolPacket>> = RefCell::new(None);
    let sends = Cell::new(0);
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| {}),
        ctrl_sink(|packet| {
            sends.set(sends.get() + 1);
            if let H4Packet::Pooled(packet) = packet {
                released.borrow_mut().replace(packet);
            }
        }),
        2,
        0,
    );
    let mut event = le_buffer_size_v1_event(2);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    assert!(proxy.send_gatt_notify(0x123, 0x145, &[0xAB, 0xCD]).is_ok());
    assert_eq!(proxy.send_gatt_notify(0x123, 0x145, &[0xAB, 0xCD]), Err(Error::Unavailable));

    // Dropping the outstanding packet returns its buffer to the pool.
    released.borrow_mut().take();
    assert!(proxy.send_gatt_notify(0x123, 0x145, &[0xAB, 0xCD]).is_ok());
    assert_eq!(proxy.send_gatt_notify(0x123, 0x145, &[0xAB, 0xCD]), Err(Error::Unavailable));
    assert_eq!(sends.get(), 2);
}

// ##### Number_Of_Completed_Packets

#[test]
fn nocp_reclaims_proxy_credits_and_rewrites_event() {
    let mut resources: Resources<4> = ProxyResources::new();
    let nocp_seen: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| {
            if packet.as_ref()[0] == 0x13 {
                nocp_seen.borrow_mut().push(packet.as_ref().to_vec());
            }
        }),
        ctrl_sink(|_| {}),
        3,
        0,
    );
    let mut event = le_buffer_size_v1_event(3);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    for handle in [0x123, 0x456, 0x789] {
        assert!(proxy.send_gatt_notify(handle, 1, &[0]).is_ok());
    }
    assert_eq!(proxy.free_le_acl_credits(), 0);
    assert_eq!(proxy.send_gatt_notify(0x123, 1, &[0]), Err(Error::Unavailable));

    // One completion on connections 0 and 2, none on 1.
    let mut event = nocp_event(&[(0x123, 1), (0x456, 0), (0x789, 1)]);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    assert_eq!(proxy.free_le_acl_credits(), 2);
    let seen = nocp_seen.borrow();
    assert_eq!(seen.len(), 1);
    // All completions were ours; the host sees zero everywhere, with the
    // handle entries untouched.
    assert_eq!(seen[0], nocp_event(&[(0x123, 0), (0x456, 0), (0x789, 0)]));
}

#[test]
fn nocp_reclaim_clamps_to_in_flight() {
    let mut resources: Resources<4> = ProxyResources::new();
    let nocp_seen: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| {
            if packet.as_ref()[0] == 0x13 {
                nocp_seen.borrow_mut().push(packet.as_ref().to_vec());
            }
        }),
        ctrl_sink(|_| {}),
        2,
        0,
    );
    let mut event = le_buffer_size_v1_event(2);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    assert!(proxy.send_gatt_notify(0x123, 1, &[0]).is_ok());
    assert!(proxy.send_gatt_notify(0x456, 1, &[0]).is_ok());

    // The controller reports far more completions than the proxy has in
    // flight; only one credit per connection comes back to the proxy.
    let mut event = nocp_event(&[(0x123, 10), (0x456, 15)]);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    assert_eq!(proxy.free_le_acl_credits(), 2);
    assert_eq!(nocp_seen.borrow()[0], nocp_event(&[(0x123, 9), (0x456, 14)]));
}

#[test]
fn nocp_untouched_when_no_credits_in_use() {
    let mut resources: Resources<4> = ProxyResources::new();
    let nocp_seen: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| {
            if packet.as_ref()[0] == 0x13 {
                nocp_seen.borrow_mut().push(packet.as_ref().to_vec());
            }
        }),
        ctrl_sink(|_| {}),
        10,
        0,
    );
    let mut event = le_buffer_size_v1_event(10);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    let original = nocp_event(&[(0x123, 10), (0x456, 15)]);
    let mut event = original.clone();
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));
    // An empty event is legal too.
    let mut event = nocp_event(&[]);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    assert_eq!(proxy.free_le_acl_credits(), 10);
    let seen = nocp_seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], original);
}

#[test]
fn example_scenario_reserve_notify_reclaim_notify() {
    let mut resources: Resources<4> = ProxyResources::new();
    let host_totals: RefCell<Vec<u8>> = RefCell::new(Vec::new());
    let sends = Cell::new(0);
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| {
            if packet.as_ref()[0] == 0x0E {
                host_totals.borrow_mut().push(packet.as_ref()[8]);
            }
        }),
        ctrl_sink(|_| sends.set(sends.get() + 1)),
        2,
        0,
    );

    // Reserve 2 LE credits out of a controller total of 10; host sees 8.
    let mut event = le_buffer_size_v1_event(10);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));
    assert_eq!(host_totals.borrow()[0], 8);
    assert_eq!(proxy.free_le_acl_credits(), 2);

    assert!(proxy.send_gatt_notify(0x123, 0x42, &[1, 2, 3]).is_ok());
    assert_eq!(proxy.free_le_acl_credits(), 1);

    let mut event = nocp_event(&[(0x123, 1)]);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));
    assert_eq!(proxy.free_le_acl_credits(), 2);

    assert!(proxy.send_gatt_notify(0x123, 0x42, &[4, 5, 6]).is_ok());
    assert_eq!(sends.get(), 2);
}

// ##### L2CAP channels

#[test]
fn channel_write_frames_and_sends() {
    let mut resources: Resources<4> = ProxyResources::new();
    let sends: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| {}),
        ctrl_sink(|packet| {
            if packet.h4_type() == H4PacketType::AclData {
                sends.borrow_mut().push(packet.as_ref().to_vec());
            }
        }),
        2,
        0,
    );
    let mut event = le_buffer_size_v1_event(2);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    let mut receive = |_: &[u8]| {};
    let mut events = |_: L2capChannelEvent| {};
    let channel = proxy
        .acquire_basic_channel(0x123, 0x40, 0x50, Transport::Le, &mut receive, &mut events)
        .unwrap();

    proxy.channel_write(channel, &[0x09, 0x09]).unwrap();

    let sends = sends.borrow();
    assert_eq!(sends.len(), 1);
    // Framed for the remote CID with a basic L2CAP header.
    assert_eq!(sends[0], vec![0x02, 0x23, 0x01, 0x06, 0x00, 0x02, 0x00, 0x50, 0x00, 0x09, 0x09]);
    drop(proxy);
}

#[test]
fn channel_write_queues_until_credits_arrive_round_robin() {
    let mut resources: Resources<8> = ProxyResources::new();
    let sent_markers: RefCell<Vec<u8>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| {}),
        ctrl_sink(|packet| {
            if packet.h4_type() == H4PacketType::AclData {
                let data = packet.as_ref();
                sent_markers.borrow_mut().push(data[data.len() - 1]);
            }
        }),
        8,
        0,
    );

    let mut rx_a = |_: &[u8]| {};
    let mut ev_a = |_: L2capChannelEvent| {};
    let mut rx_b = |_: &[u8]| {};
    let mut ev_b = |_: L2capChannelEvent| {};
    let mut rx_c = |_: &[u8]| {};
    let mut ev_c = |_: L2capChannelEvent| {};
    let a = proxy
        .acquire_basic_channel(0x123, 0x40, 0x50, Transport::Le, &mut rx_a, &mut ev_a)
        .unwrap();
    let b = proxy
        .acquire_basic_channel(0x123, 0x41, 0x51, Transport::Le, &mut rx_b, &mut ev_b)
        .unwrap();
    let c = proxy
        .acquire_basic_channel(0x123, 0x42, 0x52, Transport::Le, &mut rx_c, &mut ev_c)
        .unwrap();

    // No credits reserved yet; everything queues.
    proxy.channel_write(a, &[0xA0]).unwrap();
    proxy.channel_write(a, &[0xA1]).unwrap();
    proxy.channel_write(b, &[0xB0]).unwrap();
    proxy.channel_write(c, &[0xC0]).unwrap();
    assert!(sent_markers.borrow().is_empty());

    // Credits arrive; queues drain round robin: one PDU per channel per
    // sweep before any channel sends twice.
    let mut event = le_buffer_size_v1_event(8);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    assert_eq!(&sent_markers.borrow()[..], &[0xA0, 0xB0, 0xC0, 0xA1]);
    drop(proxy);
}

#[test]
fn full_queue_latches_write_available() {
    let mut resources: Resources<8> = ProxyResources::new();
    let acl_sends = Cell::new(0);
    let events: RefCell<Vec<L2capChannelEvent>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| {}),
        ctrl_sink(|packet| {
            if packet.h4_type() == H4PacketType::AclData {
                acl_sends.set(acl_sends.get() + 1);
            }
        }),
        8,
        0,
    );

    let mut receive = |_: &[u8]| {};
    let mut event_fn = |e: L2capChannelEvent| events.borrow_mut().push(e);
    let channel = proxy
        .acquire_basic_channel(0x123, 0x40, 0x50, Transport::Le, &mut receive, &mut event_fn)
        .unwrap();

    // No credits yet: five writes fill the queue, the sixth bounces.
    for i in 0u8..5 {
        proxy.channel_write(channel, &[i]).unwrap();
    }
    assert_eq!(proxy.channel_write(channel, &[5]), Err(Error::Unavailable));
    assert!(events.borrow().is_empty());

    let mut event = le_buffer_size_v1_event(8);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    assert_eq!(acl_sends.get(), 5);
    assert!(events.borrow().contains(&L2capChannelEvent::WriteAvailable));
    // And the retry goes through.
    proxy.channel_write(channel, &[5]).unwrap();
    assert_eq!(acl_sends.get(), 6);
    drop(proxy);
}

#[test]
fn inbound_pdu_delivered_to_channel() {
    let mut resources: Resources<4> = ProxyResources::new();
    let received: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    let to_host = Cell::new(0);
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| to_host.set(to_host.get() + 1)),
        ctrl_sink(|_| {}),
        2,
        0,
    );

    let mut receive = |data: &[u8]| received.borrow_mut().push(data.to_vec());
    let mut events = |_: L2capChannelEvent| {};
    proxy
        .acquire_basic_channel(0x123, 0x40, 0x50, Transport::Le, &mut receive, &mut events)
        .unwrap();

    let mut frame = acl_frame(0x123, PB_FIRST, &l2cap_pdu(0x40, &[0xAA, 0xBB, 0xCC, 0xDD]));
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::AclData, &mut frame));

    assert_eq!(&received.borrow()[..], &[vec![0xAA, 0xBB, 0xCC, 0xDD]]);
    assert_eq!(to_host.get(), 0);
    drop(proxy);
}

#[test]
fn fragmented_pdu_is_recombined() {
    let mut resources: Resources<4> = ProxyResources::new();
    let received: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    let to_host = Cell::new(0);
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| to_host.set(to_host.get() + 1)),
        ctrl_sink(|_| {}),
        2,
        0,
    );

    let mut receive = |data: &[u8]| received.borrow_mut().push(data.to_vec());
    let mut events = |_: L2capChannelEvent| {};
    proxy
        .acquire_basic_channel(0x123, 0x40, 0x50, Transport::Le, &mut receive, &mut events)
        .unwrap();

    // A 6-byte PDU split across two ACL frames.
    let mut pdu = l2cap_pdu(0x40, &[1, 2, 3, 4, 5, 6]);
    pdu.truncate(4 + 3);
    let mut first = acl_frame(0x123, PB_FIRST, &pdu);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::AclData, &mut first));
    assert!(received.borrow().is_empty());

    let mut second = acl_frame(0x123, PB_CONTINUING, &[4, 5, 6]);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::AclData, &mut second));

    assert_eq!(&received.borrow()[..], &[vec![1, 2, 3, 4, 5, 6]]);
    assert_eq!(to_host.get(), 0);
    drop(proxy);
}

#[test]
fn unmatched_fragments_pass_through() {
    let mut resources: Resources<4> = ProxyResources::new();
    let seen: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|packet| seen.borrow_mut().push(packet.as_ref().to_vec())),
        ctrl_sink(|_| {}),
        2,
        0,
    );

    let mut receive = |_: &[u8]| {};
    let mut events = |_: L2capChannelEvent| {};
    proxy
        .acquire_basic_channel(0x123, 0x40, 0x50, Transport::Le, &mut receive, &mut events)
        .unwrap();

    // A PDU for an unmanaged CID spanning two frames: both pass through,
    // including the continuation.
    let mut pdu = l2cap_pdu(0x99, &[1, 2, 3, 4, 5, 6]);
    pdu.truncate(4 + 3);
    let first = acl_frame(0x123, PB_FIRST, &pdu);
    let mut buf = first.clone();
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::AclData, &mut buf));
    let second = acl_frame(0x123, PB_CONTINUING, &[4, 5, 6]);
    let mut buf = second.clone();
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::AclData, &mut buf));

    assert_eq!(&seen.borrow()[..], &[first, second]);

    // The pass-through fragment is finished; the next frame is parsed as a
    // fresh PDU start again.
    let mut frame = acl_frame(0x123, PB_FIRST, &l2cap_pdu(0x99, &[7]));
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::AclData, &mut frame));
    assert_eq!(seen.borrow().len(), 3);
    drop(proxy);
}

#[test]
fn new_start_discards_stale_fragment() {
    let mut resources: Resources<4> = ProxyResources::new();
    let received: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| {}),
        ctrl_sink(|_| {}),
        2,
        0,
    );

    let mut receive = |data: &[u8]| received.borrow_mut().push(data.to_vec());
    let mut events = |_: L2capChannelEvent| {};
    proxy
        .acquire_basic_channel(0x123, 0x40, 0x50, Transport::Le, &mut receive, &mut events)
        .unwrap();

    // Start a fragmented PDU but never finish it.
    let mut pdu = l2cap_pdu(0x40, &[1, 2, 3, 4, 5, 6]);
    pdu.truncate(4 + 3);
    let mut stale = acl_frame(0x123, PB_FIRST, &pdu);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::AclData, &mut stale));

    // A fresh complete PDU on the same connection replaces the stale one.
    let mut fresh = acl_frame(0x123, PB_FIRST, &l2cap_pdu(0x40, &[7, 7]));
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::AclData, &mut fresh));

    assert_eq!(&received.borrow()[..], &[vec![7, 7]]);
    drop(proxy);
}

#[test]
fn stale_channel_handle_is_rejected() {
    let mut resources: Resources<4> = ProxyResources::new();
    let proxy = ProxyHost::new(&mut resources, host_sink(|_| {}), ctrl_sink(|_| {}), 2, 0);

    let mut receive = |_: &[u8]| {};
    let mut events = |_: L2capChannelEvent| {};
    let channel = proxy
        .acquire_basic_channel(0x123, 0x40, 0x50, Transport::Le, &mut receive, &mut events)
        .unwrap();
    proxy.release_channel(channel).unwrap();

    assert_eq!(proxy.channel_write(channel, &[1]), Err(Error::InvalidArgument));
    assert_eq!(proxy.release_channel(channel), Err(Error::InvalidArgument));

    // The freed slot can be reused; the old handle stays dead.
    let mut receive2 = |_: &[u8]| {};
    let mut events2 = |_: L2capChannelEvent| {};
    let replacement = proxy
        .acquire_basic_channel(0x124, 0x40, 0x50, Transport::Le, &mut receive2, &mut events2)
        .unwrap();
    assert_eq!(proxy.channel_write(channel, &[1]), Err(Error::InvalidArgument));
    assert_ne!(channel, replacement);
    drop(proxy);
}

// ##### Credit-based channels

fn coc_rx_config() -> CocConfig {
    CocConfig {
        cid: 0x40,
        mtu: 100,
        mps: 50,
        credits: 2,
    }
}

fn coc_tx_config() -> CocConfig {
    CocConfig {
        cid: 0x41,
        mtu: 23,
        mps: 25,
        credits: 1,
    }
}

#[test]
fn coc_write_prepends_sdu_length_and_spends_credits() {
    let mut resources: Resources<4> = ProxyResources::new();
    let sends: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    let to_host = Cell::new(0);
    let events: RefCell<Vec<L2capChannelEvent>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| to_host.set(to_host.get() + 1)),
        ctrl_sink(|packet| {
            if packet.h4_type() == H4PacketType::AclData {
                sends.borrow_mut().push(packet.as_ref().to_vec());
            }
        }),
        4,
        0,
    );
    let mut event = le_buffer_size_v1_event(4);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    let mut receive = |_: &[u8]| {};
    let mut event_fn = |e: L2capChannelEvent| events.borrow_mut().push(e);
    let channel = proxy
        .acquire_credit_channel(0x123, 0x25, coc_rx_config(), coc_tx_config(), &mut receive, &mut event_fn)
        .unwrap();

    proxy.channel_write(channel, &[1, 2, 3]).unwrap();
    assert_eq!(
        sends.borrow()[0],
        vec![0x02, 0x23, 0x01, 0x09, 0x00, 0x05, 0x00, 0x41, 0x00, 0x03, 0x00, 1, 2, 3]
    );

    // The single peer credit is spent.
    assert_eq!(proxy.channel_write(channel, &[4]), Err(Error::Unavailable));

    // Peer grants two more credits through a flow control credit indication
    // on the signaling channel; the proxy peeks at it but the host still
    // gets the packet.
    let signal = [0x16, 0x01, 0x04, 0x00, 0x41, 0x00, 0x02, 0x00];
    let mut frame = acl_frame(0x123, PB_FIRST, &l2cap_pdu(0x0005, &signal));
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::AclData, &mut frame));
    assert_eq!(to_host.get(), 1);
    assert!(events.borrow().contains(&L2capChannelEvent::WriteAvailable));

    proxy.channel_write(channel, &[4]).unwrap();
    assert_eq!(sends.borrow().len(), 2);
    drop(proxy);
}

#[test]
fn coc_rx_strips_sdu_length_and_discards_segmented() {
    let mut resources: Resources<4> = ProxyResources::new();
    let received: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    let events: RefCell<Vec<L2capChannelEvent>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(&mut resources, host_sink(|_| {}), ctrl_sink(|_| {}), 2, 0);

    let mut receive = |data: &[u8]| received.borrow_mut().push(data.to_vec());
    let mut event_fn = |e: L2capChannelEvent| events.borrow_mut().push(e);
    proxy
        .acquire_credit_channel(0x123, 0x25, coc_rx_config(), coc_tx_config(), &mut receive, &mut event_fn)
        .unwrap();

    // A complete SDU in one K-frame: the 2-byte SDU length is stripped.
    let mut body = vec![0x03, 0x00, 9, 8, 7];
    let mut frame = acl_frame(0x123, PB_FIRST, &l2cap_pdu(0x40, &body));
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::AclData, &mut frame));
    assert_eq!(&received.borrow()[..], &[vec![9, 8, 7]]);

    // An SDU announcing 16 bytes but delivering 2 is segmented;
    // desegmentation is unsupported, so the whole SDU is discarded.
    body = vec![0x10, 0x00, 1, 2];
    let mut frame = acl_frame(0x123, PB_FIRST, &l2cap_pdu(0x40, &body));
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::AclData, &mut frame));
    assert!(events.borrow().contains(&L2capChannelEvent::RxFragmentDropped));
    assert_eq!(received.borrow().len(), 1);

    // The 14 remaining bytes arrive in a follow-up K-frame and are ignored.
    let remainder = [0u8; 14];
    let mut frame = acl_frame(0x123, PB_FIRST, &l2cap_pdu(0x40, &remainder));
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::AclData, &mut frame));
    assert_eq!(received.borrow().len(), 1);

    // Back in sync afterwards.
    body = vec![0x01, 0x00, 0x55];
    let mut frame = acl_frame(0x123, PB_FIRST, &l2cap_pdu(0x40, &body));
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::AclData, &mut frame));
    assert_eq!(received.borrow()[1], vec![0x55]);
    drop(proxy);
}

#[test]
fn send_additional_rx_credits_signals_peer() {
    let mut resources: Resources<4> = ProxyResources::new();
    let sends: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| {}),
        ctrl_sink(|packet| {
            if packet.h4_type() == H4PacketType::AclData {
                sends.borrow_mut().push(packet.as_ref().to_vec());
            }
        }),
        2,
        0,
    );
    let mut event = le_buffer_size_v1_event(2);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    let mut receive = |_: &[u8]| {};
    let mut event_fn = |_: L2capChannelEvent| {};
    let channel = proxy
        .acquire_credit_channel(0x123, 0x25, coc_rx_config(), coc_tx_config(), &mut receive, &mut event_fn)
        .unwrap();

    proxy.send_additional_rx_credits(channel, 5).unwrap();

    let sends = sends.borrow();
    assert_eq!(sends.len(), 1);
    // L2CAP_FLOW_CONTROL_CREDIT_IND on the LE signaling channel, granting 5
    // credits on our local CID.
    assert_eq!(
        sends[0],
        vec![0x02, 0x23, 0x01, 0x0C, 0x00, 0x08, 0x00, 0x05, 0x00, 0x16, 0x01, 0x04, 0x00, 0x40, 0x00, 0x05, 0x00]
    );
    drop(proxy);
}

// ##### Disconnection and reset

struct RecordingDelegate {
    psm: u16,
    opened: Vec<L2capConnectionInfo>,
    closed: Vec<ConnHandle>,
}

impl L2capStatusDelegate for RecordingDelegate {
    fn psm(&self) -> u16 {
        self.psm
    }

    fn connection_opened(&mut self, info: &L2capConnectionInfo) {
        self.opened.push(*info);
    }

    fn connection_closed(&mut self, connection_handle: ConnHandle) {
        self.closed.push(connection_handle);
    }
}

#[test]
fn disconnection_closes_channels_and_notifies() {
    let mut resources: Resources<4> = ProxyResources::new();
    let mut delegate = RecordingDelegate {
        psm: 0x25,
        opened: Vec::new(),
        closed: Vec::new(),
    };
    let to_host = Cell::new(0);
    let events: RefCell<Vec<L2capChannelEvent>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(
        &mut resources,
        host_sink(|_| to_host.set(to_host.get() + 1)),
        ctrl_sink(|_| {}),
        2,
        0,
    );
    proxy.register_status_delegate(&mut delegate).unwrap();

    let mut receive = |_: &[u8]| {};
    let mut event_fn = |e: L2capChannelEvent| events.borrow_mut().push(e);
    let channel = proxy
        .acquire_credit_channel(0x123, 0x25, coc_rx_config(), coc_tx_config(), &mut receive, &mut event_fn)
        .unwrap();

    let mut event = disconnection_event(0x123);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    // The event still reaches the host, the channel is closed and the
    // delegate informed.
    assert_eq!(to_host.get(), 1);
    assert_eq!(&events.borrow()[..], &[L2capChannelEvent::ChannelClosedByOther]);
    assert_eq!(proxy.channel_write(channel, &[1]), Err(Error::InvalidArgument));

    drop(proxy);
    assert_eq!(delegate.opened.len(), 1);
    assert_eq!(delegate.opened[0].psm, 0x25);
    assert_eq!(delegate.closed, vec![ConnHandle::new(0x123)]);
}

#[test]
fn disconnection_returns_in_flight_credits() {
    let mut resources: Resources<4> = ProxyResources::new();
    let proxy = ProxyHost::new(&mut resources, host_sink(|_| {}), ctrl_sink(|_| {}), 2, 0);
    let mut event = le_buffer_size_v1_event(2);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));

    assert!(proxy.send_gatt_notify(0x123, 1, &[0]).is_ok());
    assert!(proxy.send_gatt_notify(0x123, 1, &[0]).is_ok());
    assert_eq!(proxy.free_le_acl_credits(), 0);

    // No completions will ever come for a dead link; the credits come home.
    let mut event = disconnection_event(0x123);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));
    assert_eq!(proxy.free_le_acl_credits(), 2);
}

#[test]
fn reset_clears_credits_and_channels() {
    let mut resources: Resources<4> = ProxyResources::new();
    let events: RefCell<Vec<L2capChannelEvent>> = RefCell::new(Vec::new());
    let proxy = ProxyHost::new(&mut resources, host_sink(|_| {}), ctrl_sink(|_| {}), 2, 0);
    let mut event = le_buffer_size_v1_event(10);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));
    assert_eq!(proxy.free_le_acl_credits(), 2);

    let mut receive = |_: &[u8]| {};
    let mut event_fn = |e: L2capChannelEvent| events.borrow_mut().push(e);
    let channel = proxy
        .acquire_basic_channel(0x123, 0x40, 0x50, Transport::Le, &mut receive, &mut event_fn)
        .unwrap();

    proxy.reset();

    assert_eq!(proxy.free_le_acl_credits(), 0);
    assert!(proxy.has_send_le_acl_capability());
    assert_eq!(&events.borrow()[..], &[L2capChannelEvent::Reset]);
    assert_eq!(proxy.channel_write(channel, &[1]), Err(Error::InvalidArgument));

    // A fresh buffer-size response re-reserves.
    let mut event = le_buffer_size_v1_event(10);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));
    assert_eq!(proxy.free_le_acl_credits(), 2);
    drop(proxy);
}

#[test]
fn works_with_static_resources() {
    use static_cell::StaticCell;

    static RESOURCES: StaticCell<ProxyResources<NoopRawMutex, 2, 40>> = StaticCell::new();
    let resources = RESOURCES.init(ProxyResources::new());

    let sends = Cell::new(0);
    let proxy = ProxyHost::new(resources, host_sink(|_| {}), ctrl_sink(|_| sends.set(sends.get() + 1)), 1, 0);
    let mut event = le_buffer_size_v1_event(1);
    proxy.handle_h4_from_controller(HciPacket::new(H4PacketType::Event, &mut event));
    assert!(proxy.send_gatt_notify(0x042, 0x17, &[0x01]).is_ok());
    assert_eq!(sends.get(), 1);
}

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use rand_core::OsRng;

use rns_core::buffer::ByteBuf;
use rns_core::hash::AddressHash;
use rns_core::identity::PrivateIdentity;

use rns_transport::destination::{DestinationName, SingleInputDestination};
use rns_transport::iface::{InterfaceMode, InterfaceProperties};
use rns_transport::packet::{
    DestinationType, Header, HeaderType, Packet, PacketContext, PacketType, PropagationType,
};
use rns_transport::transport::config::TransportConfig;
use rns_transport::transport::{SendOptions, Transport};

use common::{FrameQueue, PipeDriver};

struct SharedInstanceNode {
    transport: Transport,
    uplink: AddressHash,
    uplink_frames: FrameQueue,
    local_client: AddressHash,
    local_client_frames: FrameQueue,
    other: AddressHash,
    other_frames: FrameQueue,
}

/// A node in the shared-instance role: one uplink, one connected local
/// client program, and one further interface.
fn shared_instance_node(name: &str) -> SharedInstanceNode {
    let config = TransportConfig::new(name, PrivateIdentity::new_from_name(name));
    let mut transport = Transport::new(config);

    let uplink = AddressHash::new_from_slice(format!("{}-uplink", name).as_bytes());
    let uplink_frames: FrameQueue = Rc::new(RefCell::new(Default::default()));
    transport
        .register_interface(
            InterfaceProperties::new(uplink, 500, 1_000_000, InterfaceMode::Full),
            Box::new(PipeDriver::new(uplink_frames.clone())),
        )
        .expect("uplink");

    let local_client = AddressHash::new_from_slice(format!("{}-local", name).as_bytes());
    let local_client_frames: FrameQueue = Rc::new(RefCell::new(Default::default()));
    let mut local_properties =
        InterfaceProperties::new(local_client, 500, 1_000_000, InterfaceMode::Full);
    local_properties.is_local_shared_instance = true;
    transport
        .register_interface(local_properties, Box::new(PipeDriver::new(local_client_frames.clone())))
        .expect("local client");

    let other = AddressHash::new_from_slice(format!("{}-other", name).as_bytes());
    let other_frames: FrameQueue = Rc::new(RefCell::new(Default::default()));
    transport
        .register_interface(
            InterfaceProperties::new(other, 500, 1_000_000, InterfaceMode::Full),
            Box::new(PipeDriver::new(other_frames.clone())),
        )
        .expect("other");

    SharedInstanceNode {
        transport,
        uplink,
        uplink_frames,
        local_client,
        local_client_frames,
        other,
        other_frames,
    }
}

fn plain_broadcast(payload: &[u8]) -> Vec<u8> {
    Packet {
        header: Header {
            destination_type: DestinationType::Plain,
            propagation_type: PropagationType::Broadcast,
            packet_type: PacketType::Data,
            ..Default::default()
        },
        ifac: None,
        destination: AddressHash::new_from_slice(b"plain-broadcast-group"),
        transport: None,
        context: PacketContext::None,
        data: ByteBuf::from_slice(payload),
    }
    .to_bytes()
    .expect("frame")
}

#[test]
fn local_client_interfaces_are_tracked() {
    let node = shared_instance_node("tracked");
    assert!(node.transport.is_local_client_interface(&node.local_client));
    assert!(!node.transport.is_local_client_interface(&node.uplink));
    assert!(!node.transport.is_local_client_interface(&node.other));
}

#[test]
fn outside_broadcast_reaches_only_local_clients() {
    let mut node = shared_instance_node("inbound");
    let now = 1000.0;

    let frame = plain_broadcast(b"from the network");
    let uplink = node.uplink;
    node.transport.inbound(&frame, &uplink, now);

    assert!(node.uplink_frames.borrow().is_empty(), "no echo to the source");
    assert!(node.other_frames.borrow().is_empty(), "non-clients get nothing");
    assert_eq!(node.local_client_frames.borrow().len(), 1);
}

#[test]
fn local_client_broadcast_floods_every_other_interface() {
    let mut node = shared_instance_node("outbound");
    let now = 1000.0;

    let frame = plain_broadcast(b"from the client");
    let local_client = node.local_client;
    node.transport.inbound(&frame, &local_client, now);

    assert!(node.local_client_frames.borrow().is_empty(), "no echo to the source");
    assert_eq!(node.uplink_frames.borrow().len(), 1);
    assert_eq!(node.other_frames.borrow().len(), 1);

    // The shared-instance proxy is hop-transparent: the flooded copy
    // carries the client's hop count unchanged.
    let flooded = node.uplink_frames.borrow_mut().pop_front().expect("frame");
    let packet = Packet::from_bytes(&flooded).expect("packet");
    assert_eq!(packet.header.hops, 0);
}

#[test]
fn single_hop_send_behind_a_shared_instance_gets_a_transport_header() {
    let config =
        TransportConfig::new("behind-shared", PrivateIdentity::new_from_name("behind-shared"));
    let mut transport = Transport::new(config);

    let iface = AddressHash::new_from_slice(b"iface-behind-shared");
    let frames: FrameQueue = Rc::new(RefCell::new(Default::default()));
    let mut properties = InterfaceProperties::new(iface, 500, 1_000_000, InterfaceMode::Full);
    properties.is_connected_to_shared_instance = true;
    transport
        .register_interface(properties, Box::new(PipeDriver::new(frames.clone())))
        .expect("interface");

    // Learn a one-hop path the ordinary way.
    let now = 1000.0;
    let mut remote = SingleInputDestination::new(
        PrivateIdentity::new_from_rand(OsRng),
        DestinationName::new("app", "behind.shared"),
    );
    let destination = remote.desc.address_hash;
    let announce = remote.announce(OsRng, None).expect("announce").to_bytes().expect("frame");
    transport.inbound(&announce, &iface, now);
    assert_eq!(transport.hops_to(&destination), Some(1));

    transport
        .send_to_single(&destination, b"through the instance", SendOptions::default(), now)
        .expect("send");

    let frame = frames.borrow_mut().pop_front().expect("frame");
    let packet = Packet::from_bytes(&frame).expect("packet");
    assert_eq!(packet.header.header_type, HeaderType::Type2);
    assert_eq!(packet.header.propagation_type, PropagationType::Transport);
    assert_eq!(packet.transport, Some(destination));
}

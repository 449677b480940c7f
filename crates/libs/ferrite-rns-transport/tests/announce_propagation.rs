mod common;

use std::cell::RefCell;
use std::rc::Rc;

use rns_transport::destination::DestinationName;
use rns_transport::transport::{AnnounceHandler, TransportEvent};

use common::{node, pump, registered_destination};

#[test]
fn one_hop_announce_builds_a_path() {
    let mut sender = node("announce-sender", false);
    let mut receiver = node("announce-receiver", false);
    let now = 1000.0;

    let (destination, shared) = registered_destination(&mut sender, "app", "aspect.one");
    let announced_identity = shared.borrow().desc.identity.address_hash;

    let handled: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = handled.clone();
    let filter = {
        let name = DestinationName::new("app", "aspect.one");
        let mut bytes = [0u8; 10];
        bytes.copy_from_slice(name.as_name_hash_slice());
        bytes
    };
    receiver
        .transport
        .register_announce_handler(AnnounceHandler {
            name_filter: Some(filter),
            callback: Box::new(move |_, _, app_data| {
                sink.borrow_mut().push(app_data.to_vec());
            }),
        })
        .expect("handler");

    sender.transport.announce(&destination, Some(b"fruit"), now).expect("announce");
    assert_eq!(pump(&sender, &mut receiver, now), 1);

    assert!(receiver.transport.has_path(&destination, now));
    assert_eq!(receiver.transport.hops_to(&destination), Some(1));
    let recalled = receiver.transport.recall(&destination).expect("identity");
    assert_eq!(recalled.address_hash, announced_identity);
    assert_eq!(receiver.transport.recall_app_data(&destination).as_deref(), Some(&b"fruit"[..]));

    assert_eq!(handled.borrow().as_slice(), &[b"fruit".to_vec()]);

    let events = receiver.transport.drain_events();
    assert!(events.iter().any(|event| matches!(
        event,
        TransportEvent::AnnounceReceived { destination: announced, hops: 1, .. }
            if *announced == destination
    )));
}

#[test]
fn duplicate_announce_is_dropped() {
    let mut sender = node("dup-sender", false);
    let mut receiver = node("dup-receiver", false);
    let now = 1000.0;

    let (destination, _) = registered_destination(&mut sender, "app", "aspect.two");

    let invocations = Rc::new(RefCell::new(0usize));
    let counter = invocations.clone();
    receiver
        .transport
        .register_announce_handler(AnnounceHandler {
            name_filter: None,
            callback: Box::new(move |_, _, _| {
                *counter.borrow_mut() += 1;
            }),
        })
        .expect("handler");

    sender.transport.announce(&destination, None, now).expect("announce");
    let frame = sender.outbox.borrow_mut().pop_front().expect("frame");

    let iface = receiver.iface;
    receiver.transport.inbound(&frame, &iface, now);
    assert_eq!(receiver.transport.path_count(), 1);
    assert_eq!(*invocations.borrow(), 1);

    // The exact same bytes again: same random blob, so a replay.
    receiver.transport.inbound(&frame, &iface, now + 1.0);
    assert_eq!(receiver.transport.path_count(), 1);
    assert_eq!(*invocations.borrow(), 1);
}

#[test]
fn aspect_filter_skips_unrelated_announces() {
    let mut sender = node("filter-sender", false);
    let mut receiver = node("filter-receiver", false);
    let now = 1000.0;

    let (destination, _) = registered_destination(&mut sender, "app", "aspect.three");

    let invocations = Rc::new(RefCell::new(0usize));
    let counter = invocations.clone();
    let other_filter = {
        let name = DestinationName::new("app", "aspect.other");
        let mut bytes = [0u8; 10];
        bytes.copy_from_slice(name.as_name_hash_slice());
        bytes
    };
    receiver
        .transport
        .register_announce_handler(AnnounceHandler {
            name_filter: Some(other_filter),
            callback: Box::new(move |_, _, _| {
                *counter.borrow_mut() += 1;
            }),
        })
        .expect("handler");

    sender.transport.announce(&destination, None, now).expect("announce");
    pump(&sender, &mut receiver, now);

    // Path learned, handler filtered out.
    assert!(receiver.transport.has_path(&destination, now));
    assert_eq!(*invocations.borrow(), 0);
}

#[test]
fn transport_node_rebroadcasts_on_other_interfaces() {
    let mut sender = node("rebroadcast-sender", false);
    let mut relay = node("rebroadcast-relay", true);
    let now = 1000.0;

    // Second interface on the relay; the rebroadcast must go there and
    // not back out the interface the announce arrived on.
    use rns_core::hash::AddressHash;
    use rns_transport::iface::{InterfaceMode, InterfaceProperties};
    let downstream: common::FrameQueue = std::rc::Rc::new(RefCell::new(Default::default()));
    let second = AddressHash::new_from_slice(b"iface-rebroadcast-second");
    relay
        .transport
        .register_interface(
            InterfaceProperties::new(second, 500, 1_000_000, InterfaceMode::Full),
            Box::new(common::PipeDriver::new(downstream.clone())),
        )
        .expect("second interface");

    let (destination, _) = registered_destination(&mut sender, "app", "aspect.four");
    sender.transport.announce(&destination, None, now).expect("announce");
    pump(&sender, &mut relay, now);

    // The retransmission window includes the pathfinder jitter; sweep a
    // little past it.
    for tick in 0..8 {
        relay.transport.jobs(now + 1.0 + tick as f64);
    }

    assert!(relay.outbox.borrow().is_empty(), "no rebroadcast on the source interface");
    let frame = downstream.borrow_mut().pop_front().expect("rebroadcast frame");
    let packet = rns_transport::packet::Packet::from_bytes(&frame).expect("packet");
    assert_eq!(packet.destination, destination);
    assert_eq!(packet.header.header_type, rns_transport::packet::HeaderType::Type2);
    assert_eq!(packet.transport, Some(relay.transport.identity_hash()));
}

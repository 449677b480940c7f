mod common;

use rns_transport::destination::link::LinkStatus;
use rns_transport::destination::ProofStrategy;
use rns_transport::packet::Packet;
use rns_transport::transport::{SendOptions, TransportEvent};

use common::{node, pump, registered_destination, settle, Node};

/// Announce `server`'s destination into `client` so links can be opened.
fn introduce(server: &mut Node, client: &mut Node, now: f64) -> rns_core::hash::AddressHash {
    let (destination, shared) = registered_destination(server, "link_app", "session");
    shared.borrow_mut().set_accepts_links(true);
    shared.borrow_mut().set_proof_strategy(ProofStrategy::ProveAll);
    server.transport.announce(&destination, None, now).expect("announce");
    pump(server, client, now);
    destination
}

#[test]
fn link_establishes_across_two_nodes() {
    let mut server = node("link-server", false);
    let mut client = node("link-client", false);
    let now = 1000.0;

    let destination = introduce(&mut server, &mut client, now);

    let link = client.transport.link_to(&destination, now).expect("link");
    settle(&mut client, &mut server, now + 0.1);

    assert_eq!(link.borrow().status(), LinkStatus::Active);
    assert!(link.borrow().rtt() > 0.0);

    let client_events = client.transport.drain_events();
    assert!(client_events
        .iter()
        .any(|event| matches!(event, TransportEvent::LinkEstablished { .. })));
    let server_events = server.transport.drain_events();
    assert!(server_events
        .iter()
        .any(|event| matches!(event, TransportEvent::LinkEstablished { .. })));
}

#[test]
fn link_data_is_delivered_and_acked() {
    let mut server = node("data-server", false);
    let mut client = node("data-client", false);
    let now = 1000.0;

    let destination = introduce(&mut server, &mut client, now);
    let link = client.transport.link_to(&destination, now).expect("link");
    settle(&mut client, &mut server, now + 0.1);
    server.transport.drain_events();

    let packet = link.borrow().data_packet(b"ping over link").expect("packet");
    client.transport.outbound(packet, SendOptions::default(), now + 1.0).expect("send");
    settle(&mut client, &mut server, now + 1.1);

    let events = server.transport.drain_events();
    assert!(events.iter().any(|event| matches!(
        event,
        TransportEvent::LinkData { payload, .. } if payload == b"ping over link"
    )));
}

#[test]
fn unanswered_link_request_times_out_and_requests_a_path() {
    let mut server = node("timeout-server", false);
    let mut client = node("timeout-client", false);
    let now = 1000.0;

    let destination = introduce(&mut server, &mut client, now);
    let link = client.transport.link_to(&destination, now).expect("link");

    // Swallow the link request; the server never sees it.
    client.outbox.borrow_mut().clear();

    // Establishment retries exhaust, then the pending link closes. The
    // retried link requests are swallowed each round; the frames left at
    // closure time are whatever the failure handling produced.
    let mut later = now;
    for _ in 0..32 {
        later += 7.0;
        client.transport.jobs(later);
        if link.borrow().status() == LinkStatus::Closed {
            break;
        }
        client.outbox.borrow_mut().clear();
    }
    assert_eq!(link.borrow().status(), LinkStatus::Closed);

    let path_request_destination = client.transport.path_request_destination();
    let frames: Vec<Vec<u8>> = client.outbox.borrow_mut().drain(..).collect();
    let requests: Vec<Packet> = frames
        .iter()
        .filter_map(|frame| Packet::from_bytes(frame).ok())
        .filter(|packet| packet.destination == path_request_destination)
        .collect();
    assert_eq!(requests.len(), 1);
    assert_eq!(&requests[0].data.as_slice()[..16], destination.as_slice());

    let events = client.transport.drain_events();
    assert!(events
        .iter()
        .any(|event| matches!(event, TransportEvent::LinkClosed { .. })));
}

#[test]
fn proved_delivery_settles_the_receipt() {
    let mut server = node("receipt-server", false);
    let mut client = node("receipt-client", false);
    let now = 1000.0;

    let destination = introduce(&mut server, &mut client, now);

    let packet_hash = client
        .transport
        .send_to_single(
            &destination,
            b"prove this payload",
            SendOptions { create_receipt: true },
            now,
        )
        .expect("send");
    settle(&mut client, &mut server, now + 0.2);

    let server_events = server.transport.drain_events();
    assert!(server_events.iter().any(|event| matches!(
        event,
        TransportEvent::PacketDelivered { data, .. } if data == b"prove this payload"
    )));

    let client_events = client.transport.drain_events();
    assert!(client_events.iter().any(|event| matches!(
        event,
        TransportEvent::ReceiptDelivered { packet_hash: proven, .. } if *proven == packet_hash
    )));
}

#[test]
fn resource_transfer_rides_a_transport_link() {
    let mut server = node("resource-server", false);
    let mut client = node("resource-client", false);
    let now = 1000.0;

    let destination = introduce(&mut server, &mut client, now);
    let link = client.transport.link_to(&destination, now).expect("link");
    settle(&mut client, &mut server, now + 0.1);
    let link_id = *link.borrow().id();

    let payload: Vec<u8> = (0..3000u32).map(|value| (value % 251) as u8).collect();
    client
        .transport
        .send_resource(&link_id, &payload, None, now + 1.0)
        .expect("resource");
    settle(&mut client, &mut server, now + 1.1);

    let server_events = server.transport.drain_events();
    let received = server_events
        .iter()
        .find_map(|event| match event {
            TransportEvent::Resource(resource_event) => match &resource_event.kind {
                rns_transport::resource::ResourceEventKind::Complete { data, .. } => {
                    Some(data.clone())
                }
                _ => None,
            },
            _ => None,
        })
        .expect("complete resource");
    assert_eq!(received, payload);

    let client_events = client.transport.drain_events();
    assert!(client_events.iter().any(|event| matches!(
        event,
        TransportEvent::Resource(resource_event)
            if matches!(resource_event.kind, rns_transport::resource::ResourceEventKind::OutboundComplete)
    )));
}

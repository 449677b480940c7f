mod common;

use std::cell::Cell;
use std::rc::Rc;

use rand_core::OsRng;

use rns_core::hash::AddressHash;
use rns_core::identity::PrivateIdentity;
use rns_transport::destination::{DestinationName, SingleInputDestination};
use rns_transport::iface::{InterfaceMode, InterfaceProperties};
use rns_transport::transport::config::{MemoryPressure, TransportConfig};
use rns_transport::transport::Transport;

use common::PipeDriver;

fn pressured_node(pressure: Rc<Cell<MemoryPressure>>) -> (Transport, AddressHash) {
    let mut config =
        TransportConfig::new("pressured", PrivateIdentity::new_from_name("pressured"));
    config.memory_pressure = Some(Box::new(move || pressure.get()));
    let mut transport = Transport::new(config);

    let iface = AddressHash::new_from_slice(b"iface-pressured");
    let outbox = Rc::new(std::cell::RefCell::new(Default::default()));
    transport
        .register_interface(
            InterfaceProperties::new(iface, 500, 1_000_000, InterfaceMode::Full),
            Box::new(PipeDriver::new(outbox)),
        )
        .expect("interface");
    (transport, iface)
}

fn feed_announces(transport: &mut Transport, iface: &AddressHash, count: usize, now: f64) {
    for index in 0..count {
        let mut destination = SingleInputDestination::new(
            PrivateIdentity::new_from_rand(OsRng),
            DestinationName::new("pressure", &format!("aspect.{}", index)),
        );
        let announce = destination.announce(OsRng, None).expect("announce");
        let frame = announce.to_bytes().expect("frame");
        transport.inbound(&frame, iface, now);
    }
}

#[test]
fn memory_pressure_sheds_paths_and_hashlist() {
    let pressure = Rc::new(Cell::new(MemoryPressure::Normal));
    let (mut transport, iface) = pressured_node(pressure.clone());
    let now = 1000.0;

    feed_announces(&mut transport, &iface, 20, now);
    assert_eq!(transport.path_count(), 20);

    // Normal pressure leaves the tables alone.
    transport.jobs(now + 1.0);
    assert_eq!(transport.path_count(), 20);

    pressure.set(MemoryPressure::Low);
    transport.jobs(now + 2.0);
    assert!(transport.path_count() <= 16);
    assert!(transport.hashlist_count() <= 30);

    pressure.set(MemoryPressure::Critical);
    transport.jobs(now + 3.0);
    assert!(transport.path_count() <= 8);
    assert!(transport.hashlist_count() <= 20);
}

#[test]
fn path_table_occupancy_never_exceeds_capacity() {
    let pressure = Rc::new(Cell::new(MemoryPressure::Normal));
    let (mut transport, iface) = pressured_node(pressure);
    let now = 1000.0;

    feed_announces(&mut transport, &iface, 40, now);
    assert!(transport.path_count() <= 32);
}

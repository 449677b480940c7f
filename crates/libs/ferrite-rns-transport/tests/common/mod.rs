#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rand_core::OsRng;

use rns_core::error::RnsError;
use rns_core::hash::AddressHash;
use rns_core::identity::PrivateIdentity;

use rns_transport::destination::{DestinationName, SingleInputDestination};
use rns_transport::iface::{InterfaceDriver, InterfaceMode, InterfaceProperties};
use rns_transport::transport::config::TransportConfig;
use rns_transport::transport::Transport;

pub type FrameQueue = Rc<RefCell<VecDeque<Vec<u8>>>>;

/// Driver that parks transmitted frames in a queue the test shuttles.
pub struct PipeDriver {
    outbox: FrameQueue,
}

impl PipeDriver {
    pub fn new(outbox: FrameQueue) -> Self {
        Self { outbox }
    }
}

impl InterfaceDriver for PipeDriver {
    fn send(&mut self, frame: &[u8]) -> Result<(), RnsError> {
        self.outbox.borrow_mut().push_back(frame.to_vec());
        Ok(())
    }
}

pub struct Node {
    pub transport: Transport,
    pub iface: AddressHash,
    pub outbox: FrameQueue,
}

pub fn node(name: &str, transport_enabled: bool) -> Node {
    let identity = PrivateIdentity::new_from_name(name);
    let config = TransportConfig::new(name, identity).with_transport(transport_enabled);
    let mut transport = Transport::new(config);

    let iface = AddressHash::new_from_slice(format!("iface-{}", name).as_bytes());
    let outbox: FrameQueue = Rc::new(RefCell::new(VecDeque::new()));
    let properties = InterfaceProperties::new(iface, 500, 1_000_000, InterfaceMode::Full);
    transport
        .register_interface(properties, Box::new(PipeDriver { outbox: outbox.clone() }))
        .expect("interface");

    Node { transport, iface, outbox }
}

/// Move every frame queued at `from` into `to`'s inbound pipeline.
pub fn pump(from: &Node, to: &mut Node, now: f64) -> usize {
    let mut moved = 0;
    loop {
        let frame = from.outbox.borrow_mut().pop_front();
        let Some(frame) = frame else {
            break;
        };
        let iface = to.iface;
        to.transport.inbound(&frame, &iface, now);
        moved += 1;
    }
    moved
}

/// Shuttle frames both ways until the network goes quiet.
pub fn settle(left: &mut Node, right: &mut Node, now: f64) {
    for _ in 0..64 {
        let moved = pump_pair(left, right, now);
        if moved == 0 {
            return;
        }
    }
    panic!("network did not settle");
}

fn pump_pair(left: &mut Node, right: &mut Node, now: f64) -> usize {
    let mut moved = 0;
    loop {
        let frame = left.outbox.borrow_mut().pop_front();
        let Some(frame) = frame else {
            break;
        };
        let iface = right.iface;
        right.transport.inbound(&frame, &iface, now);
        moved += 1;
    }
    loop {
        let frame = right.outbox.borrow_mut().pop_front();
        let Some(frame) = frame else {
            break;
        };
        let iface = left.iface;
        left.transport.inbound(&frame, &iface, now);
        moved += 1;
    }
    moved
}

pub fn registered_destination(
    node: &mut Node,
    app_name: &str,
    aspects: &str,
) -> (AddressHash, Rc<RefCell<SingleInputDestination>>) {
    let destination = SingleInputDestination::new(
        PrivateIdentity::new_from_rand(OsRng),
        DestinationName::new(app_name, aspects),
    );
    let hash = destination.desc.address_hash;
    let shared = node.transport.register_destination(destination).expect("destination");
    (hash, shared)
}

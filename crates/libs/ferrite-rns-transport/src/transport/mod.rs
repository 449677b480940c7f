pub mod announce_limits;
pub mod announce_table;
pub mod config;
pub mod hashlist;
pub mod link_table;
pub mod packet_cache;
pub mod path_requests;
pub mod path_table;
pub mod persist;
pub mod pool;
pub mod tunnels;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rand_core::OsRng;

use rns_core::error::RnsError;
use rns_core::hash::{AddressHash, Hash};
use rns_core::identity::Identity;
use rns_core::ratchets::RatchetStore;

use crate::destination::link::{Link, LinkEvent, LinkId, LinkStatus, TeardownReason};
use crate::destination::{
    self, emission_timestamp, validate_announce, DestinationDesc, DestinationName, ProofStrategy,
    SingleInputDestination, NAME_HASH_LENGTH, RATCHET_LENGTH,
};
use crate::iface::{InterfaceDriver, InterfaceProperties, InterfaceRegistry};
use crate::packet::{
    DestinationType, HeaderType, Packet, PacketContext, PacketType, PropagationType, MAX_HOPS,
};
use crate::receipt::{PacketReceipt, ReceiptStatus, ReceiptTable};
use crate::resource::{ResourceAction, ResourceEvent, ResourceManager};
use crate::storage::Storage;

use announce_limits::{AnnounceRates, RatePolicy};
use announce_table::{AnnounceEntry, AnnounceTable, TxStrategy};
use config::{
    MemoryPressure, TransportConfig, ANNOUNCES_CHECK_INTERVAL, CRITICAL_MEM_HASHLIST_TARGET,
    CRITICAL_MEM_PATH_TARGET, LINKS_CHECK_INTERVAL, LINK_TIMEOUT, LOW_MEM_HASHLIST_TARGET,
    LOW_MEM_PATH_TARGET, MAX_ACTIVE_LINKS, MAX_ANNOUNCE_HANDLERS, MAX_DESTINATIONS,
    MAX_DISCOVERY_PATH_REQUESTS, MAX_DISCOVERY_TAGS, MAX_KNOWN_DESTINATIONS,
    MAX_LOCAL_CLIENT_INTERFACES, MAX_LOCAL_PATH_REQUESTS, MAX_PATH_REQUEST_THROTTLE,
    MAX_PENDING_LINKS, RECEIPTS_CHECK_INTERVAL, TABLES_CULL_INTERVAL,
};
use hashlist::PacketHashlist;
use link_table::{LinkTable, ReverseTable};
use packet_cache::PacketCache;
use path_requests::PathRequests;
use path_table::{PathTable, PathUpdate};
use pool::FixedTable;

/// A remembered remote identity, recorded from validated announces.
pub struct KnownDestination {
    pub identity: Identity,
    pub name_hash: [u8; NAME_HASH_LENGTH],
    pub app_data: Vec<u8>,
    pub packet_hash: Hash,
    pub timestamp: f64,
}

/// Announce handler registration; `None` filter matches every aspect.
pub struct AnnounceHandler {
    pub name_filter: Option<[u8; NAME_HASH_LENGTH]>,
    pub callback: Box<dyn FnMut(&AddressHash, &Identity, &[u8])>,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    AnnounceReceived {
        destination: AddressHash,
        hops: u8,
        app_data: Vec<u8>,
        iface: AddressHash,
    },
    PacketDelivered {
        destination: AddressHash,
        data: Vec<u8>,
        context: PacketContext,
        ratchet_used: bool,
    },
    LinkEstablished {
        link_id: LinkId,
        destination: AddressHash,
    },
    LinkClosed {
        link_id: LinkId,
        reason: TeardownReason,
    },
    LinkData {
        link_id: LinkId,
        context: PacketContext,
        payload: Vec<u8>,
    },
    ReceiptDelivered {
        packet_hash: Hash,
        rtt: f64,
    },
    ReceiptFailed {
        packet_hash: Hash,
    },
    Resource(ResourceEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    SentDirect,
    SentBroadcast,
    QueuedForAnnounceCap,
    Deferred,
    NoRoute,
}

/// Options for [`Transport::outbound`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub create_receipt: bool,
}

struct JobTimers {
    links: f64,
    receipts: f64,
    announces: f64,
    cull: f64,
}

/// How an inbound packet relates to the local clients hanging off a
/// shared instance. Packets serving a local client get full transport
/// handling even when this node is not a transport node.
#[derive(Debug, Clone, Copy, Default)]
struct LocalClientClass {
    from_local_client: bool,
    for_local_client: bool,
    for_local_client_link: bool,
    proof_for_local_client: bool,
}

impl LocalClientClass {
    fn serves_local_client(&self) -> bool {
        self.from_local_client
            || self.for_local_client
            || self.for_local_client_link
            || self.proof_for_local_client
    }
}

/// The routing core. Owns every table, all registered interfaces and
/// destinations, links in both roles, and the resource manager. Strictly
/// single-threaded: one external driver pumps [`Transport::inbound`] and
/// [`Transport::jobs`].
pub struct Transport {
    config: TransportConfig,
    interfaces: InterfaceRegistry,
    local_client_interfaces: FixedTable<AddressHash, ()>,
    destinations: FixedTable<AddressHash, Rc<RefCell<SingleInputDestination>>>,
    known_destinations: FixedTable<AddressHash, KnownDestination>,
    path_table: PathTable,
    announce_table: AnnounceTable,
    announce_rates: AnnounceRates,
    link_table: LinkTable,
    reverse_table: ReverseTable,
    tunnels: tunnels::TunnelTable,
    hashlist: PacketHashlist,
    path_requests: PathRequests,
    receipts: ReceiptTable,
    pending_links: Vec<Rc<RefCell<Link>>>,
    active_links: Vec<Rc<RefCell<Link>>>,
    resources: ResourceManager,
    announce_handlers: Vec<AnnounceHandler>,
    control_hashes: FixedTable<AddressHash, ()>,
    storage: Option<Box<dyn Storage>>,
    ratchet_store: Option<RatchetStore>,
    packet_filter: Option<Box<dyn FnMut(&Packet) -> bool>>,
    proof_requested_callback: Option<Box<dyn FnMut(&AddressHash, &Packet) -> bool>>,
    events: VecDeque<TransportEvent>,
    jobs_locked: bool,
    deferred_outbound: VecDeque<(Packet, SendOptions)>,
    timers: JobTimers,
    packets_received: u64,
    packets_sent: u64,
    paths_crc: Option<u32>,
    tunnels_crc: Option<u32>,
    hashlist_crc: Option<u32>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let capacities = config.capacities;
        let transport_id =
            if config.transport_enabled { Some(*config.identity.address_hash()) } else { None };
        let path_requests = PathRequests::new(
            transport_id,
            MAX_DISCOVERY_TAGS,
            MAX_DISCOVERY_PATH_REQUESTS,
            MAX_PATH_REQUEST_THROTTLE,
            MAX_LOCAL_PATH_REQUESTS,
        );

        let mut control_hashes = FixedTable::new(config::MAX_CONTROL_HASHES);
        let _ = control_hashes.insert(path_requests.control_destination_hash(), ());

        Self {
            config,
            interfaces: InterfaceRegistry::new(),
            local_client_interfaces: FixedTable::new(MAX_LOCAL_CLIENT_INTERFACES),
            destinations: FixedTable::new(MAX_DESTINATIONS),
            known_destinations: FixedTable::new(MAX_KNOWN_DESTINATIONS),
            path_table: PathTable::new(capacities.paths),
            announce_table: AnnounceTable::new(capacities.announces, capacities.held_announces),
            announce_rates: AnnounceRates::new(config::MAX_ANNOUNCE_RATE_ENTRIES),
            link_table: LinkTable::new(capacities.links, LINK_TIMEOUT),
            reverse_table: ReverseTable::new(capacities.reverse),
            tunnels: tunnels::TunnelTable::new(capacities.tunnels),
            hashlist: PacketHashlist::new(capacities.hashlist),
            path_requests,
            receipts: ReceiptTable::new(capacities.receipts),
            pending_links: Vec::new(),
            active_links: Vec::new(),
            resources: ResourceManager::new(),
            announce_handlers: Vec::new(),
            control_hashes,
            storage: None,
            ratchet_store: None,
            packet_filter: None,
            proof_requested_callback: None,
            events: VecDeque::new(),
            jobs_locked: false,
            deferred_outbound: VecDeque::new(),
            timers: JobTimers { links: 0.0, receipts: 0.0, announces: 0.0, cull: 0.0 },
            packets_received: 0,
            packets_sent: 0,
            paths_crc: None,
            tunnels_crc: None,
            hashlist_crc: None,
        }
    }

    pub fn identity_hash(&self) -> AddressHash {
        *self.config.identity.address_hash()
    }

    pub fn set_packet_filter(&mut self, filter: Box<dyn FnMut(&Packet) -> bool>) {
        self.packet_filter = Some(filter);
    }

    pub fn set_proof_requested_callback(
        &mut self,
        callback: Box<dyn FnMut(&AddressHash, &Packet) -> bool>,
    ) {
        self.proof_requested_callback = Some(callback);
    }

    pub fn set_ratchet_store(&mut self, store: RatchetStore) {
        self.ratchet_store = Some(store);
    }

    /// Attach persistent storage and restore saved state. Invalid
    /// persisted entries are skipped with a warning; the announce cache is
    /// swept of files no restored path refers to.
    pub fn attach_storage(&mut self, storage: Box<dyn Storage>, now: f64) {
        self.storage = Some(storage);
        let Some(storage) = self.storage.as_deref() else {
            return;
        };

        persist::load_tunnels(storage, &mut self.tunnels);
        persist::load_hashlist(storage, &mut self.hashlist);

        let interfaces = &self.interfaces;
        let restored = persist::load_paths(
            storage,
            |iface| interfaces.contains(iface),
            |hash| PacketCache::contains(storage, hash),
        );
        for (destination, entry) in restored {
            if entry.expires > now {
                self.path_table.restore(destination, entry);
            }
        }

        let referenced: Vec<Hash> =
            self.path_table.iter().map(|(_, entry)| entry.packet_hash).collect();
        if let Some(storage) = self.storage.as_deref_mut() {
            PacketCache::clean(storage, |hash| referenced.contains(hash));
        }
    }

    pub fn register_interface(
        &mut self,
        properties: InterfaceProperties,
        driver: Box<dyn InterfaceDriver>,
    ) -> Result<AddressHash, RnsError> {
        let is_local_client = properties.is_local_shared_instance;
        let hash = self.interfaces.register(properties, driver)?;
        if is_local_client && self.local_client_interfaces.insert(hash, ()).is_err() {
            log::warn!("{}: local-client interface table full", self.config.name);
            self.interfaces.remove(&hash);
            return Err(RnsError::TableFull);
        }
        Ok(hash)
    }

    pub fn remove_interface(&mut self, hash: &AddressHash) {
        if self.interfaces.remove(hash) {
            self.local_client_interfaces.remove(hash);
            self.tunnels.detach_interface(hash);
        }
    }

    pub fn is_local_client_interface(&self, hash: &AddressHash) -> bool {
        self.local_client_interfaces.contains_key(hash)
    }

    pub fn register_tunnel(&mut self, tunnel_id: AddressHash, iface: AddressHash, now: f64) {
        self.tunnels.register(tunnel_id, iface, now);
    }

    /// Registering the same destination hash twice is a caller bug and is
    /// reported as an error immediately.
    pub fn register_destination(
        &mut self,
        destination: SingleInputDestination,
    ) -> Result<Rc<RefCell<SingleInputDestination>>, RnsError> {
        let hash = destination.desc.address_hash;
        if self.destinations.contains_key(&hash) {
            return Err(RnsError::InvalidArgument);
        }
        let shared = Rc::new(RefCell::new(destination));
        self.destinations
            .insert(hash, shared.clone())
            .map_err(|_| RnsError::TableFull)?;
        Ok(shared)
    }

    pub fn register_announce_handler(&mut self, handler: AnnounceHandler) -> Result<(), RnsError> {
        if self.announce_handlers.len() >= MAX_ANNOUNCE_HANDLERS {
            return Err(RnsError::TableFull);
        }
        self.announce_handlers.push(handler);
        Ok(())
    }

    pub fn drain_events(&mut self) -> Vec<TransportEvent> {
        self.events.drain(..).collect()
    }

    pub fn has_path(&self, destination: &AddressHash, now: f64) -> bool {
        self.path_table.has_path(destination, now)
    }

    pub fn hops_to(&self, destination: &AddressHash) -> Option<u8> {
        self.path_table.hops_to(destination)
    }

    /// Identity knowledge, the `recall` side of the identity contract.
    pub fn recall(&self, destination: &AddressHash) -> Option<Identity> {
        self.known_destinations.get(destination).map(|known| known.identity)
    }

    pub fn recall_app_data(&self, destination: &AddressHash) -> Option<Vec<u8>> {
        self.known_destinations.get(destination).map(|known| known.app_data.clone())
    }

    fn remember(
        &mut self,
        destination: AddressHash,
        identity: Identity,
        name_hash: [u8; NAME_HASH_LENGTH],
        app_data: &[u8],
        packet_hash: Hash,
        now: f64,
    ) {
        let known = KnownDestination {
            identity,
            name_hash,
            app_data: app_data.to_vec(),
            packet_hash,
            timestamp: now,
        };
        self.known_destinations.insert_or_evict_oldest(destination, known, |held| held.timestamp);
    }

    //***********************************************************************//
    // Outbound
    //***********************************************************************//

    pub fn announce(
        &mut self,
        destination: &AddressHash,
        app_data: Option<&[u8]>,
        now: f64,
    ) -> Result<(), RnsError> {
        let Some(shared) = self.destinations.get(destination).cloned() else {
            return Err(RnsError::InvalidArgument);
        };
        let packet = shared.borrow_mut().announce(OsRng, app_data)?;
        self.outbound(packet, SendOptions::default(), now).map(|_| ())
    }

    /// Encrypt and send a payload to a remembered SINGLE destination.
    pub fn send_to_single(
        &mut self,
        destination: &AddressHash,
        payload: &[u8],
        options: SendOptions,
        now: f64,
    ) -> Result<Hash, RnsError> {
        let Some(known) = self.known_destinations.get(destination) else {
            return Err(RnsError::InvalidArgument);
        };
        let identity = known.identity;
        let name = DestinationName::new_from_hash_slice(&known.name_hash);

        let out_destination = destination::SingleOutputDestination::new(identity, name);
        let ratchet: Option<[u8; RATCHET_LENGTH]> =
            self.ratchet_store.as_mut().and_then(|store| store.get(destination));
        let ciphertext = out_destination.encrypt(payload, ratchet, OsRng)?;

        let packet = Packet {
            destination: *destination,
            data: rns_core::buffer::ByteBuf::from_slice(&ciphertext),
            ..Default::default()
        };
        let packet_hash = packet.hash();
        self.outbound(packet, options, now)?;
        Ok(packet_hash)
    }

    pub fn outbound(
        &mut self,
        packet: Packet,
        options: SendOptions,
        now: f64,
    ) -> Result<SendOutcome, RnsError> {
        if packet.destination.is_empty() {
            return Err(RnsError::InvalidArgument);
        }

        // Re-entrant sends from callbacks wait for the running sweep; the
        // queue drains when the guard is released.
        if self.jobs_locked {
            self.deferred_outbound.push_back((packet, options));
            return Ok(SendOutcome::Deferred);
        }

        self.outbound_now(packet, options, now)
    }

    fn outbound_now(
        &mut self,
        packet: Packet,
        options: SendOptions,
        now: f64,
    ) -> Result<SendOutcome, RnsError> {
        if options.create_receipt && receipt_qualifies(&packet) {
            let hops = self.path_table.hops_to(&packet.destination).unwrap_or(1);
            self.receipts.add(PacketReceipt::new(&packet, hops, now));
        }

        self.hashlist.insert(packet.hash());
        self.cache_if_cacheable(&packet);

        let (mut rewritten, direct_iface) = self.path_table.rewrite_outbound(&packet);
        if let Some(iface) = direct_iface {
            // A single-hop path reached through a shared instance still
            // needs the transport header, or the instance drops instead
            // of forwarding.
            if rewritten.header.header_type == HeaderType::Type1 {
                let behind_shared_instance = self
                    .interfaces
                    .get(&iface)
                    .map(|registered| registered.properties.is_connected_to_shared_instance)
                    .unwrap_or(false);
                if behind_shared_instance {
                    if let Some(next_hop) = self.path_table.next_hop(&packet.destination) {
                        rewritten.header.header_type = HeaderType::Type2;
                        rewritten.header.propagation_type = PropagationType::Transport;
                        rewritten.transport = Some(next_hop);
                    }
                }
            }
            self.transmit(&iface, &rewritten);
            return Ok(SendOutcome::SentDirect);
        }

        if packet.header.packet_type == PacketType::Announce {
            return Ok(self.broadcast_announce(packet, now));
        }

        let sent = self.broadcast(&packet, None, None);
        if sent > 0 {
            Ok(SendOutcome::SentBroadcast)
        } else {
            log::trace!("{}: no route for {}", self.config.name, packet.destination);
            Ok(SendOutcome::NoRoute)
        }
    }

    /// Announces respect each interface's announce cap; capped interfaces
    /// queue the newest copy per destination.
    fn broadcast_announce(&mut self, packet: Packet, now: f64) -> SendOutcome {
        let emitted = announce_emission(&packet).unwrap_or(0);
        let frame = match packet.to_bytes() {
            Ok(frame) => frame,
            Err(_) => return SendOutcome::NoRoute,
        };

        let mut sent = 0usize;
        let mut queued = 0usize;
        for iface in self.interfaces.iter_mut() {
            if !iface.properties.out_enabled {
                continue;
            }
            if iface.consume_announce_budget(frame.len(), now) {
                if iface.transmit(&frame).is_ok() {
                    sent += 1;
                }
            } else if iface.queue_announce(packet.destination, emitted, packet.clone()).is_ok() {
                queued += 1;
            }
        }
        self.packets_sent += sent as u64;

        if sent > 0 {
            SendOutcome::SentBroadcast
        } else if queued > 0 {
            SendOutcome::QueuedForAnnounceCap
        } else {
            SendOutcome::NoRoute
        }
    }

    fn broadcast(
        &mut self,
        packet: &Packet,
        exclude: Option<AddressHash>,
        from_mode: Option<crate::iface::InterfaceMode>,
    ) -> usize {
        let frame = match packet.to_bytes() {
            Ok(frame) => frame,
            Err(_) => return 0,
        };

        let mut sent = 0usize;
        for iface in self.interfaces.iter_mut() {
            if !iface.properties.out_enabled {
                continue;
            }
            if Some(iface.hash()) == exclude {
                continue;
            }
            // Roaming-class traffic does not flow between two
            // roaming-class interfaces.
            if let Some(from_mode) = from_mode {
                if from_mode.is_roaming_class() && iface.properties.mode.is_roaming_class() {
                    continue;
                }
            }
            if iface.transmit(&frame).is_ok() {
                sent += 1;
            }
        }
        self.packets_sent += sent as u64;
        sent
    }

    /// Broadcast restricted to the local-client interfaces.
    fn broadcast_to_local_clients(&mut self, packet: &Packet, exclude: Option<AddressHash>) -> usize {
        let Ok(frame) = packet.to_bytes() else {
            return 0;
        };

        let mut sent = 0usize;
        let local_clients = &self.local_client_interfaces;
        for iface in self.interfaces.iter_mut() {
            if !iface.properties.out_enabled {
                continue;
            }
            if Some(iface.hash()) == exclude {
                continue;
            }
            if !local_clients.contains_key(&iface.hash()) {
                continue;
            }
            if iface.transmit(&frame).is_ok() {
                sent += 1;
            }
        }
        self.packets_sent += sent as u64;
        sent
    }

    fn transmit(&mut self, iface_hash: &AddressHash, packet: &Packet) {
        let Ok(frame) = packet.to_bytes() else {
            return;
        };
        let Some(iface) = self.interfaces.get_mut(iface_hash) else {
            log::debug!("{}: transmit on unknown interface {}", self.config.name, iface_hash);
            return;
        };
        if iface.transmit(&frame).is_ok() {
            self.packets_sent += 1;
        }
    }

    fn cache_if_cacheable(&mut self, packet: &Packet) {
        if !packet.is_cacheable() {
            return;
        }
        if let Some(storage) = self.storage.as_deref_mut() {
            if let Err(err) = PacketCache::store(storage, packet) {
                log::warn!("{}: packet cache write failed: {}", self.config.name, err);
            }
        }
    }

    //***********************************************************************//
    // Links
    //***********************************************************************//

    /// Open a link toward a remembered destination. The request goes out
    /// immediately; activation is reported through the event queue.
    pub fn link_to(
        &mut self,
        destination: &AddressHash,
        now: f64,
    ) -> Result<Rc<RefCell<Link>>, RnsError> {
        if self.pending_links.len() >= MAX_PENDING_LINKS {
            return Err(RnsError::TableFull);
        }
        let Some(known) = self.known_destinations.get(destination) else {
            return Err(RnsError::InvalidArgument);
        };

        let desc = DestinationDesc {
            identity: known.identity,
            address_hash: *destination,
            name: DestinationName::new_from_hash_slice(&known.name_hash),
        };
        let hops = self.path_table.hops_to(destination).unwrap_or(1);

        let mut link = Link::new(desc, hops, now);
        let request = link.request(now);
        let shared = Rc::new(RefCell::new(link));
        self.pending_links.push(shared.clone());

        self.outbound(request, SendOptions::default(), now)?;
        Ok(shared)
    }

    pub fn find_link(&self, link_id: &LinkId) -> Option<Rc<RefCell<Link>>> {
        self.active_links
            .iter()
            .chain(self.pending_links.iter())
            .find(|link| link.borrow().id() == link_id)
            .cloned()
    }

    /// Start a resource transfer on an active link.
    pub fn send_resource(
        &mut self,
        link_id: &LinkId,
        data: &[u8],
        metadata: Option<&[u8]>,
        now: f64,
    ) -> Result<Hash, RnsError> {
        let Some(link) = self.find_link(link_id) else {
            return Err(RnsError::InvalidArgument);
        };
        let (hash, packet) = {
            let link = link.borrow();
            if link.status() != LinkStatus::Active {
                return Err(RnsError::InvalidArgument);
            }
            self.resources.start_send(&link, data, metadata, now)?
        };
        self.outbound(packet, SendOptions::default(), now)?;
        Ok(hash)
    }

    fn drain_link_events(&mut self, link: &Rc<RefCell<Link>>) {
        let events = link.borrow_mut().take_events();
        for event in events {
            match event.event {
                LinkEvent::Activated => {
                    self.events.push_back(TransportEvent::LinkEstablished {
                        link_id: event.id,
                        destination: event.destination,
                    });
                }
                LinkEvent::Closed { reason } => {
                    self.resources.drop_link(&event.id);
                    self.events
                        .push_back(TransportEvent::LinkClosed { link_id: event.id, reason });
                }
                LinkEvent::Data { context, payload } => {
                    self.events.push_back(TransportEvent::LinkData {
                        link_id: event.id,
                        context,
                        payload,
                    });
                }
            }
        }
    }

    //***********************************************************************//
    // Inbound
    //***********************************************************************//

    pub fn inbound(&mut self, raw: &[u8], iface_hash: &AddressHash, now: f64) {
        self.packets_received += 1;
        self.jobs_locked = true;
        self.inbound_locked(raw, iface_hash, now);
        self.jobs_locked = false;
        self.flush_deferred(now);
    }

    fn inbound_locked(&mut self, raw: &[u8], iface_hash: &AddressHash, now: f64) {
        let Some(iface) = self.interfaces.get(iface_hash) else {
            log::debug!("{}: inbound from unknown interface", self.config.name);
            return;
        };
        let iface_mode = iface.properties.mode;
        let is_local_shared = iface.properties.is_local_shared_instance;
        let rate_policy = iface.properties.announce_rate_target.map(|target| RatePolicy {
            target,
            grace: iface.properties.announce_rate_grace,
            penalty: iface.properties.announce_rate_penalty,
        });

        // Interfaces with an access code unmask and authenticate first.
        let unmasked;
        let raw = match &iface.properties.ifac {
            Some(ifac) => match ifac.unmask(raw) {
                Ok(frame) => {
                    unmasked = frame;
                    unmasked.as_slice()
                }
                Err(_) => {
                    log::debug!("{}: dropping frame failing IFAC", self.config.name);
                    return;
                }
            },
            None => raw,
        };

        let mut packet = match Packet::from_bytes(raw) {
            Ok(packet) => packet,
            Err(_) => {
                log::debug!("{}: dropping malformed packet", self.config.name);
                return;
            }
        };

        packet.header.hops = packet.header.hops.saturating_add(1);
        // A local shared-instance proxy is transparent hop-wise.
        if is_local_shared {
            packet.header.hops = packet.header.hops.saturating_sub(1);
        }

        if let Some(filter) = self.packet_filter.as_mut() {
            if !filter(&packet) {
                return;
            }
        }

        if !self.filter_packet(&packet, now) {
            return;
        }

        self.hashlist.insert(packet.hash());
        self.cache_if_cacheable(&packet);

        let class = self.classify_local_client(&packet, iface_hash);

        // Local broadcast traffic (except control destinations): from a
        // local client it floods to every other interface; from anywhere
        // else only the local clients get a copy.
        if packet.header.destination_type == DestinationType::Plain
            && packet.header.propagation_type == PropagationType::Broadcast
            && !self.control_hashes.contains_key(&packet.destination)
        {
            if class.from_local_client {
                self.broadcast(&packet, Some(*iface_hash), Some(iface_mode));
            } else {
                self.broadcast_to_local_clients(&packet, Some(*iface_hash));
            }
        }

        if self.config.transport_enabled || class.serves_local_client() {
            self.transport_packet(&packet, iface_hash, now);
        }

        match packet.header.packet_type {
            PacketType::Announce => {
                self.handle_announce(&packet, iface_hash, iface_mode, rate_policy, now);
            }
            PacketType::LinkRequest => self.handle_link_request(&packet, iface_hash, now),
            PacketType::Data => self.handle_data(&packet, iface_hash, now),
            PacketType::Proof => self.handle_proof(&packet, iface_hash, now),
        }
    }

    /// Classify a packet against the local-client interface table: where
    /// it came from, and whether a local client is the party it serves. A
    /// destination announced by a local client sits in the path table at
    /// zero hops.
    fn classify_local_client(&self, packet: &Packet, iface_hash: &AddressHash) -> LocalClientClass {
        if self.local_client_interfaces.is_empty() {
            return LocalClientClass::default();
        }

        let from_local_client = self.local_client_interfaces.contains_key(iface_hash);

        let for_local_client = packet.header.destination_type != DestinationType::Link
            && self
                .path_table
                .get(&packet.destination)
                .map(|entry| entry.hops == 0)
                .unwrap_or(false);

        let for_local_client_link = packet.header.destination_type == DestinationType::Link
            && self
                .link_table
                .get(&packet.destination)
                .map(|entry| {
                    self.local_client_interfaces.contains_key(&entry.received_on)
                        || self.local_client_interfaces.contains_key(&entry.next_hop_iface)
                })
                .unwrap_or(false);

        let proof_for_local_client = packet.header.packet_type == PacketType::Proof
            && self
                .reverse_table
                .get(&packet.destination)
                .map(|entry| self.local_client_interfaces.contains_key(&entry.received_on))
                .unwrap_or(false);

        LocalClientClass {
            from_local_client,
            for_local_client,
            for_local_client_link,
            proof_for_local_client,
        }
    }

    /// Built-in duplicate and validity filter. Keepalives, resource
    /// traffic, cache requests, channel data and announces pass even when
    /// recently seen, because repeated copies carry meaning for them.
    fn filter_packet(&self, packet: &Packet, _now: f64) -> bool {
        if packet.header.hops > MAX_HOPS {
            return false;
        }

        if (packet.header.destination_type == DestinationType::Plain
            || packet.header.destination_type == DestinationType::Group)
            && packet.header.hops > 1
            && !self.control_hashes.contains_key(&packet.destination)
        {
            log::debug!("{}: dropping over-traveled plain/group packet", self.config.name);
            return false;
        }

        let exempt = match packet.header.packet_type {
            PacketType::Announce => packet.header.destination_type == DestinationType::Single,
            PacketType::LinkRequest => true,
            PacketType::Data => {
                packet.context == PacketContext::KeepAlive
                    || packet.context == PacketContext::Channel
                    || packet.context == PacketContext::CacheRequest
                    || packet.context.is_resource()
            }
            PacketType::Proof => {
                packet.context == PacketContext::LinkRequestProof
                    && self
                        .pending_links
                        .iter()
                        .any(|link| link.borrow().status().not_yet_active())
            }
        };

        if exempt {
            return true;
        }

        !self.hashlist.contains(&packet.hash())
    }

    /// General transport handling: forwarding for other nodes.
    fn transport_packet(&mut self, packet: &Packet, iface_hash: &AddressHash, now: f64) {
        // Packets explicitly addressed through us as transport.
        if packet.header.header_type == HeaderType::Type2
            && packet.transport == Some(self.identity_hash())
        {
            self.forward_for_transport(packet, iface_hash, now);
            return;
        }

        // Link-addressed traffic through an in-transit link entry.
        if packet.header.destination_type == DestinationType::Link {
            if packet.header.packet_type == PacketType::Proof
                && packet.context == PacketContext::LinkRequestProof
            {
                if let Some((forwarded, back_iface)) = self.link_table.handle_proof(packet, now) {
                    self.transmit(&back_iface, &forwarded);
                }
                return;
            }
            if self.link_table.get(&packet.destination).is_some()
                && self.find_link(&packet.destination).is_none()
            {
                let arrived_from_initiator = self
                    .link_table
                    .get(&packet.destination)
                    .map(|entry| entry.received_on == *iface_hash)
                    .unwrap_or(false);
                let forwarded = if arrived_from_initiator {
                    self.link_table.forward_toward_destination(packet, now)
                } else {
                    self.link_table.forward_toward_initiator(packet, now)
                };
                if let Some((forwarded, iface)) = forwarded {
                    self.transmit(&iface, &forwarded);
                }
            }
        }
    }

    fn forward_for_transport(&mut self, packet: &Packet, iface_hash: &AddressHash, now: f64) {
        if self.destinations.contains_key(&packet.destination) {
            // Addressed through us to us; local dispatch handles it.
            return;
        }

        let Some(entry_hops) = self.path_table.hops_to(&packet.destination) else {
            return;
        };
        let Some(next_hop) = self.path_table.next_hop(&packet.destination) else {
            return;
        };
        let Some(out_iface) = self.path_table.next_hop_interface(&packet.destination) else {
            return;
        };

        let mut forwarded = packet.clone();
        forwarded.header.hops = packet.header.hops;
        if entry_hops <= 1 {
            // Last hop: strip the transport header.
            forwarded.header.header_type = HeaderType::Type1;
            forwarded.transport = None;
            forwarded.header.propagation_type = PropagationType::Broadcast;
        } else {
            forwarded.header.header_type = HeaderType::Type2;
            forwarded.transport = Some(next_hop);
            forwarded.header.propagation_type = PropagationType::Transport;
        }

        // Leave a breadcrumb so the proof finds its way back.
        if packet.header.packet_type != PacketType::Announce {
            self.reverse_table.add(packet.truncated_hash(), *iface_hash, out_iface, now);
        }
        if packet.header.packet_type == PacketType::LinkRequest {
            self.link_table.add(
                crate::destination::link::link_id_from_request(packet),
                packet.destination,
                *iface_hash,
                next_hop,
                out_iface,
                packet.header.hops,
                now,
            );
        }

        self.transmit(&out_iface, &forwarded);
    }

    fn handle_announce(
        &mut self,
        packet: &Packet,
        iface_hash: &AddressHash,
        iface_mode: crate::iface::InterfaceMode,
        rate_policy: Option<RatePolicy>,
        now: f64,
    ) {
        if !self.announce_rates.check(&packet.destination, rate_policy, now) {
            return;
        }

        let info = match validate_announce(packet) {
            Ok(info) => info,
            Err(err) => {
                log::debug!("{}: invalid announce: {}", self.config.name, err);
                return;
            }
        };
        let emitted = info.emitted();
        let random_blob = info.random_blob;
        let identity = info.identity;
        let name_hash = info.name_hash;
        let app_data = info.app_data.to_vec();
        let ratchet = info.ratchet;

        if let (Some(store), Some(ratchet)) = (self.ratchet_store.as_mut(), ratchet) {
            if let Err(err) = store.remember(&packet.destination, ratchet) {
                log::warn!("{}: ratchet store write failed: {}", self.config.name, err);
            }
        }

        self.remember(packet.destination, identity, name_hash, &app_data, packet.hash(), now);

        let received_from = packet.transport.unwrap_or(packet.destination);
        let update = self.path_table.handle_announce(
            packet,
            packet.header.hops,
            emitted,
            random_blob,
            received_from,
            *iface_hash,
            iface_mode,
            now,
        );

        // Schedule a rebroadcast for fresh paths; access points never
        // rebroadcast what they hear.
        if self.config.transport_enabled
            && update == PathUpdate::Recorded
            && iface_mode != crate::iface::InterfaceMode::AccessPoint
            && !self.destinations.contains_key(&packet.destination)
        {
            let mut entry = AnnounceEntry::new(
                strip_transport_header(packet),
                *iface_hash,
                packet.header.hops,
                emitted,
                now,
            );
            if self.path_requests.discovery_pending(&packet.destination, now) {
                entry.block_rebroadcasts = true;
                self.path_requests.end_discovery(&packet.destination);
            }
            self.announce_table.add(packet.destination, entry);
        }

        // Replays and worse paths stop here: handlers and events only see
        // announces that changed what we know.
        if update != PathUpdate::Recorded {
            return;
        }

        if packet.context != PacketContext::PathResponse {
            for handler in self.announce_handlers.iter_mut() {
                let matches = match handler.name_filter {
                    Some(filter) => filter == name_hash,
                    None => true,
                };
                if matches {
                    (handler.callback)(&packet.destination, &identity, &app_data);
                }
            }
        }

        self.events.push_back(TransportEvent::AnnounceReceived {
            destination: packet.destination,
            hops: packet.header.hops,
            app_data,
            iface: *iface_hash,
        });
    }

    fn handle_link_request(&mut self, packet: &Packet, iface_hash: &AddressHash, now: f64) {
        let Some(shared) = self.destinations.get(&packet.destination).cloned() else {
            return;
        };
        let destination = shared.borrow();
        if !destination.accepts_links {
            log::debug!("{}: destination does not accept links", self.config.name);
            return;
        }
        if self.active_links.len() >= MAX_ACTIVE_LINKS {
            log::warn!("{}: active link table full", self.config.name);
            return;
        }

        let signing_key = destination.identity.sign_key().clone();
        let desc = destination.desc;
        drop(destination);

        match Link::new_from_request(packet, signing_key, desc, now) {
            Ok((mut link, proof)) => {
                link.set_outbound_interface(Some(*iface_hash));
                let shared_link = Rc::new(RefCell::new(link));
                self.active_links.push(shared_link.clone());
                self.drain_link_events(&shared_link);
                self.transmit(iface_hash, &proof);
            }
            Err(err) => {
                log::debug!("{}: rejected link request: {}", self.config.name, err);
            }
        }
    }

    fn handle_data(&mut self, packet: &Packet, iface_hash: &AddressHash, now: f64) {
        match packet.header.destination_type {
            DestinationType::Link => self.handle_link_data(packet, now),
            DestinationType::Plain => {
                if packet.destination == self.path_requests.control_destination_hash() {
                    self.handle_path_request(packet, iface_hash, now);
                }
            }
            DestinationType::Single | DestinationType::Group => {
                if packet.context == PacketContext::CacheRequest {
                    self.handle_cache_request(packet, iface_hash);
                    return;
                }
                self.deliver_local(packet, now);
            }
        }
    }

    fn handle_link_data(&mut self, packet: &Packet, now: f64) {
        let Some(link) = self.find_link(&packet.destination) else {
            return;
        };

        let responses = if packet.context.is_resource() {
            let mut link_ref = link.borrow_mut();
            self.resources.handle_packet(packet, &mut link_ref, now)
        } else {
            link.borrow_mut().handle_packet(packet, now)
        };

        self.drain_link_events(&link);
        for event in self.resources.drain_events() {
            self.events.push_back(TransportEvent::Resource(event));
        }
        for response in responses {
            let _ = self.outbound_now(response, SendOptions::default(), now);
        }
    }

    fn deliver_local(&mut self, packet: &Packet, now: f64) {
        let Some(shared) = self.destinations.get(&packet.destination).cloned() else {
            return;
        };

        let (plaintext, ratchet_used, strategy, identity_clone) = {
            let mut destination = shared.borrow_mut();
            let strategy = destination.proof_strategy;
            match destination.decrypt(packet.data.as_slice()) {
                Ok((plaintext, ratchet_used)) => {
                    (plaintext, ratchet_used, strategy, destination.identity.clone())
                }
                Err(_) => {
                    log::debug!("{}: undecryptable packet for local destination", self.config.name);
                    return;
                }
            }
        };

        let prove = match strategy {
            ProofStrategy::ProveAll => true,
            ProofStrategy::ProveNone => false,
            ProofStrategy::ProveApp => self
                .proof_requested_callback
                .as_mut()
                .map(|callback| callback(&packet.destination, packet))
                .unwrap_or(false),
        };
        if prove {
            let proof = packet.prove(&identity_clone);
            let _ = self.outbound_now(proof, SendOptions::default(), now);
        }

        self.events.push_back(TransportEvent::PacketDelivered {
            destination: packet.destination,
            data: plaintext,
            context: packet.context,
            ratchet_used,
        });
    }

    fn handle_cache_request(&mut self, packet: &Packet, iface_hash: &AddressHash) {
        let Ok(wanted) = Hash::try_from_slice(packet.data.as_slice()) else {
            return;
        };
        let cached = self
            .storage
            .as_deref()
            .and_then(|storage| PacketCache::load(storage, &wanted));
        if let Some(cached) = cached {
            self.transmit(iface_hash, &cached);
        }
    }

    fn handle_path_request(&mut self, packet: &Packet, iface_hash: &AddressHash, now: f64) {
        let Some(request) = self.path_requests.accept(packet.data.as_slice(), now) else {
            return;
        };

        // A destination of ours: answer with a fresh path response.
        if let Some(shared) = self.destinations.get(&request.destination).cloned() {
            if let Ok(response) = shared.borrow_mut().path_response(OsRng, None) {
                self.transmit(iface_hash, &response);
            }
            return;
        }

        if !self.config.transport_enabled {
            return;
        }

        // A known path: serve the cached announce as a path response. Any
        // scheduled rebroadcast is popped aside and reinserted once the
        // response has gone out.
        if self.path_table.has_path(&request.destination, now) {
            let (hops, emitted, packet_hash) = match self.path_table.get(&request.destination) {
                Some(entry) => (entry.hops, entry.emitted, entry.packet_hash),
                None => return,
            };
            let cached = self
                .storage
                .as_deref()
                .and_then(|storage| PacketCache::load(storage, &packet_hash));
            if let Some(announce) = cached {
                self.announce_table.hold(&request.destination);
                let mut entry = AnnounceEntry::new(announce, *iface_hash, hops, emitted, now);
                entry.block_rebroadcasts = true;
                entry.response_iface = Some(*iface_hash);
                entry.retransmit_at = now;
                self.announce_table.add(request.destination, entry);
            }
            return;
        }

        // Unknown: recursive discovery, rebroadcast the request onward.
        if self.path_requests.begin_discovery(&request.destination, now) {
            let onward = self.path_requests.generate(&request.destination, Some(request.tag));
            self.broadcast(&onward, Some(*iface_hash), None);
        }
    }

    fn handle_proof(&mut self, packet: &Packet, iface_hash: &AddressHash, now: f64) {
        let _ = iface_hash;

        // Link establishment and link-internal proofs.
        if packet.header.destination_type == DestinationType::Link {
            if packet.context == PacketContext::ResourceProof {
                self.handle_link_data(packet, now);
                return;
            }
            if let Some(link) = self.find_link(&packet.destination) {
                let was_pending = link.borrow().status().not_yet_active();
                let responses = link.borrow_mut().handle_packet(packet, now);
                if was_pending && link.borrow().status() == LinkStatus::Active {
                    self.promote_link(&link);
                }
                self.drain_link_events(&link);
                for response in responses {
                    let _ = self.outbound_now(response, SendOptions::default(), now);
                }
                return;
            }
        }

        // A proof for an outstanding receipt of ours.
        let known = &self.known_destinations;
        let settled = self.receipts.handle_proof(
            &packet.destination,
            packet.data.as_slice(),
            |destination| known.get(destination).map(|entry| entry.identity),
            now,
        );
        if let Some(receipt) = settled {
            self.events.push_back(TransportEvent::ReceiptDelivered {
                packet_hash: receipt.packet_hash,
                rtt: receipt.rtt.unwrap_or(0.0),
            });
            return;
        }

        // Someone else's proof traveling back over our breadcrumb.
        if let Some(entry) = self.reverse_table.take(&packet.destination) {
            let mut forwarded = packet.clone();
            forwarded.header.hops = packet.header.hops;
            self.transmit(&entry.received_on, &forwarded);
        }
    }

    fn promote_link(&mut self, link: &Rc<RefCell<Link>>) {
        let link_id = *link.borrow().id();
        self.pending_links.retain(|pending| *pending.borrow().id() != link_id);
        if self.active_links.len() < MAX_ACTIVE_LINKS {
            self.active_links.push(link.clone());
        } else {
            log::warn!("{}: active link table full, closing {}", self.config.name, link_id);
            link.borrow_mut().close(TeardownReason::Timeout);
        }
    }

    //***********************************************************************//
    // Periodic jobs
    //***********************************************************************//

    /// The periodic sweep, expected roughly every 250 ms. Sub-tasks run on
    /// their own intervals.
    pub fn jobs(&mut self, now: f64) {
        self.jobs_locked = true;

        if now - self.timers.links >= LINKS_CHECK_INTERVAL {
            self.timers.links = now;
            self.check_links(now);
        }
        if now - self.timers.receipts >= RECEIPTS_CHECK_INTERVAL {
            self.timers.receipts = now;
            self.check_receipts(now);
        }
        if now - self.timers.announces >= ANNOUNCES_CHECK_INTERVAL {
            self.timers.announces = now;
            self.check_announces(now);
            self.check_resources(now);
        }
        if now - self.timers.cull >= TABLES_CULL_INTERVAL {
            self.timers.cull = now;
            self.cull_tables(now);
            self.persist_state();
        }

        self.check_memory_pressure();

        self.jobs_locked = false;
        self.flush_deferred(now);
    }

    fn flush_deferred(&mut self, now: f64) {
        while let Some((packet, options)) = self.deferred_outbound.pop_front() {
            let _ = self.outbound_now(packet, options, now);
        }
    }

    fn check_links(&mut self, now: f64) {
        let mut to_send: Vec<Packet> = Vec::new();
        let mut failed_pending: Vec<AddressHash> = Vec::new();

        for link in self.pending_links.clone() {
            let destination = link.borrow().destination().address_hash;
            let status_before = link.borrow().status();
            to_send.extend(link.borrow_mut().poll(now));
            if status_before != LinkStatus::Closed && link.borrow().status() == LinkStatus::Closed
            {
                failed_pending.push(destination);
            }
            self.drain_link_events(&link);
        }
        for link in self.active_links.clone() {
            to_send.extend(link.borrow_mut().poll(now));
            self.drain_link_events(&link);
        }

        self.pending_links.retain(|link| link.borrow().status() != LinkStatus::Closed);
        self.active_links.retain(|link| {
            let closed = link.borrow().status() == LinkStatus::Closed;
            if closed {
                self.resources.drop_link(link.borrow().id());
            }
            !closed
        });

        for packet in to_send {
            let _ = self.outbound_now(packet, SendOptions::default(), now);
        }

        // A failed establishment asks the network for a fresh path, rate
        // limited per destination.
        if !self.config.transport_enabled {
            for destination in failed_pending {
                if let Some(request) = self.path_requests.generate_local(&destination, now) {
                    let _ = self.outbound_now(request, SendOptions::default(), now);
                }
            }
        }
    }

    fn check_receipts(&mut self, now: f64) {
        let mut failed: Vec<Hash> = Vec::new();
        self.receipts.check_timeouts_with(now, |receipt| {
            if receipt.status == ReceiptStatus::Failed {
                failed.push(receipt.packet_hash);
            }
        });
        for packet_hash in failed {
            self.events.push_back(TransportEvent::ReceiptFailed { packet_hash });
        }
    }

    fn check_announces(&mut self, now: f64) {
        let transport_id = self.identity_hash();
        for (strategy, packet) in self.announce_table.due(now, &transport_id) {
            match strategy {
                TxStrategy::Direct(iface) => self.transmit(&iface, &packet),
                TxStrategy::Broadcast { exclude } => {
                    self.broadcast(&packet, exclude, None);
                }
            }
        }

        // Serve per-interface announce queues as budget returns.
        let mut releases: Vec<(AddressHash, Packet)> = Vec::new();
        for iface in self.interfaces.iter_mut() {
            if let Some(queued) = iface.pop_queued_announce(now) {
                releases.push((iface.hash(), queued.packet));
            }
        }
        for (iface_hash, packet) in releases {
            if let Ok(frame) = packet.to_bytes() {
                if let Some(iface) = self.interfaces.get_mut(&iface_hash) {
                    if iface.consume_announce_budget(frame.len(), now) {
                        let _ = iface.transmit(&frame);
                    } else {
                        let emitted = announce_emission(&packet).unwrap_or(0);
                        let _ = iface.queue_announce(packet.destination, emitted, packet);
                    }
                }
            }
        }
    }

    fn check_resources(&mut self, now: f64) {
        let actions = {
            let active = &self.active_links;
            self.resources.job(now, |link_id| {
                active
                    .iter()
                    .find(|link| link.borrow().id() == link_id)
                    .map(|link| link.borrow().rtt())
                    .unwrap_or(0.0)
            })
        };

        for action in actions {
            let packet = match &action {
                ResourceAction::SendRequest { link_id, request } => self
                    .find_link(link_id)
                    .and_then(|link| ResourceManager::build_request_packet(&link.borrow(), request).ok()),
                ResourceAction::Readvertise { link_id, advertisement } => {
                    self.find_link(link_id).and_then(|link| {
                        ResourceManager::build_advertisement_packet(&link.borrow(), advertisement)
                            .ok()
                    })
                }
            };
            if let Some(packet) = packet {
                let _ = self.outbound_now(packet, SendOptions::default(), now);
            }
        }

        for event in self.resources.drain_events() {
            self.events.push_back(TransportEvent::Resource(event));
        }
    }

    fn cull_tables(&mut self, now: f64) {
        let interfaces = &self.interfaces;
        self.path_table.cull(now, |iface| interfaces.contains(iface));
        self.reverse_table.cull(now);
        self.link_table.cull(now);
        self.path_requests.cull(now);
        self.tunnels.cull(now);
    }

    fn check_memory_pressure(&mut self) {
        let Some(probe) = self.config.memory_pressure.as_ref() else {
            return;
        };
        match probe() {
            MemoryPressure::Normal => {}
            MemoryPressure::Low => {
                self.path_table.shrink_to(LOW_MEM_PATH_TARGET);
                self.hashlist.trim_to(LOW_MEM_HASHLIST_TARGET);
            }
            MemoryPressure::Critical => {
                log::warn!("{}: critical memory pressure, shedding tables", self.config.name);
                self.path_table.shrink_to(CRITICAL_MEM_PATH_TARGET);
                self.hashlist.trim_to(CRITICAL_MEM_HASHLIST_TARGET);
            }
        }
    }

    fn persist_state(&mut self) {
        let Some(storage) = self.storage.as_deref_mut() else {
            return;
        };
        if let Err(err) = persist::save_paths(storage, &self.path_table, &mut self.paths_crc) {
            log::warn!("{}: path table persist failed: {}", self.config.name, err);
        }
        if let Err(err) = persist::save_tunnels(storage, &self.tunnels, &mut self.tunnels_crc) {
            log::warn!("{}: tunnel table persist failed: {}", self.config.name, err);
        }
        if let Err(err) = persist::save_hashlist(storage, &self.hashlist, &mut self.hashlist_crc)
        {
            log::warn!("{}: hashlist persist failed: {}", self.config.name, err);
        }
    }

    /// Hash of the shared path-request control endpoint.
    pub fn path_request_destination(&self) -> AddressHash {
        self.path_requests.control_destination_hash()
    }

    pub fn request_path(&mut self, destination: &AddressHash, now: f64) -> bool {
        match self.path_requests.generate_local(destination, now) {
            Some(packet) => {
                let _ = self.outbound(packet, SendOptions::default(), now);
                true
            }
            None => false,
        }
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn path_count(&self) -> usize {
        self.path_table.len()
    }

    pub fn hashlist_count(&self) -> usize {
        self.hashlist.len()
    }
}

fn receipt_qualifies(packet: &Packet) -> bool {
    packet.header.packet_type == PacketType::Data
        && packet.header.destination_type != DestinationType::Plain
        && !packet.context.is_link_control()
        && !packet.context.is_resource()
}

/// The emission timestamp buried in an announce payload, for
/// freshest-wins announce queueing.
fn announce_emission(packet: &Packet) -> Option<u64> {
    let data = packet.data.as_slice();
    let offset = 64 + NAME_HASH_LENGTH;
    if data.len() < offset + 10 {
        return None;
    }
    let mut blob = [0u8; 10];
    blob.copy_from_slice(&data[offset..offset + 10]);
    Some(emission_timestamp(&blob))
}

/// Rebroadcasts carry the original announce payload in a fresh header.
fn strip_transport_header(packet: &Packet) -> Packet {
    let mut stripped = packet.clone();
    stripped.header.header_type = HeaderType::Type1;
    stripped.transport = None;
    stripped
}

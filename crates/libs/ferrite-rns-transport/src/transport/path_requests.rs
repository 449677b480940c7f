use rand_core::OsRng;

use rns_core::buffer::ByteBuf;
use rns_core::error::RnsError;
use rns_core::hash::{AddressHash, ADDRESS_HASH_SIZE};
use rns_core::identity::EmptyIdentity;

use crate::destination::{DestinationName, PlainInputDestination};
use crate::packet::{
    ContextFlag, DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext, PacketType,
    PropagationType,
};
use crate::transport::config::{
    PATH_REQUEST_MIN_INTERVAL, PATH_REQUEST_THROTTLE, PATH_REQUEST_TIMEOUT,
};
use crate::transport::pool::FixedTable;

/// The fixed control endpoint every node listens on for path requests.
pub fn create_path_request_destination() -> PlainInputDestination {
    PlainInputDestination::new(EmptyIdentity, DestinationName::new("rnstransport", "path.request"))
}

pub type Tag = [u8; ADDRESS_HASH_SIZE];

pub fn create_random_tag() -> Tag {
    *AddressHash::new_from_rand(OsRng).as_bytes()
}

/// Decoded path request payload:
/// `destination_hash [∥ requesting_transport] ∥ tag`.
pub struct PathRequest {
    pub destination: AddressHash,
    pub requesting_transport: Option<AddressHash>,
    pub tag: Tag,
}

impl PathRequest {
    pub fn decode(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() <= ADDRESS_HASH_SIZE {
            return Err(RnsError::PacketError);
        }

        let destination = AddressHash::try_from_slice(data)?;

        let (requesting_transport, tag_start) = if data.len() > ADDRESS_HASH_SIZE * 2 {
            (
                Some(AddressHash::try_from_slice(&data[ADDRESS_HASH_SIZE..])?),
                ADDRESS_HASH_SIZE * 2,
            )
        } else {
            (None, ADDRESS_HASH_SIZE)
        };

        let mut tag = [0u8; ADDRESS_HASH_SIZE];
        let tag_bytes = &data[tag_start..];
        let tag_len = tag_bytes.len().min(ADDRESS_HASH_SIZE);
        tag[..tag_len].copy_from_slice(&tag_bytes[..tag_len]);

        Ok(Self { destination, requesting_transport, tag })
    }
}

/// Circular record of recently served request tags; a repeated tag is the
/// same request echoing back through the mesh.
struct TagRing {
    ring: Vec<Option<(AddressHash, Tag)>>,
    next: usize,
}

impl TagRing {
    fn new(capacity: usize) -> Self {
        let mut ring = Vec::with_capacity(capacity);
        ring.resize_with(capacity, || None);
        Self { ring, next: 0 }
    }

    fn insert(&mut self, destination: AddressHash, tag: Tag) -> bool {
        if self.ring.iter().flatten().any(|(seen_dest, seen_tag)| {
            *seen_dest == destination && *seen_tag == tag
        }) {
            return false;
        }
        if self.ring.is_empty() {
            return true;
        }
        self.ring[self.next] = Some((destination, tag));
        self.next = (self.next + 1) % self.ring.len();
        true
    }
}

struct DiscoveryEntry {
    timeout: f64,
}

struct ThrottleEntry {
    timestamp: f64,
}

struct LocalRequestEntry {
    requested_at: f64,
}

/// Path request handling state: the control destination, duplicate-tag
/// suppression, discovery bookkeeping, inbound throttling, and the
/// minimum-interval gate for locally originated requests.
pub struct PathRequests {
    transport_id: Option<AddressHash>,
    controlled_destination: PlainInputDestination,
    tags: TagRing,
    discovery: FixedTable<AddressHash, DiscoveryEntry>,
    throttle: FixedTable<AddressHash, ThrottleEntry>,
    local: FixedTable<AddressHash, LocalRequestEntry>,
}

impl PathRequests {
    pub fn new(
        transport_id: Option<AddressHash>,
        tag_capacity: usize,
        discovery_capacity: usize,
        throttle_capacity: usize,
        local_capacity: usize,
    ) -> Self {
        Self {
            transport_id,
            controlled_destination: create_path_request_destination(),
            tags: TagRing::new(tag_capacity),
            discovery: FixedTable::new(discovery_capacity),
            throttle: FixedTable::new(throttle_capacity),
            local: FixedTable::new(local_capacity),
        }
    }

    pub fn control_destination_hash(&self) -> AddressHash {
        self.controlled_destination.desc.address_hash
    }

    /// Parse an inbound request, rejecting duplicates by tag and
    /// throttled destinations.
    pub fn accept(&mut self, data: &[u8], now: f64) -> Option<PathRequest> {
        let request = match PathRequest::decode(data) {
            Ok(request) => request,
            Err(_) => {
                log::debug!("ignoring malformed path request");
                return None;
            }
        };

        if !self.tags.insert(request.destination, request.tag) {
            log::debug!("ignoring duplicate path request for {}", request.destination);
            return None;
        }

        if let Some(entry) = self.throttle.get(&request.destination) {
            if now - entry.timestamp < PATH_REQUEST_THROTTLE {
                log::debug!("throttling path request for {}", request.destination);
                return None;
            }
        }
        self.throttle.insert_or_evict_oldest(
            request.destination,
            ThrottleEntry { timestamp: now },
            |entry| entry.timestamp,
        );

        Some(request)
    }

    /// Build a path request packet for a destination we want a route to.
    pub fn generate(&mut self, destination: &AddressHash, tag: Option<Tag>) -> Packet {
        let mut data = ByteBuf::from_slice(destination.as_slice());
        if let Some(transport_id) = self.transport_id {
            data.append(transport_id.as_slice());
        }
        data.append(&tag.unwrap_or_else(create_random_tag));

        Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type1,
                context_flag: ContextFlag::Unset,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Plain,
                packet_type: PacketType::Data,
                hops: 0,
            },
            ifac: None,
            destination: self.controlled_destination.desc.address_hash,
            transport: self.transport_id,
            context: PacketContext::None,
            data,
        }
    }

    /// Locally originated request, rate limited per destination.
    pub fn generate_local(&mut self, destination: &AddressHash, now: f64) -> Option<Packet> {
        if let Some(entry) = self.local.get_mut(destination) {
            if now - entry.requested_at < PATH_REQUEST_MIN_INTERVAL {
                return None;
            }
            entry.requested_at = now;
        } else {
            self.local.insert_or_evict_oldest(
                *destination,
                LocalRequestEntry { requested_at: now },
                |entry| entry.requested_at,
            );
        }
        Some(self.generate(destination, None))
    }

    /// Track a discovery request this transport node is trying to answer
    /// by rebroadcasting the request further.
    pub fn begin_discovery(&mut self, destination: &AddressHash, now: f64) -> bool {
        if let Some(entry) = self.discovery.get(destination) {
            if entry.timeout > now {
                log::debug!("discovery for {} already pending", destination);
                return false;
            }
        }
        self.discovery.insert_or_evict_oldest(
            *destination,
            DiscoveryEntry { timeout: now + PATH_REQUEST_TIMEOUT },
            |entry| entry.timeout,
        );
        true
    }

    pub fn discovery_pending(&self, destination: &AddressHash, now: f64) -> bool {
        self.discovery.get(destination).map(|entry| entry.timeout > now).unwrap_or(false)
    }

    pub fn end_discovery(&mut self, destination: &AddressHash) {
        self.discovery.remove(destination);
    }

    pub fn cull(&mut self, now: f64) {
        self.discovery.retain(|_, entry| entry.timeout > now);
        self.throttle.retain(|_, entry| now - entry.timestamp < PATH_REQUEST_THROTTLE);
    }
}

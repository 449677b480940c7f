use rns_core::hash::AddressHash;

use crate::destination::link::LinkId;
use crate::packet::{Header, HeaderType, Packet, PropagationType};
use crate::transport::config::{LINK_TIMEOUT, REVERSE_TIMEOUT};
use crate::transport::pool::FixedTable;

/// A link being established or carried through this node.
pub struct LinkEntry {
    pub timestamp: f64,
    pub proof_timeout: f64,
    pub next_hop: AddressHash,
    pub next_hop_iface: AddressHash,
    pub received_on: AddressHash,
    pub destination: AddressHash,
    pub hops_taken: u8,
    pub hops_remaining: u8,
    pub validated: bool,
}

/// Return-route breadcrumb left by a forwarded packet so its proof can
/// travel back without a path-table entry.
pub struct ReverseEntry {
    pub timestamp: f64,
    pub received_on: AddressHash,
    pub forwarded_on: AddressHash,
}

fn forward_back(packet: &Packet, next_hop: AddressHash) -> Packet {
    Packet {
        header: Header {
            ifac_flag: packet.header.ifac_flag,
            header_type: HeaderType::Type2,
            context_flag: packet.header.context_flag,
            propagation_type: PropagationType::Transport,
            destination_type: packet.header.destination_type,
            packet_type: packet.header.packet_type,
            hops: packet.header.hops + 1,
        },
        ifac: None,
        destination: packet.destination,
        transport: Some(next_hop),
        context: packet.context,
        data: packet.data.clone(),
    }
}

pub struct LinkTable {
    entries: FixedTable<LinkId, LinkEntry>,
    proof_timeout: f64,
}

impl LinkTable {
    pub fn new(capacity: usize, proof_timeout: f64) -> Self {
        Self { entries: FixedTable::new(capacity), proof_timeout }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn add(
        &mut self,
        link_id: LinkId,
        destination: AddressHash,
        received_on: AddressHash,
        next_hop: AddressHash,
        next_hop_iface: AddressHash,
        hops_taken: u8,
        now: f64,
    ) {
        if self.entries.contains_key(&link_id) {
            return;
        }

        let entry = LinkEntry {
            timestamp: now,
            proof_timeout: now + self.proof_timeout,
            next_hop,
            next_hop_iface,
            received_on,
            destination,
            hops_taken,
            hops_remaining: 0,
            validated: false,
        };
        if self.entries.insert_or_evict_oldest(link_id, entry, |held| held.timestamp).is_some() {
            log::debug!("link table full, evicted oldest");
        }
    }

    pub fn get(&self, link_id: &LinkId) -> Option<&LinkEntry> {
        self.entries.get(link_id)
    }

    pub fn validated_destination(&self, link_id: &LinkId) -> Option<AddressHash> {
        self.entries.get(link_id).filter(|entry| entry.validated).map(|entry| entry.destination)
    }

    /// A link packet traversing this node toward the initiator.
    pub fn forward_toward_initiator(&mut self, packet: &Packet, now: f64) -> Option<(Packet, AddressHash)> {
        let entry = self.entries.get_mut(&packet.destination)?;
        entry.timestamp = now;
        Some((forward_back(packet, entry.next_hop), entry.received_on))
    }

    /// The link-request proof coming back from the destination validates
    /// the in-transit entry and rides the breadcrumb toward the
    /// initiator.
    pub fn handle_proof(&mut self, proof: &Packet, now: f64) -> Option<(Packet, AddressHash)> {
        let entry = self.entries.get_mut(&proof.destination)?;
        entry.hops_remaining = proof.header.hops;
        entry.validated = true;
        entry.timestamp = now;
        Some((forward_back(proof, entry.next_hop), entry.received_on))
    }

    /// A data packet traveling the validated link toward the destination.
    pub fn forward_toward_destination(
        &mut self,
        packet: &Packet,
        now: f64,
    ) -> Option<(Packet, AddressHash)> {
        let entry = self.entries.get_mut(&packet.destination)?;
        if !entry.validated {
            return None;
        }
        entry.timestamp = now;
        let forwarded = Packet {
            header: Header {
                hops: packet.header.hops + 1,
                ..packet.header
            },
            ifac: None,
            destination: packet.destination,
            transport: packet.transport,
            context: packet.context,
            data: packet.data.clone(),
        };
        Some((forwarded, entry.next_hop_iface))
    }

    /// Validated entries expire after the link timeout; unvalidated ones
    /// at their own proof deadline.
    pub fn cull(&mut self, now: f64) {
        self.entries.retain(|link_id, entry| {
            let keep = if entry.validated {
                now - entry.timestamp <= LINK_TIMEOUT
            } else {
                now <= entry.proof_timeout
            };
            if !keep {
                log::debug!("in-transit link {} expired", link_id);
            }
            keep
        });
    }
}

pub struct ReverseTable {
    entries: FixedTable<AddressHash, ReverseEntry>,
}

impl ReverseTable {
    pub fn new(capacity: usize) -> Self {
        Self { entries: FixedTable::new(capacity) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Key is the truncated packet hash of the forwarded packet.
    pub fn add(
        &mut self,
        packet_hash: AddressHash,
        received_on: AddressHash,
        forwarded_on: AddressHash,
        now: f64,
    ) {
        let entry = ReverseEntry { timestamp: now, received_on, forwarded_on };
        self.entries.insert_or_evict_oldest(packet_hash, entry, |held| held.timestamp);
    }

    pub fn get(&self, packet_hash: &AddressHash) -> Option<&ReverseEntry> {
        self.entries.get(packet_hash)
    }

    pub fn take(&mut self, packet_hash: &AddressHash) -> Option<ReverseEntry> {
        self.entries.remove(packet_hash)
    }

    pub fn cull(&mut self, now: f64) {
        self.entries.retain(|_, entry| now - entry.timestamp <= REVERSE_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use rns_core::buffer::ByteBuf;
    use rns_core::hash::AddressHash;

    use super::{LinkTable, ReverseTable};
    use crate::packet::{
        DestinationType, Header, HeaderType, Packet, PacketContext, PacketType,
    };
    use crate::transport::config::{LINK_TIMEOUT, REVERSE_TIMEOUT};

    fn link_proof(link_id: AddressHash) -> Packet {
        Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                hops: 2,
                ..Default::default()
            },
            ifac: None,
            destination: link_id,
            transport: None,
            context: PacketContext::LinkRequestProof,
            data: ByteBuf::from_slice(b"proof"),
        }
    }

    fn populated_table(now: f64) -> (LinkTable, AddressHash, AddressHash, AddressHash) {
        let mut table = LinkTable::new(4, 30.0);
        let link_id = AddressHash::new_from_rand(OsRng);
        let next_hop = AddressHash::new_from_rand(OsRng);
        let received_on = AddressHash::new_from_rand(OsRng);
        table.add(
            link_id,
            AddressHash::new_from_rand(OsRng),
            received_on,
            next_hop,
            AddressHash::new_from_rand(OsRng),
            1,
            now,
        );
        (table, link_id, next_hop, received_on)
    }

    #[test]
    fn proof_validates_and_forwards_backwards() {
        let (mut table, link_id, next_hop, received_on) = populated_table(100.0);

        let (forwarded, back_iface) =
            table.handle_proof(&link_proof(link_id), 101.0).expect("forwarded");
        assert_eq!(back_iface, received_on);
        assert_eq!(forwarded.transport, Some(next_hop));
        assert_eq!(forwarded.header.header_type, HeaderType::Type2);
        assert_eq!(forwarded.header.hops, 3);
        assert!(table.get(&link_id).expect("entry").validated);
    }

    #[test]
    fn unvalidated_entries_expire_at_proof_timeout() {
        let (mut table, link_id, _, _) = populated_table(100.0);

        table.cull(129.0);
        assert!(table.get(&link_id).is_some());

        table.cull(131.0);
        assert!(table.get(&link_id).is_none());
    }

    #[test]
    fn validated_entries_live_for_the_link_timeout() {
        let (mut table, link_id, _, _) = populated_table(100.0);
        table.handle_proof(&link_proof(link_id), 100.5).expect("validated");

        table.cull(100.5 + LINK_TIMEOUT - 1.0);
        assert!(table.get(&link_id).is_some());

        table.cull(100.5 + LINK_TIMEOUT + 1.0);
        assert!(table.get(&link_id).is_none());
    }

    #[test]
    fn reverse_entries_age_out() {
        let mut table = ReverseTable::new(4);
        let key = AddressHash::new_from_rand(OsRng);
        table.add(
            key,
            AddressHash::new_from_rand(OsRng),
            AddressHash::new_from_rand(OsRng),
            100.0,
        );

        table.cull(100.0 + REVERSE_TIMEOUT - 1.0);
        assert!(table.get(&key).is_some());

        table.cull(100.0 + REVERSE_TIMEOUT + 1.0);
        assert!(table.get(&key).is_none());
    }
}

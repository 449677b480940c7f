use rand_core::{OsRng, RngCore};

use rns_core::hash::AddressHash;

use crate::packet::{
    ContextFlag, DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext, PacketType,
    PropagationType,
};
use crate::transport::config::{PATHFINDER_GRACE, PATHFINDER_RANDOM_WINDOW, PATHFINDER_RETRIES};
use crate::transport::pool::FixedTable;

/// Where a queued frame should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStrategy {
    Broadcast { exclude: Option<AddressHash> },
    Direct(AddressHash),
}

pub struct AnnounceEntry {
    pub packet: Packet,
    pub received_on: AddressHash,
    pub hops: u8,
    pub emitted: u64,
    pub timestamp: f64,
    pub retransmit_at: f64,
    pub retries: u8,
    /// Retransmit as a path response instead of a plain announce.
    pub block_rebroadcasts: bool,
    /// Direct interface for a path response, broadcast otherwise.
    pub response_iface: Option<AddressHash>,
}

fn random_jitter() -> f64 {
    (OsRng.next_u32() as f64 / u32::MAX as f64) * PATHFINDER_RANDOM_WINDOW
}

impl AnnounceEntry {
    pub fn new(
        packet: Packet,
        received_on: AddressHash,
        hops: u8,
        emitted: u64,
        now: f64,
    ) -> Self {
        Self {
            packet,
            received_on,
            hops,
            emitted,
            timestamp: now,
            retransmit_at: now + PATHFINDER_GRACE + random_jitter(),
            retries: 0,
            block_rebroadcasts: false,
            response_iface: None,
        }
    }

    /// Wire form of the retransmission: HEADER_2 with our transport id so
    /// downstream nodes record us as the next hop. The announce payload
    /// (and with it the emission timestamp) is carried unmodified.
    pub fn retransmit_packet(&self, transport_id: &AddressHash) -> Packet {
        let context = if self.block_rebroadcasts {
            PacketContext::PathResponse
        } else {
            PacketContext::None
        };

        Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type2,
                context_flag: self.packet.header.context_flag,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                hops: self.hops,
            },
            ifac: None,
            destination: self.packet.destination,
            transport: Some(*transport_id),
            context,
            data: self.packet.data.clone(),
        }
    }
}

/// Scheduled announce rebroadcasts plus the held slots used while a path
/// request is being answered.
pub struct AnnounceTable {
    entries: FixedTable<AddressHash, AnnounceEntry>,
    held: FixedTable<AddressHash, AnnounceEntry>,
}

impl AnnounceTable {
    pub fn new(capacity: usize, held_capacity: usize) -> Self {
        Self { entries: FixedTable::new(capacity), held: FixedTable::new(held_capacity) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, destination: &AddressHash) -> bool {
        self.entries.contains_key(destination)
    }

    pub fn get(&self, destination: &AddressHash) -> Option<&AnnounceEntry> {
        self.entries.get(destination).or_else(|| self.held.get(destination))
    }

    pub fn add(&mut self, destination: AddressHash, entry: AnnounceEntry) {
        if let Some(existing) = self.entries.get_mut(&destination) {
            // Keep whichever copy is freshest by emission timestamp.
            if entry.emitted >= existing.emitted {
                *existing = entry;
            }
            return;
        }
        if self.entries.insert_or_evict_oldest(destination, entry, |held| held.timestamp).is_some()
        {
            log::debug!("announce table full, evicted oldest");
        }
    }

    /// Pop an entry aside to answer a path request.
    pub fn hold(&mut self, destination: &AddressHash) -> bool {
        let Some(entry) = self.entries.remove(destination) else {
            return false;
        };
        self.held.insert_or_evict_oldest(*destination, entry, |held| held.timestamp);
        true
    }

    /// Put a held entry back into the schedule. A fresher copy that
    /// arrived meanwhile wins; on equal emission the held entry stays.
    pub fn release_held(&mut self, destination: &AddressHash) {
        let Some(held) = self.held.remove(destination) else {
            return;
        };
        match self.entries.get_mut(destination) {
            Some(existing) if existing.emitted > held.emitted => {}
            _ => {
                self.entries.insert_or_evict_oldest(*destination, held, |entry| entry.timestamp);
            }
        }
    }

    /// Collect retransmissions due at `now`. Entries past their retry
    /// budget are dropped; path responses go out exactly once, after
    /// which any held announce for that destination is rescheduled.
    pub fn due(&mut self, now: f64, transport_id: &AddressHash) -> Vec<(TxStrategy, Packet)> {
        let mut out = Vec::new();
        let mut dropped = 0usize;
        let mut responded: Vec<AddressHash> = Vec::new();

        self.entries.retain(|destination, entry| {
            if now < entry.retransmit_at {
                return true;
            }

            if entry.block_rebroadcasts {
                let strategy = match entry.response_iface {
                    Some(iface) => TxStrategy::Direct(iface),
                    None => TxStrategy::Broadcast { exclude: Some(entry.received_on) },
                };
                out.push((strategy, entry.retransmit_packet(transport_id)));
                responded.push(*destination);
                return false;
            }

            if entry.retries > PATHFINDER_RETRIES {
                dropped += 1;
                return false;
            }

            out.push((
                TxStrategy::Broadcast { exclude: Some(entry.received_on) },
                entry.retransmit_packet(transport_id),
            ));
            entry.retries += 1;
            entry.retransmit_at = now + PATHFINDER_GRACE + random_jitter();
            true
        });

        for destination in responded {
            self.release_held(&destination);
        }

        if !out.is_empty() || dropped > 0 {
            log::trace!("announce table: {} retransmitted, {} dropped", out.len(), dropped);
        }
        out
    }

    pub fn remove(&mut self, destination: &AddressHash) {
        self.entries.remove(destination);
        self.held.remove(destination);
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use rns_core::buffer::ByteBuf;
    use rns_core::hash::AddressHash;

    use super::{AnnounceEntry, AnnounceTable, TxStrategy};
    use crate::packet::{Header, HeaderType, Packet, PacketContext, PacketType};
    use crate::transport::config::PATHFINDER_RETRIES;

    fn announce(destination: AddressHash) -> Packet {
        Packet {
            header: Header { packet_type: PacketType::Announce, ..Default::default() },
            ifac: None,
            destination,
            transport: None,
            context: PacketContext::None,
            data: ByteBuf::from_slice(b"payload"),
        }
    }

    fn entry(destination: AddressHash, emitted: u64) -> AnnounceEntry {
        AnnounceEntry::new(
            announce(destination),
            AddressHash::new_from_rand(OsRng),
            2,
            emitted,
            1000.0,
        )
    }

    #[test]
    fn due_retransmits_with_transport_header_then_drops() {
        let mut table = AnnounceTable::new(4, 4);
        let destination = AddressHash::new_from_rand(OsRng);
        let transport_id = AddressHash::new_from_rand(OsRng);
        table.add(destination, entry(destination, 100));

        let mut sent = 0;
        let mut now = 1000.0;
        for _ in 0..8 {
            now += 10.0;
            for (strategy, packet) in table.due(now, &transport_id) {
                sent += 1;
                assert!(matches!(strategy, TxStrategy::Broadcast { exclude: Some(_) }));
                assert_eq!(packet.header.header_type, HeaderType::Type2);
                assert_eq!(packet.transport, Some(transport_id));
                assert_eq!(packet.header.hops, 2);
            }
        }

        assert_eq!(sent, PATHFINDER_RETRIES as usize + 1);
        assert!(table.is_empty());
    }

    #[test]
    fn fresher_copy_replaces_a_scheduled_entry() {
        let mut table = AnnounceTable::new(4, 4);
        let destination = AddressHash::new_from_rand(OsRng);
        table.add(destination, entry(destination, 100));
        table.add(destination, entry(destination, 200));
        assert_eq!(table.get(&destination).expect("entry").emitted, 200);

        table.add(destination, entry(destination, 150));
        assert_eq!(table.get(&destination).expect("entry").emitted, 200);
    }

    #[test]
    fn held_entries_are_released_back() {
        let mut table = AnnounceTable::new(4, 4);
        let destination = AddressHash::new_from_rand(OsRng);
        table.add(destination, entry(destination, 100));

        assert!(table.hold(&destination));
        assert_eq!(table.len(), 0);

        table.release_held(&destination);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&destination).expect("entry").emitted, 100);
    }

    #[test]
    fn fresher_arrival_wins_over_held_entry() {
        let mut table = AnnounceTable::new(4, 4);
        let destination = AddressHash::new_from_rand(OsRng);
        table.add(destination, entry(destination, 100));
        table.hold(&destination);

        table.add(destination, entry(destination, 300));
        table.release_held(&destination);
        assert_eq!(table.get(&destination).expect("entry").emitted, 300);
    }

    #[test]
    fn path_responses_go_direct() {
        let mut table = AnnounceTable::new(4, 4);
        let destination = AddressHash::new_from_rand(OsRng);
        let iface = AddressHash::new_from_rand(OsRng);
        let transport_id = AddressHash::new_from_rand(OsRng);

        let mut response = entry(destination, 100);
        response.block_rebroadcasts = true;
        response.response_iface = Some(iface);
        response.retransmit_at = 1000.0;
        table.add(destination, response);

        let due = table.due(1001.0, &transport_id);
        assert_eq!(due.len(), 1);
        assert!(matches!(due[0].0, TxStrategy::Direct(target) if target == iface));
        assert_eq!(due[0].1.context, PacketContext::PathResponse);
    }
}

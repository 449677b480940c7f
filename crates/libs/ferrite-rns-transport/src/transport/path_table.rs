use std::collections::VecDeque;

use rns_core::hash::{AddressHash, Hash};

use crate::iface::InterfaceMode;
use crate::packet::{
    DestinationType, Header, HeaderType, Packet, PacketType, PropagationType,
};
use crate::transport::config::{
    AP_PATH_TIME, DESTINATION_TIMEOUT, MAX_RANDOM_BLOBS, ROAMING_PATH_TIME,
};
use crate::transport::pool::FixedTable;

pub struct PathEntry {
    pub timestamp: f64,
    pub received_from: AddressHash,
    pub hops: u8,
    pub iface: AddressHash,
    pub expires: f64,
    /// Emission timestamp of the freshest announce recorded for this path.
    pub emitted: u64,
    /// Random blobs seen on announce copies, bounded, for replay detection.
    pub random_blobs: VecDeque<[u8; 10]>,
    pub packet_hash: Hash,
}

impl PathEntry {
    fn knows_blob(&self, blob: &[u8; 10]) -> bool {
        self.random_blobs.iter().any(|seen| seen == blob)
    }

    fn remember_blob(&mut self, blob: [u8; 10]) {
        if self.knows_blob(&blob) {
            return;
        }
        if self.random_blobs.len() >= MAX_RANDOM_BLOBS {
            self.random_blobs.pop_front();
        }
        self.random_blobs.push_back(blob);
    }
}

pub fn path_expiry_for_mode(mode: InterfaceMode, now: f64) -> f64 {
    match mode {
        InterfaceMode::AccessPoint => now + AP_PATH_TIME,
        InterfaceMode::Roaming => now + ROAMING_PATH_TIME,
        _ => now + DESTINATION_TIMEOUT,
    }
}

/// What an inbound announce did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathUpdate {
    /// New or better path recorded.
    Recorded,
    /// Known replay or a worse path; nothing recorded.
    Ignored,
}

pub struct PathTable {
    table: FixedTable<AddressHash, PathEntry>,
}

impl PathTable {
    pub fn new(capacity: usize) -> Self {
        Self { table: FixedTable::new(capacity) }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn get(&self, destination: &AddressHash) -> Option<&PathEntry> {
        self.table.get(destination)
    }

    pub fn has_path(&self, destination: &AddressHash, now: f64) -> bool {
        self.table.get(destination).map(|entry| entry.expires > now).unwrap_or(false)
    }

    pub fn hops_to(&self, destination: &AddressHash) -> Option<u8> {
        self.table.get(destination).map(|entry| entry.hops)
    }

    pub fn next_hop(&self, destination: &AddressHash) -> Option<AddressHash> {
        self.table.get(destination).map(|entry| entry.received_from)
    }

    pub fn next_hop_interface(&self, destination: &AddressHash) -> Option<AddressHash> {
        self.table.get(destination).map(|entry| entry.iface)
    }

    pub fn remove(&mut self, destination: &AddressHash) -> Option<PathEntry> {
        self.table.remove(destination)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AddressHash, &PathEntry)> {
        self.table.iter()
    }

    /// The announce path-update rule.
    ///
    /// Fewer-or-equal hops win outright unless the random blob is a known
    /// replay. More hops only replace an expired path or one whose
    /// recorded announce is older by emission timestamp, and never on a
    /// replayed blob.
    pub fn handle_announce(
        &mut self,
        announce: &Packet,
        hops: u8,
        emitted: u64,
        random_blob: [u8; 10],
        received_from: AddressHash,
        iface: AddressHash,
        iface_mode: InterfaceMode,
        now: f64,
    ) -> PathUpdate {
        if let Some(entry) = self.table.get_mut(&announce.destination) {
            if entry.knows_blob(&random_blob) {
                return PathUpdate::Ignored;
            }

            let accept = if hops <= entry.hops {
                true
            } else {
                entry.expires <= now || emitted > entry.emitted
            };

            if !accept {
                entry.remember_blob(random_blob);
                return PathUpdate::Ignored;
            }

            entry.timestamp = now;
            entry.received_from = received_from;
            entry.hops = hops;
            entry.iface = iface;
            entry.expires = path_expiry_for_mode(iface_mode, now);
            entry.emitted = emitted;
            entry.packet_hash = announce.hash();
            entry.remember_blob(random_blob);
            return PathUpdate::Recorded;
        }

        let mut entry = PathEntry {
            timestamp: now,
            received_from,
            hops,
            iface,
            expires: path_expiry_for_mode(iface_mode, now),
            emitted,
            random_blobs: VecDeque::new(),
            packet_hash: announce.hash(),
        };
        entry.remember_blob(random_blob);

        if self
            .table
            .insert_or_evict_oldest(announce.destination, entry, |held| held.timestamp)
            .is_some()
        {
            log::debug!("path table full, evicted oldest for {}", announce.destination);
        }
        log::info!(
            "{} reachable over {} hops via {} on {}",
            announce.destination,
            hops,
            received_from,
            iface
        );
        PathUpdate::Recorded
    }

    /// Rewrite an outbound packet toward its next hop. Multi-hop paths
    /// get a HEADER_2 with the next-hop transport id; single-hop paths
    /// transmit unchanged on the path's interface.
    pub fn rewrite_outbound(&self, packet: &Packet) -> (Packet, Option<AddressHash>) {
        if packet.header.header_type == HeaderType::Type2
            || packet.header.packet_type == PacketType::Announce
            || packet.header.destination_type == DestinationType::Plain
            || packet.header.destination_type == DestinationType::Group
        {
            return (packet.clone(), None);
        }

        let Some(entry) = self.table.get(&packet.destination) else {
            return (packet.clone(), None);
        };

        if entry.hops <= 1 {
            return (packet.clone(), Some(entry.iface));
        }

        (
            Packet {
                header: Header {
                    ifac_flag: packet.header.ifac_flag,
                    header_type: HeaderType::Type2,
                    context_flag: packet.header.context_flag,
                    propagation_type: PropagationType::Transport,
                    destination_type: packet.header.destination_type,
                    packet_type: packet.header.packet_type,
                    hops: packet.header.hops,
                },
                ifac: packet.ifac.clone(),
                destination: packet.destination,
                transport: Some(entry.received_from),
                context: packet.context,
                data: packet.data.clone(),
            },
            Some(entry.iface),
        )
    }

    /// Drop expired paths and paths through unregistered interfaces.
    pub fn cull<F>(&mut self, now: f64, iface_registered: F)
    where
        F: Fn(&AddressHash) -> bool,
    {
        self.table.retain(|destination, entry| {
            if entry.expires <= now {
                log::debug!("path to {} expired", destination);
                return false;
            }
            if !iface_registered(&entry.iface) {
                log::debug!("path to {} lost its interface", destination);
                return false;
            }
            true
        });
    }

    /// Reinstate a persisted entry, evicting the oldest if needed.
    pub fn restore(&mut self, destination: AddressHash, entry: PathEntry) {
        self.table.insert_or_evict_oldest(destination, entry, |held| held.timestamp);
    }

    /// Shrink to `target` entries, oldest timestamps first. Memory
    /// pressure calls this outside the normal cull window.
    pub fn shrink_to(&mut self, target: usize) {
        while self.table.len() > target {
            let Some(oldest) = self.table.oldest_key(|entry| entry.timestamp) else {
                break;
            };
            self.table.remove(&oldest);
        }
    }
}

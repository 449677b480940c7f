use rns_core::hash::AddressHash;

use crate::transport::config::TUNNEL_TIMEOUT;
use crate::transport::pool::FixedTable;

/// A path learned through a tunnel, kept so it can be revived when the
/// tunnel's physical interface comes back.
pub struct TunnelPath {
    pub destination: AddressHash,
    pub received_from: AddressHash,
    pub hops: u8,
    pub expires: f64,
}

pub struct TunnelEntry {
    pub iface: Option<AddressHash>,
    pub expires: f64,
    pub paths: Vec<TunnelPath>,
}

/// Tunnels synthesized by interface drivers that reconnect (for example a
/// TCP transport that changes source ports). Entries outlive their
/// interface for the tunnel timeout so routes survive reconnects.
pub struct TunnelTable {
    table: FixedTable<AddressHash, TunnelEntry>,
}

impl TunnelTable {
    pub fn new(capacity: usize) -> Self {
        Self { table: FixedTable::new(capacity) }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn register(&mut self, tunnel_id: AddressHash, iface: AddressHash, now: f64) {
        if let Some(entry) = self.table.get_mut(&tunnel_id) {
            entry.iface = Some(iface);
            entry.expires = now + TUNNEL_TIMEOUT;
            return;
        }

        let entry =
            TunnelEntry { iface: Some(iface), expires: now + TUNNEL_TIMEOUT, paths: Vec::new() };
        if self.table.insert_or_evict_oldest(tunnel_id, entry, |held| held.expires).is_some() {
            log::debug!("tunnel table full, evicted oldest");
        }
    }

    pub fn get(&self, tunnel_id: &AddressHash) -> Option<&TunnelEntry> {
        self.table.get(tunnel_id)
    }

    pub fn get_mut(&mut self, tunnel_id: &AddressHash) -> Option<&mut TunnelEntry> {
        self.table.get_mut(tunnel_id)
    }

    /// The interface dropped; keep the entry until it expires.
    pub fn detach_interface(&mut self, iface: &AddressHash) {
        for entry in self.table.values_mut() {
            if entry.iface == Some(*iface) {
                entry.iface = None;
            }
        }
    }

    pub fn record_path(
        &mut self,
        tunnel_id: &AddressHash,
        destination: AddressHash,
        received_from: AddressHash,
        hops: u8,
        expires: f64,
    ) {
        let Some(entry) = self.table.get_mut(tunnel_id) else {
            return;
        };
        if let Some(path) = entry.paths.iter_mut().find(|path| path.destination == destination) {
            path.received_from = received_from;
            path.hops = hops;
            path.expires = expires;
            return;
        }
        entry.paths.push(TunnelPath { destination, received_from, hops, expires });
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AddressHash, &TunnelEntry)> {
        self.table.iter()
    }

    /// Drop expired tunnels and stale sub-paths of live ones.
    pub fn cull(&mut self, now: f64) {
        self.table.retain(|tunnel_id, entry| {
            entry.paths.retain(|path| path.expires > now);
            let keep = entry.expires > now || entry.iface.is_some();
            if !keep {
                log::debug!("tunnel {} expired", tunnel_id);
            }
            keep
        });
    }

    pub fn restore(&mut self, tunnel_id: AddressHash, entry: TunnelEntry) {
        let _ = self.table.insert(tunnel_id, entry);
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use rns_core::hash::AddressHash;

    use super::TunnelTable;
    use crate::transport::config::TUNNEL_TIMEOUT;

    #[test]
    fn detached_tunnels_expire_but_attached_ones_stay() {
        let mut table = TunnelTable::new(4);
        let tunnel = AddressHash::new_from_rand(OsRng);
        let iface = AddressHash::new_from_rand(OsRng);
        table.register(tunnel, iface, 100.0);

        table.cull(100.0 + TUNNEL_TIMEOUT + 1.0);
        assert!(table.get(&tunnel).is_some(), "attached tunnel must survive");

        table.detach_interface(&iface);
        table.cull(100.0 + TUNNEL_TIMEOUT + 1.0);
        assert!(table.get(&tunnel).is_none());
    }

    #[test]
    fn stale_sub_paths_are_trimmed() {
        let mut table = TunnelTable::new(4);
        let tunnel = AddressHash::new_from_rand(OsRng);
        table.register(tunnel, AddressHash::new_from_rand(OsRng), 100.0);

        table.record_path(
            &tunnel,
            AddressHash::new_from_rand(OsRng),
            AddressHash::new_from_rand(OsRng),
            2,
            150.0,
        );
        table.record_path(
            &tunnel,
            AddressHash::new_from_rand(OsRng),
            AddressHash::new_from_rand(OsRng),
            3,
            500.0,
        );

        table.cull(200.0);
        assert_eq!(table.get(&tunnel).expect("tunnel").paths.len(), 1);
    }
}

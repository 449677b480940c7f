use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf as SerdeBytes;

use rns_core::error::RnsError;
use rns_core::hash::{AddressHash, Hash};
use rns_core::identity::PrivateIdentity;

use crate::storage::Storage;
use crate::transport::hashlist::PacketHashlist;
use crate::transport::path_table::{PathEntry, PathTable};
use crate::transport::tunnels::{TunnelEntry, TunnelPath, TunnelTable};

pub const DESTINATION_TABLE_PATH: &str = "storage/destination_table";
pub const TUNNELS_PATH: &str = "storage/tunnels";
pub const HASHLIST_PATH: &str = "storage/packet_hashlist";
pub const TRANSPORT_IDENTITY_PATH: &str = "storage/transport_identity";

/// Serialised tables are prefixed with a CRC of the payload. The same CRC
/// gates writes: unchanged state is not rewritten, which matters on
/// flash-backed targets.
fn write_gated(
    storage: &mut dyn Storage,
    path: &str,
    payload: &[u8],
    last_crc: &mut Option<u32>,
) -> Result<bool, RnsError> {
    let crc = crc32fast::hash(payload);
    if *last_crc == Some(crc) {
        return Ok(false);
    }

    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&crc.to_be_bytes());
    framed.extend_from_slice(payload);
    storage.write_file(path, &framed)?;
    *last_crc = Some(crc);
    Ok(true)
}

fn read_gated(storage: &dyn Storage, path: &str) -> Option<Vec<u8>> {
    let framed = storage.read_file(path).ok()?;
    if framed.len() < 4 {
        return None;
    }
    let crc = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]);
    let payload = &framed[4..];
    if crc32fast::hash(payload) != crc {
        log::warn!("{}: checksum mismatch, discarding", path);
        return None;
    }
    Some(payload.to_vec())
}

#[derive(Serialize, Deserialize)]
struct PersistedPath {
    destination: SerdeBytes,
    received_from: SerdeBytes,
    hops: u8,
    iface: SerdeBytes,
    timestamp: f64,
    expires: f64,
    emitted: u64,
    random_blobs: Vec<SerdeBytes>,
    packet_hash: SerdeBytes,
}

pub fn save_paths(
    storage: &mut dyn Storage,
    paths: &PathTable,
    last_crc: &mut Option<u32>,
) -> Result<bool, RnsError> {
    let records: Vec<PersistedPath> = paths
        .iter()
        .map(|(destination, entry)| PersistedPath {
            destination: SerdeBytes::from(destination.as_slice().to_vec()),
            received_from: SerdeBytes::from(entry.received_from.as_slice().to_vec()),
            hops: entry.hops,
            iface: SerdeBytes::from(entry.iface.as_slice().to_vec()),
            timestamp: entry.timestamp,
            expires: entry.expires,
            emitted: entry.emitted,
            random_blobs: entry
                .random_blobs
                .iter()
                .map(|blob| SerdeBytes::from(blob.to_vec()))
                .collect(),
            packet_hash: SerdeBytes::from(entry.packet_hash.as_slice().to_vec()),
        })
        .collect();

    let payload = rmp_serde::to_vec_named(&records).map_err(|_| RnsError::StorageError)?;
    write_gated(storage, DESTINATION_TABLE_PATH, &payload, last_crc)
}

/// Restore the path table. Entries referencing unknown interfaces or
/// missing cached announce packets are invalid and skipped.
pub fn load_paths<I, C>(
    storage: &dyn Storage,
    iface_registered: I,
    packet_cached: C,
) -> Vec<(AddressHash, PathEntry)>
where
    I: Fn(&AddressHash) -> bool,
    C: Fn(&Hash) -> bool,
{
    let Some(payload) = read_gated(storage, DESTINATION_TABLE_PATH) else {
        return Vec::new();
    };
    let Ok(records) = rmp_serde::from_slice::<Vec<PersistedPath>>(&payload) else {
        log::warn!("destination table: undecodable, starting empty");
        return Vec::new();
    };

    let mut out = Vec::new();
    for record in records {
        let Ok(destination) = AddressHash::try_from_slice(record.destination.as_ref()) else {
            continue;
        };
        let Ok(received_from) = AddressHash::try_from_slice(record.received_from.as_ref()) else {
            continue;
        };
        let Ok(iface) = AddressHash::try_from_slice(record.iface.as_ref()) else {
            continue;
        };
        let Ok(packet_hash) = Hash::try_from_slice(record.packet_hash.as_ref()) else {
            continue;
        };

        if !iface_registered(&iface) {
            log::warn!("skipping persisted path to {}: interface unknown", destination);
            continue;
        }
        if !packet_cached(&packet_hash) {
            log::warn!("skipping persisted path to {}: announce not cached", destination);
            continue;
        }

        let mut random_blobs = VecDeque::new();
        for blob in &record.random_blobs {
            if blob.len() == 10 {
                let mut bytes = [0u8; 10];
                bytes.copy_from_slice(blob.as_ref());
                random_blobs.push_back(bytes);
            }
        }

        out.push((
            destination,
            PathEntry {
                timestamp: record.timestamp,
                received_from,
                hops: record.hops,
                iface,
                expires: record.expires,
                emitted: record.emitted,
                random_blobs,
                packet_hash,
            },
        ));
    }
    out
}

#[derive(Serialize, Deserialize)]
struct PersistedTunnelPath {
    destination: SerdeBytes,
    received_from: SerdeBytes,
    hops: u8,
    expires: f64,
}

#[derive(Serialize, Deserialize)]
struct PersistedTunnel {
    tunnel_id: SerdeBytes,
    expires: f64,
    paths: Vec<PersistedTunnelPath>,
}

pub fn save_tunnels(
    storage: &mut dyn Storage,
    tunnels: &TunnelTable,
    last_crc: &mut Option<u32>,
) -> Result<bool, RnsError> {
    let records: Vec<PersistedTunnel> = tunnels
        .iter()
        .map(|(tunnel_id, entry)| PersistedTunnel {
            tunnel_id: SerdeBytes::from(tunnel_id.as_slice().to_vec()),
            expires: entry.expires,
            paths: entry
                .paths
                .iter()
                .map(|path| PersistedTunnelPath {
                    destination: SerdeBytes::from(path.destination.as_slice().to_vec()),
                    received_from: SerdeBytes::from(path.received_from.as_slice().to_vec()),
                    hops: path.hops,
                    expires: path.expires,
                })
                .collect(),
        })
        .collect();

    let payload = rmp_serde::to_vec_named(&records).map_err(|_| RnsError::StorageError)?;
    write_gated(storage, TUNNELS_PATH, &payload, last_crc)
}

pub fn load_tunnels(storage: &dyn Storage, tunnels: &mut TunnelTable) {
    let Some(payload) = read_gated(storage, TUNNELS_PATH) else {
        return;
    };
    let Ok(records) = rmp_serde::from_slice::<Vec<PersistedTunnel>>(&payload) else {
        log::warn!("tunnel table: undecodable, starting empty");
        return;
    };

    for record in records {
        let Ok(tunnel_id) = AddressHash::try_from_slice(record.tunnel_id.as_ref()) else {
            continue;
        };
        let mut paths = Vec::new();
        for path in &record.paths {
            let (Ok(destination), Ok(received_from)) = (
                AddressHash::try_from_slice(path.destination.as_ref()),
                AddressHash::try_from_slice(path.received_from.as_ref()),
            ) else {
                continue;
            };
            paths.push(TunnelPath {
                destination,
                received_from,
                hops: path.hops,
                expires: path.expires,
            });
        }
        tunnels.restore(tunnel_id, TunnelEntry { iface: None, expires: record.expires, paths });
    }
}

pub fn save_hashlist(
    storage: &mut dyn Storage,
    hashlist: &PacketHashlist,
    last_crc: &mut Option<u32>,
) -> Result<bool, RnsError> {
    let records: Vec<SerdeBytes> = hashlist
        .snapshot()
        .iter()
        .map(|hash| SerdeBytes::from(hash.as_slice().to_vec()))
        .collect();
    let payload = rmp_serde::to_vec(&records).map_err(|_| RnsError::StorageError)?;
    write_gated(storage, HASHLIST_PATH, &payload, last_crc)
}

pub fn load_hashlist(storage: &dyn Storage, hashlist: &mut PacketHashlist) {
    let Some(payload) = read_gated(storage, HASHLIST_PATH) else {
        return;
    };
    let Ok(records) = rmp_serde::from_slice::<Vec<SerdeBytes>>(&payload) else {
        return;
    };
    for record in records {
        if let Ok(hash) = Hash::try_from_slice(record.as_ref()) {
            hashlist.insert(hash);
        }
    }
}

pub fn save_transport_identity(
    storage: &mut dyn Storage,
    identity: &PrivateIdentity,
) -> Result<(), RnsError> {
    storage.write_file(TRANSPORT_IDENTITY_PATH, &identity.to_private_key_bytes())
}

pub fn load_transport_identity(storage: &dyn Storage) -> Option<PrivateIdentity> {
    let bytes = storage.read_file(TRANSPORT_IDENTITY_PATH).ok()?;
    PrivateIdentity::from_private_key_bytes(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use rns_core::buffer::ByteBuf;
    use rns_core::hash::AddressHash;
    use rns_core::identity::PrivateIdentity;

    use super::{
        load_hashlist, load_paths, load_transport_identity, save_hashlist, save_paths,
        save_transport_identity,
    };
    use crate::iface::InterfaceMode;
    use crate::packet::{Header, Packet, PacketType};
    use crate::storage::{MemoryStorage, Storage};
    use crate::transport::hashlist::PacketHashlist;
    use crate::transport::path_table::PathTable;

    fn populated_paths(iface: AddressHash) -> PathTable {
        let mut table = PathTable::new(8);
        let announce = Packet {
            header: Header { packet_type: PacketType::Announce, ..Default::default() },
            ifac: None,
            destination: AddressHash::new_from_rand(OsRng),
            transport: None,
            context: crate::packet::PacketContext::None,
            data: ByteBuf::from_slice(b"persisted"),
        };
        table.handle_announce(
            &announce,
            2,
            500,
            [7u8; 10],
            AddressHash::new_from_rand(OsRng),
            iface,
            InterfaceMode::Full,
            1000.0,
        );
        table
    }

    #[test]
    fn paths_roundtrip_and_crc_gates_rewrites() {
        let mut storage = MemoryStorage::new();
        let iface = AddressHash::new_from_rand(OsRng);
        let table = populated_paths(iface);

        let mut crc = None;
        assert!(save_paths(&mut storage, &table, &mut crc).expect("save"));
        // Unchanged state does not hit storage again.
        assert!(!save_paths(&mut storage, &table, &mut crc).expect("save"));

        let restored = load_paths(&storage, |_| true, |_| true);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].1.hops, 2);
        assert_eq!(restored[0].1.emitted, 500);
    }

    #[test]
    fn paths_with_unknown_interfaces_are_skipped() {
        let mut storage = MemoryStorage::new();
        let table = populated_paths(AddressHash::new_from_rand(OsRng));
        let mut crc = None;
        save_paths(&mut storage, &table, &mut crc).expect("save");

        let restored = load_paths(&storage, |_| false, |_| true);
        assert!(restored.is_empty());
    }

    #[test]
    fn corrupted_file_is_discarded() {
        let mut storage = MemoryStorage::new();
        let table = populated_paths(AddressHash::new_from_rand(OsRng));
        let mut crc = None;
        save_paths(&mut storage, &table, &mut crc).expect("save");

        let mut raw = storage.read_file(super::DESTINATION_TABLE_PATH).expect("read");
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        storage.write_file(super::DESTINATION_TABLE_PATH, &raw).expect("write");

        assert!(load_paths(&storage, |_| true, |_| true).is_empty());
    }

    #[test]
    fn hashlist_roundtrip() {
        let mut storage = MemoryStorage::new();
        let mut list = PacketHashlist::new(8);
        for seed in 0..4u8 {
            list.insert(rns_core::hash::Hash::new_from_slice(&[seed]));
        }

        let mut crc = None;
        save_hashlist(&mut storage, &list, &mut crc).expect("save");

        let mut restored = PacketHashlist::new(8);
        load_hashlist(&storage, &mut restored);
        assert_eq!(restored.len(), 4);
    }

    #[test]
    fn transport_identity_roundtrip() {
        let mut storage = MemoryStorage::new();
        let identity = PrivateIdentity::new_from_rand(OsRng);
        save_transport_identity(&mut storage, &identity).expect("save");

        let restored = load_transport_identity(&storage).expect("identity");
        assert_eq!(restored.address_hash(), identity.address_hash());
    }
}

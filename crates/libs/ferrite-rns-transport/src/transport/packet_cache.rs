use rns_core::error::RnsError;
use rns_core::hash::Hash;

use crate::packet::Packet;
use crate::storage::Storage;

pub const CACHE_DIR: &str = "cache";

/// On-disk cache of cacheable packets (announces and proofs), one file
/// per packet keyed by the hex packet hash.
pub struct PacketCache;

impl PacketCache {
    fn path_for(hash: &Hash) -> String {
        format!("{}/{}", CACHE_DIR, hex::encode(hash.as_slice()))
    }

    pub fn store(storage: &mut dyn Storage, packet: &Packet) -> Result<(), RnsError> {
        let raw = packet.to_bytes()?;
        storage.write_file(&Self::path_for(&packet.hash()), &raw)
    }

    pub fn load(storage: &dyn Storage, hash: &Hash) -> Option<Packet> {
        let raw = storage.read_file(&Self::path_for(hash)).ok()?;
        match Packet::from_bytes(&raw) {
            Ok(packet) => Some(packet),
            Err(_) => {
                log::warn!("corrupt cached packet {}", hash);
                None
            }
        }
    }

    pub fn contains(storage: &dyn Storage, hash: &Hash) -> bool {
        storage.file_exists(&Self::path_for(hash))
    }

    pub fn remove(storage: &mut dyn Storage, hash: &Hash) {
        let _ = storage.remove_file(&Self::path_for(hash));
    }

    /// Startup sweep: delete cache files no current path entry refers to.
    pub fn clean<F>(storage: &mut dyn Storage, is_referenced: F)
    where
        F: Fn(&Hash) -> bool,
    {
        let Ok(names) = storage.list_directory(CACHE_DIR) else {
            return;
        };

        let mut removed = 0usize;
        for name in names {
            let keep = hex::decode(&name)
                .ok()
                .and_then(|bytes| Hash::try_from_slice(&bytes).ok())
                .map(|hash| is_referenced(&hash))
                .unwrap_or(false);
            if !keep {
                let _ = storage.remove_file(&format!("{}/{}", CACHE_DIR, name));
                removed += 1;
            }
        }
        if removed > 0 {
            log::debug!("packet cache: removed {} unreferenced entries", removed);
        }
    }
}

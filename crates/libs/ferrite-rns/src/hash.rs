use core::fmt;

use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};

use crate::error::RnsError;

pub const HASH_SIZE: usize = 32;
pub const ADDRESS_HASH_SIZE: usize = 16;

/// Full SHA-256 digest.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct Hash([u8; HASH_SIZE]);

/// Truncated digest used for destination, interface and link addressing.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct AddressHash([u8; ADDRESS_HASH_SIZE]);

impl Hash {
    pub fn generator() -> Sha256 {
        Sha256::new()
    }

    pub const fn new(digest: [u8; HASH_SIZE]) -> Self {
        Self(digest)
    }

    pub const fn new_empty() -> Self {
        Self([0u8; HASH_SIZE])
    }

    pub fn new_from_slice(data: &[u8]) -> Self {
        Self(Sha256::new().chain_update(data).finalize().into())
    }

    pub fn new_from_rand<R: CryptoRngCore>(mut rng: R) -> Self {
        let mut seed = [0u8; HASH_SIZE];
        rng.fill_bytes(&mut seed);
        Self::new_from_slice(&seed)
    }

    pub fn try_from_slice(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < HASH_SIZE {
            return Err(RnsError::IncorrectHash);
        }
        let mut digest = [0u8; HASH_SIZE];
        digest.copy_from_slice(&data[..HASH_SIZE]);
        Ok(Self(digest))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; HASH_SIZE] {
        self.0
    }

    pub fn truncated(&self) -> AddressHash {
        AddressHash::new_from_hash(self)
    }
}

impl AddressHash {
    pub const fn new(bytes: [u8; ADDRESS_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn new_empty() -> Self {
        Self([0u8; ADDRESS_HASH_SIZE])
    }

    pub fn new_from_slice(data: &[u8]) -> Self {
        Hash::new_from_slice(data).truncated()
    }

    pub fn new_from_hash(hash: &Hash) -> Self {
        let mut bytes = [0u8; ADDRESS_HASH_SIZE];
        bytes.copy_from_slice(&hash.0[..ADDRESS_HASH_SIZE]);
        Self(bytes)
    }

    pub fn new_from_rand<R: CryptoRngCore>(rng: R) -> Self {
        Hash::new_from_rand(rng).truncated()
    }

    pub fn try_from_slice(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < ADDRESS_HASH_SIZE {
            return Err(RnsError::IncorrectHash);
        }
        let mut bytes = [0u8; ADDRESS_HASH_SIZE];
        bytes.copy_from_slice(&data[..ADDRESS_HASH_SIZE]);
        Ok(Self(bytes))
    }

    pub fn new_from_hex_string(hex_string: &str) -> Result<Self, RnsError> {
        let decoded = hex::decode(hex_string).map_err(|_| RnsError::IncorrectHash)?;
        Self::try_from_slice(&decoded)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_HASH_SIZE] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    pub fn to_hex_string(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<Hash> for AddressHash {
    fn from(hash: Hash) -> Self {
        Self::new_from_hash(&hash)
    }
}

impl Default for AddressHash {
    fn default() -> Self {
        Self::new_empty()
    }
}

impl fmt::Display for AddressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", hex::encode(self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{AddressHash, Hash};

    #[test]
    fn address_hex_roundtrip() {
        let original = AddressHash::new_from_rand(OsRng);
        let decoded = AddressHash::new_from_hex_string(&original.to_hex_string()).expect("hash");
        assert_eq!(decoded, original);
    }

    #[test]
    fn truncation_takes_leading_bytes() {
        let hash = Hash::new_from_slice(b"truncate me");
        let address = hash.truncated();
        assert_eq!(address.as_slice(), &hash.as_slice()[..16]);
    }

    #[test]
    fn short_slice_is_rejected() {
        assert!(AddressHash::try_from_slice(&[0u8; 4]).is_err());
        assert!(Hash::try_from_slice(&[0u8; 16]).is_err());
    }
}

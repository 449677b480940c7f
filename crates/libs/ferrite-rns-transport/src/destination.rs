pub mod link;

use core::fmt;
use core::marker::PhantomData;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, SIGNATURE_LENGTH};
use rand_core::{CryptoRngCore, OsRng};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use serde_bytes::ByteBuf as SerdeBytes;
use x25519_dalek::{PublicKey, StaticSecret};

use rns_core::buffer::ByteBuf;
use rns_core::error::RnsError;
use rns_core::hash::{AddressHash, Hash};
use rns_core::identity::{
    decrypt_with_private_key, encrypt_for_public_key, EmptyIdentity, HashIdentity, Identity,
    PrivateIdentity, PUBLIC_KEY_LENGTH,
};
use rns_core::time::now_secs;

use crate::packet::{
    ContextFlag, DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext, PacketType,
    PropagationType,
};

pub const NAME_HASH_LENGTH: usize = 10;
pub const RAND_HASH_LENGTH: usize = 10;
pub const RATCHET_LENGTH: usize = PUBLIC_KEY_LENGTH;
pub const MIN_ANNOUNCE_DATA_LENGTH: usize =
    PUBLIC_KEY_LENGTH * 2 + NAME_HASH_LENGTH + RAND_HASH_LENGTH + SIGNATURE_LENGTH;

const DEFAULT_RATCHET_INTERVAL_SECS: u64 = 30 * 60;
const DEFAULT_RETAINED_RATCHETS: usize = 128;

//***************************************************************************//

pub trait Direction {}

pub struct Input;
pub struct Output;

impl Direction for Input {}
impl Direction for Output {}

pub trait Type {
    fn destination_type() -> DestinationType;
}

pub struct Single;
pub struct Plain;
pub struct Group;

impl Type for Single {
    fn destination_type() -> DestinationType {
        DestinationType::Single
    }
}

impl Type for Plain {
    fn destination_type() -> DestinationType {
        DestinationType::Plain
    }
}

impl Type for Group {
    fn destination_type() -> DestinationType {
        DestinationType::Group
    }
}

//***************************************************************************//

/// Proof emission policy for inbound DATA packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStrategy {
    ProveNone,
    ProveAll,
    ProveApp,
}

#[derive(Copy, Clone)]
pub struct DestinationName {
    pub hash: Hash,
}

impl DestinationName {
    pub fn new(app_name: &str, aspects: &str) -> Self {
        let hash = Hash::new(
            Hash::generator()
                .chain_update(app_name.as_bytes())
                .chain_update(".".as_bytes())
                .chain_update(aspects.as_bytes())
                .finalize()
                .into(),
        );
        Self { hash }
    }

    pub fn new_from_hash_slice(hash_slice: &[u8]) -> Self {
        let mut hash = [0u8; 32];
        let len = hash_slice.len().min(32);
        hash[..len].copy_from_slice(&hash_slice[..len]);
        Self { hash: Hash::new(hash) }
    }

    pub fn as_name_hash_slice(&self) -> &[u8] {
        &self.hash.as_slice()[..NAME_HASH_LENGTH]
    }
}

#[derive(Copy, Clone)]
pub struct DestinationDesc {
    pub identity: Identity,
    pub address_hash: AddressHash,
    pub name: DestinationName,
}

impl fmt::Display for DestinationDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address_hash)
    }
}

pub fn create_address_hash<I: HashIdentity>(identity: &I, name: &DestinationName) -> AddressHash {
    Hash::new(
        Hash::generator()
            .chain_update(name.as_name_hash_slice())
            .chain_update(identity.as_address_hash_slice())
            .finalize()
            .into(),
    )
    .truncated()
}

//***************************************************************************//

/// Validated contents of an inbound announce.
pub struct AnnounceInfo<'a> {
    pub identity: Identity,
    pub name_hash: [u8; NAME_HASH_LENGTH],
    pub random_blob: [u8; RAND_HASH_LENGTH],
    pub app_data: &'a [u8],
    pub ratchet: Option<[u8; RATCHET_LENGTH]>,
}

impl AnnounceInfo<'_> {
    /// Emission timestamp carried in the trailing five bytes of the random
    /// blob, big-endian unix seconds.
    pub fn emitted(&self) -> u64 {
        emission_timestamp(&self.random_blob)
    }
}

pub fn emission_timestamp(random_blob: &[u8; RAND_HASH_LENGTH]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[3..8].copy_from_slice(&random_blob[RAND_HASH_LENGTH / 2..]);
    u64::from_be_bytes(bytes)
}

/// Check an announce packet: parse the key material, recompute the
/// destination hash, and verify the signature over the announced fields.
pub fn validate_announce(packet: &Packet) -> Result<AnnounceInfo<'_>, RnsError> {
    if packet.header.packet_type != PacketType::Announce {
        return Err(RnsError::PacketError);
    }

    let announce_data = packet.data.as_slice();
    if announce_data.len() < MIN_ANNOUNCE_DATA_LENGTH {
        return Err(RnsError::PacketError);
    }

    let mut offset = 0usize;

    let identity = Identity::new_from_slices(
        &announce_data[offset..offset + PUBLIC_KEY_LENGTH],
        &announce_data[offset + PUBLIC_KEY_LENGTH..offset + PUBLIC_KEY_LENGTH * 2],
    )?;
    offset += PUBLIC_KEY_LENGTH * 2;

    let mut name_hash = [0u8; NAME_HASH_LENGTH];
    name_hash.copy_from_slice(&announce_data[offset..offset + NAME_HASH_LENGTH]);
    offset += NAME_HASH_LENGTH;

    let mut random_blob = [0u8; RAND_HASH_LENGTH];
    random_blob.copy_from_slice(&announce_data[offset..offset + RAND_HASH_LENGTH]);
    offset += RAND_HASH_LENGTH;

    let expected_hash =
        create_address_hash(&identity, &DestinationName::new_from_hash_slice(&name_hash));
    if expected_hash != packet.destination {
        log::debug!(
            "announce: destination mismatch, expected {} got {}",
            expected_hash,
            packet.destination
        );
        return Err(RnsError::IncorrectHash);
    }

    let has_ratchet = packet.header.context_flag == ContextFlag::Set;
    let remaining = announce_data.len() - offset;

    let ratchet = if has_ratchet {
        if remaining < RATCHET_LENGTH + SIGNATURE_LENGTH {
            return Err(RnsError::PacketError);
        }
        let mut ratchet = [0u8; RATCHET_LENGTH];
        ratchet.copy_from_slice(&announce_data[offset..offset + RATCHET_LENGTH]);
        offset += RATCHET_LENGTH;
        Some(ratchet)
    } else {
        None
    };

    let signature = Signature::from_slice(&announce_data[offset..offset + SIGNATURE_LENGTH])
        .map_err(|_| RnsError::CryptoError)?;
    offset += SIGNATURE_LENGTH;
    let app_data = &announce_data[offset..];

    let mut signed_data = Vec::with_capacity(announce_data.len() + 16);
    signed_data.extend_from_slice(packet.destination.as_slice());
    signed_data.extend_from_slice(identity.public_key_bytes());
    signed_data.extend_from_slice(identity.verifying_key_bytes());
    signed_data.extend_from_slice(&name_hash);
    signed_data.extend_from_slice(&random_blob);
    if let Some(ratchet) = &ratchet {
        signed_data.extend_from_slice(ratchet);
    }
    signed_data.extend_from_slice(app_data);

    identity.verify(&signed_data, &signature)?;

    Ok(AnnounceInfo { identity, name_hash, random_blob, app_data, ratchet })
}

//***************************************************************************//

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRatchets {
    signature: SerdeBytes,
    ratchets: SerdeBytes,
}

/// Rotating ratchet secrets for a local destination. Bounded circular
/// retention; the newest key is announced, older keys keep decrypting
/// in-flight traffic.
struct RatchetState {
    enabled: bool,
    ratchets: Vec<[u8; RATCHET_LENGTH]>,
    ratchets_path: Option<PathBuf>,
    ratchet_interval_secs: u64,
    retained_ratchets: usize,
    latest_ratchet_time: f64,
    enforce_ratchets: bool,
}

impl Default for RatchetState {
    fn default() -> Self {
        Self {
            enabled: false,
            ratchets: Vec::new(),
            ratchets_path: None,
            ratchet_interval_secs: DEFAULT_RATCHET_INTERVAL_SECS,
            retained_ratchets: DEFAULT_RETAINED_RATCHETS,
            latest_ratchet_time: 0.0,
            enforce_ratchets: false,
        }
    }
}

impl RatchetState {
    fn enable(&mut self, identity: &PrivateIdentity, path: PathBuf) -> Result<(), RnsError> {
        self.reload(identity, &path)?;
        self.enabled = true;
        self.ratchets_path = Some(path);
        Ok(())
    }

    fn reload(&mut self, identity: &PrivateIdentity, path: &Path) -> Result<(), RnsError> {
        if !path.exists() {
            self.ratchets = Vec::new();
            return self.persist(identity, path);
        }

        let data = std::fs::read(path).map_err(|_| RnsError::StorageError)?;
        let persisted: PersistedRatchets =
            rmp_serde::from_slice(&data).map_err(|_| RnsError::StorageError)?;
        let signature = Signature::from_slice(persisted.signature.as_ref())
            .map_err(|_| RnsError::CryptoError)?;
        identity.verify(persisted.ratchets.as_ref(), &signature)?;

        let decoded: Vec<SerdeBytes> =
            rmp_serde::from_slice(persisted.ratchets.as_ref()).map_err(|_| RnsError::StorageError)?;
        self.ratchets = decoded
            .iter()
            .filter(|ratchet| ratchet.len() == RATCHET_LENGTH)
            .map(|ratchet| {
                let mut bytes = [0u8; RATCHET_LENGTH];
                bytes.copy_from_slice(ratchet.as_ref());
                bytes
            })
            .collect();
        Ok(())
    }

    fn persist(&self, identity: &PrivateIdentity, path: &Path) -> Result<(), RnsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|_| RnsError::StorageError)?;
        }
        let list: Vec<SerdeBytes> =
            self.ratchets.iter().map(|bytes| SerdeBytes::from(bytes.to_vec())).collect();
        let packed = rmp_serde::to_vec(&list).map_err(|_| RnsError::StorageError)?;
        let signature = identity.sign(&packed).to_bytes();
        let persisted = PersistedRatchets {
            signature: SerdeBytes::from(signature.to_vec()),
            ratchets: SerdeBytes::from(packed),
        };
        let encoded = rmp_serde::to_vec(&persisted).map_err(|_| RnsError::StorageError)?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, encoded).map_err(|_| RnsError::StorageError)?;
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        std::fs::rename(&tmp_path, path).map_err(|_| RnsError::StorageError)
    }

    fn rotate_if_needed(&mut self, identity: &PrivateIdentity, now: f64) -> Result<(), RnsError> {
        if !self.enabled {
            return Ok(());
        }
        if self.ratchets.is_empty() || now > self.latest_ratchet_time + self.ratchet_interval_secs as f64
        {
            let secret = StaticSecret::random_from_rng(OsRng);
            self.ratchets.insert(0, secret.to_bytes());
            self.latest_ratchet_time = now;
            if self.ratchets.len() > self.retained_ratchets {
                self.ratchets.truncate(self.retained_ratchets);
            }
            if let Some(path) = self.ratchets_path.clone() {
                self.persist(identity, &path)?;
            }
        }
        Ok(())
    }

    fn current_ratchet_public(&self) -> Option<[u8; RATCHET_LENGTH]> {
        let ratchet = self.ratchets.first()?;
        let secret = StaticSecret::from(*ratchet);
        Some(*PublicKey::from(&secret).as_bytes())
    }
}

//***************************************************************************//

pub struct Destination<I: HashIdentity, D: Direction, T: Type> {
    pub direction: PhantomData<D>,
    pub r#type: PhantomData<T>,
    pub identity: I,
    pub desc: DestinationDesc,
    pub accepts_links: bool,
    pub proof_strategy: ProofStrategy,
    ratchet_state: RatchetState,
}

impl<I: HashIdentity, D: Direction, T: Type> Destination<I, D, T> {
    pub fn destination_type(&self) -> DestinationType {
        <T as Type>::destination_type()
    }
}

pub type SingleInputDestination = Destination<PrivateIdentity, Input, Single>;
pub type SingleOutputDestination = Destination<Identity, Output, Single>;
pub type PlainInputDestination = Destination<EmptyIdentity, Input, Plain>;
pub type PlainOutputDestination = Destination<EmptyIdentity, Output, Plain>;

impl SingleInputDestination {
    pub fn new(identity: PrivateIdentity, name: DestinationName) -> Self {
        let address_hash = create_address_hash(&identity, &name);
        let pub_identity = *identity.as_identity();
        Self {
            direction: PhantomData,
            r#type: PhantomData,
            identity,
            desc: DestinationDesc { identity: pub_identity, name, address_hash },
            accepts_links: false,
            proof_strategy: ProofStrategy::ProveNone,
            ratchet_state: RatchetState::default(),
        }
    }

    pub fn set_proof_strategy(&mut self, strategy: ProofStrategy) {
        self.proof_strategy = strategy;
    }

    pub fn set_accepts_links(&mut self, accepts: bool) {
        self.accepts_links = accepts;
    }

    pub fn enable_ratchets<P: AsRef<Path>>(&mut self, path: P) -> Result<(), RnsError> {
        self.ratchet_state.enable(&self.identity, path.as_ref().to_path_buf())
    }

    pub fn enforce_ratchets(&mut self, enforce: bool) {
        self.ratchet_state.enforce_ratchets = enforce;
    }

    pub fn set_retained_ratchets(&mut self, retained: usize) -> Result<(), RnsError> {
        if retained == 0 {
            return Err(RnsError::InvalidArgument);
        }
        self.ratchet_state.retained_ratchets = retained;
        self.ratchet_state.ratchets.truncate(retained);
        Ok(())
    }

    pub fn set_ratchet_interval_secs(&mut self, secs: u64) -> Result<(), RnsError> {
        if secs == 0 {
            return Err(RnsError::InvalidArgument);
        }
        self.ratchet_state.ratchet_interval_secs = secs;
        Ok(())
    }

    /// Decrypt an inbound single-destination payload, trying current
    /// ratchets before the long-term key. The flag in the result reports
    /// whether a ratchet decrypted it.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, bool), RnsError> {
        let salt = self.desc.address_hash;
        if self.ratchet_state.enabled && !self.ratchet_state.ratchets.is_empty() {
            for ratchet in &self.ratchet_state.ratchets {
                let secret = StaticSecret::from(*ratchet);
                if let Ok(plaintext) =
                    decrypt_with_private_key(&secret, salt.as_slice(), ciphertext)
                {
                    return Ok((plaintext, true));
                }
            }
            if self.ratchet_state.enforce_ratchets {
                return Err(RnsError::CryptoError);
            }
        }

        let plaintext = self.identity.decrypt(ciphertext, salt.as_slice())?;
        Ok((plaintext, false))
    }

    pub fn announce<R: CryptoRngCore + Copy>(
        &mut self,
        rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, RnsError> {
        self.announce_with_context(rng, app_data, PacketContext::None)
    }

    pub fn path_response<R: CryptoRngCore + Copy>(
        &mut self,
        rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, RnsError> {
        self.announce_with_context(rng, app_data, PacketContext::PathResponse)
    }

    fn announce_with_context<R: CryptoRngCore + Copy>(
        &mut self,
        rng: R,
        app_data: Option<&[u8]>,
        context: PacketContext,
    ) -> Result<Packet, RnsError> {
        // Python Reticulum encodes announce randomness as 5 random bytes
        // followed by a 5-byte big-endian unix timestamp. The timestamp is
        // the freshness tiebreaker for the path-update rule, so the layout
        // must match the reference wire exactly.
        let mut random_blob = [0u8; RAND_HASH_LENGTH];
        let mut rng_mut = rng;
        rng_mut.fill_bytes(&mut random_blob[..RAND_HASH_LENGTH / 2]);
        let emitted = (now_secs().floor() as u64).to_be_bytes();
        random_blob[RAND_HASH_LENGTH / 2..].copy_from_slice(&emitted[3..8]);

        let ratchet = if self.ratchet_state.enabled {
            self.ratchet_state.rotate_if_needed(&self.identity, now_secs())?;
            self.ratchet_state.current_ratchet_public()
        } else {
            None
        };

        let public_key = self.desc.identity.public_key_bytes();
        let verifying_key = self.desc.identity.verifying_key_bytes();

        let mut signed_data = Vec::with_capacity(256);
        signed_data.extend_from_slice(self.desc.address_hash.as_slice());
        signed_data.extend_from_slice(public_key);
        signed_data.extend_from_slice(verifying_key);
        signed_data.extend_from_slice(self.desc.name.as_name_hash_slice());
        signed_data.extend_from_slice(&random_blob);
        if let Some(ratchet) = &ratchet {
            signed_data.extend_from_slice(ratchet);
        }
        if let Some(data) = app_data {
            signed_data.extend_from_slice(data);
        }
        let signature = self.identity.sign(&signed_data);

        let mut packet_data = ByteBuf::from_slice(public_key);
        packet_data.append(verifying_key);
        packet_data.append(self.desc.name.as_name_hash_slice());
        packet_data.append(&random_blob);
        if let Some(ratchet) = &ratchet {
            packet_data.append(ratchet);
        }
        packet_data.append(&signature.to_bytes());
        if let Some(data) = app_data {
            packet_data.append(data);
        }
        if !packet_data.is_valid() {
            return Err(RnsError::OutOfMemory);
        }

        Ok(Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type1,
                context_flag: if ratchet.is_some() { ContextFlag::Set } else { ContextFlag::Unset },
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                hops: 0,
            },
            ifac: None,
            destination: self.desc.address_hash,
            transport: None,
            context,
            data: packet_data,
        })
    }
}

impl SingleOutputDestination {
    pub fn new(identity: Identity, name: DestinationName) -> Self {
        let address_hash = create_address_hash(&identity, &name);
        Self {
            direction: PhantomData,
            r#type: PhantomData,
            identity,
            desc: DestinationDesc { identity, name, address_hash },
            accepts_links: false,
            proof_strategy: ProofStrategy::ProveNone,
            ratchet_state: RatchetState::default(),
        }
    }

    /// Encrypt toward this destination with a per-message ephemeral key; a
    /// remembered ratchet key takes precedence over the long-term key.
    pub fn encrypt<R: CryptoRngCore + Copy>(
        &self,
        plaintext: &[u8],
        ratchet: Option<[u8; RATCHET_LENGTH]>,
        rng: R,
    ) -> Result<Vec<u8>, RnsError> {
        let salt = self.desc.address_hash;
        let target = match ratchet {
            Some(key) => PublicKey::from(key),
            None => self.identity.public_key,
        };
        encrypt_for_public_key(&target, salt.as_slice(), plaintext, rng)
    }
}

impl<D: Direction> Destination<EmptyIdentity, D, Plain> {
    pub fn new(identity: EmptyIdentity, name: DestinationName) -> Self {
        let address_hash = create_address_hash(&identity, &name);
        Self {
            direction: PhantomData,
            r#type: PhantomData,
            identity,
            desc: DestinationDesc { identity: Identity::default(), name, address_hash },
            accepts_links: false,
            proof_strategy: ProofStrategy::ProveNone,
            ratchet_state: RatchetState::default(),
        }
    }
}

pub fn new_in(identity: PrivateIdentity, app_name: &str, aspect: &str) -> SingleInputDestination {
    SingleInputDestination::new(identity, DestinationName::new(app_name, aspect))
}

pub fn new_out(identity: Identity, app_name: &str, aspect: &str) -> SingleOutputDestination {
    SingleOutputDestination::new(identity, DestinationName::new(app_name, aspect))
}

/// Symmetric encryption for GROUP destinations sharing a key.
pub fn group_encrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, RnsError> {
    use rns_core::crypt::token::{TokenCipher, TOKEN_MAX_PADDING_SIZE, TOKEN_OVERHEAD_SIZE};
    let cipher = TokenCipher::new_from_slices(&key[..16], &key[16..]);
    let mut out = vec![0u8; data.len() + TOKEN_OVERHEAD_SIZE + TOKEN_MAX_PADDING_SIZE];
    let len = cipher.encrypt(data, &mut out, OsRng)?.len();
    out.truncate(len);
    Ok(out)
}

pub fn group_decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, RnsError> {
    use rns_core::crypt::token::TokenCipher;
    let cipher = TokenCipher::new_from_slices(&key[..16], &key[16..]);
    let mut out = vec![0u8; data.len()];
    let len = cipher.decrypt(data, &mut out)?.len();
    out.truncate(len);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use core::num::Wrapping;

    use rand_core::{CryptoRng, OsRng, RngCore};
    use tempfile::TempDir;

    use rns_core::error::RnsError;
    use rns_core::identity::PrivateIdentity;
    use rns_core::time::now_secs;

    use super::{
        emission_timestamp, validate_announce, DestinationName, SingleInputDestination,
        SingleOutputDestination, RATCHET_LENGTH,
    };

    #[derive(Clone, Copy)]
    struct FixedRng {
        next: Wrapping<u8>,
    }

    impl FixedRng {
        fn new(seed: u8) -> Self {
            Self { next: Wrapping(seed) }
        }
    }

    impl RngCore for FixedRng {
        fn next_u32(&mut self) -> u32 {
            let mut bytes = [0u8; 4];
            self.fill_bytes(&mut bytes);
            u32::from_le_bytes(bytes)
        }

        fn next_u64(&mut self) -> u64 {
            let mut bytes = [0u8; 8];
            self.fill_bytes(&mut bytes);
            u64::from_le_bytes(bytes)
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for slot in dest.iter_mut() {
                *slot = self.next.0;
                self.next += Wrapping(1);
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    impl CryptoRng for FixedRng {}

    fn test_destination() -> SingleInputDestination {
        SingleInputDestination::new(
            PrivateIdentity::new_from_rand(OsRng),
            DestinationName::new("example_utilities", "announcesample.fruits"),
        )
    }

    #[test]
    fn announce_validates() {
        let mut destination = test_destination();
        let announce = destination.announce(OsRng, None).expect("announce");
        let info = validate_announce(&announce).expect("valid announce");
        assert_eq!(info.identity.address_hash, destination.desc.identity.address_hash);
    }

    #[test]
    fn announce_signature_covers_app_data() {
        let mut destination = test_destination();
        let announce = destination.announce(OsRng, Some(b"app data")).expect("announce");

        let mut tampered = announce.clone();
        let offset = 32 + 32 + 10 + 10 + 64;
        let mut bytes = tampered.data.as_slice().to_vec();
        bytes[offset] ^= 0x01;
        tampered.data = rns_core::buffer::ByteBuf::from_slice(&bytes);

        match validate_announce(&tampered) {
            Ok(_) => panic!("tampered app_data must fail"),
            Err(err) => assert_eq!(err, RnsError::IncorrectSignature),
        }
    }

    #[test]
    fn announce_random_blob_layout() {
        let mut destination = test_destination();
        let before = now_secs().floor() as u64;
        let announce = destination.announce(FixedRng::new(0x11), None).expect("announce");
        let after = now_secs().floor() as u64;

        let info = validate_announce(&announce).expect("valid announce");
        assert_eq!(&info.random_blob[..5], &[0x11, 0x12, 0x13, 0x14, 0x15]);

        let emitted = emission_timestamp(&info.random_blob);
        assert!(emitted >= before.saturating_sub(1) && emitted <= after.saturating_add(1));
    }

    #[test]
    fn announce_includes_ratchet_when_enabled() {
        let temp = TempDir::new().expect("temp dir");
        let mut destination = test_destination();
        destination
            .enable_ratchets(temp.path().join("dest.ratchets"))
            .expect("enable ratchets");

        let announce = destination.announce(OsRng, None).expect("announce");
        let info = validate_announce(&announce).expect("valid announce");
        assert!(info.ratchet.is_some());
    }

    #[test]
    fn ratchet_announce_still_decryptable_with_ratchet_key() {
        let temp = TempDir::new().expect("temp dir");
        let mut destination = test_destination();
        destination
            .enable_ratchets(temp.path().join("dest.ratchets"))
            .expect("enable ratchets");
        let announce = destination.announce(OsRng, None).expect("announce");
        let info = validate_announce(&announce).expect("valid announce");
        let ratchet = info.ratchet.expect("ratchet");

        let out_destination =
            SingleOutputDestination::new(info.identity, destination.desc.name);
        let ciphertext = out_destination.encrypt(b"ratcheted", Some(ratchet), OsRng).expect("ct");
        let (plaintext, used_ratchet) = destination.decrypt(&ciphertext).expect("plaintext");
        assert_eq!(plaintext, b"ratcheted");
        assert!(used_ratchet);
    }

    #[test]
    fn plain_payload_without_ratchet_falls_back_to_identity_key() {
        let mut destination = test_destination();
        let out_destination =
            SingleOutputDestination::new(destination.desc.identity, destination.desc.name);
        let ciphertext = out_destination.encrypt(b"long-term", None, OsRng).expect("ct");
        let (plaintext, used_ratchet) = destination.decrypt(&ciphertext).expect("plaintext");
        assert_eq!(plaintext, b"long-term");
        assert!(!used_ratchet);
    }

    #[test]
    fn group_key_roundtrip() {
        let key = [9u8; 32];
        let ciphertext = super::group_encrypt(&key, b"group message").expect("ct");
        let plaintext = super::group_decrypt(&key, &ciphertext).expect("plaintext");
        assert_eq!(plaintext, b"group message");
    }

    #[test]
    fn same_name_and_identity_hash_deterministically() {
        let identity = PrivateIdentity::new_from_name("stable");
        let left = SingleInputDestination::new(
            identity.clone(),
            DestinationName::new("app", "aspect.one"),
        );
        let right =
            SingleInputDestination::new(identity, DestinationName::new("app", "aspect.one"));
        assert_eq!(left.desc.address_hash, right.desc.address_hash);
    }
}

use std::collections::HashMap;
use std::io::Read;

use bzip2::read::{BzDecoder, BzEncoder};
use bzip2::Compression;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf as SerdeBytes;
use sha2::Digest;

use rns_core::buffer::ByteBuf;
use rns_core::error::RnsError;
use rns_core::hash::{AddressHash, Hash, HASH_SIZE};

use crate::destination::link::{Link, LinkId};
use crate::packet::{
    DestinationType, Header, Packet, PacketContext, PacketType, PACKET_MDU,
};

pub const WINDOW: usize = 4;
pub const WINDOW_MAX: usize = 10;
pub const MAPHASH_LEN: usize = 4;
pub const RANDOM_HASH_SIZE: usize = 4;

/// Compression is only attempted below this size; larger payloads cost
/// more to squeeze than the air time saved.
pub const AUTO_COMPRESS_MAX_SIZE: usize = 32 * 1024;

/// Per-segment plaintext ceiling; larger transfers split into segments
/// accumulated by the receiver.
pub const MAX_SEGMENT_SIZE: usize = 64 * 1024;
pub const MAX_CONCURRENT_TRANSFERS: usize = 8;
pub const MAX_TRANSFER_SEGMENTS: usize = 64;
pub const TRANSFER_TIMEOUT: f64 = 600.0;

pub const MAX_RETRIES: u8 = 8;
pub const MAX_ADV_RETRIES: u8 = 4;

pub const ADVERTISEMENT_OVERHEAD: usize = 134;
/// Map hashes per advertisement or update, sized so the MsgPack frame
/// still fits one encrypted link packet.
pub const HASHMAP_MAX_LEN: usize =
    (crate::destination::link::LINK_MDU - ADVERTISEMENT_OVERHEAD) / MAPHASH_LEN;

pub const FLAG_ENCRYPTED: u8 = 0x01;
pub const FLAG_COMPRESSED: u8 = 0x02;
pub const FLAG_SPLIT: u8 = 0x04;
pub const FLAG_IS_RESPONSE: u8 = 0x08;
pub const FLAG_HAS_METADATA: u8 = 0x10;

const METADATA_MAX_SIZE: usize = (1 << 24) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    Queued,
    Advertised,
    Transferring,
    AwaitingProof,
    Complete,
    Failed,
    Corrupt,
    Canceled,
}

impl ResourceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResourceStatus::Complete
                | ResourceStatus::Failed
                | ResourceStatus::Corrupt
                | ResourceStatus::Canceled
        )
    }
}

//***************************************************************************//

/// Resource advertisement, an eleven-key MsgPack map. The single-letter
/// key set is part of the wire contract with the reference network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAdvertisement {
    pub transfer_size: u64,
    pub data_size: u64,
    pub parts: u32,
    pub hash: Hash,
    pub random_hash: [u8; RANDOM_HASH_SIZE],
    pub original_hash: Hash,
    pub segment_index: u32,
    pub total_segments: u32,
    pub request_id: Option<SerdeBytes>,
    pub flags: u8,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceAdvertisementFrame {
    #[serde(rename = "t")]
    transfer_size: u64,
    #[serde(rename = "d")]
    data_size: u64,
    #[serde(rename = "n")]
    parts: u32,
    #[serde(rename = "h", with = "serde_bytes")]
    hash: Vec<u8>,
    #[serde(rename = "r", with = "serde_bytes")]
    random_hash: Vec<u8>,
    #[serde(rename = "o", with = "serde_bytes")]
    original_hash: Vec<u8>,
    #[serde(rename = "i")]
    segment_index: u32,
    #[serde(rename = "l")]
    total_segments: u32,
    #[serde(rename = "q")]
    request_id: Option<SerdeBytes>,
    #[serde(rename = "f")]
    flags: u8,
    #[serde(rename = "m", with = "serde_bytes")]
    hashmap: Vec<u8>,
}

impl ResourceAdvertisement {
    pub fn pack(&self) -> Result<Vec<u8>, RnsError> {
        let frame = ResourceAdvertisementFrame {
            transfer_size: self.transfer_size,
            data_size: self.data_size,
            parts: self.parts,
            hash: self.hash.as_slice().to_vec(),
            random_hash: self.random_hash.to_vec(),
            original_hash: self.original_hash.as_slice().to_vec(),
            segment_index: self.segment_index,
            total_segments: self.total_segments,
            request_id: self.request_id.clone(),
            flags: self.flags,
            hashmap: self.hashmap.clone(),
        };
        rmp_serde::to_vec_named(&frame).map_err(|_| RnsError::PacketError)
    }

    pub fn unpack(data: &[u8]) -> Result<Self, RnsError> {
        let frame: ResourceAdvertisementFrame =
            rmp_serde::from_slice(data).map_err(|_| RnsError::PacketError)?;
        Ok(Self {
            transfer_size: frame.transfer_size,
            data_size: frame.data_size,
            parts: frame.parts,
            hash: Hash::try_from_slice(&frame.hash)?,
            random_hash: copy_fixed::<RANDOM_HASH_SIZE>(&frame.random_hash)?,
            original_hash: Hash::try_from_slice(&frame.original_hash)?,
            segment_index: frame.segment_index,
            total_segments: frame.total_segments,
            request_id: frame.request_id,
            flags: frame.flags,
            hashmap: frame.hashmap,
        })
    }

    pub fn encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn split(&self) -> bool {
        self.flags & FLAG_SPLIT != 0
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_IS_RESPONSE != 0 && self.request_id.is_some()
    }

    pub fn has_metadata(&self) -> bool {
        self.flags & FLAG_HAS_METADATA != 0
    }
}

/// Part request: `[hmu_flag][last_map_hash?][resource_hash][map hashes…]`.
/// The resource hash is redundant for the sender but stays on the wire for
/// interoperability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub hashmap_exhausted: bool,
    pub last_map_hash: Option<[u8; MAPHASH_LEN]>,
    pub resource_hash: Hash,
    pub requested_hashes: Vec<[u8; MAPHASH_LEN]>,
}

const HASHMAP_IS_EXHAUSTED: u8 = 0xFF;
const HASHMAP_IS_NOT_EXHAUSTED: u8 = 0x00;

impl ResourceRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + MAPHASH_LEN + HASH_SIZE + self.requested_hashes.len() * MAPHASH_LEN,
        );
        if self.hashmap_exhausted {
            out.push(HASHMAP_IS_EXHAUSTED);
            out.extend_from_slice(&self.last_map_hash.unwrap_or([0u8; MAPHASH_LEN]));
        } else {
            out.push(HASHMAP_IS_NOT_EXHAUSTED);
        }
        out.extend_from_slice(self.resource_hash.as_slice());
        for hash in &self.requested_hashes {
            out.extend_from_slice(hash);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < 1 + HASH_SIZE {
            return Err(RnsError::PacketError);
        }
        let hashmap_exhausted = data[0] == HASHMAP_IS_EXHAUSTED;
        let mut offset = 1;
        let last_map_hash = if hashmap_exhausted {
            if data.len() < 1 + MAPHASH_LEN + HASH_SIZE {
                return Err(RnsError::PacketError);
            }
            let last = copy_fixed::<MAPHASH_LEN>(&data[offset..])?;
            offset += MAPHASH_LEN;
            Some(last)
        } else {
            None
        };
        let resource_hash = Hash::try_from_slice(&data[offset..])?;
        offset += HASH_SIZE;

        let mut requested_hashes = Vec::new();
        while offset + MAPHASH_LEN <= data.len() {
            requested_hashes.push(copy_fixed::<MAPHASH_LEN>(&data[offset..])?);
            offset += MAPHASH_LEN;
        }
        Ok(Self { hashmap_exhausted, last_map_hash, resource_hash, requested_hashes })
    }
}

/// Hashmap continuation: `resource_hash ∥ msgpack [segment, hashmap]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHashUpdate {
    pub resource_hash: Hash,
    pub segment: u32,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceHashUpdateFrame(u32, #[serde(with = "serde_bytes")] Vec<u8>);

impl ResourceHashUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, RnsError> {
        let mut out = Vec::with_capacity(HASH_SIZE + self.hashmap.len() + 8);
        out.extend_from_slice(self.resource_hash.as_slice());
        let payload =
            rmp_serde::to_vec(&ResourceHashUpdateFrame(self.segment, self.hashmap.clone()))
                .map_err(|_| RnsError::PacketError)?;
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < HASH_SIZE + 1 {
            return Err(RnsError::PacketError);
        }
        let resource_hash = Hash::try_from_slice(data)?;
        let frame: ResourceHashUpdateFrame =
            rmp_serde::from_slice(&data[HASH_SIZE..]).map_err(|_| RnsError::PacketError)?;
        Ok(Self { resource_hash, segment: frame.0, hashmap: frame.1 })
    }
}

/// Proof of receipt: `resource_hash ∥ SHA256(plaintext ∥ resource_hash)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProof {
    pub resource_hash: Hash,
    pub proof: Hash,
}

impl ResourceProof {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HASH_SIZE * 2);
        out.extend_from_slice(self.resource_hash.as_slice());
        out.extend_from_slice(self.proof.as_slice());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RnsError> {
        if data.len() < HASH_SIZE * 2 {
            return Err(RnsError::PacketError);
        }
        Ok(Self {
            resource_hash: Hash::try_from_slice(data)?,
            proof: Hash::try_from_slice(&data[HASH_SIZE..])?,
        })
    }
}

//***************************************************************************//

#[derive(Debug, Clone)]
pub struct ResourceProgress {
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub received_parts: usize,
    pub total_parts: usize,
}

impl ResourceProgress {
    /// Monotonic 0.0..=1.0 completion ratio.
    pub fn ratio(&self) -> f64 {
        if self.total_parts == 0 {
            return 0.0;
        }
        self.received_parts as f64 / self.total_parts as f64
    }
}

#[derive(Debug, Clone)]
pub enum ResourceEventKind {
    Progress(ResourceProgress),
    Complete { data: Vec<u8>, metadata: Option<Vec<u8>> },
    /// All segments of a split transfer reassembled.
    AssembledComplete { data: Vec<u8> },
    OutboundSegmentComplete { segment_index: u32, total_segments: u32 },
    OutboundComplete,
    Failed { status: ResourceStatus },
}

#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub hash: Hash,
    pub link_id: AddressHash,
    pub kind: ResourceEventKind,
}

/// Deferred work the manager asks transport to perform with link access.
pub enum ResourceAction {
    SendRequest { link_id: LinkId, request: ResourceRequest },
    Readvertise { link_id: LinkId, advertisement: ResourceAdvertisement },
}

//***************************************************************************//

fn map_hash(part: &[u8], random_hash: &[u8; RANDOM_HASH_SIZE]) -> [u8; MAPHASH_LEN] {
    let digest = sha2::Sha256::new().chain_update(part).chain_update(random_hash).finalize();
    let mut out = [0u8; MAPHASH_LEN];
    out.copy_from_slice(&digest[..MAPHASH_LEN]);
    out
}

fn hash_with_suffix(data: &[u8], suffix: &[u8]) -> Hash {
    Hash::new(sha2::Sha256::new().chain_update(data).chain_update(suffix).finalize().into())
}

fn compress(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = BzEncoder::new(data, Compression::default());
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).ok()?;
    Some(out)
}

fn decompress(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = BzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

fn slice_hashmap_segment(hashes: &[[u8; MAPHASH_LEN]], segment: usize) -> Vec<u8> {
    let start = segment * HASHMAP_MAX_LEN;
    let end = usize::min((segment + 1) * HASHMAP_MAX_LEN, hashes.len());
    let mut out = Vec::with_capacity((end.saturating_sub(start)) * MAPHASH_LEN);
    for hash in &hashes[start.min(hashes.len())..end] {
        out.extend_from_slice(hash);
    }
    out
}

fn copy_fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], RnsError> {
    if bytes.len() < N {
        return Err(RnsError::PacketError);
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    Ok(out)
}

fn build_link_packet(
    link: &Link,
    packet_type: PacketType,
    context: PacketContext,
    payload: &[u8],
) -> Result<Packet, RnsError> {
    // Parts are already link-encrypted ciphertext and proofs are bare
    // hashes; everything else is encrypted for the link.
    let plaintext_contexts =
        context == PacketContext::Resource || context == PacketContext::ResourceProof;
    if plaintext_contexts {
        Ok(Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type,
                ..Default::default()
            },
            ifac: None,
            destination: *link.id(),
            transport: None,
            context,
            data: ByteBuf::from_slice(payload),
        })
    } else {
        link.packet_with_context(payload, context).map(|mut packet| {
            packet.header.packet_type = packet_type;
            packet
        })
    }
}

//***************************************************************************//

struct ResourceSender {
    resource_hash: Hash,
    random_hash: [u8; RANDOM_HASH_SIZE],
    original_hash: Hash,
    segment_index: u32,
    total_segments: u32,
    parts: Vec<Vec<u8>>,
    map_hashes: Vec<[u8; MAPHASH_LEN]>,
    expected_proof: Hash,
    data_size: u64,
    flags: u8,
    link_id: LinkId,
    status: ResourceStatus,
    last_activity: f64,
    adv_retries: u8,
}

impl ResourceSender {
    #[allow(clippy::too_many_arguments)]
    fn new(
        link: &Link,
        data: &[u8],
        metadata: Option<&[u8]>,
        original_hash: Option<Hash>,
        segment_index: u32,
        total_segments: u32,
        is_response: bool,
        now: f64,
    ) -> Result<Self, RnsError> {
        let mut flags = FLAG_ENCRYPTED;

        let payload = match metadata {
            Some(metadata) => {
                if metadata.len() > METADATA_MAX_SIZE {
                    return Err(RnsError::InvalidArgument);
                }
                flags |= FLAG_HAS_METADATA;
                let size_bytes = (metadata.len() as u32).to_be_bytes();
                let mut combined = Vec::with_capacity(3 + metadata.len() + data.len());
                combined.extend_from_slice(&size_bytes[1..]);
                combined.extend_from_slice(metadata);
                combined.extend_from_slice(data);
                combined
            }
            None => data.to_vec(),
        };

        let mut random_hash = [0u8; RANDOM_HASH_SIZE];
        OsRng.fill_bytes(&mut random_hash);

        let resource_hash = hash_with_suffix(&payload, &random_hash);
        let expected_proof = hash_with_suffix(&payload, resource_hash.as_slice());

        // Compression pays only when it actually shrinks the payload.
        let body = if payload.len() <= AUTO_COMPRESS_MAX_SIZE {
            match compress(&payload) {
                Some(compressed) if compressed.len() < payload.len() => {
                    flags |= FLAG_COMPRESSED;
                    compressed
                }
                _ => payload.clone(),
            }
        } else {
            payload.clone()
        };

        if total_segments > 1 {
            flags |= FLAG_SPLIT;
        }
        if is_response {
            flags |= FLAG_IS_RESPONSE;
        }

        let mut plaintext = Vec::with_capacity(RANDOM_HASH_SIZE + body.len());
        plaintext.extend_from_slice(&random_hash);
        plaintext.extend_from_slice(&body);

        let mut cipher_buf = vec![0u8; plaintext.len() + 128];
        let cipher_len = link.encrypt(&plaintext, &mut cipher_buf)?.len();
        cipher_buf.truncate(cipher_len);

        let parts: Vec<Vec<u8>> =
            cipher_buf.chunks(PACKET_MDU).map(|chunk| chunk.to_vec()).collect();
        let map_hashes = parts.iter().map(|part| map_hash(part, &random_hash)).collect();

        Ok(Self {
            resource_hash,
            random_hash,
            original_hash: original_hash.unwrap_or(resource_hash),
            segment_index,
            total_segments,
            parts,
            map_hashes,
            expected_proof,
            data_size: payload.len() as u64,
            flags,
            link_id: *link.id(),
            status: ResourceStatus::Advertised,
            last_activity: now,
            adv_retries: 0,
        })
    }

    fn advertisement(&self) -> ResourceAdvertisement {
        ResourceAdvertisement {
            transfer_size: self.parts.iter().map(|part| part.len() as u64).sum(),
            data_size: self.data_size,
            parts: self.parts.len() as u32,
            hash: self.resource_hash,
            random_hash: self.random_hash,
            original_hash: self.original_hash,
            segment_index: self.segment_index,
            total_segments: self.total_segments,
            request_id: None,
            flags: self.flags,
            hashmap: slice_hashmap_segment(&self.map_hashes, 0),
        }
    }

    fn handle_request(&mut self, request: &ResourceRequest, link: &Link, now: f64) -> Vec<Packet> {
        if request.resource_hash != self.resource_hash {
            return Vec::new();
        }

        self.last_activity = now;
        self.status = ResourceStatus::Transferring;

        let mut packets = Vec::new();
        let mut sent_last_part = false;
        for hash in &request.requested_hashes {
            if let Some(index) = self.map_hashes.iter().position(|entry| entry == hash) {
                if let Some(part) = self.parts.get(index) {
                    match build_link_packet(link, PacketType::Data, PacketContext::Resource, part)
                    {
                        Ok(packet) => packets.push(packet),
                        Err(_) => log::warn!("resource: failed to build part packet"),
                    }
                    if index + 1 == self.parts.len() {
                        sent_last_part = true;
                    }
                }
            }
        }

        if request.hashmap_exhausted {
            if let Some(update) = self.hashmap_update_after(request.last_map_hash) {
                match update.encode().and_then(|payload| {
                    build_link_packet(
                        link,
                        PacketType::Data,
                        PacketContext::ResourceHashUpdate,
                        &payload,
                    )
                }) {
                    Ok(packet) => packets.push(packet),
                    Err(_) => log::warn!("resource: failed to build hashmap update"),
                }
            }
        }

        if sent_last_part {
            self.status = ResourceStatus::AwaitingProof;
        }

        packets
    }

    fn hashmap_update_after(
        &self,
        last_map_hash: Option<[u8; MAPHASH_LEN]>,
    ) -> Option<ResourceHashUpdate> {
        let last_hash = last_map_hash?;
        let last_index = self.map_hashes.iter().position(|entry| *entry == last_hash)?;
        let next_segment = last_index / HASHMAP_MAX_LEN + 1;
        if next_segment * HASHMAP_MAX_LEN >= self.map_hashes.len() {
            return None;
        }
        Some(ResourceHashUpdate {
            resource_hash: self.resource_hash,
            segment: next_segment as u32,
            hashmap: slice_hashmap_segment(&self.map_hashes, next_segment),
        })
    }

    fn handle_proof(&mut self, proof: &ResourceProof) -> bool {
        if proof.resource_hash != self.resource_hash || proof.proof != self.expected_proof {
            return false;
        }
        self.status = ResourceStatus::Complete;
        true
    }
}

//***************************************************************************//

struct ResourceReceiver {
    resource_hash: Hash,
    original_hash: Hash,
    segment_index: u32,
    total_segments: u32,
    link_id: LinkId,
    random_hash: [u8; RANDOM_HASH_SIZE],
    parts: Vec<Option<Vec<u8>>>,
    hashmap: Vec<Option<[u8; MAPHASH_LEN]>>,
    consecutive_completed: usize,
    received: usize,
    received_bytes: u64,
    total_bytes: u64,
    encrypted: bool,
    compressed: bool,
    split: bool,
    has_metadata: bool,
    window: usize,
    last_activity: f64,
    last_request: f64,
    retries: u8,
    status: ResourceStatus,
}

enum PartOutcome {
    NoMatch,
    Incomplete,
    Complete { proof: Packet, data: Vec<u8>, metadata: Option<Vec<u8>> },
}

impl ResourceReceiver {
    fn new(adv: &ResourceAdvertisement, link_id: LinkId, now: f64) -> Self {
        let total_parts = adv.parts as usize;
        let mut receiver = Self {
            resource_hash: adv.hash,
            original_hash: adv.original_hash,
            segment_index: adv.segment_index,
            total_segments: adv.total_segments,
            link_id,
            random_hash: adv.random_hash,
            parts: vec![None; total_parts],
            hashmap: vec![None; total_parts],
            consecutive_completed: 0,
            received: 0,
            received_bytes: 0,
            total_bytes: adv.transfer_size,
            encrypted: adv.encrypted(),
            compressed: adv.compressed(),
            split: adv.split(),
            has_metadata: adv.has_metadata(),
            window: WINDOW,
            last_activity: now,
            last_request: now,
            retries: 0,
            status: ResourceStatus::Transferring,
        };
        receiver.apply_hashmap_segment(adv.segment_index.saturating_sub(1) as usize, &adv.hashmap);
        receiver
    }

    fn apply_hashmap_segment(&mut self, segment: usize, bytes: &[u8]) {
        for (position, chunk) in bytes.chunks_exact(MAPHASH_LEN).enumerate() {
            let index = segment * HASHMAP_MAX_LEN + position;
            if index < self.hashmap.len() {
                let mut entry = [0u8; MAPHASH_LEN];
                entry.copy_from_slice(chunk);
                self.hashmap[index] = Some(entry);
            }
        }
    }

    /// Collect up to `window` outstanding map hashes from the known region
    /// past the contiguous completed prefix.
    fn build_request(&self) -> ResourceRequest {
        let mut requested = Vec::new();
        let mut last_known: Option<[u8; MAPHASH_LEN]> = None;
        let mut hashmap_exhausted = false;

        for index in self.consecutive_completed..self.hashmap.len() {
            match &self.hashmap[index] {
                Some(hash) => {
                    last_known = Some(*hash);
                    if self.parts[index].is_none() {
                        requested.push(*hash);
                        if requested.len() >= self.window {
                            break;
                        }
                    }
                }
                None => {
                    hashmap_exhausted = true;
                    break;
                }
            }
        }

        ResourceRequest {
            hashmap_exhausted,
            last_map_hash: if hashmap_exhausted { last_known } else { None },
            resource_hash: self.resource_hash,
            requested_hashes: requested,
        }
    }

    fn handle_hash_update(&mut self, update: &ResourceHashUpdate, now: f64) {
        if update.resource_hash != self.resource_hash {
            return;
        }
        self.last_activity = now;
        self.apply_hashmap_segment(update.segment as usize, &update.hashmap);
    }

    fn handle_part(&mut self, part: &[u8], link: &Link, now: f64) -> PartOutcome {
        let hash = map_hash(part, &self.random_hash);
        let Some(index) = self.hashmap.iter().position(|entry| entry.as_ref() == Some(&hash))
        else {
            return PartOutcome::NoMatch;
        };

        if self.parts[index].is_none() {
            self.parts[index] = Some(part.to_vec());
            self.received += 1;
            self.received_bytes = self.received_bytes.saturating_add(part.len() as u64);
            self.last_activity = now;
            self.retries = 0;
            if self.window < WINDOW_MAX {
                self.window += 1;
            }
            while self.consecutive_completed < self.parts.len()
                && self.parts[self.consecutive_completed].is_some()
            {
                self.consecutive_completed += 1;
            }
        }

        if self.received < self.parts.len() || self.parts.is_empty() {
            return PartOutcome::Incomplete;
        }

        self.assemble(link)
    }

    fn assemble(&mut self, link: &Link) -> PartOutcome {
        let mut stream = Vec::with_capacity(self.total_bytes as usize);
        for part in self.parts.iter().flatten() {
            stream.extend_from_slice(part);
        }

        let plain = if self.encrypted {
            let mut out = vec![0u8; stream.len() + 64];
            match link.decrypt(&stream, &mut out) {
                Ok(value) => value.to_vec(),
                Err(_) => {
                    self.status = ResourceStatus::Corrupt;
                    return PartOutcome::Incomplete;
                }
            }
        } else {
            stream
        };

        // Strip the leading salt.
        if plain.len() < RANDOM_HASH_SIZE {
            self.status = ResourceStatus::Corrupt;
            return PartOutcome::Incomplete;
        }
        let mut payload = plain[RANDOM_HASH_SIZE..].to_vec();

        if self.compressed {
            match decompress(&payload) {
                Some(decompressed) => payload = decompressed,
                None => {
                    self.status = ResourceStatus::Corrupt;
                    return PartOutcome::Incomplete;
                }
            }
        }

        if hash_with_suffix(&payload, &self.random_hash) != self.resource_hash {
            self.status = ResourceStatus::Corrupt;
            return PartOutcome::Incomplete;
        }

        let (metadata, data) = if self.has_metadata && payload.len() >= 3 {
            let size = ((payload[0] as usize) << 16)
                | ((payload[1] as usize) << 8)
                | payload[2] as usize;
            if size > METADATA_MAX_SIZE || payload.len() < 3 + size {
                self.status = ResourceStatus::Corrupt;
                return PartOutcome::Incomplete;
            }
            (Some(payload[3..3 + size].to_vec()), payload[3 + size..].to_vec())
        } else {
            (None, payload.clone())
        };

        let proof_payload = ResourceProof {
            resource_hash: self.resource_hash,
            proof: hash_with_suffix(&payload, self.resource_hash.as_slice()),
        };
        let proof = match build_link_packet(
            link,
            PacketType::Proof,
            PacketContext::ResourceProof,
            &proof_payload.encode(),
        ) {
            Ok(packet) => packet,
            Err(_) => {
                self.status = ResourceStatus::Failed;
                return PartOutcome::Incomplete;
            }
        };

        self.status = ResourceStatus::Complete;
        PartOutcome::Complete { proof, data, metadata }
    }

    fn progress(&self) -> ResourceProgress {
        ResourceProgress {
            received_bytes: self.received_bytes,
            total_bytes: self.total_bytes,
            received_parts: self.received,
            total_parts: self.parts.len(),
        }
    }

    fn retry_timeout(&self, rtt: f64) -> f64 {
        let backoff = 1.5f64.powi(self.retries as i32);
        backoff * (2.5 * rtt).max(1.0) * (self.window as f64 + 1.5)
    }
}

//***************************************************************************//

/// Accumulates completed segments of split transfers keyed by the original
/// resource hash.
struct SegmentAccumulator {
    transfers: HashMap<Hash, SegmentTransfer>,
}

struct SegmentTransfer {
    segments: Vec<Option<Vec<u8>>>,
    link_id: LinkId,
    last_activity: f64,
}

impl SegmentAccumulator {
    fn new() -> Self {
        Self { transfers: HashMap::new() }
    }

    /// Returns the reassembled stream once every segment is in.
    fn push(
        &mut self,
        original_hash: Hash,
        segment_index: u32,
        total_segments: u32,
        data: Vec<u8>,
        link_id: LinkId,
        now: f64,
    ) -> Option<Vec<u8>> {
        let total = total_segments as usize;
        if total == 0 || total > MAX_TRANSFER_SEGMENTS {
            return None;
        }
        let index = segment_index.checked_sub(1)? as usize;
        if index >= total {
            return None;
        }

        if !self.transfers.contains_key(&original_hash)
            && self.transfers.len() >= MAX_CONCURRENT_TRANSFERS
        {
            log::warn!("resource: too many concurrent split transfers");
            return None;
        }

        let transfer = self.transfers.entry(original_hash).or_insert_with(|| SegmentTransfer {
            segments: vec![None; total],
            link_id,
            last_activity: now,
        });
        if transfer.segments.len() != total {
            return None;
        }
        transfer.segments[index] = Some(data);
        transfer.last_activity = now;

        if transfer.segments.iter().any(|segment| segment.is_none()) {
            return None;
        }

        let transfer = self.transfers.remove(&original_hash)?;
        let mut assembled = Vec::new();
        for segment in transfer.segments.into_iter().flatten() {
            assembled.extend_from_slice(&segment);
        }
        Some(assembled)
    }

    fn cull(&mut self, now: f64) {
        self.transfers
            .retain(|_, transfer| now - transfer.last_activity <= TRANSFER_TIMEOUT);
    }
}

//***************************************************************************//

struct QueuedSegment {
    data: Vec<u8>,
    original_hash: Hash,
    segment_index: u32,
    total_segments: u32,
    link_id: LinkId,
}

/// Owns every in-flight resource transfer, both directions, across all
/// links. Packet building that needs link key material is either done
/// inline (when a link reference is at hand) or deferred via
/// [`ResourceAction`].
pub struct ResourceManager {
    outgoing: HashMap<Hash, ResourceSender>,
    queued_segments: Vec<QueuedSegment>,
    incoming: HashMap<Hash, ResourceReceiver>,
    segments: SegmentAccumulator,
    events: Vec<ResourceEvent>,
    adv_retry_interval: f64,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            outgoing: HashMap::new(),
            queued_segments: Vec::new(),
            incoming: HashMap::new(),
            segments: SegmentAccumulator::new(),
            events: Vec::new(),
            adv_retry_interval: 4.0,
        }
    }

    pub fn drain_events(&mut self) -> Vec<ResourceEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    pub fn incoming_progress(&self, hash: &Hash) -> Option<ResourceProgress> {
        self.incoming.get(hash).map(|receiver| receiver.progress())
    }

    /// Begin sending `data` over `link`. Large payloads split into
    /// segments; the first advertisement packet is returned, subsequent
    /// segments advertise as their predecessors complete.
    pub fn start_send(
        &mut self,
        link: &Link,
        data: &[u8],
        metadata: Option<&[u8]>,
        now: f64,
    ) -> Result<(Hash, Packet), RnsError> {
        if data.is_empty() {
            return Err(RnsError::InvalidArgument);
        }

        let total_segments = data.len().div_ceil(MAX_SEGMENT_SIZE);
        if total_segments > MAX_TRANSFER_SEGMENTS {
            return Err(RnsError::InvalidArgument);
        }

        if total_segments == 1 {
            let sender =
                ResourceSender::new(link, data, metadata, None, 1, 1, false, now)?;
            return self.register_sender(link, sender);
        }

        // Split transfer: the original hash seeds segment correlation.
        let mut salt = [0u8; RANDOM_HASH_SIZE];
        OsRng.fill_bytes(&mut salt);
        let original_hash = hash_with_suffix(data, &salt);

        let first_len = MAX_SEGMENT_SIZE.min(data.len());
        let sender = ResourceSender::new(
            link,
            &data[..first_len],
            metadata,
            Some(original_hash),
            1,
            total_segments as u32,
            false,
            now,
        )?;

        for segment_index in 1..total_segments {
            let start = segment_index * MAX_SEGMENT_SIZE;
            let end = ((segment_index + 1) * MAX_SEGMENT_SIZE).min(data.len());
            self.queued_segments.push(QueuedSegment {
                data: data[start..end].to_vec(),
                original_hash,
                segment_index: segment_index as u32 + 1,
                total_segments: total_segments as u32,
                link_id: *link.id(),
            });
        }

        self.register_sender(link, sender)
    }

    fn register_sender(
        &mut self,
        link: &Link,
        sender: ResourceSender,
    ) -> Result<(Hash, Packet), RnsError> {
        let resource_hash = sender.resource_hash;
        let payload = sender.advertisement().pack()?;
        let packet = build_link_packet(
            link,
            PacketType::Data,
            PacketContext::ResourceAdvertisement,
            &payload,
        )?;
        self.outgoing.insert(resource_hash, sender);
        Ok((resource_hash, packet))
    }

    pub fn handle_packet(&mut self, packet: &Packet, link: &mut Link, now: f64) -> Vec<Packet> {
        match packet.context {
            PacketContext::ResourceAdvertisement => {
                self.handle_advertisement(packet, link, now)
            }
            PacketContext::ResourceRequest => self.handle_request(packet, link, now),
            PacketContext::ResourceHashUpdate => self.handle_hash_update(packet, link, now),
            PacketContext::Resource => self.handle_resource_part(packet, link, now),
            PacketContext::ResourceProof => self.handle_proof(packet, link, now),
            PacketContext::ResourceInitiatorCancel | PacketContext::ResourceReceiverCancel => {
                self.handle_cancel(packet, link)
            }
            _ => Vec::new(),
        }
    }

    fn handle_advertisement(
        &mut self,
        packet: &Packet,
        link: &mut Link,
        now: f64,
    ) -> Vec<Packet> {
        let mut buffer = [0u8; PACKET_MDU];
        let Ok(plaintext) = link.decrypt(packet.data.as_slice(), &mut buffer) else {
            log::debug!("resource: undecryptable advertisement");
            return Vec::new();
        };
        let Ok(advertisement) = ResourceAdvertisement::unpack(plaintext) else {
            log::debug!("resource: malformed advertisement");
            return Vec::new();
        };
        if advertisement.parts == 0 {
            return Vec::new();
        }

        let resource_hash = advertisement.hash;
        let mut receiver = ResourceReceiver::new(&advertisement, *link.id(), now);
        let request = receiver.build_request();
        receiver.last_request = now;
        self.incoming.insert(resource_hash, receiver);

        match build_link_packet(
            link,
            PacketType::Data,
            PacketContext::ResourceRequest,
            &request.encode(),
        ) {
            Ok(packet) => vec![packet],
            Err(_) => {
                log::warn!("resource: failed to build request packet");
                Vec::new()
            }
        }
    }

    fn handle_request(&mut self, packet: &Packet, link: &mut Link, now: f64) -> Vec<Packet> {
        let mut buffer = [0u8; PACKET_MDU];
        let Ok(plaintext) = link.decrypt(packet.data.as_slice(), &mut buffer) else {
            return Vec::new();
        };
        let Ok(request) = ResourceRequest::decode(plaintext) else {
            return Vec::new();
        };
        match self.outgoing.get_mut(&request.resource_hash) {
            Some(sender) => sender.handle_request(&request, link, now),
            None => Vec::new(),
        }
    }

    fn handle_hash_update(&mut self, packet: &Packet, link: &mut Link, now: f64) -> Vec<Packet> {
        let mut buffer = [0u8; PACKET_MDU];
        let Ok(plaintext) = link.decrypt(packet.data.as_slice(), &mut buffer) else {
            return Vec::new();
        };
        let Ok(update) = ResourceHashUpdate::decode(plaintext) else {
            return Vec::new();
        };
        let Some(receiver) = self.incoming.get_mut(&update.resource_hash) else {
            return Vec::new();
        };
        receiver.handle_hash_update(&update, now);
        let request = receiver.build_request();
        receiver.last_request = now;
        match build_link_packet(
            link,
            PacketType::Data,
            PacketContext::ResourceRequest,
            &request.encode(),
        ) {
            Ok(packet) => vec![packet],
            Err(_) => Vec::new(),
        }
    }

    fn handle_resource_part(&mut self, packet: &Packet, link: &mut Link, now: f64) -> Vec<Packet> {
        let mut responses = Vec::new();
        let mut completed: Option<(Hash, Vec<u8>, Option<Vec<u8>>)> = None;

        for (hash, receiver) in self.incoming.iter_mut() {
            let received_before = receiver.received;
            match receiver.handle_part(packet.data.as_slice(), link, now) {
                PartOutcome::NoMatch => continue,
                PartOutcome::Complete { proof, data, metadata } => {
                    responses.push(proof);
                    completed = Some((*hash, data, metadata));
                    break;
                }
                PartOutcome::Incomplete => {
                    if receiver.status == ResourceStatus::Corrupt
                        || receiver.status == ResourceStatus::Failed
                    {
                        let status = receiver.status;
                        let link_id = receiver.link_id;
                        let hash = *hash;
                        self.events.push(ResourceEvent {
                            hash,
                            link_id,
                            kind: ResourceEventKind::Failed { status },
                        });
                        completed = Some((hash, Vec::new(), None));
                        break;
                    }
                    if receiver.received > received_before {
                        self.events.push(ResourceEvent {
                            hash: *hash,
                            link_id: receiver.link_id,
                            kind: ResourceEventKind::Progress(receiver.progress()),
                        });
                        // Ask for the next window as soon as this one lands.
                        let outstanding =
                            receiver.parts.iter().any(|part| part.is_none());
                        if outstanding {
                            let request = receiver.build_request();
                            if !request.requested_hashes.is_empty()
                                || request.hashmap_exhausted
                            {
                                receiver.last_request = now;
                                if let Ok(packet) = build_link_packet(
                                    link,
                                    PacketType::Data,
                                    PacketContext::ResourceRequest,
                                    &request.encode(),
                                ) {
                                    responses.push(packet);
                                }
                            }
                        }
                    }
                    break;
                }
            }
        }

        if let Some((hash, data, metadata)) = completed {
            let receiver = self.incoming.remove(&hash);
            if let Some(receiver) = receiver {
                if receiver.status == ResourceStatus::Complete {
                    if receiver.total_segments > 1 {
                        self.events.push(ResourceEvent {
                            hash,
                            link_id: receiver.link_id,
                            kind: ResourceEventKind::Progress(receiver.progress()),
                        });
                        if let Some(assembled) = self.segments.push(
                            receiver.original_hash,
                            receiver.segment_index,
                            receiver.total_segments,
                            data,
                            receiver.link_id,
                            now,
                        ) {
                            self.events.push(ResourceEvent {
                                hash: receiver.original_hash,
                                link_id: receiver.link_id,
                                kind: ResourceEventKind::AssembledComplete { data: assembled },
                            });
                        }
                    } else {
                        self.events.push(ResourceEvent {
                            hash,
                            link_id: receiver.link_id,
                            kind: ResourceEventKind::Complete { data, metadata },
                        });
                    }
                }
            }
        }

        responses
    }

    fn handle_proof(&mut self, packet: &Packet, link: &mut Link, now: f64) -> Vec<Packet> {
        let Ok(proof) = ResourceProof::decode(packet.data.as_slice()) else {
            return Vec::new();
        };
        let Some(sender) = self.outgoing.get_mut(&proof.resource_hash) else {
            return Vec::new();
        };
        if !sender.handle_proof(&proof) {
            return Vec::new();
        }

        let sender = match self.outgoing.remove(&proof.resource_hash) {
            Some(sender) => sender,
            None => return Vec::new(),
        };

        if sender.total_segments > 1 {
            self.events.push(ResourceEvent {
                hash: sender.resource_hash,
                link_id: sender.link_id,
                kind: ResourceEventKind::OutboundSegmentComplete {
                    segment_index: sender.segment_index,
                    total_segments: sender.total_segments,
                },
            });
        }

        // Advance the next queued segment for this transfer, if any.
        let next = self
            .queued_segments
            .iter()
            .position(|queued| queued.original_hash == sender.original_hash)
            .map(|index| self.queued_segments.remove(index));

        if let Some(queued) = next {
            match ResourceSender::new(
                link,
                &queued.data,
                None,
                Some(queued.original_hash),
                queued.segment_index,
                queued.total_segments,
                false,
                now,
            )
            .and_then(|next_sender| self.register_sender(link, next_sender))
            {
                Ok((_, packet)) => return vec![packet],
                Err(_) => {
                    log::warn!("resource: failed to advance split transfer");
                    self.events.push(ResourceEvent {
                        hash: sender.original_hash,
                        link_id: sender.link_id,
                        kind: ResourceEventKind::Failed { status: ResourceStatus::Failed },
                    });
                    return Vec::new();
                }
            }
        }

        self.events.push(ResourceEvent {
            hash: sender.resource_hash,
            link_id: sender.link_id,
            kind: ResourceEventKind::OutboundComplete,
        });
        Vec::new()
    }

    fn handle_cancel(&mut self, packet: &Packet, link: &mut Link) -> Vec<Packet> {
        let mut buffer = [0u8; PACKET_MDU];
        let Ok(plaintext) = link.decrypt(packet.data.as_slice(), &mut buffer) else {
            return Vec::new();
        };
        let Ok(hash) = Hash::try_from_slice(plaintext) else {
            return Vec::new();
        };

        if let Some(mut receiver) = self.incoming.remove(&hash) {
            receiver.status = ResourceStatus::Canceled;
            self.events.push(ResourceEvent {
                hash,
                link_id: receiver.link_id,
                kind: ResourceEventKind::Failed { status: ResourceStatus::Canceled },
            });
        }
        if let Some(mut sender) = self.outgoing.remove(&hash) {
            sender.status = ResourceStatus::Canceled;
            self.queued_segments.retain(|queued| queued.original_hash != sender.original_hash);
            self.events.push(ResourceEvent {
                hash,
                link_id: sender.link_id,
                kind: ResourceEventKind::Failed { status: ResourceStatus::Canceled },
            });
        }
        Vec::new()
    }

    /// Build a cancel packet for a local transfer and drop its state.
    pub fn cancel(&mut self, hash: &Hash, link: &Link) -> Option<Packet> {
        let context = if self.outgoing.remove(hash).is_some() {
            self.queued_segments.retain(|queued| queued.original_hash != *hash);
            PacketContext::ResourceInitiatorCancel
        } else if self.incoming.remove(hash).is_some() {
            PacketContext::ResourceReceiverCancel
        } else {
            return None;
        };

        build_link_packet(link, PacketType::Data, context, hash.as_slice()).ok()
    }

    /// Watchdog sweep. Expired receivers re-request with backoff until
    /// `MAX_RETRIES`; silent senders re-advertise until `MAX_ADV_RETRIES`.
    pub fn job(&mut self, now: f64, rtt_of: impl Fn(&LinkId) -> f64) -> Vec<ResourceAction> {
        let mut actions = Vec::new();

        let mut failed_receivers = Vec::new();
        for (hash, receiver) in self.incoming.iter_mut() {
            if receiver.status.is_terminal() {
                failed_receivers.push(*hash);
                continue;
            }
            let rtt = rtt_of(&receiver.link_id);
            if now - receiver.last_request > receiver.retry_timeout(rtt) {
                if receiver.retries >= MAX_RETRIES {
                    receiver.status = ResourceStatus::Failed;
                    self.events.push(ResourceEvent {
                        hash: *hash,
                        link_id: receiver.link_id,
                        kind: ResourceEventKind::Failed { status: ResourceStatus::Failed },
                    });
                    failed_receivers.push(*hash);
                    continue;
                }
                receiver.retries += 1;
                receiver.last_request = now;
                actions.push(ResourceAction::SendRequest {
                    link_id: receiver.link_id,
                    request: receiver.build_request(),
                });
            }
        }
        for hash in failed_receivers {
            self.incoming.remove(&hash);
        }

        let mut failed_senders = Vec::new();
        for (hash, sender) in self.outgoing.iter_mut() {
            if sender.status != ResourceStatus::Advertised {
                continue;
            }
            if now - sender.last_activity > self.adv_retry_interval {
                if sender.adv_retries >= MAX_ADV_RETRIES {
                    sender.status = ResourceStatus::Failed;
                    self.events.push(ResourceEvent {
                        hash: *hash,
                        link_id: sender.link_id,
                        kind: ResourceEventKind::Failed { status: ResourceStatus::Failed },
                    });
                    failed_senders.push(*hash);
                    continue;
                }
                sender.adv_retries += 1;
                sender.last_activity = now;
                actions.push(ResourceAction::Readvertise {
                    link_id: sender.link_id,
                    advertisement: sender.advertisement(),
                });
            }
        }
        for hash in failed_senders {
            if let Some(sender) = self.outgoing.remove(&hash) {
                self.queued_segments
                    .retain(|queued| queued.original_hash != sender.original_hash);
            }
        }

        self.segments.cull(now);
        actions
    }

    /// Drop every transfer bound to a closed link.
    pub fn drop_link(&mut self, link_id: &LinkId) {
        let mut dropped = Vec::new();
        self.incoming.retain(|hash, receiver| {
            let keep = receiver.link_id != *link_id;
            if !keep {
                dropped.push((*hash, receiver.link_id));
            }
            keep
        });
        self.outgoing.retain(|hash, sender| {
            let keep = sender.link_id != *link_id;
            if !keep {
                dropped.push((*hash, sender.link_id));
            }
            keep
        });
        self.queued_segments.retain(|queued| queued.link_id != *link_id);
        for (hash, link_id) in dropped {
            self.events.push(ResourceEvent {
                hash,
                link_id,
                kind: ResourceEventKind::Failed { status: ResourceStatus::Failed },
            });
        }
    }

    pub fn build_request_packet(
        link: &Link,
        request: &ResourceRequest,
    ) -> Result<Packet, RnsError> {
        build_link_packet(link, PacketType::Data, PacketContext::ResourceRequest, &request.encode())
    }

    pub fn build_advertisement_packet(
        link: &Link,
        advertisement: &ResourceAdvertisement,
    ) -> Result<Packet, RnsError> {
        let payload = advertisement.pack()?;
        build_link_packet(link, PacketType::Data, PacketContext::ResourceAdvertisement, &payload)
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rand_core::{OsRng, RngCore};

    use super::*;
    use crate::destination::link::Link;
    use crate::destination::{DestinationName, SingleInputDestination};
    use rns_core::identity::PrivateIdentity;

    fn established_pair() -> (Link, Link) {
        let destination = SingleInputDestination::new(
            PrivateIdentity::new_from_rand(OsRng),
            DestinationName::new("resource_tests", "endpoint"),
        );
        let desc = destination.desc;
        let now = 100.0;

        let mut initiator = Link::new(desc, 0, now);
        let request = initiator.request(now);
        let (mut responder, proof) = Link::new_from_request(
            &request,
            destination.identity.sign_key().clone(),
            desc,
            now,
        )
        .expect("responder");
        for packet in initiator.handle_packet(&proof, now + 0.1) {
            responder.handle_packet(&packet, now + 0.2);
        }
        (initiator, responder)
    }

    /// Run a transfer to completion by shuttling packets between the
    /// sender's and receiver's managers.
    fn run_transfer(
        data: &[u8],
        metadata: Option<&[u8]>,
    ) -> (Vec<ResourceEvent>, Vec<ResourceEvent>) {
        let (mut sender_link, mut receiver_link) = established_pair();
        let mut sender = ResourceManager::new();
        let mut receiver = ResourceManager::new();
        let now = 200.0;

        let (_, advertisement) =
            sender.start_send(&sender_link, data, metadata, now).expect("start send");

        let mut to_receiver = vec![advertisement];
        let mut to_sender: Vec<Packet> = Vec::new();
        let mut rounds = 0;

        while !to_receiver.is_empty() || !to_sender.is_empty() {
            rounds += 1;
            assert!(rounds < 512, "transfer did not converge");

            let mut next_to_sender = Vec::new();
            for packet in to_receiver.drain(..) {
                next_to_sender.extend(receiver.handle_packet(&packet, &mut receiver_link, now));
            }
            let mut next_to_receiver = Vec::new();
            for packet in next_to_sender.drain(..) {
                next_to_receiver.extend(sender.handle_packet(&packet, &mut sender_link, now));
            }
            // Anything still queued for the sender flows next round.
            to_receiver = next_to_receiver;
            to_sender.clear();
        }

        (sender.drain_events(), receiver.drain_events())
    }

    #[test]
    fn advertisement_msgpack_uses_single_letter_keys() {
        let advertisement = ResourceAdvertisement {
            transfer_size: 10,
            data_size: 8,
            parts: 1,
            hash: Hash::new_from_slice(b"hash"),
            random_hash: [1, 2, 3, 4],
            original_hash: Hash::new_from_slice(b"hash"),
            segment_index: 1,
            total_segments: 1,
            request_id: None,
            flags: FLAG_ENCRYPTED,
            hashmap: vec![0u8; MAPHASH_LEN],
        };

        let packed = advertisement.pack().expect("pack");
        let value: rmpv::Value =
            rmpv::decode::read_value(&mut packed.as_slice()).expect("msgpack");
        let map = value.as_map().expect("map");
        let mut keys: Vec<&str> = map
            .iter()
            .filter_map(|(key, _)| key.as_str())
            .collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["d", "f", "h", "i", "l", "m", "n", "o", "q", "r", "t"]);

        let decoded = ResourceAdvertisement::unpack(&packed).expect("unpack");
        assert_eq!(decoded, advertisement);
    }

    #[test]
    fn request_codec_roundtrip_with_exhausted_hashmap() {
        let request = ResourceRequest {
            hashmap_exhausted: true,
            last_map_hash: Some([9, 9, 9, 9]),
            resource_hash: Hash::new_from_slice(b"resource"),
            requested_hashes: vec![[1, 1, 1, 1], [2, 2, 2, 2]],
        };
        let decoded = ResourceRequest::decode(&request.encode()).expect("decode");
        assert_eq!(decoded, request);
    }

    #[test]
    fn small_transfer_completes_end_to_end() {
        let mut data = vec![0u8; 3000];
        OsRng.fill_bytes(&mut data);

        let (sender_events, receiver_events) = run_transfer(&data, None);

        let received = receiver_events
            .iter()
            .find_map(|event| match &event.kind {
                ResourceEventKind::Complete { data, .. } => Some(data.clone()),
                _ => None,
            })
            .expect("complete event");
        assert_eq!(received, data);

        assert!(sender_events
            .iter()
            .any(|event| matches!(event.kind, ResourceEventKind::OutboundComplete)));

        // Progress events stay monotonic.
        let ratios: Vec<f64> = receiver_events
            .iter()
            .filter_map(|event| match &event.kind {
                ResourceEventKind::Progress(progress) => Some(progress.ratio()),
                _ => None,
            })
            .collect();
        assert!(ratios.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn compressible_payload_sets_the_compressed_flag() {
        let data = vec![b'a'; 4000];
        let (_, receiver_events) = run_transfer(&data, None);
        let received = receiver_events
            .iter()
            .find_map(|event| match &event.kind {
                ResourceEventKind::Complete { data, .. } => Some(data.clone()),
                _ => None,
            })
            .expect("complete event");
        assert_eq!(received, data);
    }

    #[test]
    fn metadata_rides_along() {
        let mut data = vec![0u8; 600];
        OsRng.fill_bytes(&mut data);

        let (_, receiver_events) = run_transfer(&data, Some(b"content-type: test"));
        let (received, metadata) = receiver_events
            .iter()
            .find_map(|event| match &event.kind {
                ResourceEventKind::Complete { data, metadata } => {
                    Some((data.clone(), metadata.clone()))
                }
                _ => None,
            })
            .expect("complete event");
        assert_eq!(received, data);
        assert_eq!(metadata.as_deref(), Some(&b"content-type: test"[..]));
    }

    #[test]
    fn split_transfer_reassembles_across_segments() {
        let mut data = vec![0u8; MAX_SEGMENT_SIZE + 1024];
        OsRng.fill_bytes(&mut data);

        let (sender_events, receiver_events) = run_transfer(&data, None);

        assert!(sender_events.iter().any(|event| matches!(
            event.kind,
            ResourceEventKind::OutboundSegmentComplete { total_segments: 2, .. }
        )));

        let assembled = receiver_events
            .iter()
            .find_map(|event| match &event.kind {
                ResourceEventKind::AssembledComplete { data } => Some(data.clone()),
                _ => None,
            })
            .expect("assembled event");
        assert_eq!(assembled, data);
    }

    #[test]
    fn corrupted_part_stream_ends_corrupt() {
        let (mut sender_link, mut receiver_link) = established_pair();
        let mut sender = ResourceManager::new();
        let mut receiver = ResourceManager::new();
        let now = 200.0;

        let data = vec![7u8; 300];
        let (_, advertisement) =
            sender.start_send(&sender_link, &data, None, now).expect("start send");

        let request_packets = receiver.handle_packet(&advertisement, &mut receiver_link, now);
        let mut parts = Vec::new();
        for packet in &request_packets {
            parts.extend(sender.handle_packet(packet, &mut sender_link, now));
        }
        assert!(!parts.is_empty());

        // Flip ciphertext so reassembly must fail the decrypt. The part
        // keeps its advertised map hash by recomputing it after the flip,
        // so it still slots into the hashmap.
        let advert_plain = {
            let mut buffer = [0u8; PACKET_MDU];
            let plain = receiver_link
                .decrypt(advertisement.data.as_slice(), &mut buffer)
                .expect("advert");
            ResourceAdvertisement::unpack(plain).expect("advert")
        };
        let mut tampered_bytes = parts[0].data.as_slice().to_vec();
        tampered_bytes[0] ^= 0xFF;
        let tampered_hash = map_hash(&tampered_bytes, &advert_plain.random_hash);

        if let Some(receiver_state) = receiver.incoming.get_mut(&advert_plain.hash) {
            receiver_state.hashmap[0] = Some(tampered_hash);
        }
        let mut tampered = parts[0].clone();
        tampered.data = ByteBuf::from_slice(&tampered_bytes);
        receiver.handle_packet(&tampered, &mut receiver_link, now);

        let events = receiver.drain_events();
        assert!(events.iter().any(|event| matches!(
            event.kind,
            ResourceEventKind::Failed { status: ResourceStatus::Corrupt }
        )));
        assert_eq!(receiver.incoming_count(), 0);
    }

    #[test]
    fn receiver_watchdog_gives_up_after_max_retries() {
        let (sender_link, mut receiver_link) = established_pair();
        let mut sender = ResourceManager::new();
        let mut receiver = ResourceManager::new();
        let mut now = 200.0;

        let data = vec![1u8; 900];
        let (_, advertisement) =
            sender.start_send(&sender_link, &data, None, now).expect("start send");
        receiver.handle_packet(&advertisement, &mut receiver_link, now);

        let mut request_actions = 0;
        for _ in 0..64 {
            now += 3600.0;
            let actions = receiver.job(now, |_| 0.1);
            request_actions += actions
                .iter()
                .filter(|action| matches!(action, ResourceAction::SendRequest { .. }))
                .count();
            if receiver.incoming_count() == 0 {
                break;
            }
        }

        assert_eq!(request_actions, MAX_RETRIES as usize);
        assert_eq!(receiver.incoming_count(), 0);
        assert!(receiver.drain_events().iter().any(|event| matches!(
            event.kind,
            ResourceEventKind::Failed { status: ResourceStatus::Failed }
        )));
    }

    #[test]
    fn sender_readvertises_then_fails_without_requests() {
        let (sender_link, _) = established_pair();
        let mut sender = ResourceManager::new();
        let mut now = 200.0;

        let data = vec![2u8; 400];
        sender.start_send(&sender_link, &data, None, now).expect("start send");

        let mut readvertisements = 0;
        for _ in 0..16 {
            now += 60.0;
            let actions = sender.job(now, |_| 0.1);
            readvertisements += actions
                .iter()
                .filter(|action| matches!(action, ResourceAction::Readvertise { .. }))
                .count();
            if sender.outgoing_count() == 0 {
                break;
            }
        }

        assert_eq!(readvertisements, MAX_ADV_RETRIES as usize);
        assert_eq!(sender.outgoing_count(), 0);
    }

    #[test]
    fn cancel_drops_both_sides() {
        let (sender_link, mut receiver_link) = established_pair();
        let mut sender = ResourceManager::new();
        let mut receiver = ResourceManager::new();
        let now = 200.0;

        let data = vec![3u8; 500];
        let (hash, advertisement) =
            sender.start_send(&sender_link, &data, None, now).expect("start send");
        receiver.handle_packet(&advertisement, &mut receiver_link, now);

        let cancel = sender.cancel(&hash, &sender_link).expect("cancel packet");
        assert_eq!(sender.outgoing_count(), 0);

        receiver.handle_packet(&cancel, &mut receiver_link, now);
        assert_eq!(receiver.incoming_count(), 0);
    }
}

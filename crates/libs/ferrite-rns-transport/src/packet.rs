use core::fmt;

use sha2::Digest;

use rns_core::buffer::ByteBuf;
use rns_core::error::RnsError;
use rns_core::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};
use rns_core::identity::PrivateIdentity;

// Reticulum default MTU (500) minus the largest header and the one-byte
// IFAC minimum: 500 - (2 + 1 + 16*2) - 1 = 464.
pub const RETICULUM_MTU: usize = 500;
pub const PACKET_MDU: usize = 464;
pub const HEADER_MINSIZE: usize = 2 + ADDRESS_HASH_SIZE + 1;
pub const HEADER_MAXSIZE: usize = 2 + ADDRESS_HASH_SIZE * 2 + 1;
pub const IFAC_MIN_SIZE: usize = 1;
pub const MAX_HOPS: u8 = 127;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum IfacFlag {
    Open = 0b0,
    Authenticated = 0b1,
}

impl From<u8> for IfacFlag {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => IfacFlag::Authenticated,
            _ => IfacFlag::Open,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HeaderType {
    Type1 = 0b0,
    Type2 = 0b1,
}

impl From<u8> for HeaderType {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => HeaderType::Type2,
            _ => HeaderType::Type1,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ContextFlag {
    Unset = 0b0,
    Set = 0b1,
}

impl From<u8> for ContextFlag {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => ContextFlag::Set,
            _ => ContextFlag::Unset,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PropagationType {
    Broadcast = 0b0,
    Transport = 0b1,
}

impl From<u8> for PropagationType {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => PropagationType::Transport,
            _ => PropagationType::Broadcast,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DestinationType {
    Single = 0b00,
    Group = 0b01,
    Plain = 0b10,
    Link = 0b11,
}

impl From<u8> for DestinationType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => DestinationType::Group,
            0b10 => DestinationType::Plain,
            0b11 => DestinationType::Link,
            _ => DestinationType::Single,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketType {
    Data = 0b00,
    Announce = 0b01,
    LinkRequest = 0b10,
    Proof = 0b11,
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => PacketType::Announce,
            0b10 => PacketType::LinkRequest,
            0b11 => PacketType::Proof,
            _ => PacketType::Data,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketContext {
    None = 0x00,
    Resource = 0x01,
    ResourceAdvertisement = 0x02,
    ResourceRequest = 0x03,
    ResourceHashUpdate = 0x04,
    ResourceProof = 0x05,
    ResourceInitiatorCancel = 0x06,
    ResourceReceiverCancel = 0x07,
    CacheRequest = 0x08,
    Request = 0x09,
    Response = 0x0A,
    PathResponse = 0x0B,
    Command = 0x0C,
    CommandStatus = 0x0D,
    Channel = 0x0E,
    KeepAlive = 0xFA,
    LinkIdentify = 0xFB,
    LinkClose = 0xFC,
    LinkProof = 0xFD,
    LinkRtt = 0xFE,
    LinkRequestProof = 0xFF,
}

impl From<u8> for PacketContext {
    fn from(value: u8) -> Self {
        match value {
            0x01 => PacketContext::Resource,
            0x02 => PacketContext::ResourceAdvertisement,
            0x03 => PacketContext::ResourceRequest,
            0x04 => PacketContext::ResourceHashUpdate,
            0x05 => PacketContext::ResourceProof,
            0x06 => PacketContext::ResourceInitiatorCancel,
            0x07 => PacketContext::ResourceReceiverCancel,
            0x08 => PacketContext::CacheRequest,
            0x09 => PacketContext::Request,
            0x0A => PacketContext::Response,
            0x0B => PacketContext::PathResponse,
            0x0C => PacketContext::Command,
            0x0D => PacketContext::CommandStatus,
            0x0E => PacketContext::Channel,
            0xFA => PacketContext::KeepAlive,
            0xFB => PacketContext::LinkIdentify,
            0xFC => PacketContext::LinkClose,
            0xFD => PacketContext::LinkProof,
            0xFE => PacketContext::LinkRtt,
            0xFF => PacketContext::LinkRequestProof,
            _ => PacketContext::None,
        }
    }
}

impl PacketContext {
    /// Contexts belonging to an in-flight resource transfer.
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            PacketContext::Resource
                | PacketContext::ResourceAdvertisement
                | PacketContext::ResourceRequest
                | PacketContext::ResourceHashUpdate
                | PacketContext::ResourceProof
                | PacketContext::ResourceInitiatorCancel
                | PacketContext::ResourceReceiverCancel
        )
    }

    /// Contexts that manage the link itself rather than carry user data.
    pub fn is_link_control(&self) -> bool {
        matches!(
            self,
            PacketContext::KeepAlive
                | PacketContext::LinkIdentify
                | PacketContext::LinkClose
                | PacketContext::LinkProof
                | PacketContext::LinkRtt
                | PacketContext::LinkRequestProof
        )
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Header {
    pub ifac_flag: IfacFlag,
    pub header_type: HeaderType,
    pub context_flag: ContextFlag,
    pub propagation_type: PropagationType,
    pub destination_type: DestinationType,
    pub packet_type: PacketType,
    pub hops: u8,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            ifac_flag: IfacFlag::Open,
            header_type: HeaderType::Type1,
            context_flag: ContextFlag::Unset,
            propagation_type: PropagationType::Broadcast,
            destination_type: DestinationType::Single,
            packet_type: PacketType::Data,
            hops: 0,
        }
    }
}

impl Header {
    pub fn to_meta(&self) -> u8 {
        (self.ifac_flag as u8) << 7
            | (self.header_type as u8) << 6
            | (self.context_flag as u8) << 5
            | (self.propagation_type as u8) << 4
            | (self.destination_type as u8) << 2
            | (self.packet_type as u8)
    }

    pub fn from_meta(meta: u8) -> Self {
        Self {
            ifac_flag: IfacFlag::from(meta >> 7),
            header_type: HeaderType::from(meta >> 6),
            context_flag: ContextFlag::from(meta >> 5),
            propagation_type: PropagationType::from(meta >> 4),
            destination_type: DestinationType::from(meta >> 2),
            packet_type: PacketType::from(meta),
            hops: 0,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0>8b}.{}", self.to_meta(), self.hops)
    }
}

/// A single wire packet. Immutable after construction apart from the hop
/// counter, which transport rewrites while forwarding.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet {
    pub header: Header,
    pub ifac: Option<ByteBuf>,
    pub destination: AddressHash,
    pub transport: Option<AddressHash>,
    pub context: PacketContext,
    pub data: ByteBuf,
}

impl Packet {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RnsError> {
        if bytes.len() < HEADER_MINSIZE {
            return Err(RnsError::PacketError);
        }

        let mut header = Header::from_meta(bytes[0]);
        header.hops = bytes[1];

        let mut index = 2;

        let transport = if header.header_type == HeaderType::Type2 {
            if bytes.len() < HEADER_MAXSIZE {
                return Err(RnsError::PacketError);
            }
            let transport = AddressHash::try_from_slice(&bytes[index..])?;
            index += ADDRESS_HASH_SIZE;
            Some(transport)
        } else {
            None
        };

        let destination = AddressHash::try_from_slice(&bytes[index..])?;
        index += ADDRESS_HASH_SIZE;

        let context = PacketContext::from(bytes[index]);
        index += 1;

        let data = ByteBuf::from_slice(&bytes[index..]);
        if !data.is_valid() {
            return Err(RnsError::OutOfMemory);
        }

        Ok(Self { header, ifac: None, destination, transport, context, data })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RnsError> {
        let mut out = Vec::with_capacity(HEADER_MAXSIZE + self.data.len());

        out.push(self.header.to_meta());
        out.push(self.header.hops);

        if self.header.header_type == HeaderType::Type2 {
            let transport = self.transport.ok_or(RnsError::InvalidArgument)?;
            out.extend_from_slice(transport.as_slice());
        }

        out.extend_from_slice(self.destination.as_slice());
        out.push(self.context as u8);
        out.extend_from_slice(self.data.as_slice());

        Ok(out)
    }

    /// Digest over the fields that do not change in transit: the flag bits
    /// below the hop-relevant ones, destination, context and payload.
    pub fn hash(&self) -> Hash {
        Hash::new(
            Hash::generator()
                .chain_update([self.header.to_meta() & 0b0000_1111])
                .chain_update(self.destination.as_slice())
                .chain_update([self.context as u8])
                .chain_update(self.data.as_slice())
                .finalize()
                .into(),
        )
    }

    pub fn truncated_hash(&self) -> AddressHash {
        self.hash().truncated()
    }

    /// Whether transport keeps a copy on disk for path responses and
    /// proof replays.
    pub fn is_cacheable(&self) -> bool {
        matches!(self.header.packet_type, PacketType::Announce | PacketType::Proof)
    }

    /// Build the explicit proof for this packet: the packet hash and a
    /// signature over it, addressed to the packet's truncated hash so
    /// transport can route it backwards along the reverse table.
    pub fn prove(&self, identity: &PrivateIdentity) -> Packet {
        let hash = self.hash();
        let signature = identity.sign(hash.as_slice());

        let mut data = ByteBuf::from_slice(hash.as_slice());
        data.append(&signature.to_bytes());

        Packet {
            header: Header { packet_type: PacketType::Proof, ..Default::default() },
            ifac: None,
            destination: hash.truncated(),
            transport: None,
            context: PacketContext::None,
            data,
        }
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            header: Header::default(),
            ifac: None,
            destination: AddressHash::new_empty(),
            transport: None,
            context: PacketContext::None,
            data: ByteBuf::new(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.header)?;
        if let Some(transport) = self.transport {
            write!(f, " via {}", transport)?;
        }
        write!(f, " {} {}B]", self.destination, self.data.len())
    }
}

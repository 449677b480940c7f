use std::collections::VecDeque;

use ed25519_dalek::{Signature, SigningKey, SIGNATURE_LENGTH};
use rand_core::OsRng;
use sha2::Digest;

use rns_core::buffer::ByteBuf;
use rns_core::error::RnsError;
use rns_core::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE};
use rns_core::identity::{DerivedKey, Identity, PrivateIdentity, PUBLIC_KEY_LENGTH};

use crate::channel::{Channel, ChannelJob, ENVELOPE_HEADER_SIZE};
use crate::packet::{
    DestinationType, Header, Packet, PacketContext, PacketType, PACKET_MDU,
};

use super::DestinationDesc;

pub const ESTABLISHMENT_TIMEOUT_PER_HOP: f64 = 6.0;
pub const KEEPALIVE_INTERVAL: f64 = 360.0;
pub const STALE_TIME: f64 = 720.0;
pub const INACTIVITY_TIMEOUT: f64 = STALE_TIME + KEEPALIVE_INTERVAL;
pub const MAX_ESTABLISHMENT_RETRIES: u8 = 3;

pub const KEEP_ALIVE_REQUEST: u8 = 0xFF;
pub const KEEP_ALIVE_RESPONSE: u8 = 0xFE;

const LINK_MTU_SIZE: usize = 3;

/// Largest plaintext a single link packet can carry after token overhead.
pub const LINK_MDU: usize = PACKET_MDU - 48 - 1;

pub fn establishment_timeout(hops: u8) -> f64 {
    ESTABLISHMENT_TIMEOUT_PER_HOP * (hops.max(1) as f64)
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum LinkStatus {
    Pending = 0x00,
    Handshake = 0x01,
    Active = 0x02,
    Stale = 0x03,
    Closed = 0x04,
}

impl LinkStatus {
    pub fn not_yet_active(&self) -> bool {
        matches!(self, LinkStatus::Pending | LinkStatus::Handshake)
    }

    pub fn usable(&self) -> bool {
        matches!(self, LinkStatus::Active | LinkStatus::Stale)
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TeardownReason {
    Timeout,
    KeepaliveTimeout,
    InitiatorClosed,
    DestinationClosed,
    ChannelExhausted,
}

pub type LinkId = AddressHash;

/// Link id is the truncated hash of the link request, computed over the
/// request without any trailing signalling bytes.
pub fn link_id_from_request(packet: &Packet) -> LinkId {
    let data = packet.data.as_slice();
    let hashable_len = data.len().min(PUBLIC_KEY_LENGTH * 2);

    Hash::new(
        Hash::generator()
            .chain_update([packet.header.to_meta() & 0b0000_1111])
            .chain_update(packet.destination.as_slice())
            .chain_update([packet.context as u8])
            .chain_update(&data[..hashable_len])
            .finalize()
            .into(),
    )
    .truncated()
}

#[derive(Clone)]
pub enum LinkEvent {
    Activated,
    Data { context: PacketContext, payload: Vec<u8> },
    Closed { reason: TeardownReason },
}

#[derive(Clone)]
pub struct LinkEventData {
    pub id: LinkId,
    pub destination: AddressHash,
    pub event: LinkEvent,
}

pub struct Link {
    id: LinkId,
    destination: DestinationDesc,
    priv_identity: PrivateIdentity,
    peer_identity: Identity,
    derived_key: DerivedKey,
    signalling: Option<[u8; LINK_MTU_SIZE]>,
    status: LinkStatus,
    initiator: bool,
    hops: u8,
    request_time: f64,
    proof_timeout: f64,
    establishment_retries: u8,
    last_inbound: f64,
    last_keepalive_sent: f64,
    rtt: f64,
    outbound_interface: Option<AddressHash>,
    channel: Channel,
    events: VecDeque<LinkEventData>,
    teardown_reason: Option<TeardownReason>,
}

impl Link {
    /// Initiator side; follow with [`Link::request`] to obtain the
    /// LINKREQUEST packet.
    pub fn new(destination: DestinationDesc, hops: u8, now: f64) -> Self {
        Self {
            id: AddressHash::new_empty(),
            destination,
            priv_identity: PrivateIdentity::new_from_rand(OsRng),
            peer_identity: Identity::default(),
            derived_key: DerivedKey::new_empty(),
            signalling: None,
            status: LinkStatus::Pending,
            initiator: true,
            hops,
            request_time: now,
            proof_timeout: now + establishment_timeout(hops),
            establishment_retries: 0,
            last_inbound: now,
            last_keepalive_sent: now,
            rtt: 0.0,
            outbound_interface: None,
            channel: Channel::new(),
            events: VecDeque::new(),
            teardown_reason: None,
        }
    }

    /// Responder side, from a LINKREQUEST delivered to a local
    /// destination. The link derives its key immediately and the caller
    /// transmits the returned proof.
    pub fn new_from_request(
        packet: &Packet,
        signing_key: SigningKey,
        destination: DestinationDesc,
        now: f64,
    ) -> Result<(Self, Packet), RnsError> {
        let data = packet.data.as_slice();
        if data.len() < PUBLIC_KEY_LENGTH * 2 {
            return Err(RnsError::PacketError);
        }

        let peer_identity = Identity::new_from_slices(
            &data[..PUBLIC_KEY_LENGTH],
            &data[PUBLIC_KEY_LENGTH..PUBLIC_KEY_LENGTH * 2],
        )?;
        let signalling = if data.len() >= PUBLIC_KEY_LENGTH * 2 + LINK_MTU_SIZE {
            let mut bytes = [0u8; LINK_MTU_SIZE];
            bytes.copy_from_slice(
                &data[PUBLIC_KEY_LENGTH * 2..PUBLIC_KEY_LENGTH * 2 + LINK_MTU_SIZE],
            );
            Some(bytes)
        } else {
            None
        };

        let link_id = link_id_from_request(packet);
        log::debug!("link {}: created from request", link_id);

        let mut link = Self {
            id: link_id,
            destination,
            priv_identity: PrivateIdentity::new(
                x25519_dalek::StaticSecret::random_from_rng(OsRng),
                signing_key,
            ),
            peer_identity,
            derived_key: DerivedKey::new_empty(),
            signalling,
            status: LinkStatus::Pending,
            initiator: false,
            hops: packet.header.hops,
            request_time: now,
            proof_timeout: now + establishment_timeout(packet.header.hops),
            establishment_retries: 0,
            last_inbound: now,
            last_keepalive_sent: now,
            rtt: 0.0,
            outbound_interface: None,
            channel: Channel::new(),
            events: VecDeque::new(),
            teardown_reason: None,
        };

        link.handshake(peer_identity);
        let proof = link.prove(now);
        Ok((link, proof))
    }

    pub fn request(&mut self, now: f64) -> Packet {
        let mut packet_data =
            ByteBuf::from_slice(self.priv_identity.as_identity().public_key_bytes());
        packet_data.append(self.priv_identity.as_identity().verifying_key_bytes());

        let packet = Packet {
            header: Header { packet_type: PacketType::LinkRequest, ..Default::default() },
            ifac: None,
            destination: self.destination.address_hash,
            transport: None,
            context: PacketContext::None,
            data: packet_data,
        };

        self.status = LinkStatus::Pending;
        self.id = link_id_from_request(&packet);
        self.request_time = now;
        self.proof_timeout = now + establishment_timeout(self.hops);

        packet
    }

    /// Responder proof: signature over `link_id ∥ own keys [∥ signalling]`,
    /// activating the link locally.
    fn prove(&mut self, now: f64) -> Packet {
        if self.status != LinkStatus::Active {
            self.status = LinkStatus::Active;
            self.last_inbound = now;
            self.post_event(LinkEvent::Activated);
        }

        let mut signed_data = Vec::with_capacity(128);
        signed_data.extend_from_slice(self.id.as_slice());
        signed_data.extend_from_slice(self.priv_identity.as_identity().public_key_bytes());
        signed_data.extend_from_slice(self.priv_identity.as_identity().verifying_key_bytes());
        if let Some(signalling) = &self.signalling {
            signed_data.extend_from_slice(signalling);
        }
        let signature = self.priv_identity.sign(&signed_data);

        let mut packet_data = ByteBuf::from_slice(&signature.to_bytes());
        packet_data.append(self.priv_identity.as_identity().public_key_bytes());
        if let Some(signalling) = &self.signalling {
            packet_data.append(signalling);
        }

        Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context: PacketContext::LinkRequestProof,
            data: packet_data,
        }
    }

    /// Ack for a received link packet: signature over its hash.
    pub fn prove_packet(&self, packet: &Packet) -> Packet {
        let hash = packet.hash();
        let signature = self.priv_identity.sign(hash.as_slice());

        let mut packet_data = ByteBuf::from_slice(hash.as_slice());
        packet_data.append(&signature.to_bytes());

        Packet {
            header: Header {
                packet_type: PacketType::Proof,
                destination_type: DestinationType::Link,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context: PacketContext::LinkProof,
            data: packet_data,
        }
    }

    fn handshake(&mut self, peer_identity: Identity) {
        self.status = LinkStatus::Handshake;
        self.peer_identity = peer_identity;
        self.derived_key =
            self.priv_identity.derive_key(&self.peer_identity.public_key, Some(self.id.as_slice()));
    }

    pub fn handle_packet(&mut self, packet: &Packet, now: f64) -> Vec<Packet> {
        if packet.destination != self.id {
            return Vec::new();
        }

        match packet.header.packet_type {
            PacketType::Data => self.handle_data_packet(packet, now),
            PacketType::Proof => self.handle_proof_packet(packet, now),
            _ => Vec::new(),
        }
    }

    fn handle_data_packet(&mut self, packet: &Packet, now: f64) -> Vec<Packet> {
        let mut responses = Vec::new();

        match packet.context {
            PacketContext::None
            | PacketContext::Request
            | PacketContext::Response
            | PacketContext::LinkIdentify => {
                let mut buffer = [0u8; PACKET_MDU];
                match self.decrypt(packet.data.as_slice(), &mut buffer) {
                    Ok(plaintext) => {
                        self.mark_inbound(now);
                        let payload = plaintext.to_vec();
                        self.post_event(LinkEvent::Data { context: packet.context, payload });
                        responses.push(self.prove_packet(packet));
                    }
                    Err(_) => {
                        log::debug!("link {}: undecryptable data packet", self.id);
                    }
                }
            }
            PacketContext::Channel => {
                let mut buffer = [0u8; PACKET_MDU];
                match self.decrypt(packet.data.as_slice(), &mut buffer) {
                    Ok(plaintext) => {
                        self.mark_inbound(now);
                        let plaintext = plaintext.to_vec();
                        responses.push(self.prove_packet(packet));
                        if self.channel.receive(&plaintext).is_err() {
                            log::debug!("link {}: malformed channel envelope", self.id);
                        }
                    }
                    Err(_) => {
                        log::debug!("link {}: undecryptable channel packet", self.id);
                    }
                }
            }
            PacketContext::KeepAlive => {
                if packet.data.byte_at(0) == Some(KEEP_ALIVE_REQUEST) {
                    self.mark_inbound(now);
                    responses.push(self.keep_alive_packet(KEEP_ALIVE_RESPONSE));
                } else if packet.data.byte_at(0) == Some(KEEP_ALIVE_RESPONSE) {
                    self.mark_inbound(now);
                }
            }
            PacketContext::LinkClose => {
                let mut buffer = [0u8; PACKET_MDU];
                if let Ok(plaintext) = self.decrypt(packet.data.as_slice(), &mut buffer) {
                    if plaintext == self.id.as_slice() {
                        let reason = if self.initiator {
                            TeardownReason::DestinationClosed
                        } else {
                            TeardownReason::InitiatorClosed
                        };
                        self.close(reason);
                    }
                }
            }
            PacketContext::LinkRtt => {
                let mut buffer = [0u8; PACKET_MDU];
                if let Ok(plaintext) = self.decrypt(packet.data.as_slice(), &mut buffer) {
                    if let Ok(peer_rtt) = rmp::decode::read_f32(&mut &plaintext[..]) {
                        self.mark_inbound(now);
                        if self.rtt == 0.0 {
                            self.rtt = peer_rtt as f64;
                        }
                    }
                }
            }
            _ => {}
        }

        responses
    }

    fn handle_proof_packet(&mut self, packet: &Packet, now: f64) -> Vec<Packet> {
        match packet.context {
            PacketContext::LinkRequestProof => {
                if self.status == LinkStatus::Pending && self.initiator {
                    match validate_proof_packet(&self.destination, &self.id, packet) {
                        Ok(identity) => {
                            self.handshake(identity);
                            self.status = LinkStatus::Active;
                            self.mark_inbound(now);
                            self.update_rtt(now - self.request_time);
                            log::debug!("link {}: activated", self.id);
                            self.post_event(LinkEvent::Activated);
                            return vec![self.rtt_packet()];
                        }
                        Err(_) => {
                            log::debug!("link {}: invalid link request proof", self.id);
                        }
                    }
                }
            }
            PacketContext::LinkProof => {
                // Ack for one of our link packets: `hash ∥ signature`.
                let data = packet.data.as_slice();
                if data.len() < 32 + SIGNATURE_LENGTH {
                    return Vec::new();
                }
                let Ok(hash) = Hash::try_from_slice(&data[..32]) else {
                    return Vec::new();
                };
                let Ok(signature) = Signature::from_slice(&data[32..32 + SIGNATURE_LENGTH]) else {
                    return Vec::new();
                };
                if self.peer_identity.verify(hash.as_slice(), &signature).is_err() {
                    log::debug!("link {}: bad packet proof signature", self.id);
                    return Vec::new();
                }
                self.mark_inbound(now);
                if self.channel.on_packet_delivered(&hash, now) {
                    self.update_rtt(self.channel.rtt());
                }
            }
            _ => {}
        }

        Vec::new()
    }

    /// Build an encrypted DATA packet for this link.
    pub fn data_packet(&self, data: &[u8]) -> Result<Packet, RnsError> {
        self.packet_with_context(data, PacketContext::None)
    }

    pub fn packet_with_context(
        &self,
        data: &[u8],
        context: PacketContext,
    ) -> Result<Packet, RnsError> {
        let mut buffer = [0u8; PACKET_MDU];
        let cipher_len = {
            let mut rng = OsRng;
            let cipher = self.derived_key.encrypt(data, &mut buffer, &mut rng)?;
            cipher.len()
        };

        let packet_data = ByteBuf::from_slice(&buffer[..cipher_len]);
        if !packet_data.is_valid() {
            return Err(RnsError::OutOfMemory);
        }

        Ok(Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context,
            data: packet_data,
        })
    }

    pub fn keep_alive_packet(&self, marker: u8) -> Packet {
        Packet {
            header: Header {
                destination_type: DestinationType::Link,
                packet_type: PacketType::Data,
                ..Default::default()
            },
            ifac: None,
            destination: self.id,
            transport: None,
            context: PacketContext::KeepAlive,
            data: ByteBuf::from_slice(&[marker]),
        }
    }

    /// Measured round-trip, MsgPack float, for the responder's bookkeeping.
    fn rtt_packet(&self) -> Packet {
        let mut encoded = Vec::with_capacity(8);
        let _ = rmp::encode::write_f32(&mut encoded, self.rtt as f32);
        self.packet_with_context(&encoded, PacketContext::LinkRtt)
            .unwrap_or_else(|_| self.keep_alive_packet(KEEP_ALIVE_REQUEST))
    }

    /// Teardown notice for the peer; the local side closes immediately.
    pub fn teardown_packet(&mut self) -> Option<Packet> {
        let packet = self.packet_with_context(self.id.as_slice(), PacketContext::LinkClose).ok();
        let reason = if self.initiator {
            TeardownReason::InitiatorClosed
        } else {
            TeardownReason::DestinationClosed
        };
        self.close(reason);
        packet
    }

    pub fn send_channel_message(
        &mut self,
        message: &dyn crate::channel::ChannelMessage,
        now: f64,
    ) -> Result<Packet, RnsError> {
        if self.status != LinkStatus::Active {
            return Err(RnsError::InvalidArgument);
        }
        if !self.channel.is_ready_to_send() {
            return Err(RnsError::TableFull);
        }

        let payload = message.pack();
        if payload.len() + ENVELOPE_HEADER_SIZE > self.mdu() {
            return Err(RnsError::OutOfMemory);
        }

        let sequence = self.channel.take_tx_sequence()?;
        let envelope = crate::channel::Envelope {
            msg_type: message.msg_type(),
            sequence,
            payload,
        };
        let packet = self.packet_with_context(&envelope.pack(), PacketContext::Channel)?;
        self.channel.track(sequence, packet.clone(), packet.hash(), now);
        Ok(packet)
    }

    pub fn channel(&mut self) -> &mut Channel {
        &mut self.channel
    }

    /// Periodic maintenance driven by the transport sweep.
    pub fn poll(&mut self, now: f64) -> Vec<Packet> {
        let mut out = Vec::new();

        match self.status {
            LinkStatus::Pending | LinkStatus::Handshake => {
                if now > self.proof_timeout {
                    if self.initiator && self.establishment_retries < MAX_ESTABLISHMENT_RETRIES {
                        self.establishment_retries += 1;
                        log::debug!(
                            "link {}: establishment retry {}",
                            self.id,
                            self.establishment_retries
                        );
                        out.push(self.request(now));
                    } else {
                        self.close(TeardownReason::Timeout);
                    }
                }
            }
            LinkStatus::Active | LinkStatus::Stale => {
                let silent_for = now - self.last_inbound;

                if silent_for > INACTIVITY_TIMEOUT {
                    self.close(TeardownReason::KeepaliveTimeout);
                    return out;
                }

                if silent_for > STALE_TIME && self.status == LinkStatus::Active {
                    log::debug!("link {}: stale", self.id);
                    self.status = LinkStatus::Stale;
                }

                if self.initiator
                    && silent_for > KEEPALIVE_INTERVAL
                    && now - self.last_keepalive_sent > KEEPALIVE_INTERVAL
                {
                    self.last_keepalive_sent = now;
                    out.push(self.keep_alive_packet(KEEP_ALIVE_REQUEST));
                }

                let ChannelJob { resend, teardown } = self.channel.job(now);
                out.extend(resend);
                if teardown {
                    self.close(TeardownReason::ChannelExhausted);
                }
            }
            LinkStatus::Closed => {}
        }

        out
    }

    pub fn encrypt<'a>(&self, text: &[u8], out_buf: &'a mut [u8]) -> Result<&'a [u8], RnsError> {
        self.derived_key.encrypt(text, out_buf, OsRng)
    }

    pub fn decrypt<'a>(&self, token: &[u8], out_buf: &'a mut [u8]) -> Result<&'a [u8], RnsError> {
        self.derived_key.decrypt(token, out_buf)
    }

    pub fn close(&mut self, reason: TeardownReason) {
        if self.status == LinkStatus::Closed {
            return;
        }
        self.status = LinkStatus::Closed;
        self.teardown_reason = Some(reason);
        self.channel.shutdown();
        self.post_event(LinkEvent::Closed { reason });
        log::debug!("link {}: closed ({:?})", self.id, reason);
    }

    fn mark_inbound(&mut self, now: f64) {
        self.last_inbound = now;
        if self.status == LinkStatus::Stale {
            self.status = LinkStatus::Active;
        }
    }

    fn update_rtt(&mut self, sample: f64) {
        if sample <= 0.0 {
            return;
        }
        if self.rtt == 0.0 {
            self.rtt = sample;
        } else {
            self.rtt = 0.7 * self.rtt + 0.3 * sample;
        }
    }

    fn post_event(&mut self, event: LinkEvent) {
        self.events.push_back(LinkEventData {
            id: self.id,
            destination: self.destination.address_hash,
            event,
        });
    }

    pub fn take_events(&mut self) -> Vec<LinkEventData> {
        self.events.drain(..).collect()
    }

    pub fn mdu(&self) -> usize {
        LINK_MDU
    }

    pub fn id(&self) -> &LinkId {
        &self.id
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn rtt(&self) -> f64 {
        self.rtt
    }

    pub fn destination(&self) -> &DestinationDesc {
        &self.destination
    }

    pub fn peer_identity(&self) -> &Identity {
        &self.peer_identity
    }

    pub fn teardown_reason(&self) -> Option<TeardownReason> {
        self.teardown_reason
    }

    pub fn set_outbound_interface(&mut self, iface: Option<AddressHash>) {
        self.outbound_interface = iface;
    }

    pub fn outbound_interface(&self) -> Option<AddressHash> {
        self.outbound_interface
    }

    pub fn proof_timeout(&self) -> f64 {
        self.proof_timeout
    }

    pub fn elapsed_since_request(&self, now: f64) -> f64 {
        now - self.request_time
    }
}

fn validate_proof_packet(
    destination: &DestinationDesc,
    id: &LinkId,
    packet: &Packet,
) -> Result<Identity, RnsError> {
    const MIN_PROOF_LEN: usize = SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH;
    const MTU_PROOF_LEN: usize = SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH + LINK_MTU_SIZE;

    let data = packet.data.as_slice();
    if data.len() < MIN_PROOF_LEN {
        return Err(RnsError::PacketError);
    }

    let peer_public = &data[SIGNATURE_LENGTH..SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH];
    let verifying_key = destination.identity.verifying_key_bytes();

    let mut signed_data = Vec::with_capacity(ADDRESS_HASH_SIZE + PUBLIC_KEY_LENGTH * 2 + LINK_MTU_SIZE);
    signed_data.extend_from_slice(id.as_slice());
    signed_data.extend_from_slice(peer_public);
    signed_data.extend_from_slice(verifying_key);
    if data.len() >= MTU_PROOF_LEN {
        signed_data.extend_from_slice(&data[SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH..MTU_PROOF_LEN]);
    }

    let identity = Identity::new_from_slices(peer_public, verifying_key)?;
    let signature =
        Signature::from_slice(&data[..SIGNATURE_LENGTH]).map_err(|_| RnsError::CryptoError)?;
    identity.verify(&signed_data, &signature)?;

    Ok(identity)
}

use core::fmt;
use std::collections::VecDeque;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use rns_core::error::RnsError;
use rns_core::hash::AddressHash;

use crate::packet::{IfacFlag, Packet};

pub const MAX_INTERFACES: usize = 8;
pub const MAX_QUEUED_ANNOUNCES: usize = 16;
pub const IFAC_SIZE: usize = 8;
const IFAC_KEY_LENGTH: usize = 64;

/// Operating mode of an interface; drives announce propagation policy and
/// path expiry (see transport culling).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum InterfaceMode {
    Full,
    Gateway,
    AccessPoint,
    Roaming,
    Boundary,
    None,
}

impl InterfaceMode {
    pub fn is_roaming_class(&self) -> bool {
        matches!(self, InterfaceMode::Roaming | InterfaceMode::Boundary)
    }
}

/// Static description an interface driver registers with the core.
#[derive(Clone)]
pub struct InterfaceProperties {
    pub hash: AddressHash,
    pub mtu: usize,
    pub bitrate: u64,
    pub mode: InterfaceMode,
    pub out_enabled: bool,
    /// Fraction of the bitrate announces may consume, 0 disables the cap.
    pub announce_cap: f64,
    pub announce_rate_target: Option<f64>,
    pub announce_rate_grace: u32,
    pub announce_rate_penalty: f64,
    pub parent_interface: Option<AddressHash>,
    pub is_local_shared_instance: bool,
    pub is_connected_to_shared_instance: bool,
    pub ifac: Option<IfacContext>,
}

impl InterfaceProperties {
    pub fn new(hash: AddressHash, mtu: usize, bitrate: u64, mode: InterfaceMode) -> Self {
        Self {
            hash,
            mtu,
            bitrate,
            mode,
            out_enabled: true,
            announce_cap: 0.0,
            announce_rate_target: None,
            announce_rate_grace: 0,
            announce_rate_penalty: 0.0,
            parent_interface: None,
            is_local_shared_instance: false,
            is_connected_to_shared_instance: false,
            ifac: None,
        }
    }
}

/// What the core needs from a driver: a way to put bytes on the medium.
/// Everything else about the interface lives in [`InterfaceProperties`].
pub trait InterfaceDriver {
    fn send(&mut self, frame: &[u8]) -> Result<(), RnsError>;
}

/// Interface access code context. Frames on an IFAC-protected interface
/// carry an HMAC tag and are XOR-masked with HKDF output so unrelated
/// traffic on the shared medium stays unintelligible.
#[derive(Clone)]
pub struct IfacContext {
    key: [u8; IFAC_KEY_LENGTH],
}

impl IfacContext {
    pub fn new_from_passphrase(netname: &str, passphrase: &str) -> Self {
        let mut key = [0u8; IFAC_KEY_LENGTH];
        let _ = Hkdf::<Sha256>::new(Some(netname.as_bytes()), passphrase.as_bytes())
            .expand(b"ifac", &mut key);
        Self { key }
    }

    fn tag(&self, frame: &[u8]) -> [u8; IFAC_SIZE] {
        let mut hmac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key).expect("hmac key");
        hmac.update(frame);
        let digest = hmac.finalize().into_bytes();
        let mut tag = [0u8; IFAC_SIZE];
        tag.copy_from_slice(&digest[..IFAC_SIZE]);
        tag
    }

    fn mask_for(&self, tag: &[u8; IFAC_SIZE], len: usize) -> Vec<u8> {
        let mut mask = vec![0u8; len];
        let _ = Hkdf::<Sha256>::new(Some(tag), &self.key).expand(b"mask", &mut mask);
        mask
    }

    /// `frame` is a fully packed packet with the IFAC flag unset. Output:
    /// flag byte with IFAC set, hops, access code, masked remainder.
    pub fn mask(&self, frame: &[u8]) -> Result<Vec<u8>, RnsError> {
        if frame.len() < 2 {
            return Err(RnsError::PacketError);
        }

        let tag = self.tag(frame);
        let mask = self.mask_for(&tag, frame.len() - 2);

        let mut out = Vec::with_capacity(frame.len() + IFAC_SIZE);
        out.push(frame[0] | (IfacFlag::Authenticated as u8) << 7);
        out.push(frame[1]);
        out.extend_from_slice(&tag);
        for (byte, mask_byte) in frame[2..].iter().zip(mask.iter()) {
            out.push(byte ^ mask_byte);
        }
        Ok(out)
    }

    /// Reverses [`IfacContext::mask`] and authenticates the result.
    pub fn unmask(&self, frame: &[u8]) -> Result<Vec<u8>, RnsError> {
        if frame.len() < 2 + IFAC_SIZE {
            return Err(RnsError::PacketError);
        }
        if frame[0] >> 7 != IfacFlag::Authenticated as u8 {
            return Err(RnsError::PacketError);
        }

        let mut tag = [0u8; IFAC_SIZE];
        tag.copy_from_slice(&frame[2..2 + IFAC_SIZE]);
        let masked = &frame[2 + IFAC_SIZE..];
        let mask = self.mask_for(&tag, masked.len());

        let mut out = Vec::with_capacity(frame.len() - IFAC_SIZE);
        out.push(frame[0] & 0b0111_1111);
        out.push(frame[1]);
        for (byte, mask_byte) in masked.iter().zip(mask.iter()) {
            out.push(byte ^ mask_byte);
        }

        if self.tag(&out) != tag {
            return Err(RnsError::IncorrectSignature);
        }
        Ok(out)
    }
}

/// An announce waiting for interface budget, newest emission wins per
/// destination.
pub struct QueuedAnnounce {
    pub destination: AddressHash,
    pub emitted: u64,
    pub packet: Packet,
}

pub struct Interface {
    pub properties: InterfaceProperties,
    driver: Box<dyn InterfaceDriver>,
    pub tx_count: u64,
    pub rx_count: u64,
    pub tx_errors: u64,
    announce_allowed_at: f64,
    announce_queue: VecDeque<QueuedAnnounce>,
}

impl Interface {
    fn new(properties: InterfaceProperties, driver: Box<dyn InterfaceDriver>) -> Self {
        Self {
            properties,
            driver,
            tx_count: 0,
            rx_count: 0,
            tx_errors: 0,
            announce_allowed_at: 0.0,
            announce_queue: VecDeque::new(),
        }
    }

    pub fn hash(&self) -> AddressHash {
        self.properties.hash
    }

    pub fn transmit(&mut self, frame: &[u8]) -> Result<(), RnsError> {
        let result = match &self.properties.ifac {
            Some(ifac) => {
                let masked = ifac.mask(frame)?;
                self.driver.send(&masked)
            }
            None => self.driver.send(frame),
        };
        match result {
            Ok(()) => {
                self.tx_count += 1;
                Ok(())
            }
            Err(err) => {
                self.tx_errors += 1;
                log::warn!("iface {}: send failed: {}", self.properties.hash, err);
                Err(err)
            }
        }
    }

    /// Charge the announce budget for a frame of `len` bytes at `now`.
    /// Returns false when the cap is exhausted and the caller should queue.
    pub fn consume_announce_budget(&mut self, len: usize, now: f64) -> bool {
        if self.properties.announce_cap <= 0.0 || self.properties.bitrate == 0 {
            return true;
        }
        if now < self.announce_allowed_at {
            return false;
        }
        let tx_seconds = (len * 8) as f64 / self.properties.bitrate as f64;
        self.announce_allowed_at = now + tx_seconds / self.properties.announce_cap;
        true
    }

    pub fn announce_budget_ready(&self, now: f64) -> bool {
        self.properties.announce_cap <= 0.0 || now >= self.announce_allowed_at
    }

    /// Queue an announce for later transmission. A destination already in
    /// the queue keeps only the newest emission timestamp; a full queue
    /// refuses the oldest-priority insertion.
    pub fn queue_announce(
        &mut self,
        destination: AddressHash,
        emitted: u64,
        packet: Packet,
    ) -> Result<(), RnsError> {
        if let Some(existing) =
            self.announce_queue.iter_mut().find(|entry| entry.destination == destination)
        {
            if emitted >= existing.emitted {
                existing.emitted = emitted;
                existing.packet = packet;
            }
            return Ok(());
        }

        if self.announce_queue.len() >= MAX_QUEUED_ANNOUNCES {
            log::warn!("iface {}: announce queue full", self.properties.hash);
            return Err(RnsError::TableFull);
        }

        self.announce_queue.push_back(QueuedAnnounce { destination, emitted, packet });
        Ok(())
    }

    pub fn pop_queued_announce(&mut self, now: f64) -> Option<QueuedAnnounce> {
        if !self.announce_budget_ready(now) {
            return None;
        }
        self.announce_queue.pop_front()
    }

    pub fn queued_announces(&self) -> usize {
        self.announce_queue.len()
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Interface[{} mode={:?}]", self.properties.hash, self.properties.mode)
    }
}

/// Fixed-capacity registry keyed by interface hash.
pub struct InterfaceRegistry {
    slots: [Option<Interface>; MAX_INTERFACES],
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self { slots: core::array::from_fn(|_| None) }
    }

    pub fn register(
        &mut self,
        properties: InterfaceProperties,
        driver: Box<dyn InterfaceDriver>,
    ) -> Result<AddressHash, RnsError> {
        let hash = properties.hash;
        if self.get(&hash).is_some() {
            return Err(RnsError::InvalidArgument);
        }

        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(Interface::new(properties, driver));
                return Ok(hash);
            }
        }

        log::warn!("iface: registry full, rejecting {}", hash);
        Err(RnsError::TableFull)
    }

    pub fn remove(&mut self, hash: &AddressHash) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map(|iface| iface.hash()) == Some(*hash) {
                *slot = None;
                return true;
            }
        }
        false
    }

    pub fn get(&self, hash: &AddressHash) -> Option<&Interface> {
        self.slots.iter().flatten().find(|iface| iface.hash() == *hash)
    }

    pub fn get_mut(&mut self, hash: &AddressHash) -> Option<&mut Interface> {
        self.slots.iter_mut().flatten().find(|iface| iface.hash() == *hash)
    }

    pub fn contains(&self, hash: &AddressHash) -> bool {
        self.get(hash).is_some()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Interface> {
        self.slots.iter_mut().flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use rns_core::error::RnsError;

    use super::InterfaceDriver;

    /// Captures transmitted frames for assertions.
    #[derive(Default)]
    pub struct RecordingDriver {
        pub frames: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl RecordingDriver {
        pub fn new() -> (Self, Rc<RefCell<Vec<Vec<u8>>>>) {
            let frames = Rc::new(RefCell::new(Vec::new()));
            (Self { frames: frames.clone() }, frames)
        }
    }

    impl InterfaceDriver for RecordingDriver {
        fn send(&mut self, frame: &[u8]) -> Result<(), RnsError> {
            self.frames.borrow_mut().push(frame.to_vec());
            Ok(())
        }
    }
}

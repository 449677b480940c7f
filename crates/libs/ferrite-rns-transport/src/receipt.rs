use ed25519_dalek::{Signature, SIGNATURE_LENGTH};

use rns_core::hash::{AddressHash, Hash, HASH_SIZE};
use rns_core::identity::Identity;

use crate::packet::Packet;

/// Proof round-trips are allowed this many seconds per hop before the
/// receipt sweep declares them failed.
pub const RECEIPT_TIMEOUT_PER_HOP: f64 = 15.0;
pub const RECEIPT_MIN_TIMEOUT: f64 = 30.0;

pub const EXPLICIT_PROOF_LENGTH: usize = HASH_SIZE + SIGNATURE_LENGTH;
pub const IMPLICIT_PROOF_LENGTH: usize = SIGNATURE_LENGTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Sent,
    Delivered,
    Failed,
    /// Forced out of the pool before any proof arrived.
    Culled,
}

pub type ReceiptCallback = Box<dyn FnMut(&PacketReceipt)>;

/// Tracks one outbound packet awaiting a cryptographic proof of receipt.
pub struct PacketReceipt {
    pub packet_hash: Hash,
    pub destination: AddressHash,
    pub sent_at: f64,
    pub timeout_at: f64,
    pub status: ReceiptStatus,
    pub rtt: Option<f64>,
    delivered_callback: Option<ReceiptCallback>,
    timeout_callback: Option<ReceiptCallback>,
}

impl PacketReceipt {
    pub fn new(packet: &Packet, hops_estimate: u8, now: f64) -> Self {
        let timeout =
            RECEIPT_MIN_TIMEOUT.max(RECEIPT_TIMEOUT_PER_HOP * hops_estimate.max(1) as f64);
        Self {
            packet_hash: packet.hash(),
            destination: packet.destination,
            sent_at: now,
            timeout_at: now + timeout,
            status: ReceiptStatus::Sent,
            rtt: None,
            delivered_callback: None,
            timeout_callback: None,
        }
    }

    pub fn set_delivered_callback(&mut self, callback: ReceiptCallback) {
        self.delivered_callback = Some(callback);
    }

    pub fn set_timeout_callback(&mut self, callback: ReceiptCallback) {
        self.timeout_callback = Some(callback);
    }

    /// Try to settle this receipt with a proof payload. Explicit proofs
    /// carry `packet_hash ∥ signature`; implicit ones only the signature,
    /// with the packet hash implied by the proof's destination field.
    pub fn validate_proof(
        &mut self,
        proof_destination: &AddressHash,
        proof_data: &[u8],
        identity: &Identity,
        now: f64,
    ) -> bool {
        if self.status != ReceiptStatus::Sent {
            return false;
        }

        let signature_bytes = match proof_data.len() {
            EXPLICIT_PROOF_LENGTH => {
                if &proof_data[..HASH_SIZE] != self.packet_hash.as_slice() {
                    return false;
                }
                &proof_data[HASH_SIZE..]
            }
            IMPLICIT_PROOF_LENGTH => {
                if *proof_destination != self.packet_hash.truncated() {
                    return false;
                }
                proof_data
            }
            _ => return false,
        };

        let Ok(signature) = Signature::from_slice(signature_bytes) else {
            return false;
        };
        if identity.verify(self.packet_hash.as_slice(), &signature).is_err() {
            return false;
        }

        self.status = ReceiptStatus::Delivered;
        self.rtt = Some(now - self.sent_at);
        if let Some(mut callback) = self.delivered_callback.take() {
            callback(self);
        }
        true
    }

    /// Returns true when the receipt left the SENT state.
    pub fn check_timeout(&mut self, now: f64) -> bool {
        if self.status != ReceiptStatus::Sent {
            return true;
        }
        if now >= self.timeout_at {
            self.status = ReceiptStatus::Failed;
            if let Some(mut callback) = self.timeout_callback.take() {
                callback(self);
            }
            return true;
        }
        false
    }

    pub fn force_timeout(&mut self) {
        if self.status == ReceiptStatus::Sent {
            self.status = ReceiptStatus::Culled;
            if let Some(mut callback) = self.timeout_callback.take() {
                callback(self);
            }
        }
    }
}

/// Bounded queue of outstanding receipts, oldest first.
pub struct ReceiptTable {
    receipts: Vec<PacketReceipt>,
    capacity: usize,
}

impl ReceiptTable {
    pub fn new(capacity: usize) -> Self {
        Self { receipts: Vec::with_capacity(capacity), capacity }
    }

    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }

    /// Add a receipt, forcing out the oldest one when the pool is full.
    pub fn add(&mut self, receipt: PacketReceipt) {
        while self.receipts.len() >= self.capacity {
            let mut culled = self.receipts.remove(0);
            log::warn!("receipt pool full, culling {}", culled.packet_hash);
            culled.force_timeout();
        }
        self.receipts.push(receipt);
    }

    pub fn get(&self, packet_hash: &Hash) -> Option<&PacketReceipt> {
        self.receipts.iter().find(|receipt| receipt.packet_hash == *packet_hash)
    }

    /// Offer a proof to every outstanding receipt; the first match settles
    /// and is removed.
    pub fn handle_proof<F>(
        &mut self,
        proof_destination: &AddressHash,
        proof_data: &[u8],
        recall_identity: F,
        now: f64,
    ) -> Option<PacketReceipt>
    where
        F: Fn(&AddressHash) -> Option<Identity>,
    {
        for index in 0..self.receipts.len() {
            let destination = self.receipts[index].destination;
            let Some(identity) = recall_identity(&destination) else {
                continue;
            };
            if self.receipts[index].validate_proof(proof_destination, proof_data, &identity, now) {
                return Some(self.receipts.remove(index));
            }
        }
        None
    }

    /// Sweep expired receipts out of the pool.
    pub fn check_timeouts(&mut self, now: f64) {
        self.check_timeouts_with(now, |_| {});
    }

    /// Timeout sweep with an observer for each receipt leaving the pool.
    pub fn check_timeouts_with<F>(&mut self, now: f64, mut on_expired: F)
    where
        F: FnMut(&PacketReceipt),
    {
        self.receipts.retain_mut(|receipt| {
            if receipt.check_timeout(now) {
                on_expired(receipt);
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use rns_core::buffer::ByteBuf;
    use rns_core::identity::PrivateIdentity;

    use super::{PacketReceipt, ReceiptStatus, ReceiptTable};
    use crate::packet::Packet;

    fn sent_packet() -> Packet {
        let mut packet = Packet::default();
        packet.data = ByteBuf::from_slice(b"proof me");
        packet
    }

    #[test]
    fn explicit_proof_settles_receipt() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let packet = sent_packet();
        let proof = packet.prove(&identity);

        let mut receipt = PacketReceipt::new(&packet, 1, 100.0);
        assert!(receipt.validate_proof(
            &proof.destination,
            proof.data.as_slice(),
            identity.as_identity(),
            100.5,
        ));
        assert_eq!(receipt.status, ReceiptStatus::Delivered);
        assert!(receipt.rtt.expect("rtt") > 0.0);
    }

    #[test]
    fn implicit_proof_matches_by_destination() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let packet = sent_packet();
        let signature = identity.sign(packet.hash().as_slice());

        let mut receipt = PacketReceipt::new(&packet, 1, 100.0);
        assert!(receipt.validate_proof(
            &packet.truncated_hash(),
            &signature.to_bytes(),
            identity.as_identity(),
            100.2,
        ));
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let other = PrivateIdentity::new_from_rand(OsRng);
        let packet = sent_packet();
        let proof = packet.prove(&other);

        let mut receipt = PacketReceipt::new(&packet, 1, 100.0);
        assert!(!receipt.validate_proof(
            &proof.destination,
            proof.data.as_slice(),
            identity.as_identity(),
            100.5,
        ));
        assert_eq!(receipt.status, ReceiptStatus::Sent);
    }

    #[test]
    fn timeout_fires_callback_once() {
        let packet = sent_packet();
        let mut receipt = PacketReceipt::new(&packet, 1, 100.0);
        let fired = std::rc::Rc::new(std::cell::Cell::new(0));
        let counter = fired.clone();
        receipt.set_timeout_callback(Box::new(move |_| {
            counter.set(counter.get() + 1);
        }));

        assert!(!receipt.check_timeout(100.0));
        assert!(receipt.check_timeout(1000.0));
        assert!(receipt.check_timeout(2000.0));
        assert_eq!(fired.get(), 1);
        assert_eq!(receipt.status, ReceiptStatus::Failed);
    }

    #[test]
    fn full_pool_culls_oldest() {
        let mut table = ReceiptTable::new(2);
        let packets: Vec<Packet> = (0..3)
            .map(|index| {
                let mut packet = Packet::default();
                packet.data = ByteBuf::from_slice(&[index as u8]);
                packet
            })
            .collect();

        for packet in &packets {
            table.add(PacketReceipt::new(packet, 1, 100.0));
        }
        assert_eq!(table.len(), 2);
        assert!(table.get(&packets[0].hash()).is_none());
        assert!(table.get(&packets[2].hash()).is_some());
    }
}

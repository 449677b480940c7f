use std::collections::HashMap;

use rns_core::error::RnsError;
use rns_core::hash::Hash;

use crate::packet::Packet;

pub const ENVELOPE_HEADER_SIZE: usize = 6;
pub const RING_SIZE: usize = 16;

pub const WINDOW: usize = 2;
pub const WINDOW_MIN: usize = 2;
pub const WINDOW_MIN_LIMIT_MEDIUM: usize = 5;
pub const WINDOW_MIN_LIMIT_FAST: usize = 16;
pub const WINDOW_MAX_SLOW: usize = 5;
pub const WINDOW_MAX_MEDIUM: usize = 12;
pub const WINDOW_MAX_FAST: usize = 48;
pub const WINDOW_MAX: usize = WINDOW_MAX_FAST;

pub const RTT_FAST: f64 = 0.18;
pub const RTT_MEDIUM: f64 = 0.75;
pub const RTT_SLOW: f64 = 1.45;

pub const MAX_TRIES: u8 = 5;

const SEQ_HALF_MODULUS: u16 = 0x8000;

/// Channel-layer wire wrapper: `[msgtype:2][sequence:2][length:2][payload]`,
/// big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.msg_type.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self, RnsError> {
        if raw.len() < ENVELOPE_HEADER_SIZE {
            return Err(RnsError::PacketError);
        }
        let msg_type = u16::from_be_bytes([raw[0], raw[1]]);
        let sequence = u16::from_be_bytes([raw[2], raw[3]]);
        let length = u16::from_be_bytes([raw[4], raw[5]]) as usize;
        if raw.len() < ENVELOPE_HEADER_SIZE + length {
            return Err(RnsError::PacketError);
        }
        Ok(Self {
            msg_type,
            sequence,
            payload: raw[ENVELOPE_HEADER_SIZE..ENVELOPE_HEADER_SIZE + length].to_vec(),
        })
    }
}

/// A message kind carried over a channel. Implementations pack to and from
/// their own wire form; the channel only routes by `msg_type`.
pub trait ChannelMessage {
    fn msg_type(&self) -> u16;
    fn pack(&self) -> Vec<u8>;
    fn unpack(&mut self, raw: &[u8]) -> Result<(), RnsError>;
}

pub type MessageFactory = fn() -> Box<dyn ChannelMessage>;
pub type MessageHandler = Box<dyn FnMut(&dyn ChannelMessage) -> bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowTier {
    Fast,
    Medium,
    Slow,
    VerySlow,
}

struct TxSlot {
    sequence: u16,
    packet: Packet,
    packet_hash: Hash,
    sent_at: f64,
    tries: u8,
}

/// Result of one channel maintenance pass.
#[derive(Default)]
pub struct ChannelJob {
    pub resend: Vec<Packet>,
    pub teardown: bool,
}

/// Reliable, in-order message sub-stream over a link.
///
/// Outbound envelopes wait in the TX ring until the matching link proof
/// arrives; inbound envelopes wait in the RX ring until the sequence gap
/// before them closes. Window size adapts to the measured RTT tier.
pub struct Channel {
    next_tx_sequence: u16,
    next_rx_sequence: u16,
    tx_ring: Vec<TxSlot>,
    rx_ring: Vec<Envelope>,
    factories: HashMap<u16, MessageFactory>,
    handlers: Vec<MessageHandler>,
    window: usize,
    window_min: usize,
    window_max: usize,
    tier: WindowTier,
    rtt: f64,
}

impl Channel {
    pub fn new() -> Self {
        Self {
            next_tx_sequence: 0,
            next_rx_sequence: 0,
            tx_ring: Vec::with_capacity(RING_SIZE),
            rx_ring: Vec::with_capacity(RING_SIZE),
            factories: HashMap::new(),
            handlers: Vec::new(),
            window: WINDOW,
            window_min: WINDOW_MIN,
            window_max: WINDOW_MAX_SLOW,
            tier: WindowTier::Slow,
            rtt: 0.0,
        }
    }

    pub fn register_message_type(&mut self, msg_type: u16, factory: MessageFactory) {
        self.factories.insert(msg_type, factory);
    }

    pub fn add_message_handler(&mut self, handler: MessageHandler) {
        self.handlers.push(handler);
    }

    pub fn remove_message_handlers(&mut self) {
        self.handlers.clear();
    }

    pub fn is_ready_to_send(&self) -> bool {
        self.tx_ring.len() < self.window && self.tx_ring.len() < RING_SIZE
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn tier(&self) -> WindowTier {
        self.tier
    }

    pub fn rtt(&self) -> f64 {
        self.rtt
    }

    pub fn next_rx_sequence(&self) -> u16 {
        self.next_rx_sequence
    }

    pub fn tx_in_flight(&self) -> usize {
        self.tx_ring.len()
    }

    /// Claim the next TX sequence. The caller packs the envelope into a
    /// link packet and hands it back through [`Channel::track`].
    pub fn take_tx_sequence(&mut self) -> Result<u16, RnsError> {
        if !self.is_ready_to_send() {
            return Err(RnsError::TableFull);
        }
        let sequence = self.next_tx_sequence;
        self.next_tx_sequence = self.next_tx_sequence.wrapping_add(1);
        Ok(sequence)
    }

    pub fn track(&mut self, sequence: u16, packet: Packet, packet_hash: Hash, now: f64) {
        self.tx_ring.push(TxSlot { sequence, packet, packet_hash, sent_at: now, tries: 1 });
    }

    /// Link proof arrived for an outbound packet. Returns true when it
    /// settled a tracked envelope.
    pub fn on_packet_delivered(&mut self, packet_hash: &Hash, now: f64) -> bool {
        let Some(index) =
            self.tx_ring.iter().position(|slot| slot.packet_hash == *packet_hash)
        else {
            return false;
        };
        let slot = self.tx_ring.remove(index);
        // Retransmitted envelopes give no usable sample.
        if slot.tries == 1 {
            self.update_rtt(now - slot.sent_at);
        }
        if self.window < self.window_max {
            self.window += 1;
        }
        true
    }

    /// Decrypted channel payload from the link. Buffers out-of-order
    /// envelopes and dispatches the contiguous prefix in sequence order.
    pub fn receive(&mut self, plaintext: &[u8]) -> Result<usize, RnsError> {
        let envelope = Envelope::unpack(plaintext)?;

        if !self.factories.contains_key(&envelope.msg_type) {
            log::debug!("channel: no factory for msgtype {:#06x}", envelope.msg_type);
            return Ok(0);
        }

        let distance = envelope.sequence.wrapping_sub(self.next_rx_sequence);
        if distance >= SEQ_HALF_MODULUS {
            // Behind the expected sequence: a stale duplicate.
            log::debug!("channel: dropping stale sequence {}", envelope.sequence);
            return Ok(0);
        }
        if distance as usize >= WINDOW_MAX {
            log::debug!("channel: dropping out-of-range sequence {}", envelope.sequence);
            return Ok(0);
        }

        if self.rx_ring.iter().any(|held| held.sequence == envelope.sequence) {
            log::debug!("channel: dropping duplicate sequence {}", envelope.sequence);
            return Ok(0);
        }
        if self.rx_ring.len() >= RING_SIZE {
            log::warn!("channel: rx ring full, dropping sequence {}", envelope.sequence);
            return Ok(0);
        }

        // Ordered insert by circular distance from the expected sequence.
        let key = distance;
        let position = self
            .rx_ring
            .iter()
            .position(|held| held.sequence.wrapping_sub(self.next_rx_sequence) > key)
            .unwrap_or(self.rx_ring.len());
        self.rx_ring.insert(position, envelope);

        Ok(self.process_rx_ring())
    }

    fn process_rx_ring(&mut self) -> usize {
        let mut dispatched = 0;
        while let Some(first) = self.rx_ring.first() {
            if first.sequence != self.next_rx_sequence {
                break;
            }
            let envelope = self.rx_ring.remove(0);
            self.next_rx_sequence = self.next_rx_sequence.wrapping_add(1);
            self.dispatch(&envelope);
            dispatched += 1;
        }
        dispatched
    }

    fn dispatch(&mut self, envelope: &Envelope) {
        let Some(factory) = self.factories.get(&envelope.msg_type) else {
            return;
        };
        let mut message = factory();
        if message.unpack(&envelope.payload).is_err() {
            log::debug!("channel: failed to unpack msgtype {:#06x}", envelope.msg_type);
            return;
        }
        // First handler returning true claims the message.
        for handler in self.handlers.iter_mut() {
            if handler(message.as_ref()) {
                break;
            }
        }
    }

    fn update_rtt(&mut self, sample: f64) {
        if self.rtt == 0.0 {
            self.rtt = sample;
        } else {
            self.rtt = 0.7 * self.rtt + 0.3 * sample;
        }

        let (tier, window_min, window_max) = if self.rtt <= RTT_FAST {
            (WindowTier::Fast, WINDOW_MIN_LIMIT_FAST, WINDOW_MAX_FAST)
        } else if self.rtt <= RTT_MEDIUM {
            (WindowTier::Medium, WINDOW_MIN_LIMIT_MEDIUM, WINDOW_MAX_MEDIUM)
        } else if self.rtt <= RTT_SLOW {
            (WindowTier::Slow, WINDOW_MIN, WINDOW_MAX_SLOW)
        } else {
            (WindowTier::VerySlow, 1, 1)
        };
        self.tier = tier;
        self.window_min = window_min;
        self.window_max = window_max;
        self.window = self.window.clamp(self.window_min, self.window_max);
    }

    fn retry_timeout(&self, tries: u8) -> f64 {
        let backoff = 1.5f64.powi(tries.saturating_sub(1) as i32);
        backoff * (2.5 * self.rtt).max(0.025) * (self.tx_ring.len() as f64 + 1.5)
    }

    /// Periodic maintenance: retransmit overdue envelopes, shrink the
    /// window, request teardown after `MAX_TRIES`.
    pub fn job(&mut self, now: f64) -> ChannelJob {
        let mut outcome = ChannelJob::default();
        let timeout_base: Vec<(usize, f64)> = self
            .tx_ring
            .iter()
            .enumerate()
            .map(|(index, slot)| (index, self.retry_timeout(slot.tries)))
            .collect();

        for (index, timeout) in timeout_base {
            let slot = &mut self.tx_ring[index];
            if now - slot.sent_at <= timeout {
                continue;
            }
            if slot.tries >= MAX_TRIES {
                log::warn!("channel: sequence {} exceeded {} tries", slot.sequence, MAX_TRIES);
                outcome.teardown = true;
                break;
            }
            slot.tries += 1;
            slot.sent_at = now;
            outcome.resend.push(slot.packet.clone());
            if self.window > self.window_min {
                self.window -= 1;
            }
        }

        outcome
    }

    pub fn shutdown(&mut self) {
        self.tx_ring.clear();
        self.rx_ring.clear();
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use rns_core::error::RnsError;

    use super::{Channel, ChannelMessage};

    pub const RAW_MSGTYPE: u16 = 0x0101;

    /// Opaque byte message used across the channel tests.
    #[derive(Default)]
    pub struct RawMessage {
        pub data: Vec<u8>,
    }

    impl ChannelMessage for RawMessage {
        fn msg_type(&self) -> u16 {
            RAW_MSGTYPE
        }

        fn pack(&self) -> Vec<u8> {
            self.data.clone()
        }

        fn unpack(&mut self, raw: &[u8]) -> Result<(), RnsError> {
            self.data = raw.to_vec();
            Ok(())
        }
    }

    pub fn collecting_channel() -> (Channel, Rc<RefCell<Vec<Vec<u8>>>>) {
        let mut channel = Channel::new();
        channel.register_message_type(RAW_MSGTYPE, || Box::<RawMessage>::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        channel.add_message_handler(Box::new(move |message| {
            sink.borrow_mut().push(message.pack());
            true
        }));
        (channel, seen)
    }
}

#[cfg(test)]
mod tests {
    use rns_core::hash::Hash;

    use super::testing::{collecting_channel, RAW_MSGTYPE};
    use super::{Channel, Envelope, WindowTier, MAX_TRIES, RTT_FAST, WINDOW_MAX_FAST};
    use crate::packet::Packet;

    fn envelope(sequence: u16, payload: &[u8]) -> Vec<u8> {
        Envelope { msg_type: RAW_MSGTYPE, sequence, payload: payload.to_vec() }.pack()
    }

    #[test]
    fn envelope_roundtrip() {
        let packed = envelope(42, b"payload");
        let decoded = Envelope::unpack(&packed).expect("envelope");
        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.payload, b"payload");
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let packed = envelope(1, b"payload");
        assert!(Envelope::unpack(&packed[..packed.len() - 1]).is_err());
        assert!(Envelope::unpack(&packed[..4]).is_err());
    }

    #[test]
    fn reordered_sequences_dispatch_in_order() {
        let (mut channel, seen) = collecting_channel();
        // Baseline the channel at sequence 5.
        channel.next_rx_sequence = 5;

        assert_eq!(channel.receive(&envelope(7, b"seven")).expect("rx"), 0);
        assert_eq!(channel.receive(&envelope(6, b"six")).expect("rx"), 0);
        assert_eq!(channel.receive(&envelope(5, b"five")).expect("rx"), 3);
        assert_eq!(channel.receive(&envelope(8, b"eight")).expect("rx"), 1);
        // Second copy of 8 is behind the advanced sequence now.
        assert_eq!(channel.receive(&envelope(8, b"eight")).expect("rx"), 0);

        let seen = seen.borrow();
        let order: Vec<&[u8]> = seen.iter().map(|bytes| bytes.as_slice()).collect();
        assert_eq!(order, vec![&b"five"[..], &b"six"[..], &b"seven"[..], &b"eight"[..]]);
        assert_eq!(channel.next_rx_sequence(), 9);
    }

    #[test]
    fn duplicate_in_ring_is_dropped() {
        let (mut channel, seen) = collecting_channel();
        channel.receive(&envelope(1, b"one")).expect("rx");
        channel.receive(&envelope(1, b"one again")).expect("rx");
        channel.receive(&envelope(0, b"zero")).expect("rx");
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn stale_and_out_of_range_sequences_are_dropped() {
        let (mut channel, seen) = collecting_channel();
        channel.next_rx_sequence = 100;

        // Far behind: stale duplicate territory.
        channel.receive(&envelope(90, b"stale")).expect("rx");
        // Too far ahead of the window.
        channel
            .receive(&envelope(100 + WINDOW_MAX_FAST as u16, b"ahead"))
            .expect("rx");
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn sequence_wraparound_reassembles() {
        let (mut channel, seen) = collecting_channel();
        channel.next_rx_sequence = 0xFFFF;

        channel.receive(&envelope(0x0000, b"after")).expect("rx");
        assert!(seen.borrow().is_empty());
        channel.receive(&envelope(0xFFFF, b"before")).expect("rx");

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], b"before");
        assert_eq!(seen[1], b"after");
        assert_eq!(channel.next_rx_sequence(), 1);
    }

    #[test]
    fn unknown_msgtype_is_ignored() {
        let (mut channel, seen) = collecting_channel();
        let packed = Envelope { msg_type: 0x7777, sequence: 0, payload: vec![] }.pack();
        channel.receive(&packed).expect("rx");
        assert!(seen.borrow().is_empty());
        // The unknown envelope must not consume the sequence.
        assert_eq!(channel.next_rx_sequence(), 0);
    }

    fn tracked(channel: &mut Channel, now: f64) -> Hash {
        let sequence = channel.take_tx_sequence().expect("sequence");
        let hash = Hash::new_from_slice(&sequence.to_be_bytes());
        channel.track(sequence, Packet::default(), hash, now);
        hash
    }

    #[test]
    fn delivery_updates_rtt_and_grows_window() {
        let (mut channel, _) = collecting_channel();
        let hash = tracked(&mut channel, 10.0);

        assert!(channel.on_packet_delivered(&hash, 10.1));
        assert!(channel.rtt() > 0.0 && channel.rtt() <= RTT_FAST);
        assert_eq!(channel.tier(), WindowTier::Fast);
        assert!(channel.window() > super::WINDOW);
    }

    #[test]
    fn slow_samples_select_the_very_slow_tier() {
        let (mut channel, _) = collecting_channel();
        let hash = tracked(&mut channel, 0.0);
        channel.on_packet_delivered(&hash, 30.0);
        assert_eq!(channel.tier(), WindowTier::VerySlow);
        assert_eq!(channel.window(), 1);
    }

    #[test]
    fn overdue_envelopes_are_retransmitted_then_torn_down() {
        let (mut channel, _) = collecting_channel();
        tracked(&mut channel, 0.0);

        let mut now = 0.0;
        for _ in 1..MAX_TRIES {
            now += 1000.0;
            let job = channel.job(now);
            assert_eq!(job.resend.len(), 1);
            assert!(!job.teardown);
        }

        now += 1000.0;
        let job = channel.job(now);
        assert!(job.teardown);
    }

    #[test]
    fn window_limits_in_flight_envelopes() {
        let (mut channel, _) = collecting_channel();
        for _ in 0..channel.window() {
            tracked(&mut channel, 0.0);
        }
        assert!(!channel.is_ready_to_send());
        assert!(channel.take_tx_sequence().is_err());
    }
}

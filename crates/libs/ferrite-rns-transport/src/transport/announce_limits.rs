use std::collections::VecDeque;

use rns_core::hash::AddressHash;

use crate::transport::pool::FixedTable;

pub const MAX_RATE_TIMESTAMPS: usize = 16;

/// Per-interface announce rate policy, taken from interface properties.
#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    pub target: f64,
    pub grace: u32,
    pub penalty: f64,
}

struct RateEntry {
    timestamps: VecDeque<f64>,
    violations: u32,
    blocked_until: f64,
    last: f64,
}

impl RateEntry {
    fn new(now: f64) -> Self {
        let mut timestamps = VecDeque::new();
        timestamps.push_back(now);
        Self { timestamps, violations: 0, blocked_until: 0.0, last: now }
    }

    fn note(&mut self, now: f64) {
        if self.timestamps.len() >= MAX_RATE_TIMESTAMPS {
            self.timestamps.pop_front();
        }
        self.timestamps.push_back(now);
    }

    fn check(&mut self, policy: &RatePolicy, now: f64) -> bool {
        self.note(now);

        if now < self.blocked_until {
            self.last = now;
            return false;
        }

        let allowed = if now - self.last < policy.target {
            self.violations += 1;
            if self.violations > policy.grace {
                // Grace spent: block until the rate target plus penalty
                // has elapsed from this burst.
                self.violations = 0;
                self.blocked_until = self.last + policy.target + policy.penalty;
                false
            } else {
                true
            }
        } else {
            self.violations = 0;
            true
        };

        self.last = now;
        allowed
    }
}

/// Sliding-window announce rate limiter keyed by announcing destination.
pub struct AnnounceRates {
    table: FixedTable<AddressHash, RateEntry>,
}

impl AnnounceRates {
    pub fn new(capacity: usize) -> Self {
        Self { table: FixedTable::new(capacity) }
    }

    /// Returns true when the announce may proceed.
    pub fn check(
        &mut self,
        destination: &AddressHash,
        policy: Option<RatePolicy>,
        now: f64,
    ) -> bool {
        let Some(policy) = policy else {
            return true;
        };

        if let Some(entry) = self.table.get_mut(destination) {
            let allowed = entry.check(&policy, now);
            if !allowed {
                log::info!(
                    "announce rate exceeded for {}, blocked until {:.0}",
                    destination,
                    entry.blocked_until
                );
            }
            return allowed;
        }

        self.table.insert_or_evict_oldest(*destination, RateEntry::new(now), |entry| entry.last);
        true
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use rns_core::hash::AddressHash;

    use super::{AnnounceRates, RatePolicy};

    const POLICY: RatePolicy = RatePolicy { target: 60.0, grace: 2, penalty: 120.0 };

    #[test]
    fn no_policy_always_allows() {
        let mut rates = AnnounceRates::new(4);
        let destination = AddressHash::new_from_rand(OsRng);
        for index in 0..16 {
            assert!(rates.check(&destination, None, index as f64));
        }
    }

    #[test]
    fn grace_absorbs_early_bursts_then_blocks() {
        let mut rates = AnnounceRates::new(4);
        let destination = AddressHash::new_from_rand(OsRng);

        assert!(rates.check(&destination, Some(POLICY), 0.0));
        // Two violations inside the grace budget.
        assert!(rates.check(&destination, Some(POLICY), 1.0));
        assert!(rates.check(&destination, Some(POLICY), 2.0));
        // Third violation exceeds grace=2 and blocks.
        assert!(!rates.check(&destination, Some(POLICY), 3.0));
        // Still blocked inside target + penalty.
        assert!(!rates.check(&destination, Some(POLICY), 100.0));
        // Past last + target + penalty the destination recovers.
        assert!(rates.check(&destination, Some(POLICY), 300.0));
    }

    #[test]
    fn spaced_announces_never_block() {
        let mut rates = AnnounceRates::new(4);
        let destination = AddressHash::new_from_rand(OsRng);
        for index in 0..8 {
            assert!(rates.check(&destination, Some(POLICY), index as f64 * 61.0));
        }
    }
}

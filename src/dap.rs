//! DAP: a counting-bloom-filter heat throttle over source IPs and
//! queried domains, with exponential temporal decay. Ported from
//! `emcdns.cpp`'s `CheckDAP`/`UpdateDAP` pair; the table is owned by the
//! single server task, never shared, so no locking is needed around
//! updates.

use crate::config::DapConfig;

/// Number of independent hash probes per key (`EMCDNS_DAPBLOOMSTEP`). A
/// key's heat is the minimum counter across its probed slots, so one
/// collision in a single slot can't inflate an unrelated key's heat.
pub const DAP_BLOOM_STEP: u32 = 4;
/// Right-shift applied to elapsed-time ticks to get a decay amount.
pub const DAP_SHIFT_DECAY: u32 = 8;
/// Rotate-fold shift used when charging a source-IP key.
pub const IP_FOLD_SHIFT: u32 = 1;
/// Rotate-fold shift used when charging a queried-domain key.
pub const DOMAIN_FOLD_SHIFT: u32 = 6;
/// Extra heat charged against the source IP when a lookup misses NVS
/// entirely — a failed lookup is expensive, so it costs more than a
/// served answer of the same wire size.
pub const NVS_MISS_PENALTY: u16 = 240;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DapCounter {
    pub temp: u16,
    pub timestamp: u16,
}

/// Folds an arbitrary byte key (IP octets or a lowercased domain) down
/// to a table index. `shift` distinguishes IP-key folding from
/// domain-key folding; `probe` decorrelates the `DAP_BLOOM_STEP`
/// independent probes for the same key so they don't all land in the
/// same slot.
fn roladd_fold(key: &[u8], shift: u32, probe: u32) -> u32 {
    let mut acc: u32 = probe.wrapping_mul(0x9e37_79b1);
    for &b in key {
        acc = acc.rotate_left(shift).wrapping_add(b as u32);
    }
    acc
}

#[derive(Debug)]
pub struct DapTable {
    counters: Vec<DapCounter>,
    mask: u32,
    threshold: u16,
}

impl DapTable {
    pub fn new(config: DapConfig) -> Self {
        DapTable {
            counters: vec![DapCounter::default(); config.size as usize],
            mask: config.size - 1,
            threshold: config.threshold,
        }
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    fn probe_slot(&self, key: &[u8], shift: u32, probe: u32) -> usize {
        (roladd_fold(key, shift, probe) & self.mask) as usize
    }

    /// Decays and charges `inctemp` heat against every probed slot for
    /// `key`, returning the minimum counter across the `DAP_BLOOM_STEP`
    /// probes — the standard counting-bloom-filter heat estimate.
    fn charge(&mut self, key: &[u8], shift: u32, now: u16, inctemp: u16) -> u16 {
        let mut min_temp = u16::MAX;
        for probe in 0..DAP_BLOOM_STEP {
            let idx = self.probe_slot(key, shift, probe);
            let counter = &mut self.counters[idx];
            let elapsed = now.wrapping_sub(counter.timestamp) as u32;
            let decay = elapsed >> DAP_SHIFT_DECAY;
            counter.temp = counter.temp.saturating_sub(decay.min(u16::MAX as u32) as u16);
            counter.timestamp = now;
            counter.temp = counter.temp.saturating_add(inctemp);
            min_temp = min_temp.min(counter.temp);
        }
        min_temp
    }

    /// Charges a source-IP key with `inctemp` heat and returns whether
    /// the request should be admitted (heat stayed at or below the
    /// threshold).
    ///
    /// `now` is a coarse monotonic tick count (e.g. seconds since
    /// startup, truncated to u16) — wraparound is tolerated because the
    /// decay computation uses wrapping subtraction.
    pub fn admit_ip(&mut self, ip_key: &[u8], now: u16, inctemp: u16) -> bool {
        self.charge(ip_key, IP_FOLD_SHIFT, now, inctemp) <= self.threshold
    }

    /// Charges a domain key with `inctemp` heat and returns whether the
    /// request should be admitted.
    pub fn admit_domain(&mut self, domain_key: &[u8], now: u16, inctemp: u16) -> bool {
        self.charge(domain_key, DOMAIN_FOLD_SHIFT, now, inctemp) <= self.threshold
    }

    /// Read-only heat check, for diagnostics/metrics, without charging.
    pub fn peek(&self, key: &[u8], shift: u32) -> u16 {
        (0..DAP_BLOOM_STEP)
            .map(|probe| self.counters[self.probe_slot(key, shift, probe)].temp)
            .min()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(size: u32, threshold: u16) -> DapTable {
        DapTable::new(DapConfig::new(size, threshold).unwrap())
    }

    #[test]
    fn first_hit_is_admitted() {
        let mut t = table(64, 100);
        assert!(t.admit_ip(b"1.2.3.4", 0, 4));
    }

    #[test]
    fn repeated_hits_eventually_denied() {
        let mut t = table(64, 10);
        let mut admitted = true;
        for _ in 0..10 {
            admitted = t.admit_ip(b"1.2.3.4", 0, 4);
        }
        assert!(!admitted);
    }

    #[test]
    fn decay_restores_admission_over_time() {
        let mut t = table(64, 10);
        for _ in 0..10 {
            t.admit_ip(b"1.2.3.4", 0, 4);
        }
        assert!(!t.admit_ip(b"1.2.3.4", 0, 4));
        // a long time later the decay shift should have zeroed the heat
        assert!(t.admit_ip(b"1.2.3.4", u16::MAX, 4));
    }

    #[test]
    fn zero_inctemp_only_decays_and_checks() {
        let mut t = table(64, 10);
        for _ in 0..10 {
            t.admit_ip(b"1.2.3.4", 0, 4);
        }
        assert!(!t.admit_ip(b"1.2.3.4", 0, 0));
        assert!(t.peek(b"1.2.3.4", IP_FOLD_SHIFT) > 0);
    }

    #[test]
    fn distinct_keys_rarely_collide_in_heat() {
        let mut t = table(256, 5);
        assert!(t.admit_ip(b"1.2.3.4", 0, 4));
        assert!(t.admit_domain(b"example.coin", 0, 4));
    }

    #[test]
    fn ip_and_domain_folds_use_different_shifts() {
        let mut t = table(256, 1000);
        t.admit_ip(b"example.coin", 0, 50);
        let ip_heat = t.peek(b"example.coin", IP_FOLD_SHIFT);
        let domain_heat = t.peek(b"example.coin", DOMAIN_FOLD_SHIFT);
        assert_ne!(ip_heat, 0);
        assert_eq!(domain_heat, 0);
    }
}

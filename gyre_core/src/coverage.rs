use crate::executor::RunResult;
use crate::observer::Observer;
use crate::probe::{PROBE_SPACE, ProbeId};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Per-run hit counts saturate here; anything at or above lands in the top bucket.
pub const HIT_CAP: u8 = 8;

/// Initial room for the list of probes touched in one run.
const TOUCHED_RESERVE: usize = 4096;

/// Maps a saturated hit count to its bucket: 1, 2, 3, 4-7, 8+.
///
/// Bucket 0 means "never hit". Buckets are what novelty is judged on, so a probe hit 5 times
/// and one hit 6 times are indistinguishable.
#[inline]
pub fn bucket(count: u8) -> u8 {
    match count {
        0 => 0,
        1..=3 => count,
        4..=7 => 4,
        _ => 5,
    }
}

/// The sparse coverage signature of a single execution.
///
/// Entries are `(probe, bucket)` pairs sorted by probe id. `digest` is a coarse hash over
/// all entries used to reject already-seen signatures without a per-probe comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Signature {
    entries: Vec<(u32, u8)>,
    digest: u64,
}

impl Signature {
    pub fn from_entries(mut entries: Vec<(u32, u8)>) -> Self {
        entries.retain(|&(_, b)| b > 0);
        entries.sort_unstable_by_key(|&(probe, _)| probe);
        entries.dedup_by_key(|&mut (probe, _)| probe);
        let digest = digest_of(&entries);
        Self { entries, digest }
    }

    pub fn entries(&self) -> &[(u32, u8)] {
        &self.entries
    }

    pub fn probes(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|&(probe, _)| probe)
    }

    pub fn bucket_of(&self, probe: u32) -> u8 {
        self.entries
            .binary_search_by_key(&probe, |&(p, _)| p)
            .map_or(0, |idx| self.entries[idx].1)
    }

    pub fn digest(&self) -> u64 {
        self.digest
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when every probe bucket in `self` is at least the bucket recorded in `other`.
    pub fn dominates(&self, other: &Signature) -> bool {
        other
            .entries
            .iter()
            .all(|&(probe, b)| self.bucket_of(probe) >= b)
    }
}

fn digest_of(entries: &[(u32, u8)]) -> u64 {
    // FNV-1a over (probe, bucket), seeded with the entry count.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ entries.len() as u64;
    for &(probe, b) in entries {
        for byte in probe.to_le_bytes().into_iter().chain(std::iter::once(b)) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

/// Flat per-run hit table indexed by probe id.
///
/// `record` is on the hot path of every instrumented location: it does a bounds check, a
/// saturating increment and, the first time a probe is seen in a run, pushes the probe onto
/// the touched list so `reset` and `snapshot` only visit probes that actually fired.
#[derive(Debug, Clone)]
pub struct CoverageMap {
    counts: Vec<u8>,
    touched: Vec<u32>,
    dropped: u64,
}

impl CoverageMap {
    pub fn new() -> Self {
        Self::with_capacity(PROBE_SPACE)
    }

    pub fn with_capacity(slots: usize) -> Self {
        Self {
            counts: vec![0; slots],
            touched: Vec::with_capacity(TOUCHED_RESERVE),
            dropped: 0,
        }
    }

    #[inline]
    pub fn record(&mut self, probe: ProbeId) {
        self.record_raw(probe.raw());
    }

    /// Records a raw probe id; ids beyond the table are counted and otherwise ignored.
    #[inline]
    pub fn record_raw(&mut self, raw: u32) {
        let Some(slot) = self.counts.get_mut(raw as usize) else {
            self.dropped += 1;
            return;
        };
        if *slot == 0 {
            self.touched.push(raw);
        }
        if *slot < HIT_CAP {
            *slot += 1;
        }
    }

    pub fn reset(&mut self) {
        for &probe in &self.touched {
            self.counts[probe as usize] = 0;
        }
        self.touched.clear();
    }

    pub fn snapshot(&self) -> Signature {
        let entries = self
            .touched
            .iter()
            .map(|&probe| (probe, bucket(self.counts[probe as usize])))
            .collect();
        Signature::from_entries(entries)
    }

    pub fn hits(&self, probe: ProbeId) -> u8 {
        self.counts
            .get(probe.raw() as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn capacity(&self) -> usize {
        self.counts.len()
    }

    /// Number of out-of-range ids ignored since the map was created.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for CoverageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for CoverageMap {
    fn name(&self) -> &'static str {
        "CoverageMap"
    }

    fn pre_exec(&mut self) {
        self.reset();
    }

    fn post_exec(&mut self, _result: &RunResult) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(location: u32) -> ProbeId {
        ProbeId::pack(0, 0, location).unwrap()
    }

    #[test]
    fn bucket_boundaries() {
        let buckets: Vec<u8> = (0..=10).map(bucket).collect();
        assert_eq!(buckets, vec![0, 1, 2, 3, 4, 4, 4, 4, 5, 5, 5]);
    }

    #[test]
    fn record_saturates_and_snapshot_is_sorted() {
        let mut map = CoverageMap::with_capacity(1024);
        for _ in 0..100 {
            map.record(probe(7));
        }
        map.record(probe(3));
        map.record(probe(3));

        assert_eq!(map.hits(probe(7)), HIT_CAP);
        let signature = map.snapshot();
        assert_eq!(signature.entries(), &[(3, 2), (7, 5)]);
        assert_eq!(signature.bucket_of(7), 5);
        assert_eq!(signature.bucket_of(8), 0);
    }

    #[test]
    fn out_of_range_ids_are_counted_and_ignored() {
        let mut map = CoverageMap::with_capacity(16);
        map.record_raw(15);
        map.record_raw(16);
        map.record_raw(u32::MAX);
        assert_eq!(map.dropped(), 2);
        assert_eq!(map.snapshot().entries(), &[(15, 1)]);
    }

    #[test]
    fn reset_clears_only_previous_run() {
        let mut map = CoverageMap::with_capacity(64);
        map.record(probe(1));
        map.record(probe(2));
        map.pre_exec();
        assert!(map.snapshot().is_empty(), "stale hits must not leak into the next run");
        assert_eq!(map.hits(probe(1)), 0);

        map.record(probe(2));
        assert_eq!(map.snapshot().entries(), &[(2, 1)]);
    }

    #[test]
    fn digest_separates_bucket_changes() {
        let a = Signature::from_entries(vec![(1, 1), (2, 1)]);
        let b = Signature::from_entries(vec![(2, 1), (1, 1)]);
        let c = Signature::from_entries(vec![(1, 1), (2, 2)]);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert!(c.dominates(&a));
        assert!(!a.dominates(&c));
    }
}

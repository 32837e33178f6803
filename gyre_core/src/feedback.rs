use crate::coverage::Signature;
use crate::probe::{PROBE_SPACE, ProbeError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

/// Judged digests kept before the fast-reject cache is flushed.
pub const DEFAULT_DIGEST_CAPACITY: usize = 1 << 16;

#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("Coverage signal is corrupt: {0}")]
    Probe(#[from] ProbeError),
}

/// One probe whose best-ever bucket a run would raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Improvement {
    pub probe: u32,
    pub old: u8,
    pub new: u8,
}

/// Decides whether a run's signature shows behavior not seen before in the session.
pub trait Feedback {
    fn name(&self) -> &'static str;

    /// Returns the bucket improvements `signature` carries over the session so far. An empty
    /// list means nothing new. Nothing is recorded until [`Feedback::commit`].
    fn is_interesting(&mut self, signature: &Signature) -> Result<Vec<Improvement>, FeedbackError>;

    /// Folds `signature` into the session's cumulative best.
    fn commit(&mut self, signature: &Signature) -> Result<(), FeedbackError>;
}

/// The cumulative best bucket per probe, plus the digests of signatures already judged.
///
/// Buckets in `best` only ever grow. A signature whose digest has been judged before cannot
/// carry an improvement and is rejected without looking at its entries. The digest set is a
/// cache only: it is flushed once it holds `digest_capacity` entries.
#[derive(Debug)]
pub struct CoverageFeedback {
    best: HashMap<u32, u8>,
    seen_digests: HashSet<u64>,
    digest_capacity: usize,
}

impl CoverageFeedback {
    pub fn new() -> Self {
        Self::with_digest_capacity(DEFAULT_DIGEST_CAPACITY)
    }

    pub fn with_digest_capacity(digest_capacity: usize) -> Self {
        Self {
            best: HashMap::new(),
            seen_digests: HashSet::new(),
            digest_capacity: digest_capacity.max(1),
        }
    }

    pub fn cached_digests(&self) -> usize {
        self.seen_digests.len()
    }

    fn remember(&mut self, digest: u64) {
        if self.seen_digests.len() >= self.digest_capacity {
            debug!(
                capacity = self.digest_capacity,
                "flushing judged signature digests"
            );
            self.seen_digests.clear();
        }
        self.seen_digests.insert(digest);
    }

    pub fn best_bucket(&self, probe: u32) -> u8 {
        self.best.get(&probe).copied().unwrap_or(0)
    }

    /// Number of probes hit at least once in the session.
    pub fn covered(&self) -> usize {
        self.best.len()
    }

    /// The cumulative best as a signature, for reporting.
    pub fn cumulative(&self) -> Signature {
        Signature::from_entries(self.best.iter().map(|(&p, &b)| (p, b)).collect())
    }

    fn validate(signature: &Signature) -> Result<(), FeedbackError> {
        match signature.entries().last() {
            Some(&(probe, _)) if probe as usize >= PROBE_SPACE => {
                Err(ProbeError::OutOfRange(probe).into())
            }
            _ => Ok(()),
        }
    }
}

impl Default for CoverageFeedback {
    fn default() -> Self {
        Self::new()
    }
}

impl Feedback for CoverageFeedback {
    fn name(&self) -> &'static str {
        "CoverageFeedback"
    }

    fn is_interesting(&mut self, signature: &Signature) -> Result<Vec<Improvement>, FeedbackError> {
        Self::validate(signature)?;
        if self.seen_digests.contains(&signature.digest()) {
            return Ok(Vec::new());
        }
        let improvements: Vec<Improvement> = signature
            .entries()
            .iter()
            .filter_map(|&(probe, new)| {
                let old = self.best_bucket(probe);
                (new > old).then_some(Improvement { probe, old, new })
            })
            .collect();
        if improvements.is_empty() {
            self.remember(signature.digest());
        }
        Ok(improvements)
    }

    fn commit(&mut self, signature: &Signature) -> Result<(), FeedbackError> {
        Self::validate(signature)?;
        for &(probe, bucket) in signature.entries() {
            let best = self.best.entry(probe).or_insert(0);
            if bucket > *best {
                *best = bucket;
            }
        }
        self.remember(signature.digest());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn sig(entries: &[(u32, u8)]) -> Signature {
        Signature::from_entries(entries.to_vec())
    }

    #[test]
    fn coverage_feedback_reports_bucket_increases_only() {
        let mut feedback = CoverageFeedback::new();
        let first = sig(&[(1, 1), (2, 3)]);
        let improvements = feedback.is_interesting(&first).unwrap();
        assert_eq!(improvements.len(), 2);
        feedback.commit(&first).unwrap();

        assert!(
            feedback.is_interesting(&first).unwrap().is_empty(),
            "an identical signature is never novel"
        );
        assert!(feedback.is_interesting(&sig(&[(2, 2)])).unwrap().is_empty());

        let better = sig(&[(1, 1), (2, 4)]);
        assert_eq!(
            feedback.is_interesting(&better).unwrap(),
            vec![Improvement {
                probe: 2,
                old: 3,
                new: 4
            }]
        );
        assert_eq!(feedback.covered(), 2);
    }

    #[test]
    fn judging_does_not_record() {
        let mut feedback = CoverageFeedback::new();
        let signature = sig(&[(9, 1)]);
        assert!(!feedback.is_interesting(&signature).unwrap().is_empty());
        assert!(
            !feedback.is_interesting(&signature).unwrap().is_empty(),
            "still novel until committed"
        );
        assert_eq!(feedback.best_bucket(9), 0);
    }

    #[test]
    fn cumulative_best_never_decreases() {
        let mut feedback = CoverageFeedback::new();
        let mut rng = ChaCha8Rng::from_seed([7; 32]);
        let mut previous = feedback.cumulative();
        for _ in 0..500 {
            let entries: Vec<(u32, u8)> = (0..rng.random_range(0..6))
                .map(|_| (rng.random_range(0..32), rng.random_range(1..=5)))
                .collect();
            let signature = sig(&entries);
            if !feedback.is_interesting(&signature).unwrap().is_empty() {
                feedback.commit(&signature).unwrap();
            }
            let current = feedback.cumulative();
            assert!(
                current.dominates(&previous),
                "cumulative best lost a bucket: {previous:?} -> {current:?}"
            );
            previous = current;
        }
    }

    #[test]
    fn digest_cache_stays_bounded_and_verdicts_hold() {
        let mut feedback = CoverageFeedback::with_digest_capacity(4);
        let best = sig(&[(1, 5), (2, 5), (3, 5)]);
        feedback.commit(&best).unwrap();
        for round in 0..3 {
            for probe in 1..=3 {
                for bucket in 1..=4 {
                    let stale = sig(&[(probe, bucket)]);
                    assert!(
                        feedback.is_interesting(&stale).unwrap().is_empty(),
                        "round {round}: ({probe}, {bucket}) is not novel"
                    );
                    assert!(feedback.cached_digests() <= 4);
                }
            }
        }
        assert!(!feedback.is_interesting(&sig(&[(4, 1)])).unwrap().is_empty());
        assert!(!feedback.is_interesting(&sig(&[(5, 2)])).unwrap().is_empty());
    }

    #[test]
    fn out_of_range_probe_is_fatal() {
        let mut feedback = CoverageFeedback::new();
        let bad = sig(&[(PROBE_SPACE as u32, 1)]);
        assert!(matches!(
            feedback.is_interesting(&bad),
            Err(FeedbackError::Probe(ProbeError::OutOfRange(_)))
        ));
        assert!(feedback.commit(&bad).is_err());
    }
}

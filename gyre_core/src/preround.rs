//! The configuration-collection pre-round: one run on fresh randomness, before fuzzing
//! proper, that records which configuration keys the target reads.

use crate::coverage::{CoverageMap, Signature};
use crate::ei::IndexCapability;
use crate::executor::{Executor, RunResult};
use crate::stream::InputStream;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreRoundError {
    /// The single pre-round run produced no usable input, so nothing was learned.
    #[error("Pre-round run was rejected by the generator: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct PreRoundOutcome {
    pub result: RunResult,
    pub touched_config: BTreeMap<String, String>,
    /// Bytes consumed by the run, usable as a seed.
    pub bytes: Vec<u8>,
    pub signature: Signature,
}

#[derive(Debug, Clone, Copy)]
pub struct PreRound {
    limit: usize,
}

impl PreRound {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    /// Runs the harness exactly once. A failure or hang ends the pre-round and is returned in
    /// the outcome for the caller to archive.
    pub fn run<E: Executor + ?Sized>(
        &self,
        executor: &mut E,
        rng: ChaCha8Rng,
        coverage: &mut CoverageMap,
        index: &mut dyn IndexCapability,
    ) -> Result<PreRoundOutcome, PreRoundError> {
        let report = executor.execute(InputStream::fresh(rng, self.limit), coverage, index);
        if let RunResult::Invalid(reason) = report.result {
            return Err(PreRoundError::Invalid(reason));
        }
        info!(
            keys = report.touched_config.len(),
            result = ?report.result,
            "pre-round collected configuration"
        );
        for (key, value) in &report.touched_config {
            info!(key = %key, value = %value, "configuration key touched");
        }
        Ok(PreRoundOutcome {
            result: report.result,
            touched_config: report.touched_config,
            bytes: report.consumed,
            signature: coverage.snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ei::NoIndex;
    use crate::executor::{Failure, InProcessExecutor, Invalid, RunContext};
    use rand_core::SeedableRng;

    fn pick_flags(ctx: &mut RunContext<'_>) -> Result<[bool; 2], Invalid> {
        Ok([ctx.bool()?, ctx.bool()?])
    }

    fn read_flags(flags: &[bool; 2], ctx: &mut RunContext<'_>) -> Result<(), Failure> {
        ctx.track_config("red", flags[0].to_string());
        ctx.track_config("blue", flags[1].to_string());
        Ok(())
    }

    #[test]
    fn pre_round_collects_touched_keys_once() {
        let mut executor = InProcessExecutor::new(pick_flags, read_flags);
        let mut coverage = CoverageMap::with_capacity(16);
        let outcome = PreRound::new(64)
            .run(
                &mut executor,
                ChaCha8Rng::seed_from_u64(1),
                &mut coverage,
                &mut NoIndex,
            )
            .unwrap();
        assert_eq!(outcome.result, RunResult::Success);
        let keys: Vec<&str> = outcome.touched_config.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["blue", "red"]);
        assert_eq!(outcome.bytes.len(), 2);
    }

    #[test]
    fn pre_round_invalid_is_an_error() {
        let mut executor = InProcessExecutor::new(pick_flags, read_flags);
        let mut coverage = CoverageMap::with_capacity(16);
        let err = PreRound::new(1)
            .run(
                &mut executor,
                ChaCha8Rng::seed_from_u64(1),
                &mut coverage,
                &mut NoIndex,
            )
            .unwrap_err();
        assert!(matches!(err, PreRoundError::Invalid(_)));
    }

    #[test]
    fn pre_round_failure_is_returned_not_raised() {
        let failing = |_: &[bool; 2], ctx: &mut RunContext<'_>| -> Result<(), Failure> {
            ctx.track_config("green", "on");
            Err(Failure::at("green is broken", "config:green"))
        };
        let mut executor = InProcessExecutor::new(pick_flags, failing);
        let mut coverage = CoverageMap::with_capacity(16);
        let outcome = PreRound::new(8)
            .run(
                &mut executor,
                ChaCha8Rng::seed_from_u64(2),
                &mut coverage,
                &mut NoIndex,
            )
            .unwrap();
        assert!(matches!(outcome.result, RunResult::Failure(_)));
        assert!(outcome.touched_config.contains_key("green"));
    }
}

//! The fuzzing loop: picks the next input source, runs it, classifies the outcome and keeps
//! the corpus, the failure archive and the session statistics up to date.
//!
//! [`Guidance`] is generic over its [`IndexCapability`]. With [`NoIndex`] it is the plain
//! coverage-guided engine; with [`ExecutionIndexer`] saved inputs also carry the execution
//! index of every byte, which the mutator uses to aim mutations and align splices. Everything
//! else is shared.

use crate::config::SessionConfig;
use crate::corpus::{Corpus, CorpusError, InMemoryCorpus, NewEntry, OnDiskCorpus, load_seed_files};
use crate::coverage::CoverageMap;
use crate::ei::{ExecutionIndexer, IndexCapability, NoIndex};
use crate::executor::{Executor, RunReport, RunResult};
use crate::feedback::{CoverageFeedback, Feedback, FeedbackError};
use crate::input::{InputOrigin, Seed};
use crate::mutator::{HavocMutator, Mutator};
use crate::oracle::{ArchiveError, BugKind, CrashOracle, FailureArchive, Oracle};
use crate::preround::{PreRound, PreRoundError};
use crate::scheduler::{EnergyScheduler, Scheduler, SchedulerError};
use crate::stream::InputStream;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// How often the loop reports progress.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Internal errors. Any of these means the coverage signal or the session's persistent state
/// can no longer be trusted, so the session stops.
#[derive(Error, Debug)]
pub enum GuidanceError {
    #[error("Corpus operation failed: {0}")]
    Corpus(#[from] CorpusError),
    #[error("Scheduling failed: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Feedback failed: {0}")]
    Feedback(#[from] FeedbackError),
    #[error("Failure archive failed: {0}")]
    Archive(#[from] ArchiveError),
    #[error("Pre-round failed: {0}")]
    PreRoundInvalid(#[from] PreRoundError),
    #[error("No input available: the session has terminated")]
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidanceState {
    /// Serving seeds, or one fresh input if there are none.
    Seeding,
    /// Serving mutated children of favored parents (or fresh inputs in blind mode).
    Generating,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Duration,
    Trials,
    FirstCrash,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Duration => write!(f, "time budget exhausted"),
            TerminationReason::Trials => write!(f, "trial budget exhausted"),
            TerminationReason::FirstCrash => write!(f, "stopped at first failure"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Runs that produced a result other than Invalid.
    pub trials: u64,
    pub invalid: u64,
    pub timeouts: u64,
    /// Failures and hangs, before deduplication.
    pub failures: u64,
    pub unique_failures: usize,
    pub cycles: u64,
    pub corpus_size: usize,
    pub favored: usize,
    pub covered_probes: usize,
    /// Out-of-range probe ids ignored by the coverage map.
    pub dropped_probes: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub reason: TerminationReason,
    pub stats: SessionStats,
    /// Configuration keys reported by the pre-round, if it ran.
    pub touched_config: BTreeMap<String, String>,
}

impl SessionSummary {
    pub fn bugs_found(&self) -> bool {
        self.stats.unique_failures > 0
    }
}

pub struct Guidance<X: IndexCapability = NoIndex> {
    config: SessionConfig,
    state: GuidanceState,
    rng: ChaCha8Rng,
    random_seed: u64,
    seeds: VecDeque<Seed>,
    corpus: Box<dyn Corpus>,
    feedback: CoverageFeedback,
    scheduler: EnergyScheduler,
    mutator: HavocMutator,
    oracle: CrashOracle,
    archive: FailureArchive,
    coverage: CoverageMap,
    index: X,
    stats: SessionStats,
    touched_config: BTreeMap<String, String>,
    pending: Option<InputOrigin>,
    /// Whether the pending input is a child of a scheduled parent.
    scheduled: bool,
    terminated: Option<TerminationReason>,
    started: Instant,
    last_status: Instant,
}

impl Guidance<NoIndex> {
    /// Plain coverage-guided engine.
    pub fn coverage(config: SessionConfig) -> Result<Self, GuidanceError> {
        Self::new(config, NoIndex)
    }
}

impl Guidance<ExecutionIndexer> {
    /// Coverage-guided engine with execution indexing.
    pub fn execution_index(config: SessionConfig) -> Result<Self, GuidanceError> {
        Self::new(config, ExecutionIndexer::new())
    }
}

impl<X: IndexCapability> Guidance<X> {
    /// Sets up the corpus and failure archive (on disk when an output directory is
    /// configured) and loads seed files.
    pub fn new(config: SessionConfig, index: X) -> Result<Self, GuidanceError> {
        let random_seed = config.random_seed.unwrap_or_else(rand::random);
        let (corpus, archive) = match &config.output_dir {
            Some(dir) => (
                Box::new(OnDiskCorpus::create(dir, config.save_all)?) as Box<dyn Corpus>,
                FailureArchive::create(dir)?,
            ),
            None => (
                Box::new(InMemoryCorpus::new()) as Box<dyn Corpus>,
                FailureArchive::in_memory(),
            ),
        };
        let seeds: VecDeque<Seed> = load_seed_files(&config.seed_paths)?.into();
        let mutator = HavocMutator::new(config.max_input_size)
            .with_dictionary(config.dictionary.clone())
            .with_max_mutations(config.max_mutations);
        let now = Instant::now();
        Ok(Self {
            state: GuidanceState::Seeding,
            rng: ChaCha8Rng::seed_from_u64(random_seed),
            random_seed,
            seeds,
            corpus,
            feedback: CoverageFeedback::new(),
            scheduler: EnergyScheduler::new(),
            mutator,
            oracle: CrashOracle::new(),
            archive,
            coverage: CoverageMap::new(),
            index,
            stats: SessionStats::default(),
            touched_config: BTreeMap::new(),
            pending: None,
            scheduled: false,
            terminated: None,
            started: now,
            last_status: now,
            config,
        })
    }

    /// Queues a seed behind the ones already loaded.
    pub fn add_seed(&mut self, seed: Seed) {
        self.seeds.push_back(seed);
    }

    pub fn state(&self) -> GuidanceState {
        self.state
    }

    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    pub fn corpus(&self) -> &dyn Corpus {
        self.corpus.as_ref()
    }

    pub fn archive(&self) -> &FailureArchive {
        &self.archive
    }

    pub fn feedback(&self) -> &CoverageFeedback {
        &self.feedback
    }

    pub fn stats(&mut self) -> SessionStats {
        let mut stats = self.stats.clone();
        stats.unique_failures = self.archive.unique();
        stats.cycles = self.scheduler.cycles();
        stats.corpus_size = self.corpus.len();
        stats.favored = self.corpus.favored().len();
        stats.covered_probes = self.feedback.covered();
        stats.dropped_probes = self.coverage.dropped();
        stats.elapsed = self.started.elapsed();
        stats
    }

    /// Runs the session until a budget is exhausted or, with exit-on-crash, the first failure.
    /// Without any budget this only returns on an internal error.
    pub fn run<E: Executor + ?Sized>(
        &mut self,
        executor: &mut E,
    ) -> Result<SessionSummary, GuidanceError> {
        let engine = if self.index.enabled() {
            "execution-index"
        } else {
            "coverage"
        };
        info!(
            engine,
            seed = self.random_seed,
            seeds = self.seeds.len(),
            trials = ?self.config.trials,
            duration = ?self.config.duration,
            blind = self.config.blind,
            fixed_size = self.config.fixed_size,
            "starting fuzzing session"
        );
        if self.config.pre_round {
            self.pre_round(executor)?;
        }
        let reason = loop {
            if let Some(reason) = self.termination() {
                break reason;
            }
            self.run_once(executor)?;
            if self.last_status.elapsed() >= STATUS_INTERVAL {
                self.log_status();
            }
        };

        let summary = SessionSummary {
            reason,
            stats: self.stats(),
            touched_config: self.touched_config.clone(),
        };
        if summary.stats.dropped_probes > 0 {
            warn!(
                dropped = summary.stats.dropped_probes,
                "instrumentation reported probe ids outside the probe space"
            );
        }
        info!(
            reason = %reason,
            trials = summary.stats.trials,
            invalid = summary.stats.invalid,
            corpus = summary.stats.corpus_size,
            covered = summary.stats.covered_probes,
            unique_failures = summary.stats.unique_failures,
            "session finished"
        );
        Ok(summary)
    }

    /// One step of the loop: next input, one execution, classification.
    pub fn run_once<E: Executor + ?Sized>(
        &mut self,
        executor: &mut E,
    ) -> Result<RunResult, GuidanceError> {
        let stream = self.next_input()?;
        let report = executor.execute(stream, &mut self.coverage, &mut self.index);
        let result = report.result.clone();
        self.handle_result(report)?;
        Ok(result)
    }

    /// Checks the budgets; once a reason is found the guidance stays terminal.
    pub fn termination(&mut self) -> Option<TerminationReason> {
        if self.terminated.is_some() {
            return self.terminated;
        }
        let reason = if self.config.trials.is_some_and(|t| self.stats.trials >= t) {
            Some(TerminationReason::Trials)
        } else if self
            .config
            .duration
            .is_some_and(|d| self.started.elapsed() >= d)
        {
            Some(TerminationReason::Duration)
        } else {
            None
        };
        if let Some(reason) = reason {
            self.terminate(reason);
        }
        reason
    }

    fn terminate(&mut self, reason: TerminationReason) {
        self.state = GuidanceState::Terminal;
        self.terminated = Some(reason);
        debug!(reason = %reason, "guidance entered terminal state");
    }

    /// Builds the stream for the next run.
    pub fn next_input(&mut self) -> Result<InputStream, GuidanceError> {
        match self.state {
            GuidanceState::Terminal => Err(GuidanceError::Terminated),
            GuidanceState::Seeding => {
                let Some(seed) = self.seeds.pop_front() else {
                    self.state = GuidanceState::Generating;
                    return Ok(self.fresh_input());
                };
                if self.seeds.is_empty() {
                    self.state = GuidanceState::Generating;
                }
                self.pending = Some(seed.origin());
                Ok(InputStream::from_buffer(seed.bytes, self.config.fixed_size))
            }
            GuidanceState::Generating => {
                if self.config.blind || self.corpus.is_empty() {
                    return Ok(self.fresh_input());
                }
                self.mutated_input()
            }
        }
    }

    fn fresh_input(&mut self) -> InputStream {
        self.pending = Some(InputOrigin::Fresh);
        let rng = ChaCha8Rng::seed_from_u64(self.rng.random());
        InputStream::fresh(rng, self.config.max_input_size)
    }

    fn mutated_input(&mut self) -> Result<InputStream, GuidanceError> {
        let parent_id = self.scheduler.next(self.corpus.as_mut())?;
        let len = self.corpus.len();
        let donor_id = (len > 1)
            .then(|| self.rng.random_range(0..len))
            .filter(|&id| id != parent_id);

        let parent = self
            .corpus
            .get(parent_id)
            .ok_or(CorpusError::InputNotFound(parent_id))?;
        let donor = donor_id.and_then(|id| self.corpus.get(id));
        let child = self.mutator.mutate(parent, donor, &mut self.rng);
        trace!(origin = %child.origin, ops = ?child.ops, size = child.bytes.len(), "mutated child");

        self.pending = Some(child.origin);
        self.scheduled = true;
        Ok(InputStream::from_buffer(child.bytes, self.config.fixed_size))
    }

    fn handle_result(&mut self, report: RunReport) -> Result<(), GuidanceError> {
        let origin = self.pending.take().unwrap_or(InputOrigin::Fresh);
        let run_map = self.index.take_run_map();
        if std::mem::take(&mut self.scheduled) {
            self.scheduler.on_result(report.result.counts_as_trial());
        }

        match report.result {
            RunResult::Invalid(reason) => {
                self.stats.invalid += 1;
                trace!(origin = %origin, reason = %reason, "invalid input");
            }
            RunResult::Success => {
                self.stats.trials += 1;
                self.corpus.record_valid(&report.consumed)?;
                let signature = self.coverage.snapshot();
                let improvements = self.feedback.is_interesting(&signature)?;
                if improvements.is_empty() {
                    return Ok(());
                }
                self.feedback.commit(&signature)?;
                if self.config.blind {
                    return Ok(());
                }

                let focus = run_map
                    .as_ref()
                    .map(|map| map.focus_offsets(improvements.iter().map(|i| i.probe)))
                    .unwrap_or_default();
                let first = improvements[0];
                let size = report.consumed.len();
                let id = self.corpus.add(NewEntry {
                    bytes: report.consumed,
                    origin: origin.clone(),
                    signature,
                    cost: report.cost,
                    focus,
                    index_map: run_map,
                    improvements,
                    found_at: self.started.elapsed(),
                })?;
                info!(
                    id,
                    origin = %origin,
                    probe = first.probe,
                    old_bucket = first.old,
                    new_bucket = first.new,
                    size,
                    corpus = self.corpus.len(),
                    "saved new input"
                );
            }
            result @ (RunResult::Failure(_) | RunResult::Timeout) => {
                self.stats.trials += 1;
                self.handle_bug(&report.consumed, &result)?;
            }
        }
        Ok(())
    }

    fn handle_bug(&mut self, bytes: &[u8], result: &RunResult) -> Result<(), GuidanceError> {
        let Some(bug) = self.oracle.examine(bytes, result) else {
            return Ok(());
        };
        self.stats.failures += 1;
        if bug.kind == BugKind::Hang {
            self.stats.timeouts += 1;
        }
        if self.archive.record(&bug, self.started.elapsed())? {
            warn!(
                kind = ?bug.kind,
                key = %bug.dedup_key,
                cause = %bug.cause,
                location = ?bug.location,
                "found new unique failure"
            );
        } else {
            debug!(key = %bug.dedup_key, "duplicate failure");
        }
        if self.config.exit_on_crash {
            self.terminate(TerminationReason::FirstCrash);
        }
        Ok(())
    }

    fn pre_round<E: Executor + ?Sized>(&mut self, executor: &mut E) -> Result<(), GuidanceError> {
        let rng = ChaCha8Rng::seed_from_u64(self.rng.random());
        let outcome = PreRound::new(self.config.max_input_size).run(
            executor,
            rng,
            &mut self.coverage,
            &mut self.index,
        )?;
        self.index.take_run_map();
        self.touched_config = outcome.touched_config;
        match outcome.result {
            RunResult::Success => {
                if self.config.pre_round_save_as_seed {
                    self.seeds.push_front(Seed::new(outcome.bytes));
                    self.state = GuidanceState::Seeding;
                }
            }
            result => self.handle_bug(&outcome.bytes, &result)?,
        }
        Ok(())
    }

    fn log_status(&mut self) {
        self.last_status = Instant::now();
        let stats = self.stats();
        let secs = stats.elapsed.as_secs_f64().max(f64::EPSILON);
        info!(
            trials = stats.trials,
            invalid = stats.invalid,
            corpus = stats.corpus_size,
            favored = stats.favored,
            covered = stats.covered_probes,
            cycles = stats.cycles,
            unique_failures = stats.unique_failures,
            execs_per_sec = ((stats.trials + stats.invalid) as f64 / secs).round() as u64,
            "status"
        );
    }
}

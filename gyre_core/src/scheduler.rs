use crate::corpus::{Corpus, CorpusError};
use thiserror::Error;
use tracing::{debug, info};

/// Children per favored parent before size, cost and rarity adjustments.
pub const DEFAULT_BASE_ENERGY: f64 = 50.0;

/// Bounds on each of the size and cost factors.
const MIN_FACTOR: f64 = 0.25;
const MAX_FACTOR: f64 = 4.0;

/// Cap on the rarity multiplier.
const MAX_RARITY_BONUS: usize = 4;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Indicates that the corpus is empty, and therefore no parent can be scheduled.
    #[error("Corpus is empty, cannot schedule next input")]
    CorpusEmpty,
    /// Wraps an error originating from the corpus encountered during a scheduler operation.
    #[error("Corpus interaction failed within scheduler: {0}")]
    CorpusInteractionError(#[from] CorpusError),
}

/// A `Scheduler` decides which saved input the next child is mutated from.
pub trait Scheduler {
    /// Returns the id of the parent for the next child. Asking again without reporting a
    /// result returns the same parent.
    fn next(&mut self, corpus: &mut dyn Corpus) -> Result<usize, SchedulerError>;

    /// Reports the outcome of the child last handed out. Only runs that `counted` (anything
    /// but Invalid) spend the parent's energy.
    fn on_result(&mut self, counted: bool);

    /// Completed passes over the favored set.
    fn cycles(&self) -> u64;
}

/// Walks a snapshot of the favored set, handing out each parent until `energy` counted
/// children of it have run.
///
/// A fresh snapshot is taken when the walk reaches its end, which counts as one cycle.
/// Entries saved in the middle of a cycle wait for the next snapshot.
#[derive(Debug)]
pub struct EnergyScheduler {
    base_energy: f64,
    queue: Vec<usize>,
    position: usize,
    current: Option<(usize, usize)>,
    cycles: u64,
}

impl EnergyScheduler {
    pub fn new() -> Self {
        Self::with_base_energy(DEFAULT_BASE_ENERGY)
    }

    pub fn with_base_energy(base_energy: f64) -> Self {
        Self {
            base_energy: base_energy.max(1.0),
            queue: Vec::new(),
            position: 0,
            current: None,
            cycles: 0,
        }
    }

    /// Children to derive from entry `id`: more for small, cheap inputs and for inputs that
    /// are the only cover of some probe. Always at least one.
    pub fn energy(&self, corpus: &mut dyn Corpus, id: usize) -> Result<usize, SchedulerError> {
        // Refreshes `unique_cover` if entries were added since the last look.
        corpus.favored();
        let entries = corpus.entries();
        let entry = entries
            .get(id)
            .ok_or(CorpusError::InputNotFound(id))?;

        let count = entries.len() as f64;
        let avg_size = entries.iter().map(|e| e.bytes.len().max(1) as f64).sum::<f64>() / count;
        let avg_cost = entries.iter().map(|e| e.cost.max(1) as f64).sum::<f64>() / count;

        let size_factor = (avg_size / entry.bytes.len().max(1) as f64).clamp(MIN_FACTOR, MAX_FACTOR);
        let cost_factor = (avg_cost / entry.cost.max(1) as f64).clamp(MIN_FACTOR, MAX_FACTOR);
        let rarity = (1 + entry.unique_cover).min(MAX_RARITY_BONUS) as f64;

        let energy = (self.base_energy * size_factor * cost_factor * rarity).round() as usize;
        Ok(energy.max(1))
    }

    fn refill(&mut self, corpus: &mut dyn Corpus) {
        if !self.queue.is_empty() {
            self.cycles += 1;
            info!(cycle = self.cycles, parents = self.queue.len(), "queue cycle completed");
        }
        let favored = corpus.favored();
        self.queue = if favored.is_empty() {
            (0..corpus.len()).collect()
        } else {
            favored.to_vec()
        };
        self.position = 0;
    }
}

impl Default for EnergyScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for EnergyScheduler {
    fn next(&mut self, corpus: &mut dyn Corpus) -> Result<usize, SchedulerError> {
        if corpus.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }
        if let Some((id, remaining)) = self.current {
            if remaining > 0 {
                return Ok(id);
            }
        }
        if self.position >= self.queue.len() {
            self.refill(corpus);
        }
        let id = self.queue[self.position];
        self.position += 1;
        let energy = self.energy(corpus, id)?;
        debug!(parent = id, energy, "scheduling parent");
        self.current = Some((id, energy));
        Ok(id)
    }

    fn on_result(&mut self, counted: bool) {
        if let (true, Some((_, remaining))) = (counted, self.current.as_mut()) {
            *remaining = remaining.saturating_sub(1);
        }
    }

    fn cycles(&self) -> u64 {
        self.cycles
    }
}

//! Execution indexing: tagging stream positions and probe hits with the dynamic call context
//! in which they happened.
//!
//! An execution index is the path of `(call site, iteration)` pairs from the root of the
//! generator down to the point of interest. Two byte positions from different runs that carry
//! equal indexes were consumed by the same logical piece of the generator, which is what lets
//! the mutator splice between inputs without tearing structures apart and aim byte-level
//! mutations at the region responsible for a coverage gain.

use crate::executor::RunResult;
use crate::observer::Observer;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

/// Pseudo call site recorded for every byte pulled from the input stream.
pub const READ_SITE: u32 = u32::MAX;

/// Iteration tags saturate at this value; later iterations share the tag.
pub const DEFAULT_MAX_ITERATION: u32 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexEntry {
    pub call_site: u32,
    pub iteration: u32,
}

/// An immutable snapshot of the call context. Cloning is cheap.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionIndex(Arc<[IndexEntry]>);

impl ExecutionIndex {
    pub fn new(entries: &[IndexEntry]) -> Self {
        Self(Arc::from(entries))
    }

    pub fn root() -> Self {
        Self::new(&[])
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// The enclosing context: every entry except the innermost one.
    pub fn frame(&self) -> &[IndexEntry] {
        &self.0[..self.0.len().saturating_sub(1)]
    }

    pub fn starts_with(&self, prefix: &[IndexEntry]) -> bool {
        self.0.starts_with(prefix)
    }
}

/// Per-run output of an indexing capability.
#[derive(Debug, Clone, Default)]
pub struct RunIndexMap {
    /// Execution index of every byte consumed, by stream offset.
    pub positions: Vec<ExecutionIndex>,
    /// Context active the first time each probe fired during the run.
    pub probe_context: HashMap<u32, ExecutionIndex>,
    /// Bytes consumed when each probe first fired.
    pub probe_reads: HashMap<u32, usize>,
}

impl RunIndexMap {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Offsets consumed while `context` (or any context nested in it) was active.
    pub fn offsets_under(&self, context: &ExecutionIndex) -> Vec<usize> {
        if context.depth() == 0 {
            return Vec::new();
        }
        self.positions
            .iter()
            .enumerate()
            .filter(|(_, index)| index.starts_with(context.entries()))
            .map(|(offset, _)| offset)
            .collect()
    }

    /// Sorted, deduplicated offsets responsible for the given probes.
    ///
    /// A probe that fired at the root (typically in the test target, after the generator
    /// returned) is attributed to the context of the last byte read before it: every offset
    /// consumed under that read's enclosing call, or just that byte if it was read at the root.
    pub fn focus_offsets(&self, probes: impl IntoIterator<Item = u32>) -> Vec<usize> {
        let mut offsets: Vec<usize> = probes
            .into_iter()
            .flat_map(|probe| self.offsets_for_probe(probe))
            .collect();
        offsets.sort_unstable();
        offsets.dedup();
        offsets
    }

    fn offsets_for_probe(&self, probe: u32) -> Vec<usize> {
        let Some(context) = self.probe_context.get(&probe) else {
            return Vec::new();
        };
        if context.depth() > 0 {
            return self.offsets_under(context);
        }
        let reads = self.probe_reads.get(&probe).copied().unwrap_or(0);
        let Some(last) = reads.checked_sub(1) else {
            return Vec::new();
        };
        let Some(frame) = self.positions.get(last).map(ExecutionIndex::frame) else {
            return Vec::new();
        };
        if frame.is_empty() {
            return vec![last];
        }
        self.offsets_under(&ExecutionIndex::new(frame))
    }

    pub fn position_of(&self, index: &ExecutionIndex) -> Option<usize> {
        self.positions.iter().position(|candidate| candidate == index)
    }

    /// The maximal run of offsets around `offset` consumed inside the same enclosing frame.
    pub fn region_at(&self, offset: usize) -> Range<usize> {
        let Some(anchor) = self.positions.get(offset) else {
            return offset..offset;
        };
        let frame = anchor.frame();
        let mut start = offset;
        while start > 0 && self.positions[start - 1].starts_with(frame) {
            start -= 1;
        }
        let mut end = offset + 1;
        while end < self.positions.len() && self.positions[end].starts_with(frame) {
            end += 1;
        }
        start..end
    }
}

/// The optional execution-indexing capability of the guidance.
///
/// The plain coverage-guided engine runs with [`NoIndex`]; the execution-indexing engine runs
/// with [`ExecutionIndexer`]. Everything else in the guidance is shared.
pub trait IndexCapability: Observer {
    fn enabled(&self) -> bool;

    /// A call site was entered by the generator.
    fn enter(&mut self, call_site: u32);

    /// The innermost call site returned.
    fn exit(&mut self);

    /// One byte was consumed from the input stream.
    fn on_read(&mut self);

    /// A probe fired.
    fn on_probe(&mut self, probe: u32);

    /// Hands over everything recorded for the run that just finished.
    fn take_run_map(&mut self) -> Option<RunIndexMap>;
}

/// Capability used when execution indexing is off. Every hook is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndex;

impl Observer for NoIndex {
    fn name(&self) -> &'static str {
        "NoIndex"
    }

    fn pre_exec(&mut self) {}

    fn post_exec(&mut self, _result: &RunResult) {}
}

impl IndexCapability for NoIndex {
    fn enabled(&self) -> bool {
        false
    }

    #[inline]
    fn enter(&mut self, _call_site: u32) {}

    #[inline]
    fn exit(&mut self) {}

    #[inline]
    fn on_read(&mut self) {}

    #[inline]
    fn on_probe(&mut self, _probe: u32) {}

    fn take_run_map(&mut self) -> Option<RunIndexMap> {
        None
    }
}

/// Tracks the live call stack of the generator and assigns iteration tags so that repeated
/// calls to one site from a loop stay distinguishable up to `max_iteration`.
#[derive(Debug, Clone)]
pub struct ExecutionIndexer {
    path: Vec<IndexEntry>,
    // frames[0] is the root; one extra frame per entry in `path`.
    frames: Vec<HashMap<u32, u32>>,
    positions: Vec<ExecutionIndex>,
    probe_context: HashMap<u32, ExecutionIndex>,
    probe_reads: HashMap<u32, usize>,
    max_iteration: u32,
}

impl ExecutionIndexer {
    pub fn new() -> Self {
        Self::with_max_iteration(DEFAULT_MAX_ITERATION)
    }

    pub fn with_max_iteration(max_iteration: u32) -> Self {
        Self {
            path: Vec::new(),
            frames: vec![HashMap::new()],
            positions: Vec::new(),
            probe_context: HashMap::new(),
            probe_reads: HashMap::new(),
            max_iteration,
        }
    }

    pub fn current_index(&self) -> ExecutionIndex {
        ExecutionIndex::new(&self.path)
    }

    /// Iteration tag the next call to `call_site` in the current frame will receive.
    pub fn loop_iteration(&self, call_site: u32) -> u32 {
        let seen = self
            .frames
            .last()
            .and_then(|counts| counts.get(&call_site))
            .copied()
            .unwrap_or(0);
        seen.min(self.max_iteration)
    }

    fn bump(&mut self, call_site: u32) -> IndexEntry {
        let iteration = self.loop_iteration(call_site);
        if let Some(counts) = self.frames.last_mut() {
            let seen = counts.entry(call_site).or_insert(0);
            *seen = seen.saturating_add(1);
        }
        IndexEntry {
            call_site,
            iteration,
        }
    }
}

impl Default for ExecutionIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for ExecutionIndexer {
    fn name(&self) -> &'static str {
        "ExecutionIndexer"
    }

    fn pre_exec(&mut self) {
        self.path.clear();
        self.frames.clear();
        self.frames.push(HashMap::new());
        self.positions.clear();
        self.probe_context.clear();
        self.probe_reads.clear();
    }

    fn post_exec(&mut self, _result: &RunResult) {}
}

impl IndexCapability for ExecutionIndexer {
    fn enabled(&self) -> bool {
        true
    }

    fn enter(&mut self, call_site: u32) {
        let entry = self.bump(call_site);
        self.path.push(entry);
        self.frames.push(HashMap::new());
    }

    fn exit(&mut self) {
        // An unmatched exit at the root is ignored.
        if self.path.pop().is_some() {
            self.frames.pop();
        }
    }

    fn on_read(&mut self) {
        let entry = self.bump(READ_SITE);
        self.path.push(entry);
        let index = self.current_index();
        self.path.pop();
        self.positions.push(index);
    }

    fn on_probe(&mut self, probe: u32) {
        if !self.probe_context.contains_key(&probe) {
            let context = self.current_index();
            self.probe_context.insert(probe, context);
            self.probe_reads.insert(probe, self.positions.len());
        }
    }

    fn take_run_map(&mut self) -> Option<RunIndexMap> {
        Some(RunIndexMap {
            positions: std::mem::take(&mut self.positions),
            probe_context: std::mem::take(&mut self.probe_context),
            probe_reads: std::mem::take(&mut self.probe_reads),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(call_site: u32, iteration: u32) -> IndexEntry {
        IndexEntry {
            call_site,
            iteration,
        }
    }

    #[test]
    fn nested_calls_build_the_index_path() {
        let mut indexer = ExecutionIndexer::new();
        indexer.pre_exec();
        indexer.enter(10);
        indexer.enter(20);
        assert_eq!(
            indexer.current_index().entries(),
            &[entry(10, 0), entry(20, 0)]
        );
        indexer.exit();
        indexer.enter(20);
        assert_eq!(
            indexer.current_index().entries(),
            &[entry(10, 0), entry(20, 1)],
            "second call from the same frame gets the next iteration tag"
        );
        indexer.exit();
        indexer.exit();
        indexer.exit();
        assert_eq!(indexer.current_index(), ExecutionIndex::root());
    }

    #[test]
    fn iterations_collapse_beyond_the_cap() {
        let mut indexer = ExecutionIndexer::with_max_iteration(3);
        indexer.pre_exec();
        let mut tags = Vec::new();
        for _ in 0..6 {
            tags.push(indexer.loop_iteration(7));
            indexer.enter(7);
            indexer.exit();
        }
        assert_eq!(tags, vec![0, 1, 2, 3, 3, 3]);
    }

    #[test]
    fn reads_and_probes_are_tagged_with_context() {
        let mut indexer = ExecutionIndexer::new();
        indexer.pre_exec();
        indexer.on_read();
        indexer.enter(1);
        indexer.on_read();
        indexer.on_read();
        indexer.on_probe(99);
        indexer.exit();
        indexer.enter(1);
        indexer.on_read();
        indexer.on_probe(99);
        indexer.exit();

        let map = indexer.take_run_map().unwrap();
        assert_eq!(map.len(), 4);
        assert_eq!(map.positions[0].entries(), &[entry(READ_SITE, 0)]);
        assert_eq!(
            map.positions[2].entries(),
            &[entry(1, 0), entry(READ_SITE, 1)]
        );
        assert_eq!(
            map.probe_context[&99].entries(),
            &[entry(1, 0)],
            "the first context a probe fired in is kept"
        );
        assert_eq!(map.focus_offsets([99]), vec![1, 2]);
        assert_eq!(map.region_at(1), 1..3);
        assert_eq!(map.region_at(3), 3..4);
    }

    #[test]
    fn root_hits_point_at_the_last_read_context() {
        let mut indexer = ExecutionIndexer::new();
        indexer.pre_exec();
        indexer.on_probe(1);
        indexer.on_read();
        indexer.enter(4);
        indexer.on_read();
        indexer.enter(5);
        indexer.on_read();
        indexer.exit();
        indexer.exit();
        indexer.on_probe(2);
        indexer.on_read();
        indexer.on_probe(3);

        let map = indexer.take_run_map().unwrap();
        assert!(map.focus_offsets([1]).is_empty(), "nothing read yet");
        assert_eq!(
            map.focus_offsets([2]),
            vec![2],
            "innermost call enclosing the last read"
        );
        assert_eq!(map.focus_offsets([3]), vec![3], "last read was at the root");
        assert_eq!(map.focus_offsets([2, 3, 42]), vec![2, 3]);
    }

    #[test]
    fn pre_exec_discards_the_previous_run() {
        let mut indexer = ExecutionIndexer::new();
        indexer.pre_exec();
        indexer.enter(5);
        indexer.on_read();
        indexer.on_probe(1);
        indexer.pre_exec();
        assert_eq!(indexer.current_index(), ExecutionIndex::root());
        let map = indexer.take_run_map().unwrap();
        assert!(map.is_empty());
        assert!(map.probe_context.is_empty());
    }

    #[test]
    fn no_index_records_nothing() {
        let mut none = NoIndex;
        none.enter(1);
        none.on_read();
        assert!(!none.enabled());
        assert!(none.take_run_map().is_none());
    }
}

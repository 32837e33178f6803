use crate::corpus::CorpusEntry;
use crate::ei::RunIndexMap;
use crate::input::InputOrigin;
use rand::Rng;

/// Byte values that tend to sit on boundaries in parsers and arithmetic.
pub const INTERESTING_BYTES: [u8; 9] = [0, 1, 16, 32, 64, 100, 0x7f, 0x80, 0xff];

/// Longest run inserted or deleted by a single operator.
const MAX_BLOCK: usize = 32;

/// Chance that a child starts from a splice when a donor is available.
const SPLICE_PROBABILITY: f64 = 0.2;

/// Chance that a byte-level operator targets a focus offset when the parent has any.
const FOCUS_PROBABILITY: f64 = 0.75;

/// Attempts at finding a position whose execution index also appears in the donor.
const ALIGNED_SPLICE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationOp {
    FlipBit,
    FlipBits,
    Increment,
    Decrement,
    Negate,
    InterestingByte,
    InsertRandom,
    InsertDictionary,
    Delete,
    Splice,
}

const HAVOC_OPS: [MutationOp; 9] = [
    MutationOp::FlipBit,
    MutationOp::FlipBits,
    MutationOp::Increment,
    MutationOp::Decrement,
    MutationOp::Negate,
    MutationOp::InterestingByte,
    MutationOp::InsertRandom,
    MutationOp::InsertDictionary,
    MutationOp::Delete,
];

/// A candidate produced from one parent (and possibly a donor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Child {
    pub bytes: Vec<u8>,
    pub origin: InputOrigin,
    /// Operators that actually changed the buffer, in application order.
    pub ops: Vec<MutationOp>,
}

impl Child {
    /// Net change in length relative to the parent.
    pub fn size_delta(&self, parent: &CorpusEntry) -> isize {
        self.bytes.len() as isize - parent.bytes.len() as isize
    }
}

/// A `Mutator` turns saved corpus entries into new candidate byte buffers.
///
/// Parents are never modified; every call works on a copy.
pub trait Mutator<R: Rng + ?Sized> {
    fn mutate(&mut self, parent: &CorpusEntry, donor: Option<&CorpusEntry>, rng: &mut R) -> Child;
}

/// Stacked byte-level mutations with optional splicing, aimed at focus offsets when the
/// parent carries them.
#[derive(Debug, Clone)]
pub struct HavocMutator {
    dictionary: Vec<Vec<u8>>,
    max_input_size: usize,
    max_mutations: usize,
}

impl HavocMutator {
    pub fn new(max_input_size: usize) -> Self {
        Self {
            dictionary: Vec::new(),
            max_input_size: max_input_size.max(1),
            max_mutations: 8,
        }
    }

    pub fn with_dictionary(mut self, dictionary: Vec<Vec<u8>>) -> Self {
        self.dictionary = dictionary.into_iter().filter(|t| !t.is_empty()).collect();
        self
    }

    pub fn with_max_mutations(mut self, max_mutations: usize) -> Self {
        self.max_mutations = max_mutations.max(1);
        self
    }

    /// Number of stacked operators for a buffer of `len` bytes; fewer for larger inputs.
    fn mutation_count<R: Rng + ?Sized>(&self, len: usize, rng: &mut R) -> usize {
        let cap = match len {
            0..=64 => 8,
            65..=1024 => 4,
            _ => 2,
        }
        .min(self.max_mutations);
        rng.random_range(1..=cap).min(rng.random_range(1..=cap))
    }

    fn applicable(&self, op: MutationOp, len: usize) -> bool {
        match op {
            MutationOp::InsertRandom => len < self.max_input_size,
            MutationOp::InsertDictionary => {
                !self.dictionary.is_empty() && len < self.max_input_size
            }
            MutationOp::Splice => false,
            _ => len > 0,
        }
    }

    /// Applies one byte-level operator to `buf`. Returns false if it could not apply.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        op: MutationOp,
        buf: &mut Vec<u8>,
        focus: &[usize],
        rng: &mut R,
    ) -> bool {
        if !self.applicable(op, buf.len()) {
            return false;
        }
        match op {
            MutationOp::FlipBit => {
                let at = pick_offset(buf.len(), focus, rng);
                buf[at] ^= 1u8 << rng.random_range(0..8u32);
            }
            MutationOp::FlipBits => {
                let at = pick_offset(buf.len(), focus, rng);
                let mask: u8 = match rng.random_range(0..3u8) {
                    0 => 0b11,
                    1 => 0b1111,
                    _ => 0xff,
                };
                buf[at] ^= mask << rng.random_range(0..(9 - mask.count_ones()));
            }
            MutationOp::Increment => {
                let at = pick_offset(buf.len(), focus, rng);
                buf[at] = buf[at].wrapping_add(rng.random_range(1..=16));
            }
            MutationOp::Decrement => {
                let at = pick_offset(buf.len(), focus, rng);
                buf[at] = buf[at].wrapping_sub(rng.random_range(1..=16));
            }
            MutationOp::Negate => {
                let at = pick_offset(buf.len(), focus, rng);
                buf[at] = buf[at].wrapping_neg();
            }
            MutationOp::InterestingByte => {
                let at = pick_offset(buf.len(), focus, rng);
                buf[at] = INTERESTING_BYTES[rng.random_range(0..INTERESTING_BYTES.len())];
            }
            MutationOp::InsertRandom => {
                let room = self.max_input_size - buf.len();
                let len = rand_exp(rng, 1, MAX_BLOCK.min(room));
                let at = pick_insert_offset(buf.len(), focus, rng);
                let block: Vec<u8> = (0..len).map(|_| rng.random::<u8>()).collect();
                buf.splice(at..at, block);
            }
            MutationOp::InsertDictionary => {
                let token = &self.dictionary[rng.random_range(0..self.dictionary.len())];
                let room = self.max_input_size - buf.len();
                let token = &token[..token.len().min(room)];
                let at = pick_insert_offset(buf.len(), focus, rng);
                buf.splice(at..at, token.iter().copied());
            }
            MutationOp::Delete => {
                let at = pick_offset(buf.len(), focus, rng);
                let len = rand_exp(rng, 1, MAX_BLOCK.min(buf.len() - at));
                buf.drain(at..at + len);
            }
            MutationOp::Splice => return false,
        }
        true
    }

    fn splice<R: Rng + ?Sized>(
        &self,
        parent: &CorpusEntry,
        donor: &CorpusEntry,
        rng: &mut R,
    ) -> Option<Vec<u8>> {
        if donor.bytes.is_empty() {
            return None;
        }
        if let (Some(parent_map), Some(donor_map)) = (&parent.index_map, &donor.index_map) {
            if !parent.bytes.is_empty() {
                for _ in 0..ALIGNED_SPLICE_ATTEMPTS {
                    let at = pick_offset(parent.bytes.len(), &parent.focus, rng);
                    let aligned = splice_aligned(
                        &parent.bytes,
                        parent_map,
                        &donor.bytes,
                        donor_map,
                        at,
                    );
                    if let Some(child) = aligned {
                        if child != parent.bytes {
                            return Some(child);
                        }
                    }
                }
            }
        }
        Some(self.splice_flat(&parent.bytes, &donor.bytes, rng))
    }

    /// Copies a random donor range over (or into) a random position of the parent.
    fn splice_flat<R: Rng + ?Sized>(&self, parent: &[u8], donor: &[u8], rng: &mut R) -> Vec<u8> {
        let mut child = parent.to_vec();
        let from = rng.random_range(0..donor.len());
        let len = rand_exp(rng, 1, donor.len() - from);
        let block = &donor[from..from + len];
        let at = rng.random_range(0..=child.len());
        if rng.random_bool(0.5) {
            child.splice(at..at, block.iter().copied());
        } else {
            let end = (at + len).min(child.len());
            child.splice(at..end, block.iter().copied());
        }
        child
    }
}

impl<R: Rng + ?Sized> Mutator<R> for HavocMutator {
    fn mutate(&mut self, parent: &CorpusEntry, donor: Option<&CorpusEntry>, rng: &mut R) -> Child {
        let mut ops = Vec::new();
        let mut origin = InputOrigin::Mutated { parent: parent.id };

        let spliced = donor
            .filter(|d| d.id != parent.id && rng.random_bool(SPLICE_PROBABILITY))
            .and_then(|d| self.splice(parent, d, rng).map(|bytes| (d.id, bytes)));
        let mut buf = match spliced {
            Some((donor_id, bytes)) => {
                ops.push(MutationOp::Splice);
                origin = InputOrigin::Spliced {
                    parent: parent.id,
                    donor: donor_id,
                };
                bytes
            }
            None => parent.bytes.clone(),
        };
        // Focus offsets refer to the parent's layout; after a splice they no longer line up.
        let focus: &[usize] = if ops.is_empty() { &parent.focus } else { &[] };

        let count = self.mutation_count(buf.len(), rng);
        while ops.len() < count {
            let candidates: Vec<MutationOp> = HAVOC_OPS
                .into_iter()
                .filter(|&op| self.applicable(op, buf.len()))
                .collect();
            if candidates.is_empty() {
                break;
            }
            let op = candidates[rng.random_range(0..candidates.len())];
            if self.apply(op, &mut buf, focus, rng) {
                ops.push(op);
            }
        }
        buf.truncate(self.max_input_size);

        Child {
            bytes: buf,
            origin,
            ops,
        }
    }
}

/// Replaces the region of `parent` around `offset` with the donor region consumed under the
/// same execution index. `None` if the donor never consumed a byte under that index.
pub fn splice_aligned(
    parent: &[u8],
    parent_map: &RunIndexMap,
    donor: &[u8],
    donor_map: &RunIndexMap,
    offset: usize,
) -> Option<Vec<u8>> {
    let index = parent_map.positions.get(offset)?;
    let donor_offset = donor_map.position_of(index)?;
    let target = parent_map.region_at(offset);
    let source = donor_map.region_at(donor_offset);
    if target.end > parent.len() || source.end > donor.len() {
        return None;
    }
    let mut child = parent.to_vec();
    child.splice(target, donor[source].iter().copied());
    Some(child)
}

/// Half uniform, half skewed toward `min`.
fn rand_exp<R: Rng + ?Sized>(rng: &mut R, min: usize, max: usize) -> usize {
    if rng.random_bool(0.5) {
        rng.random_range(min..=max)
    } else {
        let x = rng.random_range(min..=max);
        rng.random_range(min..=x)
    }
}

fn pick_offset<R: Rng + ?Sized>(len: usize, focus: &[usize], rng: &mut R) -> usize {
    if !focus.is_empty() && rng.random_bool(FOCUS_PROBABILITY) {
        let candidate = focus[rng.random_range(0..focus.len())];
        if candidate < len {
            return candidate;
        }
    }
    rng.random_range(0..len)
}

fn pick_insert_offset<R: Rng + ?Sized>(len: usize, focus: &[usize], rng: &mut R) -> usize {
    if len == 0 {
        0
    } else {
        pick_offset(len, focus, rng) + usize::from(rng.random_bool(0.5))
    }
}

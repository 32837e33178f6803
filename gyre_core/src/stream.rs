use rand::Rng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

/// Value handed out past the end of a fixed-size input.
pub const SENTINEL: u8 = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The backing buffer (or the fresh-mode size limit) ran out.
    #[error("Input stream exhausted after {consumed} bytes")]
    EndOfData { consumed: usize },
}

#[derive(Debug)]
enum Source {
    Fresh { rng: ChaCha8Rng, limit: usize },
    Replay { bytes: Vec<u8>, pos: usize, fixed_size: bool },
}

/// A pull-based byte source feeding one run of the structured generator.
///
/// Every real byte handed out is appended to the consumed buffer; if the run turns out to be
/// worth keeping, that buffer (not the full parent) is what gets saved. Streams are built
/// fresh for each run and never rewound.
#[derive(Debug)]
pub struct InputStream {
    source: Source,
    consumed: Vec<u8>,
}

impl InputStream {
    /// An effectively unbounded stream drawn from `rng`, capped at `limit` bytes.
    pub fn fresh(rng: ChaCha8Rng, limit: usize) -> Self {
        Self {
            source: Source::Fresh { rng, limit },
            consumed: Vec::new(),
        }
    }

    /// Replays `bytes`; reading past the end is an error.
    pub fn replay(bytes: Vec<u8>) -> Self {
        Self::from_buffer(bytes, false)
    }

    /// Replays `bytes`; reading past the end yields [`SENTINEL`] without recording it.
    pub fn fixed_size(bytes: Vec<u8>) -> Self {
        Self::from_buffer(bytes, true)
    }

    pub fn from_buffer(bytes: Vec<u8>, fixed_size: bool) -> Self {
        let capacity = bytes.len();
        Self {
            source: Source::Replay {
                bytes,
                pos: 0,
                fixed_size,
            },
            consumed: Vec::with_capacity(capacity),
        }
    }

    pub fn next_byte(&mut self) -> Result<u8, StreamError> {
        match self.pull() {
            Some(byte) => Ok(byte),
            None => match self.source {
                Source::Replay {
                    fixed_size: true, ..
                } => Ok(SENTINEL),
                _ => Err(StreamError::EndOfData {
                    consumed: self.consumed.len(),
                }),
            },
        }
    }

    /// Pulls one real byte, or `None` once the source is exhausted in any mode.
    fn pull(&mut self) -> Option<u8> {
        let byte = match &mut self.source {
            Source::Fresh { rng, limit } => {
                if self.consumed.len() >= *limit {
                    return None;
                }
                rng.random::<u8>()
            }
            Source::Replay { bytes, pos, .. } => {
                let byte = *bytes.get(*pos)?;
                *pos += 1;
                byte
            }
        };
        self.consumed.push(byte);
        Some(byte)
    }

    pub fn is_exhausted(&self) -> bool {
        match &self.source {
            Source::Fresh { limit, .. } => self.consumed.len() >= *limit,
            Source::Replay { bytes, pos, .. } => *pos >= bytes.len(),
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self.source, Source::Fresh { .. })
    }

    /// Bytes still available, or `None` for a fresh stream.
    pub fn remaining(&self) -> Option<usize> {
        match &self.source {
            Source::Fresh { .. } => None,
            Source::Replay { bytes, pos, .. } => Some(bytes.len() - pos),
        }
    }

    pub fn position(&self) -> usize {
        self.consumed.len()
    }

    pub fn consumed(&self) -> &[u8] {
        &self.consumed
    }

    pub fn into_consumed(self) -> Vec<u8> {
        self.consumed
    }
}

/// Yields real bytes only; finite for replayed buffers, bounded by the limit for fresh ones.
impl Iterator for InputStream {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        self.pull()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::SeedableRng;

    #[test]
    fn replay_records_only_what_was_read() {
        let mut stream = InputStream::replay(vec![1, 2, 3, 4]);
        assert_eq!(stream.next_byte(), Ok(1));
        assert_eq!(stream.next_byte(), Ok(2));
        assert_eq!(stream.remaining(), Some(2));
        assert_eq!(stream.into_consumed(), vec![1, 2]);
    }

    #[test]
    fn replay_signals_end_of_data() {
        let mut stream = InputStream::replay(vec![9]);
        assert_eq!(stream.next_byte(), Ok(9));
        assert!(stream.is_exhausted());
        assert_eq!(
            stream.next_byte(),
            Err(StreamError::EndOfData { consumed: 1 })
        );
    }

    #[test]
    fn fixed_size_returns_sentinel_without_recording_it() {
        let mut stream = InputStream::fixed_size(vec![7]);
        assert_eq!(stream.next_byte(), Ok(7));
        assert_eq!(stream.next_byte(), Ok(SENTINEL));
        assert_eq!(stream.next_byte(), Ok(SENTINEL));
        assert_eq!(stream.consumed(), &[7]);
    }

    #[test]
    fn fresh_streams_are_deterministic_and_bounded() {
        let draw = |seed: u64| {
            let mut stream = InputStream::fresh(ChaCha8Rng::seed_from_u64(seed), 16);
            (0..16).map(|_| stream.next_byte().unwrap()).collect::<Vec<u8>>()
        };
        assert_eq!(draw(1), draw(1));
        assert_ne!(draw(1), draw(2));

        let mut stream = InputStream::fresh(ChaCha8Rng::seed_from_u64(3), 2);
        assert!(stream.next_byte().is_ok());
        assert!(stream.next_byte().is_ok());
        assert!(stream.next_byte().is_err(), "fresh mode stops at its size limit");
        assert_eq!(stream.position(), 2);
    }

    #[test]
    fn iterator_is_finite_in_replay_mode() {
        let collected: Vec<u8> = InputStream::fixed_size(vec![1, 2, 3]).collect();
        assert_eq!(collected, vec![1, 2, 3]);
    }
}

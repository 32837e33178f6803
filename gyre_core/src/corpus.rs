use crate::coverage::Signature;
use crate::ei::RunIndexMap;
use crate::feedback::Improvement;
use crate::input::{InputOrigin, Seed};
use bincode::{
    self,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const INDEX_FILENAME: &str = "corpus_index.json";
pub const SAVE_LOG_FILENAME: &str = "fuzz_log.jsonl";
const SIGNATURE_EXTENSION: &str = "cov";

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The requested input ID was not found within the corpus.
    #[error("Input ID {0} not found in corpus")]
    InputNotFound(usize),

    /// An I/O error occurred while persisting or loading corpus files.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    #[error("Corpus deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Serialization(format!("JSON operation error: {}", err))
    }
}
impl From<EncodeError> for CorpusError {
    fn from(err: EncodeError) -> Self {
        CorpusError::Serialization(format!("Bincode encoding error: {}", err))
    }
}
impl From<DecodeError> for CorpusError {
    fn from(err: DecodeError) -> Self {
        CorpusError::Deserialization(format!("Bincode decoding error: {}", err))
    }
}

/// Encoding used for signature files next to saved inputs.
pub fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// A run that earned a place in the corpus, before it is assigned an id.
#[derive(Debug, Clone)]
pub struct NewEntry {
    /// The bytes the generator actually consumed.
    pub bytes: Vec<u8>,
    pub origin: InputOrigin,
    pub signature: Signature,
    pub cost: u64,
    /// Offsets consumed under the contexts that produced the improvements.
    pub focus: Vec<usize>,
    pub index_map: Option<RunIndexMap>,
    pub improvements: Vec<Improvement>,
    /// Session time at which the run happened.
    pub found_at: Duration,
}

/// A saved input. Entries are never modified after the save except for the derived
/// `favored` and `unique_cover` fields.
#[derive(Debug, Clone)]
pub struct CorpusEntry {
    pub id: usize,
    pub bytes: Vec<u8>,
    pub origin: InputOrigin,
    pub signature: Signature,
    pub cost: u64,
    pub focus: Vec<usize>,
    pub index_map: Option<RunIndexMap>,
    pub found_at: Duration,
    pub favored: bool,
    /// Probes for which this entry is the only saved cover.
    pub unique_cover: usize,
}

impl CorpusEntry {
    /// Ranking used to pick the representative of a probe; lower is better.
    pub fn weight(&self) -> u64 {
        (self.bytes.len().max(1) as u64).saturating_mul(self.cost.max(1))
    }
}

/// The set of saved inputs plus the favored subset derived from their signatures.
pub trait Corpus {
    /// Saves `entry` and returns its sequence id. Ids are dense and start at zero.
    fn add(&mut self, entry: NewEntry) -> Result<usize, CorpusError>;

    fn get(&self, id: usize) -> Option<&CorpusEntry>;

    fn entries(&self) -> &[CorpusEntry];

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the favored entries in ascending order, recomputed if the corpus changed.
    fn favored(&mut self) -> &[usize];

    /// Offers every valid run for archiving. Most corpora ignore it.
    fn record_valid(&mut self, _bytes: &[u8]) -> Result<(), CorpusError> {
        Ok(())
    }
}

/// Corpus held entirely in memory.
///
/// For every probe it tracks the best-ranked entry covering it (`top_rated`) and how many
/// entries cover it at all. The favored set is a greedy cover over the rarest probes first,
/// taking each uncovered probe's top-rated entry.
#[derive(Debug, Default)]
pub struct InMemoryCorpus {
    entries: Vec<CorpusEntry>,
    top_rated: HashMap<u32, usize>,
    cover_count: HashMap<u32, usize>,
    favored: Vec<usize>,
    dirty: bool,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry currently representing `probe`, if any entry covers it.
    pub fn top_rated(&self, probe: u32) -> Option<usize> {
        self.top_rated.get(&probe).copied()
    }

    fn recompute_favored(&mut self) {
        let mut probes: Vec<(usize, u32)> = self
            .cover_count
            .iter()
            .map(|(&probe, &count)| (count, probe))
            .collect();
        probes.sort_unstable();

        let mut covered: HashSet<u32> = HashSet::new();
        let mut favored: Vec<usize> = Vec::new();
        for (_, probe) in probes {
            if covered.contains(&probe) {
                continue;
            }
            let Some(&winner) = self.top_rated.get(&probe) else {
                continue;
            };
            favored.push(winner);
            covered.extend(self.entries[winner].signature.probes());
        }
        favored.sort_unstable();
        favored.dedup();

        for entry in &mut self.entries {
            entry.favored = false;
            entry.unique_cover = entry
                .signature
                .probes()
                .filter(|probe| self.cover_count.get(probe) == Some(&1))
                .count();
        }
        for &id in &favored {
            self.entries[id].favored = true;
        }
        self.favored = favored;
        self.dirty = false;
    }
}

impl Corpus for InMemoryCorpus {
    fn add(&mut self, entry: NewEntry) -> Result<usize, CorpusError> {
        let id = self.entries.len();
        let saved = CorpusEntry {
            id,
            bytes: entry.bytes,
            origin: entry.origin,
            signature: entry.signature,
            cost: entry.cost,
            focus: entry.focus,
            index_map: entry.index_map,
            found_at: entry.found_at,
            favored: false,
            unique_cover: 0,
        };
        let weight = saved.weight();
        for probe in saved.signature.probes() {
            *self.cover_count.entry(probe).or_insert(0) += 1;
            match self.top_rated.get(&probe) {
                // Strictly better only: on a tie the earlier entry keeps the probe.
                Some(&current) if self.entries[current].weight() <= weight => {}
                _ => {
                    self.top_rated.insert(probe, id);
                }
            }
        }
        self.entries.push(saved);
        self.dirty = true;
        Ok(id)
    }

    fn get(&self, id: usize) -> Option<&CorpusEntry> {
        self.entries.get(id)
    }

    fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    fn favored(&mut self) -> &[usize] {
        if self.dirty {
            self.recompute_favored();
        }
        &self.favored
    }
}

/// Index record written to `corpus_index.json` for each saved input.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IndexRecord {
    pub id: usize,
    pub file: String,
    pub origin: InputOrigin,
    pub size: usize,
    pub cost: u64,
    pub probes: usize,
    pub found_at_ms: u64,
}

/// One line of `fuzz_log.jsonl`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SaveEvent {
    pub id: usize,
    pub origin: String,
    pub parent: Option<usize>,
    /// First probe whose bucket the save raised.
    pub probe: Option<u32>,
    pub old_bucket: u8,
    pub new_bucket: u8,
    pub improved_probes: usize,
    pub elapsed_ms: u64,
    pub size: usize,
}

/// Corpus that mirrors every save to an output directory:
///
/// ```text
/// <out>/corpus/id_000000        raw bytes
/// <out>/corpus/id_000000.cov    bincode signature recorded at save time
/// <out>/corpus/corpus_index.json
/// <out>/fuzz_log.jsonl
/// <out>/all/                    every valid input when save-all is on
/// ```
pub struct OnDiskCorpus {
    inner: InMemoryCorpus,
    corpus_dir_path: PathBuf,
    index_file_path: PathBuf,
    index: Vec<IndexRecord>,
    save_log: BufWriter<File>,
    all_dir_path: Option<PathBuf>,
    valid_count: usize,
    bincode_config: Configuration<LittleEndian, Fixint, NoLimit>,
}

impl OnDiskCorpus {
    /// Prepares `output_dir` for a new session. Files left in `corpus/` and `all/` by an
    /// earlier session are removed; `output_dir` itself and anything else in it is kept.
    pub fn create(output_dir: &Path, save_all: bool) -> Result<Self, CorpusError> {
        let corpus_dir_path = output_dir.join("corpus");
        let all_dir = output_dir.join("all");
        for dir in [&corpus_dir_path, &all_dir] {
            if dir.exists() {
                fs::remove_dir_all(dir).map_err(|e| {
                    CorpusError::Io(format!("Failed to clear stale directory {:?}: {}", dir, e))
                })?;
            }
        }
        fs::create_dir_all(&corpus_dir_path).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to create corpus directory at {:?}: {}",
                corpus_dir_path, e
            ))
        })?;
        let all_dir_path = if save_all {
            fs::create_dir_all(&all_dir)?;
            Some(all_dir)
        } else {
            None
        };

        let log_path = output_dir.join(SAVE_LOG_FILENAME);
        let log_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)
            .map_err(|e| {
                CorpusError::Io(format!("Failed to open save log {:?}: {}", log_path, e))
            })?;

        let corpus = Self {
            inner: InMemoryCorpus::new(),
            index_file_path: corpus_dir_path.join(INDEX_FILENAME),
            corpus_dir_path,
            index: Vec::new(),
            save_log: BufWriter::new(log_file),
            all_dir_path,
            valid_count: 0,
            bincode_config: bincode_config(),
        };
        corpus.save_index_to_disk()?;
        Ok(corpus)
    }

    pub fn corpus_dir(&self) -> &Path {
        &self.corpus_dir_path
    }

    pub fn entry_path(&self, id: usize) -> PathBuf {
        self.corpus_dir_path.join(entry_file_name(id))
    }

    fn save_index_to_disk(&self) -> Result<(), CorpusError> {
        let file = File::create(&self.index_file_path).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to create or truncate index file {:?}: {}",
                self.index_file_path, e
            ))
        })?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &self.index).map_err(|e| {
            CorpusError::Serialization(format!(
                "Failed to serialize corpus index to JSON for {:?}: {}",
                self.index_file_path, e
            ))
        })?;
        Ok(())
    }

    fn append_save_event(&mut self, event: &SaveEvent) -> Result<(), CorpusError> {
        serde_json::to_writer(&mut self.save_log, event)?;
        self.save_log.write_all(b"\n")?;
        self.save_log.flush()?;
        Ok(())
    }
}

impl Corpus for OnDiskCorpus {
    fn add(&mut self, entry: NewEntry) -> Result<usize, CorpusError> {
        let trigger = entry.improvements.first().copied();
        let improved_probes = entry.improvements.len();
        let elapsed_ms = entry.found_at.as_millis() as u64;
        let signature_bytes = bincode::encode_to_vec(&entry.signature, self.bincode_config)?;

        let id = self.inner.add(entry)?;
        let Some(saved) = self.inner.get(id) else {
            return Err(CorpusError::InputNotFound(id));
        };

        let file_path = self.entry_path(id);
        fs::write(&file_path, &saved.bytes).map_err(|e| {
            CorpusError::Io(format!("Failed to write input file {:?}: {}", file_path, e))
        })?;
        let cov_path = file_path.with_extension(SIGNATURE_EXTENSION);
        fs::write(&cov_path, &signature_bytes).map_err(|e| {
            CorpusError::Io(format!("Failed to write signature file {:?}: {}", cov_path, e))
        })?;

        self.index.push(IndexRecord {
            id,
            file: entry_file_name(id),
            origin: saved.origin.clone(),
            size: saved.bytes.len(),
            cost: saved.cost,
            probes: saved.signature.len(),
            found_at_ms: elapsed_ms,
        });
        let event = SaveEvent {
            id,
            origin: saved.origin.to_string(),
            parent: saved.origin.parent(),
            probe: trigger.map(|t| t.probe),
            old_bucket: trigger.map_or(0, |t| t.old),
            new_bucket: trigger.map_or(0, |t| t.new),
            improved_probes,
            elapsed_ms,
            size: saved.bytes.len(),
        };
        self.save_index_to_disk()?;
        self.append_save_event(&event)?;
        debug!(id, path = ?file_path, "persisted corpus entry");
        Ok(id)
    }

    fn get(&self, id: usize) -> Option<&CorpusEntry> {
        self.inner.get(id)
    }

    fn entries(&self) -> &[CorpusEntry] {
        self.inner.entries()
    }

    fn favored(&mut self) -> &[usize] {
        self.inner.favored()
    }

    fn record_valid(&mut self, bytes: &[u8]) -> Result<(), CorpusError> {
        let Some(dir) = &self.all_dir_path else {
            return Ok(());
        };
        let path = dir.join(entry_file_name(self.valid_count));
        fs::write(&path, bytes).map_err(|e| {
            CorpusError::Io(format!("Failed to write valid input {:?}: {}", path, e))
        })?;
        self.valid_count += 1;
        Ok(())
    }
}

pub fn entry_file_name(id: usize) -> String {
    format!("id_{:06}", id)
}

/// Reads the signature stored next to a saved input, if there is one.
pub fn read_signature(input_path: &Path) -> Result<Option<Signature>, CorpusError> {
    let cov_path = input_path.with_extension(SIGNATURE_EXTENSION);
    if !cov_path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(&cov_path).map_err(|e| {
        CorpusError::Io(format!("Failed to read signature file {:?}: {}", cov_path, e))
    })?;
    let (signature, _len): (Signature, usize) =
        bincode::decode_from_slice(&bytes, bincode_config()).map_err(|e| {
            CorpusError::Deserialization(format!(
                "Bincode deserialization failed for signature file {:?}: {}",
                cov_path, e
            ))
        })?;
    Ok(Some(signature))
}

/// Loads raw seed inputs from files and directories.
///
/// Directories are read one level deep, in file-name order. Hidden files, corpus index files
/// and signature files are skipped.
pub fn load_seed_files(seed_paths: &[PathBuf]) -> Result<Vec<Seed>, CorpusError> {
    let mut seeds = Vec::new();
    for path_buf in seed_paths {
        let path_ref = path_buf.as_path();
        if path_ref.is_file() {
            seeds.push(read_seed(path_ref)?);
        } else if path_ref.is_dir() {
            let mut files = Vec::new();
            for entry_result in fs::read_dir(path_ref).map_err(|e| {
                CorpusError::Io(format!("Failed to read seed directory {:?}: {}", path_ref, e))
            })? {
                let entry = entry_result.map_err(|e| {
                    CorpusError::Io(format!(
                        "Error reading entry in seed directory {:?}: {}",
                        path_ref, e
                    ))
                })?;
                let file_path_in_dir = entry.path();
                if file_path_in_dir.is_file() && !is_skipped_seed_file(&file_path_in_dir) {
                    files.push(file_path_in_dir);
                }
            }
            files.sort();
            for file in files {
                seeds.push(read_seed(&file)?);
            }
        } else {
            return Err(CorpusError::Io(format!(
                "Seed path {:?} is neither a file nor a directory",
                path_ref
            )));
        }
    }
    Ok(seeds)
}

fn is_skipped_seed_file(path: &Path) -> bool {
    let hidden_or_index = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name == INDEX_FILENAME || name.starts_with('.'));
    let signature = path
        .extension()
        .is_some_and(|ext| ext == SIGNATURE_EXTENSION);
    hidden_or_index || signature
}

fn read_seed(path: &Path) -> Result<Seed, CorpusError> {
    let bytes = fs::read(path)
        .map_err(|e| CorpusError::Io(format!("Failed to read seed file {:?}: {}", path, e)))?;
    Ok(Seed {
        bytes,
        path: Some(path.to_path_buf()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_entry(bytes: &[u8], probes: &[u32], cost: u64) -> NewEntry {
        NewEntry {
            bytes: bytes.to_vec(),
            origin: InputOrigin::Fresh,
            signature: Signature::from_entries(probes.iter().map(|&p| (p, 1)).collect()),
            cost,
            focus: Vec::new(),
            index_map: None,
            improvements: probes
                .iter()
                .map(|&probe| Improvement {
                    probe,
                    old: 0,
                    new: 1,
                })
                .collect(),
            found_at: Duration::from_millis(5),
        }
    }

    #[test]
    fn in_memory_corpus_assigns_dense_ids() {
        let mut corpus = InMemoryCorpus::new();
        assert!(corpus.is_empty());
        assert_eq!(corpus.add(new_entry(b"a", &[1], 1)).unwrap(), 0);
        assert_eq!(corpus.add(new_entry(b"b", &[2], 1)).unwrap(), 1);
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.get(1).unwrap().bytes, b"b");
        assert!(corpus.get(2).is_none());
    }

    #[test]
    fn identical_signatures_keep_the_lower_id() {
        let mut corpus = InMemoryCorpus::new();
        corpus.add(new_entry(b"abcd", &[1, 2], 10)).unwrap();
        corpus.add(new_entry(b"wxyz", &[1, 2], 10)).unwrap();
        assert_eq!(corpus.top_rated(1), Some(0));
        assert_eq!(corpus.favored(), &[0]);
        assert!(corpus.get(0).unwrap().favored);
        assert!(!corpus.get(1).unwrap().favored);
    }

    #[test]
    fn smaller_cheaper_entry_takes_over_a_probe() {
        let mut corpus = InMemoryCorpus::new();
        corpus.add(new_entry(b"long input", &[1, 2], 10)).unwrap();
        corpus.add(new_entry(b"s", &[1], 10)).unwrap();
        assert_eq!(corpus.top_rated(1), Some(1));
        assert_eq!(corpus.top_rated(2), Some(0));
        assert_eq!(
            corpus.favored(),
            &[0],
            "entry 0 is the only cover of the rarest probe and already covers probe 1"
        );

        corpus.add(new_entry(b"t", &[2], 10)).unwrap();
        assert_eq!(corpus.top_rated(2), Some(2));
        assert_eq!(corpus.favored(), &[1, 2]);
        assert!(!corpus.get(0).unwrap().favored);
    }

    #[test]
    fn greedy_cover_skips_entries_already_covered() {
        let mut corpus = InMemoryCorpus::new();
        corpus.add(new_entry(b"x", &[1, 2, 3], 1)).unwrap();
        corpus.add(new_entry(b"yyyyyyyy", &[2, 3], 5)).unwrap();
        assert_eq!(corpus.favored(), &[0]);
        assert_eq!(corpus.get(0).unwrap().unique_cover, 1);
        assert_eq!(corpus.get(1).unwrap().unique_cover, 0);
    }

    #[test]
    fn on_disk_corpus_persists_bytes_signature_index_and_log() {
        let dir = tempdir().unwrap();
        let mut corpus = OnDiskCorpus::create(dir.path(), false).unwrap();
        let id = corpus.add(new_entry(&[1, 2, 3], &[4, 5], 3)).unwrap();
        assert_eq!(id, 0);

        let path = corpus.entry_path(id);
        assert_eq!(fs::read(&path).unwrap(), vec![1, 2, 3]);
        let signature = read_signature(&path).unwrap().unwrap();
        assert_eq!(signature.entries(), &[(4, 1), (5, 1)]);

        let index: Vec<IndexRecord> = serde_json::from_str(
            &fs::read_to_string(corpus.corpus_dir().join(INDEX_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].file, "id_000000");

        let log = fs::read_to_string(dir.path().join(SAVE_LOG_FILENAME)).unwrap();
        let event: SaveEvent = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(event.probe, Some(4));
        assert_eq!(event.new_bucket, 1);
        assert_eq!(event.improved_probes, 2);
        assert_eq!(event.elapsed_ms, 5);
    }

    #[test]
    fn on_disk_corpus_clears_stale_entries_and_saves_all_valid() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("corpus").join("id_000042");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"old").unwrap();

        let mut corpus = OnDiskCorpus::create(dir.path(), true).unwrap();
        assert!(!stale.exists());
        corpus.record_valid(b"one").unwrap();
        corpus.record_valid(b"two").unwrap();
        assert_eq!(
            fs::read(dir.path().join("all").join("id_000001")).unwrap(),
            b"two"
        );
    }

    #[test]
    fn load_seed_files_reads_files_and_directories_in_order() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b"), b"second").unwrap();
        fs::write(dir.path().join("a"), b"first").unwrap();
        fs::write(dir.path().join(".hidden"), b"skip").unwrap();
        fs::write(dir.path().join("a.cov"), b"skip").unwrap();
        fs::write(dir.path().join(INDEX_FILENAME), b"[]").unwrap();
        let single = tempdir().unwrap();
        let single_file = single.path().join("only");
        fs::write(&single_file, b"solo").unwrap();

        let seeds = load_seed_files(&[dir.path().to_path_buf(), single_file.clone()]).unwrap();
        let contents: Vec<&[u8]> = seeds.iter().map(|s| s.bytes.as_slice()).collect();
        assert_eq!(contents, vec![&b"first"[..], &b"second"[..], &b"solo"[..]]);
        assert_eq!(seeds[2].path.as_deref(), Some(single_file.as_path()));

        assert!(load_seed_files(&[dir.path().join("missing")]).is_err());
    }
}

//! The counting subsystem: raw sequence in, sorted database out.
//!
//! Extraction feeds canonical k-mers into one of 64 prefix shards. Two
//! accumulation strategies share that producer:
//!
//! - a concurrent-map fast path for inputs whose k-mers fit the memory
//!   budget, counting straight into a `DashMap` keyed by packed k-mer;
//! - a bucket-spill path that appends raw k-mers per shard and, when a
//!   shard exceeds its slice of the budget, sorts and counts the bucket
//!   into a temporary sorted run on disk.
//!
//! Finalization sorts each shard (merging spilled runs where present) and
//! writes a sorted database shard with `(k-mer, count, label = 0)`.

use std::collections::HashMap;
use std::fs::File;
use std::hash::BuildHasherDefault;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use dashmap::DashMap;
use rayon::prelude::*;
use rustc_hash::FxHasher;
use tracing::{debug, info};

use crate::database::{
    create_database_dir, shard_file_name, write_index, write_shard, Database,
};
use crate::error::EngineError;
use crate::histogram::ValueHistogram;
use crate::input::InputSpec;
use crate::kmer::{Kmer, KmerLength, KmerValue, Record, NUM_SHARDS};
use crate::sequence::{read_sequences, KmerExtractor};

/// A concurrent k-mer count map with [`FxHasher`].
type DashFx = DashMap<u128, u32, BuildHasherDefault<FxHasher>>;

/// Bytes one packed k-mer occupies in a bucket.
const KMER_BYTES: u64 = 16;

/// Resource configuration handed down from the command line.
#[derive(Debug, Clone, Copy)]
pub struct CountingConfig {
    pub memory_bytes: u64,
    pub threads: usize,
}

impl Default for CountingConfig {
    fn default() -> Self {
        Self {
            // 4 GB, the engine default when no 'memory' option is given.
            memory_bytes: 4 * 1024 * 1024 * 1024,
            threads: 0,
        }
    }
}

/// Counts the k-mers of a counting node's sequence inputs into a fresh
/// database at `output`, and returns it opened.
pub fn run_counting(
    inputs: &[InputSpec],
    k: KmerLength,
    output: &Path,
    config: &CountingConfig,
) -> Result<Database, EngineError> {
    let sequences = gather_sequences(inputs)?;
    let total_bases: u64 = sequences.iter().map(|(seq, _)| seq.len() as u64).sum();

    info!(
        output = %output.display(),
        k = k.get(),
        sequences = sequences.len(),
        total_bases,
        "counting k-mers"
    );

    // Worst case one k-mer per base; if the raw k-mers fit the budget the
    // concurrent map path avoids the spill machinery entirely.
    let shards = if total_bases.saturating_mul(KMER_BYTES) <= config.memory_bytes {
        count_in_memory(&sequences, k)
    } else {
        count_with_spill(&sequences, k, config)?
    };

    create_database_dir(output)?;

    let stats: Vec<(u64, ValueHistogram)> = shards
        .into_par_iter()
        .enumerate()
        .map(|(shard, records)| {
            write_shard(&output.join(shard_file_name(shard)), k, &records)?;
            let mut histogram = ValueHistogram::new();
            for r in &records {
                histogram.record(r.value);
            }
            Ok((records.len() as u64, histogram))
        })
        .collect::<Result<_, EngineError>>()?;

    let mut histogram = ValueHistogram::new();
    let mut shard_records = Vec::with_capacity(NUM_SHARDS);
    for (count, h) in stats {
        shard_records.push(count);
        histogram.merge(&h);
    }

    write_index(output, k, shard_records, histogram)?;
    Database::open(output)
}

/// Reads every sequence of the node's inputs, tagged with its homopolymer
/// compression flag.
fn gather_sequences(inputs: &[InputSpec]) -> Result<Vec<(Bytes, bool)>, EngineError> {
    let mut sequences = Vec::new();
    for input in inputs {
        match input {
            InputSpec::Sequence { path, compress } => {
                for seq in read_sequences(path)? {
                    sequences.push((seq, *compress));
                }
            }
            InputSpec::Store { store, compress } => {
                for file in store.segment_files()? {
                    for seq in read_sequences(&file)? {
                        sequences.push((seq, *compress));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(sequences)
}

/// Concurrent-map accumulation: every worker counts straight into a shared
/// [`DashFx`], which is then drained into sorted per-shard records.
fn count_in_memory(sequences: &[(Bytes, bool)], k: KmerLength) -> Vec<Vec<Record>> {
    let counts: DashFx = DashMap::with_hasher(BuildHasherDefault::<FxHasher>::default());

    sequences.par_iter().for_each(|(seq, compress)| {
        for kmer in KmerExtractor::new(seq, k, *compress) {
            counts
                .entry(kmer.0)
                .and_modify(|c| *c = c.saturating_add(1))
                .or_insert(1);
        }
    });

    let mut shards: Vec<Vec<Record>> = vec![Vec::new(); NUM_SHARDS];
    for (bits, count) in counts {
        let kmer = Kmer(bits);
        shards[kmer.shard(k)].push(Record::new(kmer, count, 0));
    }
    shards
        .par_iter_mut()
        .for_each(|records| records.sort_by_key(|r| r.kmer));
    shards
}

/// One shard's accumulation state on the spill path.
struct ShardBucket {
    kmers: Vec<u128>,
    runs: Vec<File>,
    budget_entries: usize,
    spill_dir: PathBuf,
}

impl ShardBucket {
    fn new(budget_entries: usize, spill_dir: PathBuf) -> Self {
        Self {
            kmers: Vec::new(),
            runs: Vec::new(),
            budget_entries,
            spill_dir,
        }
    }

    fn push_all(&mut self, batch: &[u128]) -> Result<(), EngineError> {
        self.kmers.extend_from_slice(batch);
        if self.kmers.len() >= self.budget_entries {
            self.spill()?;
        }
        Ok(())
    }

    /// Sorts and counts the in-memory k-mers into a sorted run on disk.
    fn spill(&mut self) -> Result<(), EngineError> {
        let run = sort_and_count(std::mem::take(&mut self.kmers));
        let mut file = tempfile::tempfile_in(&self.spill_dir)?;
        {
            let mut writer = BufWriter::new(&mut file);
            for (bits, count) in &run {
                writer.write_all(&bits.to_le_bytes())?;
                writer.write_all(&count.to_le_bytes())?;
            }
            writer.flush()?;
        }
        debug!(entries = run.len(), "spilled counting run");
        self.runs.push(file);
        Ok(())
    }

    /// Merges the in-memory remainder with all spilled runs.
    fn into_records(self) -> Result<Vec<Record>, EngineError> {
        let tail = sort_and_count(self.kmers);

        if self.runs.is_empty() {
            return Ok(tail
                .into_iter()
                .map(|(bits, count)| Record::new(Kmer(bits), count, 0))
                .collect());
        }

        let mut readers = Vec::with_capacity(self.runs.len() + 1);
        for mut file in self.runs {
            file.seek(SeekFrom::Start(0))?;
            readers.push(RunReader::from_file(file)?);
        }
        readers.push(RunReader::from_pairs(tail));

        merge_runs(readers)
    }
}

/// Sorts raw k-mers and collapses duplicates into (k-mer, count) pairs.
fn sort_and_count(mut kmers: Vec<u128>) -> Vec<(u128, KmerValue)> {
    kmers.sort_unstable();
    let mut out: Vec<(u128, KmerValue)> = Vec::new();
    for bits in kmers {
        match out.last_mut() {
            Some((last, count)) if *last == bits => *count = count.saturating_add(1),
            _ => out.push((bits, 1)),
        }
    }
    out
}

/// A sorted run of (k-mer, count) pairs, on disk or in memory.
enum RunReader {
    Disk {
        reader: BufReader<File>,
        current: Option<(u128, KmerValue)>,
    },
    Memory {
        pairs: std::vec::IntoIter<(u128, KmerValue)>,
        current: Option<(u128, KmerValue)>,
    },
}

impl RunReader {
    fn from_file(file: File) -> Result<Self, EngineError> {
        let mut run = Self::Disk {
            reader: BufReader::new(file),
            current: None,
        };
        run.advance()?;
        Ok(run)
    }

    fn from_pairs(pairs: Vec<(u128, KmerValue)>) -> Self {
        let mut iter = pairs.into_iter();
        let current = iter.next();
        Self::Memory {
            pairs: iter,
            current,
        }
    }

    fn current(&self) -> Option<(u128, KmerValue)> {
        match self {
            Self::Disk { current, .. } | Self::Memory { current, .. } => *current,
        }
    }

    fn advance(&mut self) -> Result<(), EngineError> {
        match self {
            Self::Disk { reader, current } => {
                let mut buf = [0u8; 20];
                *current = match reader.read_exact(&mut buf) {
                    Ok(()) => Some((
                        u128::from_le_bytes(buf[0..16].try_into().unwrap_or_default()),
                        u32::from_le_bytes(buf[16..20].try_into().unwrap_or_default()),
                    )),
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => None,
                    Err(e) => return Err(e.into()),
                };
            }
            Self::Memory { pairs, current } => *current = pairs.next(),
        }
        Ok(())
    }
}

/// K-way merge of sorted runs, summing counts of equal k-mers.
fn merge_runs(mut readers: Vec<RunReader>) -> Result<Vec<Record>, EngineError> {
    let mut out = Vec::new();

    loop {
        let Some(min) = readers.iter().filter_map(|r| r.current().map(|(b, _)| b)).min()
        else {
            break;
        };

        let mut total: KmerValue = 0;
        for reader in &mut readers {
            while let Some((bits, count)) = reader.current() {
                if bits != min {
                    break;
                }
                total = total.saturating_add(count);
                reader.advance()?;
            }
        }
        out.push(Record::new(Kmer(min), total, 0));
    }

    Ok(out)
}

/// Flush threshold for a worker's local per-shard batches.
const BATCH_FLUSH: usize = 1 << 14;

/// Bucket-spill accumulation under a memory budget.
fn count_with_spill(
    sequences: &[(Bytes, bool)],
    k: KmerLength,
    config: &CountingConfig,
) -> Result<Vec<Vec<Record>>, EngineError> {
    let spill_dir = tempfile::tempdir()?;

    // Each shard gets an equal slice of the budget, with a floor so tiny
    // budgets still make progress.
    let per_shard = (config.memory_bytes / NUM_SHARDS as u64 / KMER_BYTES).max(1024) as usize;
    debug!(per_shard_entries = per_shard, "counting with spill");

    let buckets: Vec<Mutex<ShardBucket>> = (0..NUM_SHARDS)
        .map(|_| Mutex::new(ShardBucket::new(per_shard, spill_dir.path().to_path_buf())))
        .collect();

    sequences
        .par_iter()
        .try_for_each(|(seq, compress)| -> Result<(), EngineError> {
            let mut batches: Vec<Vec<u128>> = vec![Vec::new(); NUM_SHARDS];
            for kmer in KmerExtractor::new(seq, k, *compress) {
                let shard = kmer.shard(k);
                batches[shard].push(kmer.0);
                if batches[shard].len() >= BATCH_FLUSH {
                    flush_batch(&buckets[shard], &mut batches[shard])?;
                }
            }
            for (shard, batch) in batches.iter_mut().enumerate() {
                if !batch.is_empty() {
                    flush_batch(&buckets[shard], batch)?;
                }
            }
            Ok(())
        })?;

    buckets
        .into_par_iter()
        .map(|bucket| {
            bucket
                .into_inner()
                .map_err(|_| EngineError::CorruptInput {
                    details: "counting worker panicked holding a shard bucket".into(),
                })?
                .into_records()
        })
        .collect()
}

fn flush_batch(bucket: &Mutex<ShardBucket>, batch: &mut Vec<u128>) -> Result<(), EngineError> {
    let mut guard = bucket.lock().map_err(|_| EngineError::CorruptInput {
        details: "counting worker panicked holding a shard bucket".into(),
    })?;
    guard.push_all(batch)?;
    batch.clear();
    Ok(())
}

/// Counts k-mers of one sequence into a plain map. Test and library helper;
/// the engine path goes through [`run_counting`].
#[must_use]
pub fn count_sequence(seq: &[u8], k: KmerLength, compress: bool) -> HashMap<Kmer, KmerValue> {
    let mut counts = HashMap::new();
    for kmer in KmerExtractor::new(seq, k, compress) {
        *counts.entry(kmer).or_insert(0) += 1;
    }
    counts
}

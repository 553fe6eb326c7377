//! On-disk k-mer database format.
//!
//! A database is a directory holding an `index.json` document (k-mer length,
//! record counts, value histogram) and 64 shard files, each a sorted run of
//! fixed-width records.
//!
//! # Shard file format (version 1)
//!
//! ```text
//! +--------+--------+------+--------+------------------+--------+
//! | MAGIC  | VERSION|  K   | COUNT  |      DATA        | CRC32  |
//! | 4 bytes| 1 byte |1 byte| 8 bytes| 28 bytes x COUNT | 4 bytes|
//! +--------+--------+------+--------+------------------+--------+
//!
//! MAGIC:   "KFDB" (0x4B 0x46 0x44 0x42)
//! VERSION: Format version (currently 1)
//! K:       K-mer length (1-64)
//! COUNT:   Number of records (little-endian u64)
//! DATA:    Records (kmer lo u64, kmer hi u64, value u32, label u64),
//!          little-endian, ascending by k-mer
//! CRC32:   CRC32 (IEEE) of all preceding bytes (little-endian)
//! ```
//!
//! Fixed-width records keep a read-then-rewrite of an unfiltered database
//! byte-identical.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::histogram::ValueHistogram;
use crate::kmer::{Kmer, KmerLength, Record, NUM_SHARDS};

/// Magic bytes identifying a shard file.
const MAGIC: &[u8; 4] = b"KFDB";

/// Current shard file format version.
const VERSION: u8 = 1;

/// Bytes per encoded record.
const RECORD_BYTES: usize = 28;

/// The `index.json` document describing a database directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseIndex {
    pub version: u32,
    pub k: usize,
    pub total_records: u64,
    pub shard_records: Vec<u64>,
    pub histogram: ValueHistogram,
}

/// Name of the shard file for a shard id.
#[must_use]
pub fn shard_file_name(shard: usize) -> String {
    format!("shard-{shard:02}")
}

/// True if the path looks like a k-mer database directory.
#[must_use]
pub fn is_database_dir(path: &Path) -> bool {
    path.join("index.json").is_file()
}

/// An opened k-mer database.
///
/// Opening reads only the index; shards are streamed on demand by shard id.
#[derive(Debug, Clone)]
pub struct Database {
    root: PathBuf,
    k: KmerLength,
    index: DatabaseIndex,
}

impl Database {
    /// Opens a database directory by reading and validating its index.
    pub fn open(root: &Path) -> Result<Self, EngineError> {
        let index_path = root.join("index.json");
        let file = File::open(&index_path).map_err(|source| EngineError::DatabaseRead {
            source,
            path: index_path.clone(),
        })?;
        let index: DatabaseIndex = serde_json::from_reader(BufReader::new(file))?;

        if index.shard_records.len() != NUM_SHARDS {
            return Err(EngineError::InvalidDatabase {
                details: format!(
                    "expected {NUM_SHARDS} shard entries, found {}",
                    index.shard_records.len()
                ),
                path: index_path,
            });
        }
        let k = KmerLength::new(index.k).map_err(|_| EngineError::InvalidDatabase {
            details: format!("invalid k-mer length {}", index.k),
            path: index_path,
        })?;

        debug!(root = %root.display(), k = index.k, records = index.total_records, "opened database");

        Ok(Self {
            root: root.to_path_buf(),
            k,
            index,
        })
    }

    #[must_use]
    pub fn k(&self) -> KmerLength {
        self.k
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn histogram(&self) -> &ValueHistogram {
        &self.index.histogram
    }

    #[must_use]
    pub fn total_records(&self) -> u64 {
        self.index.total_records
    }

    /// Streams the records of one shard.
    pub fn shard_reader(&self, shard: usize) -> Result<ShardReader, EngineError> {
        ShardReader::open(&self.root.join(shard_file_name(shard)), self.k())
    }
}

/// Streaming reader over one sorted shard file.
pub struct ShardReader {
    reader: BufReader<File>,
    path: PathBuf,
    remaining: u64,
    crc: Crc32,
}

impl ShardReader {
    /// Opens a shard file and validates its header.
    pub fn open(path: &Path, k: KmerLength) -> Result<Self, EngineError> {
        let file = File::open(path).map_err(|source| EngineError::DatabaseRead {
            source,
            path: path.to_path_buf(),
        })?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 14];
        read_all(&mut reader, &mut header, path)?;

        if &header[..4] != MAGIC {
            return Err(EngineError::InvalidDatabase {
                details: "invalid magic bytes (not a kmerforge shard file)".into(),
                path: path.to_path_buf(),
            });
        }
        if header[4] != VERSION {
            return Err(EngineError::InvalidDatabase {
                details: format!("unsupported version {}", header[4]),
                path: path.to_path_buf(),
            });
        }
        if usize::from(header[5]) != k.get() {
            return Err(EngineError::InvalidDatabase {
                details: format!("k-mer length {} does not match index k={k}", header[5]),
                path: path.to_path_buf(),
            });
        }

        let remaining = u64::from_le_bytes(header[6..14].try_into().unwrap_or_default());

        let mut crc = Crc32::new();
        crc.update(&header);

        Ok(Self {
            reader,
            path: path.to_path_buf(),
            remaining,
            crc,
        })
    }

    /// Reads the next record, or `None` at the end of the shard.
    ///
    /// The trailing checksum is verified when the last record has been
    /// consumed.
    pub fn next_record(&mut self) -> Result<Option<Record>, EngineError> {
        if self.remaining == 0 {
            self.verify_checksum()?;
            return Ok(None);
        }

        let mut buf = [0u8; RECORD_BYTES];
        read_all(&mut self.reader, &mut buf, &self.path)?;
        self.crc.update(&buf);
        self.remaining -= 1;

        Ok(Some(decode_record(&buf)))
    }

    fn verify_checksum(&mut self) -> Result<(), EngineError> {
        let mut stored = [0u8; 4];
        read_all(&mut self.reader, &mut stored, &self.path)?;
        let stored = u32::from_le_bytes(stored);
        let computed = self.crc.finalize();
        if stored != computed {
            return Err(EngineError::InvalidDatabase {
                details: format!(
                    "checksum mismatch (expected {stored:#x}, got {computed:#x})"
                ),
                path: self.path.clone(),
            });
        }
        Ok(())
    }
}

fn read_all<R: Read>(reader: &mut R, buf: &mut [u8], path: &Path) -> Result<(), EngineError> {
    reader
        .read_exact(buf)
        .map_err(|source| EngineError::DatabaseRead {
            source,
            path: path.to_path_buf(),
        })
}

fn decode_record(buf: &[u8; RECORD_BYTES]) -> Record {
    let lo = u64::from_le_bytes(buf[0..8].try_into().unwrap_or_default());
    let hi = u64::from_le_bytes(buf[8..16].try_into().unwrap_or_default());
    let value = u32::from_le_bytes(buf[16..20].try_into().unwrap_or_default());
    let label = u64::from_le_bytes(buf[20..28].try_into().unwrap_or_default());
    Record {
        kmer: Kmer((u128::from(hi) << 64) | u128::from(lo)),
        value,
        label,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn encode_record(record: &Record, buf: &mut [u8; RECORD_BYTES]) {
    let lo = record.kmer.0 as u64;
    let hi = (record.kmer.0 >> 64) as u64;
    buf[0..8].copy_from_slice(&lo.to_le_bytes());
    buf[8..16].copy_from_slice(&hi.to_le_bytes());
    buf[16..20].copy_from_slice(&record.value.to_le_bytes());
    buf[20..28].copy_from_slice(&record.label.to_le_bytes());
}

/// Writes one shard file from records already in ascending k-mer order.
#[allow(clippy::cast_possible_truncation)]
pub fn write_shard(path: &Path, k: KmerLength, records: &[Record]) -> Result<(), EngineError> {
    let file = File::create(path).map_err(|source| EngineError::DatabaseWrite {
        source,
        path: path.to_path_buf(),
    })?;
    let mut writer = BufWriter::new(file);
    let mut crc = Crc32::new();

    let mut header = [0u8; 14];
    header[..4].copy_from_slice(MAGIC);
    header[4] = VERSION;
    header[5] = k.get() as u8;
    header[6..14].copy_from_slice(&(records.len() as u64).to_le_bytes());
    crc.update(&header);
    write_all(&mut writer, &header, path)?;

    let mut buf = [0u8; RECORD_BYTES];
    for record in records {
        encode_record(record, &mut buf);
        crc.update(&buf);
        write_all(&mut writer, &buf, path)?;
    }

    write_all(&mut writer, &crc.finalize().to_le_bytes(), path)?;
    writer.flush().map_err(|source| EngineError::DatabaseWrite {
        source,
        path: path.to_path_buf(),
    })?;
    Ok(())
}

fn write_all<W: Write>(writer: &mut W, buf: &[u8], path: &Path) -> Result<(), EngineError> {
    writer
        .write_all(buf)
        .map_err(|source| EngineError::DatabaseWrite {
            source,
            path: path.to_path_buf(),
        })
}

/// Creates the database directory (and any missing parents).
pub fn create_database_dir(root: &Path) -> Result<(), EngineError> {
    fs::create_dir_all(root).map_err(|source| EngineError::DatabaseWrite {
        source,
        path: root.to_path_buf(),
    })
}

/// Writes `index.json` for a database whose shards are already on disk.
pub fn write_index(
    root: &Path,
    k: KmerLength,
    shard_records: Vec<u64>,
    histogram: ValueHistogram,
) -> Result<(), EngineError> {
    let index = DatabaseIndex {
        version: 1,
        k: k.get(),
        total_records: shard_records.iter().sum(),
        shard_records,
        histogram,
    };
    let path = root.join("index.json");
    let file = File::create(&path).map_err(|source| EngineError::DatabaseWrite {
        source,
        path: path.clone(),
    })?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &index)?;
    writer.flush().map_err(|source| EngineError::DatabaseWrite {
        source,
        path,
    })?;
    Ok(())
}

/// Writes a whole database from unsorted records: shards, sorts, and
/// produces the index. Convenience for small databases and tests; the
/// engine's writer sink streams shards individually.
pub fn write_database(root: &Path, k: KmerLength, records: &[Record]) -> Result<(), EngineError> {
    create_database_dir(root)?;

    let mut shards: Vec<Vec<Record>> = vec![Vec::new(); NUM_SHARDS];
    for record in records {
        shards[record.kmer.shard(k)].push(*record);
    }

    let mut shard_records = Vec::with_capacity(NUM_SHARDS);
    let mut histogram = ValueHistogram::new();
    for (shard, mut records) in shards.into_iter().enumerate() {
        records.sort_by_key(|r| r.kmer);
        for r in &records {
            histogram.record(r.value);
        }
        shard_records.push(records.len() as u64);
        write_shard(&root.join(shard_file_name(shard)), k, &records)?;
    }

    write_index(root, k, shard_records, histogram)
}

/// CRC32 (IEEE polynomial), computed incrementally.
struct Crc32 {
    state: u32,
}

impl Crc32 {
    const TABLE: [u32; 256] = build_crc_table();

    fn new() -> Self {
        Self { state: !0 }
    }

    fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let idx = ((self.state ^ u32::from(byte)) & 0xFF) as usize;
            self.state = Self::TABLE[idx] ^ (self.state >> 8);
        }
    }

    fn finalize(&self) -> u32 {
        !self.state
    }
}

const fn build_crc_table() -> [u32; 256] {
    // IEEE polynomial used by gzip, PNG, etc.
    const POLYNOMIAL: u32 = 0xEDB8_8320;

    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

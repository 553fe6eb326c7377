//! Sequence input: FASTA/FASTQ reading, sequence-store segmentation, and
//! k-mer extraction.
//!
//! Extraction feeds bases through a rolling 2-bit shift register and emits
//! canonical k-mers. Non-ACGT positions are dropped from the stream, and
//! optional homopolymer compression collapses runs of identical bases to a
//! single base before they enter the register.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use bio::io::{fasta, fastq};
use bytes::Bytes;
use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::EngineError;
use crate::kmer::{base_code, Kmer, KmerLength};

/// Input sequence file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequenceFormat {
    /// Detect from the file extension; unknown extensions read as FASTA.
    #[default]
    Auto,
    Fasta,
    Fastq,
}

impl SequenceFormat {
    /// Detects the format from a file extension, looking through `.gz`.
    #[must_use]
    pub fn from_extension(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(OsStr::to_str)
            .map(str::to_lowercase);

        let effective = match ext.as_deref() {
            Some("gz") => path
                .file_stem()
                .and_then(|stem| Path::new(stem).extension())
                .and_then(OsStr::to_str)
                .map(str::to_lowercase),
            other => other.map(String::from),
        };

        match effective.as_deref() {
            Some("fq" | "fastq") => Self::Fastq,
            _ => Self::Fasta,
        }
    }

    /// Resolves `Auto` against a path.
    #[must_use]
    pub fn resolve(self, path: &Path) -> Self {
        match self {
            Self::Auto => Self::from_extension(path),
            other => other,
        }
    }
}

/// True if the extension looks like a sequence file we can read.
#[must_use]
pub fn is_sequence_file(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_lowercase);
    let effective = match ext.as_deref() {
        Some("gz") => path
            .file_stem()
            .and_then(|stem| Path::new(stem).extension())
            .and_then(OsStr::to_str)
            .map(str::to_lowercase),
        other => other.map(String::from),
    };
    matches!(
        effective.as_deref(),
        Some("fa" | "fasta" | "fna" | "fq" | "fastq")
    )
}

fn is_gzip_path(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Reads every sequence from a FASTA/FASTQ file, transparently
/// decompressing `.gz`.
pub fn read_sequences(path: &Path) -> Result<Vec<Bytes>, EngineError> {
    let format = SequenceFormat::Auto.resolve(path);
    let file = File::open(path).map_err(|e| EngineError::SequenceRead {
        details: e.to_string(),
        path: path.to_path_buf(),
    })?;

    let reader: Box<dyn Read> = if is_gzip_path(path) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let sequences = match format {
        SequenceFormat::Fastq => fastq::Reader::new(reader)
            .records()
            .map(|r| {
                r.map(|rec| Bytes::copy_from_slice(rec.seq()))
                    .map_err(|e| EngineError::SequenceRead {
                        details: e.to_string(),
                        path: path.to_path_buf(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?,
        SequenceFormat::Auto | SequenceFormat::Fasta => fasta::Reader::new(reader)
            .records()
            .map(|r| {
                r.map(|rec| Bytes::copy_from_slice(rec.seq()))
                    .map_err(|e| EngineError::SequenceRead {
                        details: e.to_string(),
                        path: path.to_path_buf(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?,
    };

    debug!(path = %path.display(), sequences = sequences.len(), "read sequence file");
    Ok(sequences)
}

/// A sequence store: a directory of sequence files read as one input, with
/// optional segmentation for coarse parallel intake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceStore {
    pub root: PathBuf,
    pub segment: usize,
    pub segment_max: usize,
}

impl SequenceStore {
    #[must_use]
    pub fn new(root: PathBuf, segment: usize, segment_max: usize) -> Self {
        Self {
            root,
            segment,
            segment_max,
        }
    }

    /// The store's sequence files belonging to this segment, in
    /// deterministic (sorted) order.
    pub fn segment_files(&self) -> Result<Vec<PathBuf>, EngineError> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.root)
            .map_err(|e| EngineError::SequenceRead {
                details: e.to_string(),
                path: self.root.clone(),
            })?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.is_file() && is_sequence_file(p))
            .collect();
        files.sort();

        let n = files.len();
        let m = self.segment_max.max(1);
        let s = self.segment.clamp(1, m) - 1;
        let begin = s * n / m;
        let end = (s + 1) * n / m;
        Ok(files[begin..end].to_vec())
    }
}

/// True if the path is a directory usable as a sequence store.
#[must_use]
pub fn is_store_dir(path: &Path) -> bool {
    path.is_dir() && !crate::database::is_database_dir(path)
}

/// Rolling extraction of canonical k-mers from one sequence.
pub struct KmerExtractor<'a> {
    seq: &'a [u8],
    pos: usize,
    k: KmerLength,
    mask: u128,
    register: u128,
    loaded: usize,
    compress: bool,
    last_code: Option<u8>,
}

impl<'a> KmerExtractor<'a> {
    #[must_use]
    pub fn new(seq: &'a [u8], k: KmerLength, compress: bool) -> Self {
        let mask = if k.bits() == 128 {
            u128::MAX
        } else {
            (1u128 << k.bits()) - 1
        };
        Self {
            seq,
            pos: 0,
            k,
            mask,
            register: 0,
            loaded: 0,
            compress,
            last_code: None,
        }
    }
}

impl Iterator for KmerExtractor<'_> {
    type Item = Kmer;

    fn next(&mut self) -> Option<Kmer> {
        while self.pos < self.seq.len() {
            let byte = self.seq[self.pos];
            self.pos += 1;

            let Some(code) = base_code(byte) else {
                // Non-ACGT positions are dropped from the stream.
                continue;
            };

            if self.compress && self.last_code == Some(code) {
                continue;
            }
            self.last_code = Some(code);

            self.register = ((self.register << 2) | u128::from(code)) & self.mask;
            self.loaded += 1;

            if self.loaded >= self.k.get() {
                return Some(Kmer(self.register).canonical(self.k));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn k(n: usize) -> KmerLength {
        KmerLength::new(n).unwrap()
    }

    fn extract(seq: &[u8], klen: usize, compress: bool) -> Vec<Vec<u8>> {
        KmerExtractor::new(seq, k(klen), compress)
            .map(|m| m.to_ascii(k(klen)))
            .collect()
    }

    #[test]
    fn format_detection() {
        assert_eq!(
            SequenceFormat::from_extension(Path::new("reads.fq")),
            SequenceFormat::Fastq
        );
        assert_eq!(
            SequenceFormat::from_extension(Path::new("reads.fastq.gz")),
            SequenceFormat::Fastq
        );
        assert_eq!(
            SequenceFormat::from_extension(Path::new("genome.fa")),
            SequenceFormat::Fasta
        );
        assert_eq!(
            SequenceFormat::from_extension(Path::new("genome.fasta.gz")),
            SequenceFormat::Fasta
        );
    }

    #[test]
    fn sequence_file_detection() {
        assert!(is_sequence_file(Path::new("a.fa")));
        assert!(is_sequence_file(Path::new("a.fna.gz")));
        assert!(is_sequence_file(Path::new("a.fastq")));
        assert!(!is_sequence_file(Path::new("a.txt")));
        assert!(!is_sequence_file(Path::new("a")));
    }

    #[test]
    fn extractor_counts_all_windows() {
        // 9 bases, k=3: 7 k-mers.
        let kmers = extract(b"ACGTACGTA", 3, false);
        assert_eq!(kmers.len(), 7);
    }

    #[test]
    fn extractor_emits_canonical_kmers() {
        // TTT canonicalizes to AAA.
        let kmers = extract(b"TTT", 3, false);
        assert_eq!(kmers, vec![b"AAA".to_vec()]);
    }

    #[test]
    fn extractor_drops_invalid_positions() {
        // N removed: ACGACG, 4 k-mers.
        let kmers = extract(b"ACGNACG", 3, false);
        assert_eq!(kmers.len(), 4);
    }

    #[test]
    fn extractor_short_sequence_is_empty() {
        assert!(extract(b"AC", 3, false).is_empty());
    }

    #[test]
    fn extractor_homopolymer_compression() {
        // AAACCCGGGT compresses to ACGT: two 3-mers.
        let kmers = extract(b"AAACCCGGGT", 3, true);
        assert_eq!(kmers.len(), 2);

        // Without compression, every window counts.
        let kmers = extract(b"AAACCCGGGT", 3, false);
        assert_eq!(kmers.len(), 8);
    }

    #[test]
    fn extractor_compression_restarts_after_invalid() {
        // "AANA": the N drops out, leaving AAA which compresses to A.
        let kmers = extract(b"AANA", 1, true);
        assert_eq!(kmers.len(), 1);
    }

    #[test]
    fn read_fasta_sequences() {
        let mut file = NamedTempFile::with_suffix(".fa").unwrap();
        writeln!(file, ">seq1\nACGT\n>seq2\nGATTACA").unwrap();
        file.flush().unwrap();

        let seqs = read_sequences(file.path()).unwrap();
        assert_eq!(seqs.len(), 2);
        assert_eq!(seqs[0].as_ref(), b"ACGT");
        assert_eq!(seqs[1].as_ref(), b"GATTACA");
    }

    #[test]
    fn read_fastq_sequences() {
        let mut file = NamedTempFile::with_suffix(".fq").unwrap();
        writeln!(file, "@r1\nACGT\n+\nIIII").unwrap();
        file.flush().unwrap();

        let seqs = read_sequences(file.path()).unwrap();
        assert_eq!(seqs.len(), 1);
        assert_eq!(seqs[0].as_ref(), b"ACGT");
    }

    #[test]
    fn store_segments_partition_files() {
        let dir = tempdir().unwrap();
        for name in ["a.fa", "b.fa", "c.fa", "d.fa"] {
            fs::write(dir.path().join(name), ">s\nACGT\n").unwrap();
        }

        let all = SequenceStore::new(dir.path().to_path_buf(), 1, 1)
            .segment_files()
            .unwrap();
        assert_eq!(all.len(), 4);

        let first = SequenceStore::new(dir.path().to_path_buf(), 1, 2)
            .segment_files()
            .unwrap();
        let second = SequenceStore::new(dir.path().to_path_buf(), 2, 2)
            .segment_files()
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_ne!(first, second);
    }

    #[test]
    fn store_dir_detection() {
        let dir = tempdir().unwrap();
        assert!(is_store_dir(dir.path()));
        fs::write(dir.path().join("index.json"), "{}").unwrap();
        assert!(!is_store_dir(dir.path()));
    }
}

//! Output sinks: text dumps, histogram and statistics reports, and the
//! final assembly of database writer fragments.
//!
//! Workers fill per-shard buffers; the driver hands the joined results to
//! these functions once all shards have finished.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::EngineError;
use crate::histogram::{HistogramStatistics, ValueHistogram};
use crate::kmer::KmerLength;

/// Writes joined printer buffers, in shard order, to the printer's target.
pub fn write_printer_output(
    target: Option<&Path>,
    shard_buffers: &[Vec<u8>],
) -> Result<(), EngineError> {
    match target {
        Some(path) => {
            let file = File::create(path).map_err(|source| EngineError::DatabaseWrite {
                source,
                path: path.to_path_buf(),
            })?;
            let mut writer = BufWriter::new(file);
            write_buffers(&mut writer, shard_buffers)?;
            writer.flush()?;
            info!(path = %path.display(), "wrote printer output");
        }
        None => {
            let stdout = io::stdout();
            let mut writer = BufWriter::new(stdout.lock());
            write_buffers(&mut writer, shard_buffers)?;
            writer.flush()?;
        }
    }
    Ok(())
}

fn write_buffers<W: Write>(writer: &mut W, shard_buffers: &[Vec<u8>]) -> Result<(), EngineError> {
    for buffer in shard_buffers {
        writer.write_all(buffer)?;
    }
    Ok(())
}

/// Writes histogram rows: `<value> <distinct> <cumulative-occurrence>`,
/// ascending by value.
pub fn write_histogram_output<W: Write>(
    writer: &mut W,
    histogram: &ValueHistogram,
) -> Result<(), EngineError> {
    for (value, distinct, cumulative) in histogram.rows() {
        writeln!(writer, "{value}\t{distinct}\t{cumulative}")?;
    }
    Ok(())
}

/// Writes the statistics summary derived from a histogram.
pub fn write_statistics_output<W: Write>(
    writer: &mut W,
    statistics: &HistogramStatistics,
) -> Result<(), EngineError> {
    writeln!(writer, "total-kmers\t{}", statistics.total_kmers)?;
    writeln!(writer, "distinct-kmers\t{}", statistics.distinct_kmers)?;
    for (quantile, value) in statistics.distinct_cutoffs {
        writeln!(writer, "distinct-quantile\t{quantile}\t{value}")?;
    }
    for (quantile, value) in statistics.word_frequency_cutoffs {
        writeln!(writer, "word-frequency-quantile\t{quantile}\t{value}")?;
    }
    Ok(())
}

/// Per-node database writer state gathered across shards.
#[derive(Debug)]
pub struct WriterJoin {
    pub root: PathBuf,
    pub shard_records: Vec<u64>,
    pub histogram: ValueHistogram,
}

impl WriterJoin {
    #[must_use]
    pub fn new(root: PathBuf, num_shards: usize) -> Self {
        Self {
            root,
            shard_records: vec![0; num_shards],
            histogram: ValueHistogram::new(),
        }
    }

    /// Folds one shard's contribution in.
    pub fn absorb(&mut self, shard: usize, records: u64, histogram: &ValueHistogram) {
        self.shard_records[shard] = records;
        self.histogram.merge(histogram);
    }

    /// Writes the index once every shard file is on disk.
    pub fn finish(self, k: KmerLength) -> Result<(), EngineError> {
        info!(
            root = %self.root.display(),
            records = self.shard_records.iter().sum::<u64>(),
            "finalizing database output"
        );
        crate::database::write_index(&self.root, k, self.shard_records, self.histogram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_output_format() {
        let mut h = ValueHistogram::new();
        h.record(1);
        h.record(1);
        h.record(3);

        let mut out = Vec::new();
        write_histogram_output(&mut out, &h).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "1\t2\t2\n3\t1\t5\n");
    }

    #[test]
    fn statistics_output_format() {
        let mut h = ValueHistogram::new();
        h.record(2);
        h.record(2);

        let mut out = Vec::new();
        write_statistics_output(&mut out, &h.statistics()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("total-kmers\t4\ndistinct-kmers\t2\n"));
        assert!(text.contains("distinct-quantile\t0.5\t"));
        assert!(text.contains("word-frequency-quantile\t0.99\t"));
    }

    #[test]
    fn printer_output_to_file_preserves_shard_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.txt");
        let buffers = vec![b"AAA\t1\t0\n".to_vec(), Vec::new(), b"CCC\t2\t0\n".to_vec()];

        write_printer_output(Some(&path), &buffers).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "AAA\t1\t0\nCCC\t2\t0\n");
    }
}

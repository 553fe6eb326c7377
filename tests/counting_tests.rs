//! Counting pipeline integration: sequence files through `count` into
//! databases, across both accumulation strategies.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;

use kmerforge::builder::CommandBuilder;
use kmerforge::counting::{run_counting, CountingConfig};
use kmerforge::database::Database;
use kmerforge::input::InputSpec;
use kmerforge::kmer::{KmerLength, KmerValue, Record, NUM_SHARDS};
use kmerforge::run::execute;
use tempfile::tempdir;

fn k(n: usize) -> KmerLength {
    KmerLength::new(n).unwrap()
}

fn read_all(db: &Database) -> Vec<Record> {
    let mut out = Vec::new();
    for shard in 0..NUM_SHARDS {
        let mut reader = db.shard_reader(shard).unwrap();
        while let Some(r) = reader.next_record().unwrap() {
            out.push(r);
        }
    }
    out.sort_by_key(|r| r.kmer);
    out
}

fn counts_by_string(db: &Database) -> HashMap<String, KmerValue> {
    read_all(db)
        .into_iter()
        .map(|r| {
            (
                String::from_utf8(r.kmer.to_ascii(db.k())).unwrap(),
                r.value,
            )
        })
        .collect()
}

/// Total count equals bases minus k plus one, with non-ACGT positions
/// removed from the stream first.
#[test]
fn counting_sums_to_window_count() {
    let dir = tempdir().unwrap();
    let fasta = dir.path().join("in.fa");
    std::fs::write(&fasta, ">s\nACGTNNACGTACGT\n").unwrap();

    let db = run_counting(
        &[InputSpec::Sequence {
            path: fasta,
            compress: false,
        }],
        k(3),
        &dir.path().join("db"),
        &CountingConfig::default(),
    )
    .unwrap();

    // 12 valid bases after removing the two Ns.
    let total: KmerValue = read_all(&db).iter().map(|r| r.value).sum();
    assert_eq!(total, 12 - 3 + 1);
}

#[test]
fn counting_labels_are_zero() {
    let dir = tempdir().unwrap();
    let fasta = dir.path().join("in.fa");
    std::fs::write(&fasta, ">s\nGATTACA\n").unwrap();

    let db = run_counting(
        &[InputSpec::Sequence {
            path: fasta,
            compress: false,
        }],
        k(3),
        &dir.path().join("db"),
        &CountingConfig::default(),
    )
    .unwrap();

    assert!(read_all(&db).iter().all(|r| r.label == 0));
}

#[test]
fn counting_multiple_files_accumulates() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.fa");
    let b = dir.path().join("b.fa");
    std::fs::write(&a, ">s\nAAAA\n").unwrap();
    std::fs::write(&b, ">s\nAAAA\n").unwrap();

    let db = run_counting(
        &[
            InputSpec::Sequence {
                path: a,
                compress: false,
            },
            InputSpec::Sequence {
                path: b,
                compress: false,
            },
        ],
        k(3),
        &dir.path().join("db"),
        &CountingConfig::default(),
    )
    .unwrap();

    let counts = counts_by_string(&db);
    assert_eq!(counts.get("AAA"), Some(&4));
}

#[test]
fn spill_and_fast_paths_agree_on_fastq() {
    let dir = tempdir().unwrap();
    let fastq = dir.path().join("reads.fq");
    std::fs::write(
        &fastq,
        "@r1\nACGTACGTACGT\n+\nIIIIIIIIIIII\n@r2\nGATTACAGATTACA\n+\nIIIIIIIIIIIIII\n",
    )
    .unwrap();

    let input = InputSpec::Sequence {
        path: fastq,
        compress: false,
    };

    let fast = run_counting(
        &[input.clone()],
        k(5),
        &dir.path().join("fast"),
        &CountingConfig::default(),
    )
    .unwrap();
    let slow = run_counting(
        &[input],
        k(5),
        &dir.path().join("slow"),
        &CountingConfig {
            memory_bytes: 1,
            threads: 0,
        },
    )
    .unwrap();

    assert_eq!(counts_by_string(&fast), counts_by_string(&slow));
}

#[test]
fn store_directory_counts_all_segments() {
    let dir = tempdir().unwrap();
    let store = dir.path().join("store");
    std::fs::create_dir(&store).unwrap();
    std::fs::write(store.join("a.fa"), ">s\nAAAA\n").unwrap();
    std::fs::write(store.join("b.fa"), ">s\nAAAAA\n").unwrap();

    // Counting each segment separately, then merging with a sum, matches
    // counting the whole store at once.
    let whole = {
        let mut builder = CommandBuilder::new();
        for w in [
            "count",
            "k=3",
            store.to_string_lossy().as_ref(),
            "output",
            dir.path().join("whole").to_string_lossy().as_ref(),
        ] {
            builder.process_word(w);
        }
        execute(&builder.finish().unwrap()).unwrap();
        Database::open(&dir.path().join("whole")).unwrap()
    };

    let merged = {
        let mut builder = CommandBuilder::new();
        for w in [
            "k=3",
            "union-sum",
            "[",
            "count",
            "segment=1/2",
            store.to_string_lossy().as_ref(),
            "]",
            "[",
            "count",
            "segment=2/2",
            store.to_string_lossy().as_ref(),
            "]",
            "output",
            dir.path().join("merged").to_string_lossy().as_ref(),
        ] {
            builder.process_word(w);
        }
        execute(&builder.finish().unwrap()).unwrap();
        Database::open(&dir.path().join("merged")).unwrap()
    };

    assert_eq!(counts_by_string(&whole), counts_by_string(&merged));
    let total: KmerValue = read_all(&whole).iter().map(|r| r.value).sum();
    assert_eq!(total, 2 + 3);
}

#[test]
fn compress_token_applies_to_sequence_inputs() {
    let dir = tempdir().unwrap();
    let fasta = dir.path().join("in.fa");
    std::fs::write(&fasta, ">s\nAAACCCGGGTTT\n").unwrap();
    let out = dir.path().join("db");

    let mut builder = CommandBuilder::new();
    for w in [
        "count",
        "k=3",
        "compress",
        fasta.to_string_lossy().as_ref(),
        "output",
        out.to_string_lossy().as_ref(),
    ] {
        builder.process_word(w);
    }
    execute(&builder.finish().unwrap()).unwrap();

    let db = Database::open(&out).unwrap();
    // The sequence compresses to ACGT: two 3-mers.
    let total: KmerValue = read_all(&db).iter().map(|r| r.value).sum();
    assert_eq!(total, 2);
}

#[test]
fn gzip_sequence_input() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let dir = tempdir().unwrap();
    let path = dir.path().join("in.fa.gz");
    let file = std::fs::File::create(&path).unwrap();
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(b">s\nGATTACA\n").unwrap();
    encoder.finish().unwrap();

    let db = run_counting(
        &[InputSpec::Sequence {
            path,
            compress: false,
        }],
        k(3),
        &dir.path().join("db"),
        &CountingConfig::default(),
    )
    .unwrap();

    let total: KmerValue = read_all(&db).iter().map(|r| r.value).sum();
    assert_eq!(total, 5);
}

#[test]
fn counted_database_index_totals_match() {
    let dir = tempdir().unwrap();
    let fasta = dir.path().join("in.fa");
    std::fs::write(&fasta, ">s\nACGTACGTACGTACGT\n").unwrap();

    let db = run_counting(
        &[InputSpec::Sequence {
            path: fasta,
            compress: false,
        }],
        k(3),
        &dir.path().join("db"),
        &CountingConfig::default(),
    )
    .unwrap();

    let records = read_all(&db);
    assert_eq!(db.total_records(), records.len() as u64);
    assert_eq!(
        db.histogram().total_occurrences(),
        records.iter().map(|r| u64::from(r.value)).sum::<u64>()
    );
}

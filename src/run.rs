//! The scheduler/driver: counting first, then 64-shard fan-out.
//!
//! Counting nodes run before the shard phase so their databases exist for
//! everything downstream. The shard phase clones the template tree into one
//! compute array per shard, evaluates shards on a rayon pool, and joins the
//! per-shard sink buffers at the end. A fatal error in one shard raises a
//! shared abort flag that other shards poll at record granularity; partial
//! outputs are discarded.

use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::{debug, info};

use crate::builder::CommandPlan;
use crate::compute::{next_record, OpCompute};
use crate::counting::run_counting;
use crate::database::{create_database_dir, shard_file_name, write_shard, Database};
use crate::error::EngineError;
use crate::histogram::ValueHistogram;
use crate::kmer::NUM_SHARDS;
use crate::output::{
    write_histogram_output, write_printer_output, write_statistics_output, WriterJoin,
};
use crate::template::{OpKind, OpTemplate};

/// One shard's harvested sink state, indexed by template ident.
struct ShardHarvest {
    printers: Vec<Option<Vec<u8>>>,
    histograms: Vec<Option<ValueHistogram>>,
    writer_stats: Vec<Option<(u64, ValueHistogram)>>,
}

/// Executes a finalized command plan to completion.
pub fn execute(plan: &CommandPlan) -> Result<(), EngineError> {
    match plan.counting.threads {
        0 => execute_inner(plan),
        threads => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| EngineError::CorruptInput {
                    details: format!("failed to build worker pool: {e}"),
                })?;
            pool.install(|| execute_inner(plan))
        }
    }
}

fn execute_inner(plan: &CommandPlan) -> Result<(), EngineError> {
    // Phase 1: counting nodes build their databases up front. Nodes with no
    // declared output land in a scratch directory that lives for the run.
    let scratch = tempfile::tempdir()?;
    let mut counted: HashMap<usize, Database> = HashMap::new();

    for template in &plan.templates {
        if template.kind != OpKind::Counting {
            continue;
        }
        let output = template
            .writer
            .clone()
            .unwrap_or_else(|| scratch.path().join(format!("count-{}", template.ident)));
        let db = run_counting(&template.inputs, plan.k, &output, &plan.counting)?;
        counted.insert(template.ident, db);
    }

    // Create writer directories before workers start writing fragments.
    for template in &plan.templates {
        if template.kind != OpKind::Counting {
            if let Some(root) = &template.writer {
                create_database_dir(root)?;
            }
        }
    }

    let roots: Vec<usize> = plan
        .roots
        .iter()
        .copied()
        .filter(|&ident| needs_pull(&plan.templates[ident]))
        .collect();

    info!(
        templates = plan.templates.len(),
        roots = plan.roots.len(),
        k = plan.k.get(),
        "evaluating operation trees"
    );

    // Phase 2: shard fan-out.
    let abort = AtomicBool::new(false);
    let results: Vec<Result<ShardHarvest, EngineError>> = (0..NUM_SHARDS)
        .into_par_iter()
        .map(|shard| {
            let result = evaluate_shard(plan, &counted, &roots, shard, &abort);
            if result.is_err() {
                abort.store(true, Ordering::Relaxed);
            }
            result
        })
        .collect();

    let mut harvests = Vec::with_capacity(NUM_SHARDS);
    let mut first_abort = None;
    for result in results {
        match result {
            Ok(harvest) => harvests.push(harvest),
            Err(EngineError::CorruptInput { details }) if details == ABORTED => {
                first_abort.get_or_insert(EngineError::CorruptInput { details });
            }
            Err(e) => return Err(e),
        }
    }
    if let Some(e) = first_abort {
        return Err(e);
    }

    join_outputs(plan, harvests)
}

/// Whether the shard phase must pull this root at all: counting roots with
/// no remaining sinks finished their work in the counting phase.
fn needs_pull(template: &OpTemplate) -> bool {
    template.kind != OpKind::Counting
        || template.printer.is_some()
        || template.histogram
        || template.statistics
}

const ABORTED: &str = "aborted after a failure in another shard";

/// Evaluates one shard: builds the compute array, drains each root, writes
/// database fragments, and returns the sink buffers.
fn evaluate_shard(
    plan: &CommandPlan,
    counted: &HashMap<usize, Database>,
    roots: &[usize],
    shard: usize,
    abort: &AtomicBool,
) -> Result<ShardHarvest, EngineError> {
    let mut nodes: Vec<OpCompute> = plan
        .templates
        .iter()
        .map(|t| OpCompute::from_template(t, &plan.templates, counted, shard, plan.k))
        .collect::<Result<_, _>>()?;

    for &root in roots {
        loop {
            if abort.load(Ordering::Relaxed) {
                return Err(EngineError::CorruptInput {
                    details: ABORTED.into(),
                });
            }
            if next_record(&mut nodes, root)?.is_none() {
                break;
            }
        }
    }

    debug!(shard, "shard evaluation complete");

    let mut harvest = ShardHarvest {
        printers: Vec::with_capacity(nodes.len()),
        histograms: Vec::with_capacity(nodes.len()),
        writer_stats: Vec::with_capacity(nodes.len()),
    };

    for (node, template) in nodes.iter_mut().zip(&plan.templates) {
        let stats = match (node.writer_records.take(), &template.writer) {
            (Some(records), Some(root)) => {
                write_shard(&root.join(shard_file_name(shard)), plan.k, &records)?;
                let mut histogram = ValueHistogram::new();
                for r in &records {
                    histogram.record(r.value);
                }
                Some((records.len() as u64, histogram))
            }
            _ => None,
        };
        harvest.writer_stats.push(stats);
        harvest.printers.push(node.printer_lines.take());
        harvest.histograms.push(node.emitted_histogram.take());
    }

    Ok(harvest)
}

/// Joins per-shard sink state and writes the final outputs, in template
/// order.
fn join_outputs(plan: &CommandPlan, harvests: Vec<ShardHarvest>) -> Result<(), EngineError> {
    for (ident, template) in plan.templates.iter().enumerate() {
        if template.kind != OpKind::Counting {
            if let Some(root) = &template.writer {
                let mut join = WriterJoin::new(root.clone(), NUM_SHARDS);
                for (shard, harvest) in harvests.iter().enumerate() {
                    if let Some((count, histogram)) = &harvest.writer_stats[ident] {
                        join.absorb(shard, *count, histogram);
                    }
                }
                join.finish(plan.k)?;
            }
        }

        if let Some(printer) = &template.printer {
            let buffers: Vec<Vec<u8>> = harvests
                .iter()
                .map(|h| h.printers[ident].clone().unwrap_or_default())
                .collect();
            write_printer_output(printer.target.as_deref(), &buffers)?;
        }

        if template.histogram || template.statistics {
            let mut merged = ValueHistogram::new();
            for harvest in &harvests {
                if let Some(h) = &harvest.histograms[ident] {
                    merged.merge(h);
                }
            }
            let stdout = io::stdout();
            let mut writer = BufWriter::new(stdout.lock());
            if template.histogram {
                write_histogram_output(&mut writer, &merged)?;
            } else {
                write_statistics_output(&mut writer, &merged.statistics())?;
            }
            writer.flush()?;
        }
    }
    Ok(())
}

/// Parses tokens and executes them: the library entry the binary calls.
pub fn run_command<S: AsRef<str>>(tokens: &[S]) -> Result<(), crate::error::CommandErrors> {
    let mut builder = crate::builder::CommandBuilder::new();
    for token in tokens {
        builder.process_word(token.as_ref());
    }
    let plan = builder.finish()?;
    execute(&plan).map_err(|e| crate::error::CommandErrors::new(vec![e.to_string()]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CommandBuilder;
    use crate::database::write_database;
    use crate::kmer::{Kmer, KmerLength, Record};
    use tempfile::{tempdir, TempDir};

    fn k3() -> KmerLength {
        KmerLength::new(3).unwrap()
    }

    fn canon(seq: &[u8]) -> Kmer {
        Kmer::from_ascii(seq).unwrap().canonical(k3())
    }

    fn make_db(dir: &TempDir, name: &str, records: &[(&[u8], u32, u64)]) -> String {
        let records: Vec<Record> = records
            .iter()
            .map(|&(s, v, l)| Record::new(canon(s), v, l))
            .collect();
        let root = dir.path().join(name);
        write_database(&root, k3(), &records).unwrap();
        root.to_string_lossy().into_owned()
    }

    fn plan(words: &[&str]) -> CommandPlan {
        let mut builder = CommandBuilder::new();
        for w in words {
            builder.process_word(w);
        }
        builder.finish().unwrap()
    }

    fn read_all(root: &std::path::Path) -> Vec<Record> {
        let db = Database::open(root).unwrap();
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

    #[test]
    fn union_max_end_to_end() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 3, 0)]);
        let b = make_db(&dir, "b", &[(b"AAA", 5, 0), (b"AAC", 1, 0)]);
        let out = dir.path().join("out");

        let plan = plan(&[
            "union-max",
            &a,
            &b,
            "output",
            out.to_string_lossy().as_ref(),
        ]);
        execute(&plan).unwrap();

        let records = read_all(&out);
        assert_eq!(records.len(), 2);
        let by_kmer: HashMap<Kmer, u32> = records.iter().map(|r| (r.kmer, r.value)).collect();
        assert_eq!(by_kmer[&canon(b"AAA")], 5);
        assert_eq!(by_kmer[&canon(b"AAC")], 1);
    }

    #[test]
    fn filter_threshold_end_to_end() {
        let dir = tempdir().unwrap();
        let a = make_db(
            &dir,
            "a",
            &[(b"AAA", 3, 0), (b"AAC", 4, 0), (b"AAT", 7, 0), (b"ACC", 2, 0)],
        );
        let out = dir.path().join("out");

        let plan = plan(&["value:ge4", &a, "output", out.to_string_lossy().as_ref()]);
        execute(&plan).unwrap();

        let records = read_all(&out);
        let values: Vec<u32> = records.iter().map(|r| r.value).collect();
        assert_eq!(records.len(), 2);
        assert!(values.contains(&4));
        assert!(values.contains(&7));
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let dir = tempdir().unwrap();
        let a = make_db(
            &dir,
            "a",
            &[(b"AAA", 3, 9), (b"CCA", 4, 8), (b"GTG", 7, 7)],
        );
        let out = dir.path().join("copy");

        let plan = plan(&[&a, "output", out.to_string_lossy().as_ref()]);
        execute(&plan).unwrap();

        for shard in 0..NUM_SHARDS {
            let original =
                std::fs::read(std::path::Path::new(&a).join(shard_file_name(shard))).unwrap();
            let copied = std::fs::read(out.join(shard_file_name(shard))).unwrap();
            assert_eq!(original, copied, "shard {shard} differs");
        }
    }

    #[test]
    fn count_then_merge_in_one_command() {
        let dir = tempdir().unwrap();
        let fasta = dir.path().join("in.fa");
        std::fs::write(&fasta, ">s\nACGTACGTA\n").unwrap();
        let out = dir.path().join("out");

        let plan = plan(&[
            "k=3",
            "union-sum",
            "[",
            "count",
            fasta.to_string_lossy().as_ref(),
            "]",
            "[",
            "count",
            fasta.to_string_lossy().as_ref(),
            "]",
            "output",
            out.to_string_lossy().as_ref(),
        ]);
        execute(&plan).unwrap();

        let records = read_all(&out);
        let total: u32 = records.iter().map(|r| r.value).sum();
        assert_eq!(total, 14);
    }

    #[test]
    fn intersect_min_with_input_all() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"GGG", 4, 11), (b"AAA", 1, 0)]);
        let b = make_db(&dir, "b", &[(b"GGG", 7, 22), (b"AAC", 1, 0)]);
        let c = make_db(&dir, "c", &[(b"GGG", 2, 33), (b"AAT", 1, 0)]);
        let out = dir.path().join("out");

        let plan = plan(&[
            "intersect-min",
            &a,
            &b,
            &c,
            "output",
            out.to_string_lossy().as_ref(),
        ]);
        execute(&plan).unwrap();

        let records = read_all(&out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kmer, canon(b"GGG"));
        assert_eq!(records[0].value, 2);
        // Min label tracks the minimum-value input.
        assert_eq!(records[0].label, 33);
    }

    #[test]
    fn print_to_file() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 2, 1)]);
        let dump = dir.path().join("dump.txt");

        let plan = plan(&[&format!("print={}", dump.display()), &a]);
        execute(&plan).unwrap();

        let text = std::fs::read_to_string(&dump).unwrap();
        assert_eq!(text, "AAA\t2\t1\n");
    }

    #[test]
    fn corrupt_shard_aborts_run() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1, 0), (b"AAC", 1, 0)]);
        // Truncate one shard behind the database's back.
        let shard = canon(b"AAA").shard(k3());
        let path = std::path::Path::new(&a).join(shard_file_name(shard));
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 2]).unwrap();

        let out = dir.path().join("out");
        let plan = plan(&[&a, "output", out.to_string_lossy().as_ref()]);
        assert!(execute(&plan).is_err());
    }
}

//! Per-shard compute twins and the synchronized multi-way merge.
//!
//! Each worker owns one `OpCompute` per template, indexed by template ident.
//! A merge step finds the minimum k-mer across the node's cursors, gathers
//! the active set of inputs carrying it, applies the modify recipes and the
//! filter, feeds the node's sinks, and advances every active cursor.
//!
//! Cross-node pulls go through indices into the worker's compute array, not
//! shared ownership: [`next_record`] temporarily takes a node out of the
//! array while it recurses into its upstream nodes.

use std::collections::HashMap;

use crate::database::{Database, ShardReader};
use crate::error::EngineError;
use crate::filter::FilterExpr;
use crate::histogram::ValueHistogram;
use crate::input::InputSpec;
use crate::kmer::{Kmer, KmerLength, Record};
use crate::modify::{ActiveInput, LabelRecipe, ValueRecipe};
use crate::template::{OpKind, OpTemplate};

/// Where one merge cursor pulls its records from.
enum CursorSource {
    /// Upstream operation, by compute-array index.
    Operation(usize),
    /// Database shard stream.
    Database(ShardReader),
    /// Placeholder for an exhausted or empty slot.
    Empty,
}

/// One input cursor: its source, 1-based slot, and the pre-loaded record.
struct Cursor {
    slot: usize,
    source: CursorSource,
    current: Option<Record>,
    last: Option<Kmer>,
}

impl Cursor {
    fn new(slot: usize, source: CursorSource) -> Self {
        Self {
            slot,
            source,
            current: None,
            last: None,
        }
    }

    /// Loads the next record, enforcing the strict-ascending invariant.
    fn advance(&mut self, nodes: &mut [OpCompute]) -> Result<(), EngineError> {
        let next = match &mut self.source {
            CursorSource::Operation(idx) => next_record(nodes, *idx)?,
            CursorSource::Database(reader) => reader.next_record()?,
            CursorSource::Empty => None,
        };

        if let Some(record) = next {
            if self.last.is_some_and(|last| record.kmer <= last) {
                return Err(EngineError::CorruptInput {
                    details: format!(
                        "input {} produced k-mers out of order ({} after {})",
                        self.slot,
                        record.kmer,
                        self.last.unwrap_or_default()
                    ),
                });
            }
            self.last = Some(record.kmer);
        }
        self.current = next;
        Ok(())
    }
}

/// The per-shard runtime twin of one operation template.
#[derive(Default)]
pub struct OpCompute {
    pub ident: usize,
    k: KmerLength,

    filter: FilterExpr,
    value: ValueRecipe,
    label: LabelRecipe,

    cursors: Vec<Cursor>,
    primed: bool,

    /// Records destined for the database writer, in emission order.
    pub writer_records: Option<Vec<Record>>,
    /// Formatted printer lines.
    pub printer_lines: Option<Vec<u8>>,
    printer_acgt: bool,
    /// Value histogram of emitted records (histogram and statistics sinks).
    pub emitted_histogram: Option<ValueHistogram>,
}

impl OpCompute {
    /// Builds the compute twin of `template` for one shard.
    ///
    /// `counted` maps counting-node idents to their freshly built databases;
    /// a counting node's own twin streams its result database, and inputs
    /// that name a counting node do the same.
    pub fn from_template(
        template: &OpTemplate,
        templates: &[OpTemplate],
        counted: &HashMap<usize, Database>,
        shard: usize,
        k: KmerLength,
    ) -> Result<Self, EngineError> {
        let mut cursors = Vec::new();

        if template.kind == OpKind::Counting {
            let source = match counted.get(&template.ident) {
                Some(db) => CursorSource::Database(db.shard_reader(shard)?),
                None => CursorSource::Empty,
            };
            cursors.push(Cursor::new(1, source));
        } else {
            for (i, spec) in template.inputs.iter().enumerate() {
                let slot = i + 1;
                let source = match spec {
                    InputSpec::Database(db) => CursorSource::Database(db.shard_reader(shard)?),
                    InputSpec::Operation(ident) | InputSpec::Template(ident) => {
                        if templates.get(*ident).map(|t| t.kind) == Some(OpKind::Counting) {
                            match counted.get(ident) {
                                Some(db) => CursorSource::Database(db.shard_reader(shard)?),
                                None => CursorSource::Empty,
                            }
                        } else {
                            CursorSource::Operation(*ident)
                        }
                    }
                    InputSpec::Sequence { .. } | InputSpec::Store { .. } => CursorSource::Empty,
                };
                cursors.push(Cursor::new(slot, source));
            }
        }

        Ok(Self {
            ident: template.ident,
            k,
            filter: template.filter.clone(),
            value: template.value,
            label: template.label,
            cursors,
            primed: false,
            // A counting node's database is written by the counting phase;
            // its twin only feeds the remaining sinks.
            writer_records: (template.writer.is_some() && template.kind != OpKind::Counting)
                .then(Vec::new),
            printer_lines: template.printer.as_ref().map(|_| Vec::new()),
            printer_acgt: template.printer.as_ref().is_some_and(|p| p.acgt_order),
            emitted_histogram: (template.histogram || template.statistics)
                .then(ValueHistogram::new),
        })
    }

    /// One merge step: returns the next record this node emits, or `None`
    /// when all cursors are exhausted.
    fn step(&mut self, nodes: &mut [OpCompute]) -> Result<Option<Record>, EngineError> {
        if !self.primed {
            for cursor in &mut self.cursors {
                cursor.advance(nodes)?;
            }
            self.primed = true;
        }

        loop {
            let Some(min) = self
                .cursors
                .iter()
                .filter_map(|c| c.current.map(|r| r.kmer))
                .min()
            else {
                return Ok(None);
            };

            let active: Vec<ActiveInput> = self
                .cursors
                .iter()
                .filter_map(|c| {
                    c.current
                        .filter(|r| r.kmer == min)
                        .map(|r| ActiveInput {
                            slot: c.slot,
                            value: r.value,
                            label: r.label,
                        })
                })
                .collect();

            let value = self.value.apply(&active)?;
            let label = self.label.apply(&active);
            let accepted = self.filter.accepts(self.k, min, value, label, &active);

            for cursor in &mut self.cursors {
                if cursor.current.is_some_and(|r| r.kmer == min) {
                    cursor.advance(nodes)?;
                }
            }

            if accepted {
                let record = Record::new(min, value, label);
                self.emit(record);
                return Ok(Some(record));
            }
        }
    }

    /// Feeds the node's own sinks with an accepted record.
    fn emit(&mut self, record: Record) {
        if let Some(records) = &mut self.writer_records {
            records.push(record);
        }
        if let Some(lines) = &mut self.printer_lines {
            let text = if self.printer_acgt {
                record.kmer.to_ascii_acgt_order(self.k)
            } else {
                record.kmer.to_ascii(self.k)
            };
            lines.extend_from_slice(&text);
            lines.extend_from_slice(format!("\t{}\t{}\n", record.value, record.label).as_bytes());
        }
        if let Some(histogram) = &mut self.emitted_histogram {
            histogram.record(record.value);
        }
    }
}

/// Pulls the next record from the node at `idx`.
///
/// The node is taken out of the array while it runs so its own cursors can
/// recurse into upstream nodes through the same slice. The tree is acyclic
/// by construction; a cycle would find the placeholder node and terminate.
pub fn next_record(nodes: &mut [OpCompute], idx: usize) -> Result<Option<Record>, EngineError> {
    let mut node = std::mem::take(&mut nodes[idx]);
    let result = node.step(nodes);
    nodes[idx] = node;
    result
}

/// Drains the node at `idx`, returning every record it emits.
pub fn drain(nodes: &mut [OpCompute], idx: usize) -> Result<Vec<Record>, EngineError> {
    let mut out = Vec::new();
    while let Some(record) = next_record(nodes, idx)? {
        out.push(record);
    }
    Ok(out)
}

//! Operation templates: the structural nodes of the command tree.
//!
//! Templates are built while the command line is parsed and are read-only
//! once the trees are finalized; each worker then clones the runtime state
//! it needs into per-shard compute twins indexed by template ident.

use std::path::PathBuf;

use crate::filter::FilterExpr;
use crate::histogram::ValueHistogram;
use crate::input::InputSpec;
use crate::modify::{LabelRecipe, ValueRecipe};

/// What a node does with the k-mers flowing through it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// No action assigned yet; resolved at finalize time.
    #[default]
    Nothing,
    /// Builds a fresh database from raw sequence.
    Counting,
    /// Reports summary statistics of its input.
    Statistics,
    /// Reports the value histogram of its input.
    Histogram,
    /// Dumps records as text.
    Print,
    /// Merges, filters and rewrites records.
    Filter,
}

impl OpKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Nothing => "nothing",
            OpKind::Counting => "count",
            OpKind::Statistics => "statistics",
            OpKind::Histogram => "histogram",
            OpKind::Print => "print",
            OpKind::Filter => "filter",
        }
    }
}

/// Text dump output configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterSpec {
    /// Destination file; `None` prints to stdout.
    pub target: Option<PathBuf>,
    /// Rewrite k-mers to ASCII-lexicographic (A<C<G<T) order.
    pub acgt_order: bool,
}

/// One node of the operation tree.
#[derive(Debug, Default, Clone)]
pub struct OpTemplate {
    pub ident: usize,
    pub kind: OpKind,

    pub inputs: Vec<InputSpec>,
    pub inputs_min: usize,
    pub inputs_max: usize,

    pub filter: FilterExpr,
    pub value: ValueRecipe,
    pub label: LabelRecipe,

    pub writer: Option<PathBuf>,
    pub printer: Option<PrinterSpec>,
    pub histogram: bool,
    pub statistics: bool,
}

impl OpTemplate {
    #[must_use]
    pub fn new(ident: usize) -> Self {
        Self {
            ident,
            inputs_min: 1,
            inputs_max: usize::MAX,
            ..Self::default()
        }
    }

    /// Constrains the allowed input arity; called when an action or alias
    /// is assigned.
    pub fn set_arity(&mut self, min: usize, max: usize) {
        self.inputs_min = min;
        self.inputs_max = max;
    }

    pub fn add_input(&mut self, spec: InputSpec) {
        self.inputs.push(spec);
    }

    /// The histogram backing `distinct=` / `word-frequency=` constants:
    /// the first database input's, when one exists.
    #[must_use]
    pub fn first_database_histogram(&self) -> Option<&ValueHistogram> {
        self.inputs.iter().find_map(|input| match input {
            InputSpec::Database(db) => Some(db.histogram()),
            _ => None,
        })
    }

    /// Resolves the node's kind once all tokens are seen: a node with no
    /// action but an attached sink becomes that sink's kind.
    pub fn resolve_kind(&mut self) {
        if self.kind == OpKind::Nothing {
            self.kind = if self.statistics {
                OpKind::Statistics
            } else if self.histogram {
                OpKind::Histogram
            } else if self.printer.is_some() {
                OpKind::Print
            } else {
                OpKind::Filter
            };
        }
    }

    /// Validates inputs and arity, and rewrites template references into
    /// operation references. Problems are appended to `errors`.
    pub fn finalize_inputs(&mut self, errors: &mut Vec<String>) {
        for input in &mut self.inputs {
            if let InputSpec::Template(ident) = input {
                *input = InputSpec::Operation(*ident);
            }
        }

        let n = self.inputs.len();
        if n < self.inputs_min {
            errors.push(format!(
                "operation '{}' has {n} input(s), needs at least {}",
                self.kind.name(),
                self.inputs_min
            ));
        }
        if n > self.inputs_max {
            errors.push(format!(
                "operation '{}' has {n} input(s), allows at most {}",
                self.kind.name(),
                self.inputs_max
            ));
        }

        for input in &self.inputs {
            match self.kind {
                OpKind::Counting => {
                    if !input.is_sequence_source() {
                        errors.push(format!(
                            "count operation cannot use a {} input",
                            input.kind_name()
                        ));
                    }
                }
                _ => {
                    if !input.is_sorted_source() {
                        errors.push(format!(
                            "operation '{}' cannot use a {} input; sequence inputs require 'count'",
                            self.kind.name(),
                            input.kind_name()
                        ));
                    }
                }
            }
        }
    }

    /// Finalizes the filter expression: reference validation, membership
    /// tables, and quantile constant resolution.
    pub fn finalize_parameters(&mut self, errors: &mut Vec<String>) {
        let num_inputs = self.inputs.len();
        // The filter borrows the histogram while it rewrites itself, so the
        // lookup works on a clone of the expression.
        let mut filter = self.filter.clone();
        filter.finalize(num_inputs, self.first_database_histogram(), errors);
        self.filter = filter;
    }

    /// Operation idents this node consumes, for topological ordering.
    #[must_use]
    pub fn upstream_idents(&self) -> Vec<usize> {
        self.inputs
            .iter()
            .filter_map(|input| match input {
                InputSpec::Template(ident) | InputSpec::Operation(ident) => Some(*ident),
                _ => None,
            })
            .collect()
    }
}

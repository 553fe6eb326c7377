//! The filter expression model.
//!
//! A filter is a sum of products of terms. Each term compares a quantity of
//! the current merge step (value, label, base composition) against a constant
//! or against another input's record, or constrains which inputs the k-mer
//! must be present in. The filter passes a candidate output iff any product
//! passes, and a product passes iff all of its terms pass.

use crate::histogram::ValueHistogram;
use crate::kmer::{Kmer, KmerLabel, KmerLength, KmerValue};
use crate::modify::ActiveInput;

/// How two sides of a term are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Eq,
    Neq,
    Leq,
    Geq,
    Lt,
    Gt,
}

impl Relation {
    #[must_use]
    pub fn compare<T: PartialOrd>(self, x: T, y: T) -> bool {
        match self {
            Relation::Eq => x == y,
            Relation::Neq => x != y,
            Relation::Leq => x <= y,
            Relation::Geq => x >= y,
            Relation::Lt => x < y,
            Relation::Gt => x > y,
        }
    }
}

/// One side of a relational term.
///
/// `Input(0)` names the prospective output k-mer; `Input(i)` with i >= 1
/// names input slot i. The quantile forms are placeholders resolved into
/// `Const` at finalize time from the first input database's histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Input(usize),
    Const(u64),
    Distinct(f64),
    WordFrequency(f64),
}

impl Operand {
    /// True if both operands name the same source, making any relation
    /// between them constant.
    #[must_use]
    pub fn same_source(&self, other: &Operand) -> bool {
        match (self, other) {
            (Operand::Input(a), Operand::Input(b)) => a == b,
            (Operand::Const(a), Operand::Const(b)) => a == b,
            _ => false,
        }
    }
}

/// Which bases a `bases:` term counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BaseSelect {
    pub a: bool,
    pub c: bool,
    pub g: bool,
    pub t: bool,
}

impl BaseSelect {
    #[must_use]
    pub fn any(self) -> bool {
        self.a || self.c || self.g || self.t
    }
}

/// Input-membership requirements of an `input:` term, as parsed.
///
/// Count forms constrain how many inputs carry the k-mer; identity forms
/// constrain which specific inputs must carry it. `finalize` converts both
/// into the lookup tables used during evaluation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Membership {
    pub nums: Vec<usize>,
    pub at_least: Option<usize>,
    pub all: bool,
    pub any: bool,
    pub indices: Vec<usize>,

    present_in_num: Vec<bool>,
    required_idx: Vec<bool>,
}

impl Membership {
    /// Records an `n-all` lower bound; repeated bounds keep the loosest.
    pub fn require_at_least(&mut self, n: usize) {
        self.at_least = Some(self.at_least.map_or(n, |cur| cur.min(n)));
    }

    /// Builds the acceptance tables for a node with `num_inputs` inputs.
    pub fn finalize(&mut self, num_inputs: usize, source: &str, errors: &mut Vec<String>) {
        self.present_in_num = vec![false; num_inputs + 1];
        self.required_idx = vec![false; num_inputs + 1];

        for &n in &self.nums {
            if n == 0 || n > num_inputs {
                errors.push(format!(
                    "filter '{source}': input count {n} out of range for {num_inputs} input(s)"
                ));
            } else {
                self.present_in_num[n] = true;
            }
        }

        if let Some(a) = self.at_least {
            if a > num_inputs {
                errors.push(format!(
                    "filter '{source}': lower bound {a} exceeds {num_inputs} input(s)"
                ));
            }
            for n in a..=num_inputs {
                self.present_in_num[n] = true;
            }
        }

        if self.all {
            self.present_in_num[num_inputs] = true;
        }

        // With no count constraint at all, any cardinality is acceptable.
        if self.any || (self.nums.is_empty() && self.at_least.is_none() && !self.all) {
            for n in 1..=num_inputs {
                self.present_in_num[n] = true;
            }
        }

        for &i in &self.indices {
            if i == 0 || i > num_inputs {
                errors.push(format!(
                    "filter '{source}': input reference @{i} out of range for {num_inputs} input(s)"
                ));
            } else {
                self.required_idx[i] = true;
            }
        }
    }

    /// True if the active set satisfies both the count and identity tables.
    #[must_use]
    pub fn accepts(&self, active: &[ActiveInput]) -> bool {
        if !self
            .present_in_num
            .get(active.len())
            .copied()
            .unwrap_or(false)
        {
            return false;
        }

        self.required_idx
            .iter()
            .enumerate()
            .filter(|(_, &req)| req)
            .all(|(i, _)| active.iter().any(|a| a.slot == i))
    }
}

/// The quantity-specific payload of a filter term.
#[derive(Debug, Clone, PartialEq)]
pub enum TermKind {
    Value {
        left: Operand,
        relation: Relation,
        right: Operand,
    },
    Label {
        left: Operand,
        relation: Relation,
        right: Operand,
    },
    Bases {
        select: BaseSelect,
        left: Operand,
        relation: Relation,
        right: Operand,
    },
    Input(Membership),
}

/// One term of a filter product.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterTerm {
    pub kind: TermKind,
    pub invert: bool,
    /// The command-line word the term was parsed from, for error reporting.
    pub source: String,
}

impl FilterTerm {
    /// Validates references and resolves quantile constants.
    ///
    /// `histogram` is the first input database's histogram, when one exists;
    /// it backs the `distinct=` and `word-frequency=` right-hand forms.
    pub fn finalize(
        &mut self,
        num_inputs: usize,
        histogram: Option<&ValueHistogram>,
        errors: &mut Vec<String>,
    ) {
        match &mut self.kind {
            TermKind::Value { left, right, .. } => {
                for side in [&mut *left, &mut *right] {
                    match *side {
                        Operand::Input(i) if i > num_inputs => {
                            errors.push(format!(
                                "filter '{}': input reference @{i} out of range for {num_inputs} input(s)",
                                self.source
                            ));
                        }
                        Operand::Distinct(f) => match histogram {
                            Some(h) => *side = Operand::Const(u64::from(h.threshold_distinct(f))),
                            None => errors.push(format!(
                                "filter '{}': distinct= requires a histogrammed database input",
                                self.source
                            )),
                        },
                        Operand::WordFrequency(f) => match histogram {
                            Some(h) => {
                                *side = Operand::Const(u64::from(h.threshold_word_frequency(f)));
                            }
                            None => errors.push(format!(
                                "filter '{}': word-frequency= requires a histogrammed database input",
                                self.source
                            )),
                        },
                        _ => {}
                    }
                }
            }
            TermKind::Label { left, right, .. } | TermKind::Bases { left, right, .. } => {
                for side in [&*left, &*right] {
                    match *side {
                        Operand::Input(i) if i > num_inputs => {
                            errors.push(format!(
                                "filter '{}': input reference @{i} out of range for {num_inputs} input(s)",
                                self.source
                            ));
                        }
                        Operand::Distinct(_) | Operand::WordFrequency(_) => {
                            errors.push(format!(
                                "filter '{}': quantile constants apply only to value filters",
                                self.source
                            ));
                        }
                        _ => {}
                    }
                }
            }
            TermKind::Input(membership) => {
                membership.finalize(num_inputs, &self.source, errors);
            }
        }
    }

    /// Evaluates the term against one merge step.
    ///
    /// A relational side that references an input absent from the active set
    /// makes the whole term false, inversion included.
    #[must_use]
    pub fn eval(
        &self,
        k: KmerLength,
        kmer: Kmer,
        out_value: KmerValue,
        out_label: KmerLabel,
        active: &[ActiveInput],
    ) -> bool {
        let raw = match &self.kind {
            TermKind::Value {
                left,
                relation,
                right,
            } => {
                let lhs = value_side(left, out_value, active);
                let rhs = value_side(right, out_value, active);
                match (lhs, rhs) {
                    (Some(x), Some(y)) => relation.compare(x, y),
                    _ => return false,
                }
            }
            TermKind::Label {
                left,
                relation,
                right,
            } => {
                let lhs = label_side(left, out_label, active);
                let rhs = label_side(right, out_label, active);
                match (lhs, rhs) {
                    (Some(x), Some(y)) => relation.compare(x, y),
                    _ => return false,
                }
            }
            TermKind::Bases {
                select,
                left,
                relation,
                right,
            } => {
                let count = u64::from(kmer.count_bases(k, select.a, select.c, select.g, select.t));
                let side = |op: &Operand| match *op {
                    Operand::Input(_) => count,
                    Operand::Const(c) => c,
                    _ => 0,
                };
                relation.compare(side(left), side(right))
            }
            TermKind::Input(membership) => membership.accepts(active),
        };

        raw != self.invert
    }
}

fn value_side(op: &Operand, out_value: KmerValue, active: &[ActiveInput]) -> Option<u64> {
    match *op {
        Operand::Input(0) => Some(u64::from(out_value)),
        Operand::Input(i) => active
            .iter()
            .find(|a| a.slot == i)
            .map(|a| u64::from(a.value)),
        Operand::Const(c) => Some(c),
        _ => None,
    }
}

fn label_side(op: &Operand, out_label: KmerLabel, active: &[ActiveInput]) -> Option<u64> {
    match *op {
        Operand::Input(0) => Some(out_label),
        Operand::Input(i) => active.iter().find(|a| a.slot == i).map(|a| a.label),
        Operand::Const(c) => Some(c),
        _ => None,
    }
}

/// A sum-of-products filter expression.
///
/// An expression with no products accepts everything.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FilterExpr {
    products: Vec<Vec<FilterTerm>>,
}

impl FilterExpr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    #[must_use]
    pub fn num_terms(&self) -> usize {
        self.products.iter().map(Vec::len).sum()
    }

    /// Starts a new product term.
    ///
    /// Returns false if the current product is still empty, which is a
    /// misplaced `or` on the command line.
    pub fn start_product(&mut self) -> bool {
        if self.products.is_empty() || self.products.last().is_some_and(Vec::is_empty) {
            return false;
        }
        self.products.push(Vec::new());
        true
    }

    /// Appends a term to the current (last) product.
    pub fn push_term(&mut self, term: FilterTerm) {
        if self.products.is_empty() {
            self.products.push(Vec::new());
        }
        if let Some(last) = self.products.last_mut() {
            last.push(term);
        }
    }

    /// Finalizes every term (reference validation, quantile resolution,
    /// membership tables).
    pub fn finalize(
        &mut self,
        num_inputs: usize,
        histogram: Option<&ValueHistogram>,
        errors: &mut Vec<String>,
    ) {
        for product in &mut self.products {
            for term in product {
                term.finalize(num_inputs, histogram, errors);
            }
        }
    }

    /// True iff any product is satisfied; short-circuits on the first
    /// passing product and the first failing term inside a product.
    #[must_use]
    pub fn accepts(
        &self,
        k: KmerLength,
        kmer: Kmer,
        out_value: KmerValue,
        out_label: KmerLabel,
        active: &[ActiveInput],
    ) -> bool {
        if self.products.is_empty() {
            return true;
        }
        self.products.iter().any(|product| {
            product
                .iter()
                .all(|term| term.eval(k, kmer, out_value, out_label, active))
        })
    }
}

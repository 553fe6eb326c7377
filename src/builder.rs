//! The command builder: one token at a time into a tree of operation
//! templates.
//!
//! Recognition order per token: grouping, pending numeric continuation,
//! action keywords and aliases, filter words, connectives, modifier and
//! option assignments, and finally input names classified by inspecting the
//! path. Problems never abort the scan; they are collected and reported
//! together by [`CommandBuilder::finish`].

use std::path::Path;

use tracing::debug;

use crate::counting::CountingConfig;
use crate::error::CommandErrors;
use crate::filter::{BaseSelect, FilterTerm, Membership, Operand, Relation, TermKind};
use crate::input::InputSpec;
use crate::kmer::KmerLength;
use crate::modify::{LabelOp, LabelRecipe, ValueOp, ValueRecipe};
use crate::template::{OpKind, OpTemplate, PrinterSpec};

/// A fully parsed and validated command: the template trees plus global
/// configuration.
#[derive(Debug)]
pub struct CommandPlan {
    pub templates: Vec<OpTemplate>,
    pub roots: Vec<usize>,
    pub k: KmerLength,
    pub counting: CountingConfig,
}

/// What the next numeric token configures.
#[derive(Debug, Clone, Copy)]
enum Pending {
    /// A threshold alias such as `less-than`: the constant completes a
    /// value filter with this relation.
    Threshold(Relation),
    /// An arithmetic alias such as `increase`: the constant completes a
    /// value recipe with this fold.
    Arithmetic(ValueOp),
    /// `memory <gigabytes>`.
    Memory,
    /// `threads <n>`.
    Threads,
    /// `output <path>` (takes a path, not a number).
    OutputPath,
}

/// Token-by-token builder for the operation tree.
#[derive(Debug, Default)]
pub struct CommandBuilder {
    templates: Vec<OpTemplate>,
    stack: Vec<usize>,
    roots: Vec<usize>,
    errors: Vec<String>,

    pending: Option<Pending>,
    invert_next_filter: bool,
    compress: bool,
    segment: usize,
    segment_max: usize,
    bracket_depth: i32,

    k: Option<usize>,
    counting: CountingConfig,
}

impl CommandBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            segment: 1,
            segment_max: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn num_errors(&self) -> usize {
        self.errors.len()
    }

    /// The operation currently being configured, creating a new root if
    /// none is open.
    fn current(&mut self) -> &mut OpTemplate {
        if self.stack.is_empty() {
            let ident = self.templates.len();
            self.templates.push(OpTemplate::new(ident));
            self.roots.push(ident);
            self.stack.push(ident);
        }
        let ident = *self.stack.last().unwrap_or(&0);
        &mut self.templates[ident]
    }

    /// Feeds one command-line word to the builder.
    pub fn process_word(&mut self, word: &str) {
        debug!(word, "processing command word");

        if word.is_empty() {
            return;
        }
        if self.group_token(word) {
            return;
        }
        if self.pending_token(word) {
            return;
        }
        if self.action_token(word) {
            return;
        }
        if self.filter_token(word) {
            self.invert_next_filter = false;
            return;
        }
        if self.connective_token(word) {
            return;
        }
        if self.assignment_token(word) {
            return;
        }
        self.input_token(word);
    }

    /// Ends the token stream: validates, resolves, and produces the plan.
    pub fn finish(mut self) -> Result<CommandPlan, CommandErrors> {
        if let Some(pending) = self.pending {
            self.errors
                .push(format!("command ended while waiting for a {pending:?} argument"));
        }
        if self.bracket_depth > 0 {
            self.errors.push("unclosed '[' group".into());
        }
        if self.templates.is_empty() {
            self.errors.push("no operations specified".into());
        }

        for ident in 0..self.templates.len() {
            let mut template = std::mem::take(&mut self.templates[ident]);
            template.resolve_kind();
            template.finalize_inputs(&mut self.errors);
            template.finalize_parameters(&mut self.errors);
            self.templates[ident] = template;
        }

        self.assert_acyclic();
        let k = self.resolve_k();

        if !self.errors.is_empty() {
            return Err(CommandErrors::new(self.errors));
        }

        Ok(CommandPlan {
            templates: self.templates,
            roots: self.roots,
            k,
            counting: self.counting,
        })
    }

    //  Group handling.

    fn group_token(&mut self, word: &str) -> bool {
        match word {
            "[" => {
                self.bracket_depth += 1;
                let ident = self.templates.len();
                self.templates.push(OpTemplate::new(ident));
                if let Some(&parent) = self.stack.last() {
                    self.templates[parent].add_input(InputSpec::Template(ident));
                } else {
                    self.roots.push(ident);
                }
                self.stack.push(ident);
                true
            }
            "]" => {
                self.bracket_depth -= 1;
                if self.bracket_depth < 0 {
                    self.errors.push("']' without a matching '['".into());
                    self.bracket_depth = 0;
                } else {
                    self.stack.pop();
                    self.compress = false;
                }
                true
            }
            _ => false,
        }
    }

    //  Pending numeric / path continuation.

    fn pending_token(&mut self, word: &str) -> bool {
        let Some(pending) = self.pending else {
            return false;
        };
        self.pending = None;

        match pending {
            Pending::Threshold(relation) => match word.parse::<u64>() {
                Ok(n) => {
                    let term = FilterTerm {
                        kind: TermKind::Value {
                            left: Operand::Input(1),
                            relation,
                            right: Operand::Const(n),
                        },
                        invert: self.invert_next_filter,
                        source: word.to_string(),
                    };
                    self.invert_next_filter = false;
                    let op = self.current();
                    op.kind = OpKind::Filter;
                    op.filter.push_term(term);
                }
                Err(_) => self
                    .errors
                    .push(format!("expected a threshold constant, found '{word}'")),
            },
            Pending::Arithmetic(op) => match word.parse::<u32>() {
                Ok(n) => {
                    let t = self.current();
                    t.kind = OpKind::Filter;
                    t.value = ValueRecipe::new(op, Some(n));
                }
                Err(_) => self
                    .errors
                    .push(format!("expected a value constant, found '{word}'")),
            },
            Pending::Memory => match word.parse::<f64>() {
                Ok(g) if g > 0.0 => {
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    {
                        self.counting.memory_bytes = (g * (1u64 << 30) as f64) as u64;
                    }
                }
                _ => self
                    .errors
                    .push(format!("expected memory in gigabytes, found '{word}'")),
            },
            Pending::Threads => match word.parse::<usize>() {
                Ok(n) if n > 0 => self.counting.threads = n,
                _ => self
                    .errors
                    .push(format!("expected a thread count, found '{word}'")),
            },
            Pending::OutputPath => {
                let op = self.current();
                if op.writer.is_some() {
                    self.errors
                        .push(format!("operation already has a database output ('{word}')"));
                } else {
                    op.writer = Some(Path::new(word).to_path_buf());
                }
            }
        }
        true
    }

    //  Actions and aliases.

    #[allow(clippy::too_many_lines)]
    fn action_token(&mut self, word: &str) -> bool {
        match word {
            "count" => {
                let op = self.current();
                op.kind = OpKind::Counting;
                op.set_arity(1, usize::MAX);
            }
            "output" => {
                self.pending = Some(Pending::OutputPath);
            }
            "histogram" => {
                let already_set = {
                    let op = self.current();
                    op.histogram || op.statistics
                };
                if already_set {
                    self.errors
                        .push("operation already has a histogram or statistics output".into());
                }
                let op = self.current();
                op.histogram = true;
                op.set_arity(1, 1);
            }
            "statistics" => {
                let already_set = {
                    let op = self.current();
                    op.histogram || op.statistics
                };
                if already_set {
                    self.errors
                        .push("operation already has a histogram or statistics output".into());
                }
                let op = self.current();
                op.statistics = true;
                op.set_arity(1, 1);
            }
            "union" => self.set_alias(2, ValueOp::Count, LabelOp::Or, AliasFilter::None),
            "union-min" => self.set_alias(2, ValueOp::Min, LabelOp::Min, AliasFilter::None),
            "union-max" => self.set_alias(2, ValueOp::Max, LabelOp::Max, AliasFilter::None),
            "union-sum" => self.set_alias(2, ValueOp::Add, LabelOp::Or, AliasFilter::None),
            "intersect" => self.set_alias(2, ValueOp::First, LabelOp::First, AliasFilter::All),
            "intersect-min" => self.set_alias(2, ValueOp::Min, LabelOp::Min, AliasFilter::All),
            "intersect-max" => self.set_alias(2, ValueOp::Max, LabelOp::Max, AliasFilter::All),
            "intersect-sum" => self.set_alias(2, ValueOp::Add, LabelOp::Or, AliasFilter::All),
            "subtract" => self.set_alias(2, ValueOp::Sub, LabelOp::First, AliasFilter::First),
            "difference" => {
                self.set_alias(2, ValueOp::First, LabelOp::First, AliasFilter::OnlyFirst);
            }
            "less-than" => self.pending = Some(Pending::Threshold(Relation::Lt)),
            "greater-than" => self.pending = Some(Pending::Threshold(Relation::Gt)),
            "at-least" => self.pending = Some(Pending::Threshold(Relation::Geq)),
            "at-most" => self.pending = Some(Pending::Threshold(Relation::Leq)),
            "equal-to" => self.pending = Some(Pending::Threshold(Relation::Eq)),
            "not-equal-to" => self.pending = Some(Pending::Threshold(Relation::Neq)),
            "increase" => self.pending = Some(Pending::Arithmetic(ValueOp::Add)),
            "decrease" => self.pending = Some(Pending::Arithmetic(ValueOp::Sub)),
            "multiply" => self.pending = Some(Pending::Arithmetic(ValueOp::Mul)),
            "divide" => self.pending = Some(Pending::Arithmetic(ValueOp::Div)),
            "divide-round" => self.pending = Some(Pending::Arithmetic(ValueOp::DivZ)),
            "modulo" => self.pending = Some(Pending::Arithmetic(ValueOp::Mod)),
            _ => return false,
        }
        true
    }

    fn set_alias(&mut self, min_inputs: usize, value: ValueOp, label: LabelOp, filter: AliasFilter) {
        let invert = self.invert_next_filter;
        self.invert_next_filter = false;

        let op = self.current();
        op.kind = OpKind::Filter;
        op.set_arity(min_inputs, usize::MAX);
        op.value = ValueRecipe::new(value, None);
        op.label = LabelRecipe::new(label, None);

        let push_membership = |op: &mut OpTemplate, membership: Membership, source: &str| {
            op.filter.push_term(FilterTerm {
                kind: TermKind::Input(membership),
                invert,
                source: source.to_string(),
            });
        };

        match filter {
            AliasFilter::None => {}
            AliasFilter::All => {
                let mut m = Membership::default();
                m.all = true;
                push_membership(op, m, "input:all");
            }
            AliasFilter::First => {
                let mut m = Membership::default();
                m.indices.push(1);
                push_membership(op, m, "input:@1");
            }
            AliasFilter::OnlyFirst => {
                let mut m = Membership::default();
                m.indices.push(1);
                push_membership(op, m, "input:@1");

                let mut m = Membership::default();
                m.nums.push(1);
                push_membership(op, m, "input:1");
            }
        }
    }

    //  Filter words.

    fn filter_token(&mut self, word: &str) -> bool {
        if let Some(rest) = word.strip_prefix("value:") {
            let term = self.decode_relational(word, rest, Quantity::Value);
            self.push_filter_term(term);
            return true;
        }
        if let Some(rest) = word.strip_prefix("label:") {
            let term = self.decode_relational(word, rest, Quantity::Label);
            self.push_filter_term(term);
            return true;
        }
        if let Some(rest) = word.strip_prefix("bases:") {
            let term = self.decode_bases(word, rest);
            self.push_filter_term(term);
            return true;
        }
        if let Some(rest) = word.strip_prefix("input:") {
            let term = self.decode_membership(word, rest);
            self.push_filter_term(term);
            return true;
        }
        false
    }

    fn push_filter_term(&mut self, term: Option<FilterTerm>) {
        if let Some(term) = term {
            let op = self.current();
            if op.kind == OpKind::Nothing {
                op.kind = OpKind::Filter;
            }
            op.filter.push_term(term);
        }
    }

    /// Decodes `[arg] rel arg` after a `value:` or `label:` prefix.
    fn decode_relational(&mut self, word: &str, body: &str, quantity: Quantity) -> Option<FilterTerm> {
        let (left_text, relation, right_text) = match split_relation(body) {
            Some(parts) => parts,
            None => {
                self.errors.push(format!(
                    "no comparison operator found in '{word}', expecting one of '==', 'eq', '!=', 'ge', '<', ..."
                ));
                return None;
            }
        };

        let left = if left_text.is_empty() {
            // An omitted left side reads as "the first input".
            Operand::Input(1)
        } else {
            self.decode_operand(word, left_text)?
        };

        if right_text.is_empty() {
            self.errors.push(format!(
                "invalid filter '{word}': no second argument to comparison operator found"
            ));
            return None;
        }
        let right = self.decode_operand(word, right_text)?;

        if left.same_source(&right) {
            self.errors
                .push(format!("invalid filter '{word}': always true (or false)"));
            return None;
        }

        let kind = match quantity {
            Quantity::Value => TermKind::Value {
                left,
                relation,
                right,
            },
            Quantity::Label => TermKind::Label {
                left,
                relation,
                right,
            },
        };

        Some(FilterTerm {
            kind,
            invert: self.invert_next_filter,
            source: word.to_string(),
        })
    }

    /// Decodes `bases:<acgt>+:[arg] rel arg`.
    fn decode_bases(&mut self, word: &str, body: &str) -> Option<FilterTerm> {
        let Some(colon) = body.find(':') else {
            self.errors
                .push(format!("failed to parse 'bases' filter '{word}'"));
            return None;
        };
        let (letters, rest) = body.split_at(colon);
        let rest = &rest[1..];

        let mut select = BaseSelect::default();
        for letter in letters.chars() {
            match letter {
                'a' | 'A' => select.a = true,
                'c' | 'C' => select.c = true,
                'g' | 'G' => select.g = true,
                't' | 'T' => select.t = true,
                _ => {
                    self.errors
                        .push(format!("invalid 'bases' letter '{letter}' in filter '{word}'"));
                }
            }
        }
        if !select.any() {
            self.errors
                .push(format!("filter '{word}' selects no bases to count"));
        }

        let (left_text, relation, right_text) = match split_relation(rest) {
            Some(parts) => parts,
            None => {
                self.errors.push(format!(
                    "no comparison operator found in '{word}', expecting one of '==', 'eq', '!=', 'ge', '<', ..."
                ));
                return None;
            }
        };

        // The base count is a property of the output k-mer; every input
        // shares it, so sides may only name @0 or a constant.
        let left = if left_text.is_empty() {
            Operand::Input(0)
        } else {
            self.decode_operand(word, left_text)?
        };
        if right_text.is_empty() {
            self.errors.push(format!(
                "invalid filter '{word}': no second argument to comparison operator found"
            ));
            return None;
        }
        let right = self.decode_operand(word, right_text)?;

        for side in [&left, &right] {
            if let Operand::Input(i) = side {
                if *i > 0 {
                    self.errors.push(format!(
                        "filter '{word}' cannot compare base counts across inputs (@{i})"
                    ));
                    return None;
                }
            }
        }

        if left.same_source(&right) {
            self.errors
                .push(format!("invalid filter '{word}': always true (or false)"));
            return None;
        }

        Some(FilterTerm {
            kind: TermKind::Bases {
                select,
                left,
                relation,
                right,
            },
            invert: self.invert_next_filter,
            source: word.to_string(),
        })
    }

    /// Decodes the `input:` membership list.
    fn decode_membership(&mut self, word: &str, body: &str) -> Option<FilterTerm> {
        let mut membership = Membership::default();

        for part in body.split([':', ',']) {
            if part.is_empty() {
                continue;
            }
            if part == "all" {
                membership.all = true;
            } else if part == "any" {
                membership.any = true;
            } else if part == "first" {
                membership.indices.push(1);
            } else if let Some(range) = part.strip_prefix('@') {
                match range.split_once("-@") {
                    Some((a, b)) => match (a.parse::<usize>(), b.parse::<usize>()) {
                        (Ok(a), Ok(b)) if a <= b => membership.indices.extend(a..=b),
                        _ => self.errors.push(format!(
                            "filter '{word}' cannot be decoded: unknown word '{part}'"
                        )),
                    },
                    None => match range.parse::<usize>() {
                        Ok(a) => membership.indices.push(a),
                        Err(_) => self.errors.push(format!(
                            "filter '{word}' cannot be decoded: unknown word '{part}'"
                        )),
                    },
                }
            } else if let Some((a, b)) = part.split_once('-') {
                match (a.parse::<usize>(), b) {
                    (Ok(a), "all") => membership.require_at_least(a),
                    (Ok(a), b) => match b.parse::<usize>() {
                        Ok(b) if a <= b => membership.nums.extend(a..=b),
                        _ => self.errors.push(format!(
                            "filter '{word}' cannot be decoded: unknown word '{part}'"
                        )),
                    },
                    _ => self.errors.push(format!(
                        "filter '{word}' cannot be decoded: unknown word '{part}'"
                    )),
                }
            } else {
                match part.parse::<usize>() {
                    Ok(a) => membership.nums.push(a),
                    Err(_) => self.errors.push(format!(
                        "filter '{word}' cannot be decoded: unknown word '{part}'"
                    )),
                }
            }
        }

        Some(FilterTerm {
            kind: TermKind::Input(membership),
            invert: self.invert_next_filter,
            source: word.to_string(),
        })
    }

    fn decode_operand(&mut self, word: &str, text: &str) -> Option<Operand> {
        if let Some(index) = text.strip_prefix('@') {
            return match index.parse::<usize>() {
                Ok(i) => Some(Operand::Input(i)),
                Err(_) => {
                    self.errors
                        .push(format!("invalid input reference '{text}' in filter '{word}'"));
                    None
                }
            };
        }
        if let Some(constant) = text.strip_prefix('#') {
            return self.decode_constant(word, constant);
        }
        if let Some(fraction) = text.strip_prefix("distinct=") {
            return match fraction.parse::<f64>() {
                Ok(f) if (0.0..=1.0).contains(&f) => Some(Operand::Distinct(f)),
                _ => {
                    self.errors
                        .push(format!("invalid distinct= fraction in filter '{word}'"));
                    None
                }
            };
        }
        for prefix in ["word-frequency=", "word-freq="] {
            if let Some(fraction) = text.strip_prefix(prefix) {
                return match fraction.parse::<f64>() {
                    Ok(f) if (0.0..=1.0).contains(&f) => Some(Operand::WordFrequency(f)),
                    _ => {
                        self.errors
                            .push(format!("invalid word-frequency= fraction in filter '{word}'"));
                        None
                    }
                };
            }
        }
        if let Some(constant) = text.strip_prefix("threshold=") {
            return self.decode_constant(word, constant);
        }
        self.decode_constant(word, text)
    }

    fn decode_constant(&mut self, word: &str, text: &str) -> Option<Operand> {
        let parsed = if let Some(hex) = text.strip_prefix("0x") {
            u64::from_str_radix(hex, 16)
        } else {
            text.parse::<u64>()
        };
        match parsed {
            Ok(c) => Some(Operand::Const(c)),
            Err(_) => {
                self.errors
                    .push(format!("cannot decode number '{text}' in filter '{word}'"));
                None
            }
        }
    }

    //  Connectives.

    fn connective_token(&mut self, word: &str) -> bool {
        match word {
            "not" => {
                self.invert_next_filter = !self.invert_next_filter;
                true
            }
            // 'and' is syntactic sugar; terms in one product are already
            // conjoined.
            "and" => true,
            "or" => {
                let ok = self.current().filter.start_product();
                if !ok {
                    self.errors
                        .push("'or' without a preceding filter term".into());
                }
                true
            }
            _ => false,
        }
    }

    //  Modifier and option assignments.

    fn assignment_token(&mut self, word: &str) -> bool {
        if let Some(rest) = word.strip_prefix("value=") {
            self.decode_value_assignment(word, rest);
            return true;
        }
        if let Some(rest) = word.strip_prefix("label=") {
            self.decode_label_assignment(word, rest);
            return true;
        }
        if let Some(rest) = word.strip_prefix("k=") {
            match rest.parse::<usize>() {
                Ok(k) if KmerLength::new(k).is_ok() => self.k = Some(k),
                _ => self.errors.push(format!(
                    "invalid k-mer length '{rest}' (must be {}-{})",
                    KmerLength::MIN,
                    KmerLength::MAX
                )),
            }
            return true;
        }
        if word == "memory" {
            self.pending = Some(Pending::Memory);
            return true;
        }
        if word == "threads" {
            self.pending = Some(Pending::Threads);
            return true;
        }
        if word == "compress" {
            self.compress = true;
            return true;
        }
        if let Some(rest) = word.strip_prefix("segment=") {
            match rest.split_once('/') {
                Some((s, m)) => match (s.parse::<usize>(), m.parse::<usize>()) {
                    (Ok(s), Ok(m)) if s >= 1 && s <= m => {
                        self.segment = s;
                        self.segment_max = m;
                    }
                    _ => self
                        .errors
                        .push(format!("invalid segment specification '{word}'")),
                },
                None => self
                    .errors
                    .push(format!("invalid segment specification '{word}'")),
            }
            return true;
        }
        if word == "print" {
            self.attach_printer(word, None, false);
            return true;
        }
        if let Some(rest) = word.strip_prefix("print:acgt") {
            match rest.strip_prefix('=') {
                Some(path) => self.attach_printer(word, Some(path), true),
                None if rest.is_empty() => self.attach_printer(word, None, true),
                None => return false,
            }
            return true;
        }
        if let Some(path) = word.strip_prefix("print=") {
            self.attach_printer(word, Some(path), false);
            return true;
        }
        false
    }

    fn attach_printer(&mut self, word: &str, target: Option<&str>, acgt_order: bool) {
        let op = self.current();
        if op.printer.is_some() {
            self.errors
                .push(format!("operation already has a printer ('{word}')"));
            return;
        }
        op.printer = Some(PrinterSpec {
            target: target.map(|p| Path::new(p).to_path_buf()),
            acgt_order,
        });
    }

    fn decode_value_assignment(&mut self, word: &str, body: &str) {
        let (mode, constant) = split_assignment(body);
        let constant = match constant {
            Some(text) => match text.parse::<u32>() {
                Ok(c) => Some(c),
                Err(_) => {
                    self.errors
                        .push(format!("cannot decode value constant in '{word}'"));
                    return;
                }
            },
            None => None,
        };

        let op = match mode {
            "nop" => ValueOp::Nop,
            "set" => ValueOp::Set,
            "selected" => ValueOp::Selected,
            "first" => ValueOp::First,
            "min" => ValueOp::Min,
            "max" => ValueOp::Max,
            "add" => ValueOp::Add,
            "sub" => ValueOp::Sub,
            "mul" => ValueOp::Mul,
            "div" => ValueOp::Div,
            "divzero" => ValueOp::DivZ,
            "mod" => ValueOp::Mod,
            "count" => ValueOp::Count,
            number => {
                // A bare integer sets the value outright.
                match number.parse::<u32>() {
                    Ok(c) => {
                        let t = self.current();
                        if t.kind == OpKind::Nothing {
                            t.kind = OpKind::Filter;
                        }
                        t.value = ValueRecipe::new(ValueOp::Set, Some(c));
                        return;
                    }
                    Err(_) => {
                        self.errors
                            .push(format!("unknown value modifier '{word}'"));
                        return;
                    }
                }
            }
        };

        let t = self.current();
        if t.kind == OpKind::Nothing {
            t.kind = OpKind::Filter;
        }
        t.value = ValueRecipe::new(op, constant);
    }

    fn decode_label_assignment(&mut self, word: &str, body: &str) {
        let (mode, constant) = split_assignment(body);
        let constant = match constant {
            Some(text) => {
                let parsed = if let Some(hex) = text.strip_prefix("0x") {
                    u64::from_str_radix(hex, 16)
                } else {
                    text.parse::<u64>()
                };
                match parsed {
                    Ok(c) => Some(c),
                    Err(_) => {
                        self.errors
                            .push(format!("cannot decode label constant in '{word}'"));
                        return;
                    }
                }
            }
            None => None,
        };

        let op = match mode {
            "nop" => LabelOp::Nop,
            "set" => LabelOp::Set,
            "selected" => LabelOp::Selected,
            "first" => LabelOp::First,
            "min" => LabelOp::Min,
            "max" => LabelOp::Max,
            "and" => LabelOp::And,
            "or" => LabelOp::Or,
            "xor" => LabelOp::Xor,
            "difference" => LabelOp::Difference,
            "lightest" => LabelOp::Lightest,
            "heaviest" => LabelOp::Heaviest,
            "invert" => LabelOp::Invert,
            "shift-left" => LabelOp::ShiftLeft,
            "shift-right" => LabelOp::ShiftRight,
            "rotate-left" => LabelOp::RotateLeft,
            "rotate-right" => LabelOp::RotateRight,
            number => match number.parse::<u64>() {
                Ok(c) => {
                    let t = self.current();
                    if t.kind == OpKind::Nothing {
                        t.kind = OpKind::Filter;
                    }
                    t.label = LabelRecipe::new(LabelOp::Set, Some(c));
                    return;
                }
                Err(_) => {
                    self.errors
                        .push(format!("unknown label modifier '{word}'"));
                    return;
                }
            },
        };

        let t = self.current();
        if t.kind == OpKind::Nothing {
            t.kind = OpKind::Filter;
        }
        t.label = LabelRecipe::new(op, constant);
    }

    //  Input names.

    fn input_token(&mut self, word: &str) {
        let compress = self.compress;
        let segment = self.segment;
        let segment_max = self.segment_max;
        self.segment = 1;
        self.segment_max = 1;

        match InputSpec::from_path(Path::new(word), compress, segment, segment_max) {
            Ok(spec) => {
                self.current().add_input(spec);
            }
            Err(_) => {
                self.errors
                    .push(format!("unrecognized token or missing input '{word}'"));
            }
        }
    }

    //  Finalization helpers.

    /// The tree is built bottom-up and cannot contain cycles; verify it
    /// anyway so a broken rewrite shows up here rather than as a stuck
    /// merge.
    fn assert_acyclic(&mut self) {
        let n = self.templates.len();
        let mut state = vec![0u8; n]; // 0 = unseen, 1 = in progress, 2 = done

        fn visit(
            templates: &[OpTemplate],
            state: &mut [u8],
            ident: usize,
            errors: &mut Vec<String>,
        ) {
            if ident >= templates.len() || state[ident] == 2 {
                return;
            }
            if state[ident] == 1 {
                errors.push(format!("operation tree contains a cycle at node {ident}"));
                return;
            }
            state[ident] = 1;
            for upstream in templates[ident].upstream_idents() {
                visit(templates, state, upstream, errors);
            }
            state[ident] = 2;
        }

        for root in self.roots.clone() {
            visit(&self.templates, &mut state, root, &mut self.errors);
        }
    }

    /// Resolves the global k-mer length from `k=` and the database inputs.
    fn resolve_k(&mut self) -> KmerLength {
        let mut resolved = self.k;

        for template in &self.templates {
            for input in &template.inputs {
                if let InputSpec::Database(db) = input {
                    let db_k = db.k().get();
                    match resolved {
                        None => resolved = Some(db_k),
                        Some(k) if k != db_k => {
                            self.errors.push(format!(
                                "k-mer length mismatch: {} has k={db_k}, expected k={k}",
                                db.root().display()
                            ));
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        match resolved {
            Some(k) => KmerLength::new(k).unwrap_or_default(),
            None => {
                let needs_k = self
                    .templates
                    .iter()
                    .any(|t| t.kind == OpKind::Counting);
                if needs_k || !self.templates.is_empty() {
                    self.errors
                        .push("k-mer length not specified; use 'k=<n>' or a database input".into());
                }
                KmerLength::default()
            }
        }
    }
}

/// Which relational quantity a filter word names.
#[derive(Debug, Clone, Copy)]
enum Quantity {
    Value,
    Label,
}

/// How an alias constrains the active set.
enum AliasFilter {
    None,
    All,
    First,
    OnlyFirst,
}

/// Splits `mode` or `mode:constant`.
fn split_assignment(body: &str) -> (&str, Option<&str>) {
    match body.split_once(':') {
        Some((mode, constant)) => (mode, Some(constant)),
        None => (body, None),
    }
}

/// Finds the relation inside a filter body and splits around it, trimming
/// the optional ':' separators.
fn split_relation(body: &str) -> Option<(&str, Relation, &str)> {
    let bytes = body.as_bytes();
    for i in 0..bytes.len() {
        if let Some((relation, len)) = relation_at(&body[i..]) {
            let mut left = &body[..i];
            if left.ends_with(':') {
                left = &left[..left.len() - 1];
            }
            let mut right = &body[i + len..];
            if let Some(stripped) = right.strip_prefix(':') {
                right = stripped;
            }
            return Some((left, relation, right));
        }
    }
    None
}

/// Decodes a relation at the start of `text`, longest symbols first.
fn relation_at(text: &str) -> Option<(Relation, usize)> {
    for (symbol, relation) in [
        ("==", Relation::Eq),
        ("eq", Relation::Eq),
        ("!=", Relation::Neq),
        ("<>", Relation::Neq),
        ("ne", Relation::Neq),
        ("<=", Relation::Leq),
        ("le", Relation::Leq),
        (">=", Relation::Geq),
        ("ge", Relation::Geq),
        ("lt", Relation::Lt),
        ("gt", Relation::Gt),
    ] {
        if text.starts_with(symbol) {
            return Some((relation, 2));
        }
    }
    for (symbol, relation) in [("=", Relation::Eq), ("<", Relation::Lt), (">", Relation::Gt)] {
        if text.starts_with(symbol) {
            return Some((relation, 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::write_database;
    use crate::kmer::{Kmer, Record};
    use tempfile::{tempdir, TempDir};

    fn k3() -> KmerLength {
        KmerLength::new(3).unwrap()
    }

    fn make_db(dir: &TempDir, name: &str, seqs: &[(&[u8], u32)]) -> String {
        let records: Vec<Record> = seqs
            .iter()
            .map(|&(s, v)| Record::new(Kmer::from_ascii(s).unwrap().canonical(k3()), v, 0))
            .collect();
        let root = dir.path().join(name);
        write_database(&root, k3(), &records).unwrap();
        root.to_string_lossy().into_owned()
    }

    fn build(words: &[&str]) -> Result<CommandPlan, CommandErrors> {
        let mut builder = CommandBuilder::new();
        for word in words {
            builder.process_word(word);
        }
        builder.finish()
    }

    #[test]
    fn union_of_two_databases() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);
        let b = make_db(&dir, "b", &[(b"AAC", 2)]);

        let plan = build(&["union-max", &a, &b]).unwrap();
        assert_eq!(plan.templates.len(), 1);
        assert_eq!(plan.roots, vec![0]);
        assert_eq!(plan.k, k3());
        assert_eq!(plan.templates[0].kind, OpKind::Filter);
        assert_eq!(plan.templates[0].value.op, ValueOp::Max);
        assert_eq!(plan.templates[0].inputs.len(), 2);
    }

    #[test]
    fn bracketed_subtrees_become_inputs() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);
        let b = make_db(&dir, "b", &[(b"AAC", 2)]);

        let plan = build(&["union", "[", "print", &a, "]", "[", &b, "]"]).unwrap();
        assert_eq!(plan.templates.len(), 3);
        assert_eq!(plan.roots, vec![0]);
        assert!(matches!(plan.templates[0].inputs[0], InputSpec::Operation(1)));
        assert!(matches!(plan.templates[0].inputs[1], InputSpec::Operation(2)));
        assert_eq!(plan.templates[1].kind, OpKind::Print);
    }

    #[test]
    fn counting_node_from_sequence() {
        let dir = tempdir().unwrap();
        let fasta = dir.path().join("in.fa");
        std::fs::write(&fasta, ">s\nACGT\n").unwrap();
        let out = dir.path().join("out-db");

        let plan = build(&[
            "count",
            "k=3",
            fasta.to_string_lossy().as_ref(),
            "output",
            out.to_string_lossy().as_ref(),
        ])
        .unwrap();

        assert_eq!(plan.templates[0].kind, OpKind::Counting);
        assert_eq!(plan.templates[0].writer.as_deref(), Some(out.as_path()));
        assert_eq!(plan.k, k3());
    }

    #[test]
    fn missing_k_for_counting_is_an_error() {
        let dir = tempdir().unwrap();
        let fasta = dir.path().join("in.fa");
        std::fs::write(&fasta, ">s\nACGT\n").unwrap();

        let err = build(&["count", fasta.to_string_lossy().as_ref()]).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("k-mer length")));
    }

    #[test]
    fn threshold_alias_consumes_constant() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);

        let plan = build(&["less-than", "100", &a]).unwrap();
        assert_eq!(plan.templates[0].kind, OpKind::Filter);
        assert_eq!(plan.templates[0].filter.num_terms(), 1);
    }

    #[test]
    fn trailing_memory_and_threads() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);

        let plan = build(&["print", &a, "memory", "2", "threads", "8"]).unwrap();
        assert_eq!(plan.counting.memory_bytes, 2 * (1 << 30));
        assert_eq!(plan.counting.threads, 8);
    }

    #[test]
    fn value_filter_words() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);

        let plan = build(&["value:ge4", &a]).unwrap();
        assert_eq!(plan.templates[0].filter.num_terms(), 1);

        // 'or' creates a second product; 'and' chains within one.
        let plan = build(&["value:ge4", "or", "value:le2", "and", "label:eq0", &a]).unwrap();
        assert_eq!(plan.templates[0].filter.num_terms(), 3);
    }

    #[test]
    fn tautological_filter_is_rejected() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);

        let err = build(&["value:@1=@1", &a]).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("always true")));

        let err = build(&["value:#4=#4", &a]).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("always true")));
    }

    #[test]
    fn bases_filter_rejects_input_references() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);

        let err = build(&["bases:gc:@1>2", &a]).unwrap_err();
        assert!(err
            .errors
            .iter()
            .any(|e| e.contains("cannot compare base counts")));
    }

    #[test]
    fn out_of_range_reference_is_collected() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);

        let err = build(&["value:@3>4", &a]).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("@3")));
    }

    #[test]
    fn errors_are_collected_not_aborted() {
        let err = build(&["value:nonsense", "no-such-file.fa", "]"]).unwrap_err();
        assert!(err.len() >= 3);
    }

    #[test]
    fn histogram_requires_single_input() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);
        let b = make_db(&dir, "b", &[(b"AAC", 1)]);

        let err = build(&["histogram", &a, &b]).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("at most 1")));
    }

    #[test]
    fn mismatched_database_k_is_an_error() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);
        let b_root = dir.path().join("b");
        write_database(
            &b_root,
            KmerLength::new(5).unwrap(),
            &[Record::new(Kmer::from_ascii(b"AAAAA").unwrap(), 1, 0)],
        )
        .unwrap();

        let err = build(&["union", &a, b_root.to_string_lossy().as_ref()]).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("mismatch")));
    }

    #[test]
    fn not_inverts_next_filter_only() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);

        let plan = build(&["not", "value:ge4", &a]).unwrap();
        assert_eq!(plan.templates[0].filter.num_terms(), 1);

        // Double negation cancels.
        let mut builder = CommandBuilder::new();
        builder.process_word("not");
        builder.process_word("not");
        assert!(!builder.invert_next_filter);
    }

    #[test]
    fn misplaced_or_is_an_error() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);

        let err = build(&["or", "value:ge4", &a]).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("'or'")));
    }

    #[test]
    fn print_variants() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);

        let plan = build(&["print", &a]).unwrap();
        let printer = plan.templates[0].printer.as_ref().unwrap();
        assert_eq!(printer.target, None);
        assert!(!printer.acgt_order);

        let plan = build(&["print:acgt", &a]).unwrap();
        assert!(plan.templates[0].printer.as_ref().unwrap().acgt_order);

        let plan = build(&["print=dump.txt", &a]).unwrap();
        assert!(plan.templates[0].printer.as_ref().unwrap().target.is_some());
    }

    #[test]
    fn value_assignment_forms() {
        let dir = tempdir().unwrap();
        let a = make_db(&dir, "a", &[(b"AAA", 1)]);

        let plan = build(&["value=min", &a]).unwrap();
        assert_eq!(plan.templates[0].value.op, ValueOp::Min);

        let plan = build(&["value=42", &a]).unwrap();
        assert_eq!(plan.templates[0].value.op, ValueOp::Set);
        assert_eq!(plan.templates[0].value.constant, Some(42));

        let plan = build(&["label=and:0xff", &a]).unwrap();
        assert_eq!(plan.templates[0].label.op, LabelOp::And);
        assert_eq!(plan.templates[0].label.constant, Some(0xff));
    }

    #[test]
    fn no_operations_is_an_error() {
        let err = build(&[]).unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("no operations")));
    }
}

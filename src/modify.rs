//! Modify recipes: how an output record's value and label are derived from
//! the active inputs of a merge step.
//!
//! Each recipe is an enum mode plus an optional constant. Folds run across
//! the active set in slot order, starting from the first active input; the
//! constant joins the fold only when one was given. Arithmetic is unsigned
//! and saturating.

use crate::error::EngineError;
use crate::kmer::{KmerLabel, KmerValue, LABEL_BITS};

/// One input carrying the current merge k-mer: its 1-based slot and the
/// (value, label) of its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveInput {
    pub slot: usize,
    pub value: KmerValue,
    pub label: KmerLabel,
}

/// How the output value is derived.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ValueOp {
    /// Pass through the first active input's value.
    #[default]
    Nop,
    /// The constant.
    Set,
    /// The value of the selected (first active) input.
    Selected,
    /// The value of input 1 if it is active, otherwise pass through.
    First,
    Min,
    Max,
    Add,
    Sub,
    Mul,
    Div,
    /// Division with a zero result coerced to 1 and zero divisors skipped.
    DivZ,
    Mod,
    /// The number of active inputs.
    Count,
}

/// How the output label is derived.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LabelOp {
    /// Pass through the first active input's label.
    #[default]
    Nop,
    /// The constant.
    Set,
    /// The label of the selected (first active) input.
    Selected,
    /// The label of input 1 if it is active, otherwise pass through.
    First,
    /// The label of the active input with the minimum value.
    Min,
    /// The label of the active input with the maximum value.
    Max,
    And,
    Or,
    Xor,
    /// Bits of input 1's label not set in any later input's label.
    Difference,
    /// The active label with the fewest set bits.
    Lightest,
    /// The active label with the most set bits.
    Heaviest,
    /// Bitwise complement of the first active input's label.
    Invert,
    ShiftLeft,
    ShiftRight,
    RotateLeft,
    RotateRight,
}

/// A value mode with its optional constant operand.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ValueRecipe {
    pub op: ValueOp,
    pub constant: Option<KmerValue>,
}

/// A label mode with its optional constant operand.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LabelRecipe {
    pub op: LabelOp,
    pub constant: Option<KmerLabel>,
}

impl ValueRecipe {
    #[must_use]
    pub fn new(op: ValueOp, constant: Option<KmerValue>) -> Self {
        Self { op, constant }
    }

    /// Computes the output value for one merge step.
    ///
    /// `active` is non-empty and in ascending slot order.
    #[allow(clippy::cast_possible_truncation)]
    pub fn apply(&self, active: &[ActiveInput]) -> Result<KmerValue, EngineError> {
        let first = active[0].value;

        let out = match self.op {
            ValueOp::Nop | ValueOp::Selected => first,
            ValueOp::Set => self.constant.unwrap_or(0),
            ValueOp::First => active
                .iter()
                .find(|a| a.slot == 1)
                .map_or(first, |a| a.value),
            ValueOp::Min => active
                .iter()
                .map(|a| a.value)
                .chain(self.constant)
                .min()
                .unwrap_or(0),
            ValueOp::Max => active
                .iter()
                .map(|a| a.value)
                .chain(self.constant)
                .max()
                .unwrap_or(0),
            ValueOp::Add => active
                .iter()
                .skip(1)
                .map(|a| a.value)
                .chain(self.constant)
                .fold(first, KmerValue::saturating_add),
            ValueOp::Sub => active
                .iter()
                .skip(1)
                .map(|a| a.value)
                .chain(self.constant)
                .fold(first, KmerValue::saturating_sub),
            ValueOp::Mul => active
                .iter()
                .skip(1)
                .map(|a| a.value)
                .chain(self.constant)
                .fold(first, KmerValue::saturating_mul),
            ValueOp::Div => {
                let mut out = first;
                for d in active.iter().skip(1).map(|a| a.value).chain(self.constant) {
                    if d == 0 {
                        return Err(EngineError::InvalidModify {
                            details: "division by zero".into(),
                        });
                    }
                    out /= d;
                }
                out
            }
            ValueOp::DivZ => {
                let mut out = first;
                for d in active.iter().skip(1).map(|a| a.value).chain(self.constant) {
                    if d != 0 {
                        out /= d;
                    }
                }
                if out == 0 {
                    1
                } else {
                    out
                }
            }
            ValueOp::Mod => {
                let mut out = first;
                for d in active.iter().skip(1).map(|a| a.value).chain(self.constant) {
                    if d == 0 {
                        return Err(EngineError::InvalidModify {
                            details: "modulo by zero".into(),
                        });
                    }
                    out %= d;
                }
                out
            }
            ValueOp::Count => active.len() as KmerValue,
        };

        Ok(out)
    }
}

impl LabelRecipe {
    #[must_use]
    pub fn new(op: LabelOp, constant: Option<KmerLabel>) -> Self {
        Self { op, constant }
    }

    /// Computes the output label for one merge step.
    ///
    /// `active` is non-empty and in ascending slot order.
    #[allow(clippy::cast_possible_truncation)]
    pub fn apply(&self, active: &[ActiveInput]) -> KmerLabel {
        let first = active[0].label;
        let shift = self.constant.unwrap_or(0) as u32;

        match self.op {
            LabelOp::Nop | LabelOp::Selected => first,
            LabelOp::Set => self.constant.unwrap_or(0),
            LabelOp::First => active
                .iter()
                .find(|a| a.slot == 1)
                .map_or(first, |a| a.label),
            LabelOp::Min => active
                .iter()
                .min_by_key(|a| a.value)
                .map_or(first, |a| a.label),
            LabelOp::Max => active
                .iter()
                .max_by_key(|a| a.value)
                .map_or(first, |a| a.label),
            LabelOp::And => active
                .iter()
                .skip(1)
                .map(|a| a.label)
                .chain(self.constant)
                .fold(first, |acc, l| acc & l),
            LabelOp::Or => active
                .iter()
                .skip(1)
                .map(|a| a.label)
                .chain(self.constant)
                .fold(first, |acc, l| acc | l),
            LabelOp::Xor => active
                .iter()
                .skip(1)
                .map(|a| a.label)
                .chain(self.constant)
                .fold(first, |acc, l| acc ^ l),
            LabelOp::Difference => {
                let head = active
                    .iter()
                    .find(|a| a.slot == 1)
                    .map_or(0, |a| a.label);
                let rest = active
                    .iter()
                    .filter(|a| a.slot != 1)
                    .fold(0, |acc, a| acc | a.label);
                head & !rest
            }
            LabelOp::Lightest => active
                .iter()
                .min_by_key(|a| a.label.count_ones())
                .map_or(first, |a| a.label),
            LabelOp::Heaviest => active
                .iter()
                .max_by_key(|a| a.label.count_ones())
                .map_or(first, |a| a.label),
            LabelOp::Invert => !first,
            LabelOp::ShiftLeft => {
                if shift >= LABEL_BITS {
                    0
                } else {
                    first << shift
                }
            }
            LabelOp::ShiftRight => {
                if shift >= LABEL_BITS {
                    0
                } else {
                    first >> shift
                }
            }
            LabelOp::RotateLeft => first.rotate_left(shift % LABEL_BITS),
            LabelOp::RotateRight => first.rotate_right(shift % LABEL_BITS),
        }
    }
}

//! Dimension and coordinate operand tokens.
//!
//! Operation specs express positions and sizes either as plain numbers
//! (`"150"`, `"37.5"`) or as percentages of an image axis (`"50%"`).
//! Percentages cannot be resolved when a rule is compiled because the
//! image dimensions they refer to are not known yet — and may change
//! between steps of a sequence (a crop before a resize changes what
//! `50%` means). Tokens are therefore kept symbolic until the moment an
//! operation runs, and resolved against the *current* axis size.
//!
//! Everything here is pure and IO-free.

use thiserror::Error;

/// Token that does not match the operand grammar.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid operand `{0}`")]
pub struct InvalidOperand(pub String);

/// A position or size operand, absolute or relative to an axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// Plain numeric value in pixels.
    Absolute(f64),
    /// Percentage of the axis size at resolution time.
    Percent(f64),
}

impl Operand {
    /// Parse a token: a number, or a number followed by `%`.
    pub fn parse(token: &str) -> Result<Self, InvalidOperand> {
        if let Some(number) = token.strip_suffix('%') {
            number
                .parse::<f64>()
                .map(Operand::Percent)
                .map_err(|_| InvalidOperand(token.to_string()))
        } else {
            token
                .parse::<f64>()
                .map(Operand::Absolute)
                .map_err(|_| InvalidOperand(token.to_string()))
        }
    }

    /// Resolve against an axis size, in pixels.
    ///
    /// Absolute operands resolve to themselves (rounded); percentages
    /// resolve to `round(axis * p / 100)`.
    pub fn resolve(self, axis: u32) -> i64 {
        match self {
            Operand::Absolute(v) => v.round() as i64,
            Operand::Percent(p) => (axis as f64 * p / 100.0).round() as i64,
        }
    }

    /// Resolve to a scale ratio of the axis.
    ///
    /// `50%` is the ratio 0.5 regardless of axis; an absolute value is
    /// its ratio to the axis size. Used by the aspect-preserving scale
    /// operations.
    pub fn ratio(self, axis: u32) -> f64 {
        match self {
            Operand::Absolute(v) => v / axis as f64,
            Operand::Percent(p) => p / 100.0,
        }
    }
}

/// A scale-operation constraint: an operand, or no constraint on that
/// axis (the `none` token).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleTarget {
    Bounded(Operand),
    Unbounded,
}

impl ScaleTarget {
    pub fn parse(token: &str) -> Result<Self, InvalidOperand> {
        if token.eq_ignore_ascii_case("none") {
            Ok(ScaleTarget::Unbounded)
        } else {
            Operand::parse(token).map(ScaleTarget::Bounded)
        }
    }

    /// Ratio of the constraint to the axis; unbounded axes contribute
    /// the identity ratio.
    pub fn ratio(self, axis: u32) -> f64 {
        match self {
            ScaleTarget::Bounded(op) => op.ratio(axis),
            ScaleTarget::Unbounded => 1.0,
        }
    }
}

//! Image derivation, implemented entirely in Rust.
//!
//! | Concern | Where |
//! |---|---|
//! | **Operand grammar** (`50%`, `none`) | [`operand`] |
//! | **Operation vocabulary + compiler** | [`ops`] |
//! | **Decode → apply → encode, mtime cache** | [`engine`] |
//!
//! Decoding, Lanczos3 resampling, flips, grayscale and 3×3 convolutions
//! all come from the `image` crate; the only subprocess in the whole
//! pipeline is the optional exiftool metadata copy (see [`crate::tags`]).

pub mod engine;
pub mod operand;
pub mod ops;

pub use engine::{DerivationRequest, Derived, DeriveError, Engine, supported_source_extensions};
pub use operand::{InvalidOperand, Operand, ScaleTarget};
pub use ops::{CompileError, CustomOp, CustomRef, FilterKind, Op, OpSpec};

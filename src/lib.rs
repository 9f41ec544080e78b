//! Residual vector quantization in pure Rust.
//!
//! A candle-based implementation of residual vector quantization (RVQ):
//! a continuous vector is approximated as a sum of codewords, one per stage,
//! with each stage quantizing what the previous stages left over.
//!
//! ## Architecture
//!
//! ```text
//! x → project_in ─→ stage 0 ─→ stage 1 ─→ … ─→ stage Q-1
//!                     │ q0        │ q1             │ q(Q-1)
//!                     └───────────┴──── Σ ─────────┘
//!                                       ↓
//!                                  project_out → x̂
//! ```
//!
//! Training can apply quantizer dropout (stop after a random stage) so the
//! model reconstructs well from coarse codes. Dropped stages report index
//! `-1` ([`SENTINEL_INDEX`]).
//!
//! ## Modules
//!
//! - [`residual`] — the residual engine, index ↔ code conversion
//! - [`grouped`] — independent residual quantizers over feature slices
//! - [`stage`] — single-stage quantizer trait and the Euclidean implementation
//! - [`codebook`] — shared, in-place mutable codebook tables
//! - [`dropout`] — dropout cutoff sampling and random-source selection
//! - [`dist`] — process-group interface for seed agreement
//! - [`config`] — serde-backed configuration

pub mod codebook;
pub mod config;
pub mod dist;
pub mod dropout;
pub mod grouped;
pub mod residual;
pub mod stage;

mod error;

pub use codebook::{Codebook, SharedCodebook};
pub use config::{GroupedResidualVqConfig, ResidualVqConfig, StageConfig};
pub use error::{Error, Result};
pub use grouped::{GroupedResidualVq, GroupedResidualVqOutput};
pub use residual::{
    ForwardOptions, IndexLossOutput, ResidualVq, ResidualVqOutput, SENTINEL_INDEX,
};
pub use stage::{LossBreakdown, StageOptions, StageOutput, StageQuantizer, VectorQuantizer};

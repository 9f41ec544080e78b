//! Error types for residual-vq.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration, raised at construction.
    #[error("config: {0}")]
    Config(String),

    /// A call-time precondition was violated by the caller.
    #[error("contract: {0}")]
    Contract(String),

    /// Number of per-group index sets does not match the group count.
    #[error("expected {expected} index sets (one per group), got {got}")]
    GroupMismatch { expected: usize, got: usize },

    /// No stage contributed a loss breakdown, so its mean is undefined.
    #[error("no stage produced a loss breakdown; cannot average an empty set")]
    EmptyLossBreakdown,

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

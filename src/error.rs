//! Error types for nano-decode-attn.

use thiserror::Error;

/// Result type alias for nano-decode-attn operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nano-decode-attn.
///
/// Everything here is raised at dispatch time, before any execution group
/// runs. A running group has no failure path.
#[derive(Error, Debug)]
pub enum Error {
    /// Tokens-per-block must be a non-zero power of two.
    #[error("invalid block size {0}: tokens per block must be a power of two")]
    InvalidBlockSize(usize),

    /// No kernel instantiation exists for this head dimension.
    #[error("unsupported head dimension {0}")]
    UnsupportedHeadDim(usize),

    /// The per-lane vector width does not divide the head dimension.
    #[error("vector width {vec_size} does not divide head dimension {head_dim}")]
    VectorWidth { head_dim: usize, vec_size: usize },

    /// The cache was laid out for a different quantization mode.
    #[error("quantization mode mismatch: cache holds {cache}, launch requested {requested}")]
    QuantModeMismatch { cache: String, requested: String },

    /// No candidate group size fits the scratch memory capacity.
    #[error("shared memory exhausted: need {required} bytes, {available} available")]
    SharedMemoryExhausted { required: usize, available: usize },

    /// A block table cannot address the tokens this step touches.
    #[error("block table for sequence {sequence} too short: need {required} blocks, have {available}")]
    BlockTableTooShort {
        sequence: usize,
        required: usize,
        available: usize,
    },

    /// Logical block index past the end of a block table.
    #[error("logical block {logical_idx} out of bounds (table holds {num_blocks})")]
    BlockIndexOutOfBounds {
        logical_idx: usize,
        num_blocks: usize,
    },

    /// Buffer length does not match the declared shape.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a length check.
    pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
        if expected != actual {
            return Err(Error::ShapeMismatch {
                what,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

//! nano-decode-attn: decode-time attention over a paged, quantized KV cache.
//!
//! One decode step appends a token to every live sequence and attends to its
//! history. This crate implements that step:
//! - 4/8-bit per-token quantized K/V with optional zero points
//! - Paged, streaming (sink + rolling local window) and linear addressing
//! - Dynamic sparse page selection for retrieval heads
//! - Single-block and split (multi-block) softmax reduction
//! - Kernel selection with a descending group-size fallback

pub mod config;
pub mod error;
pub mod logging;

pub mod attention;
pub mod core;

pub use attention::{
    decode_attention, decode_attention_tensors, AttentionParams, DecodeCaches, HeadRouting,
    LaunchReport, MultiBlockWorkspace,
};
pub use config::{
    AttentionConfig, CacheConfig, LaunchConfig, MultiBlockConfig, RotaryConfig, StreamingConfig,
};
pub use error::{Error, Result};

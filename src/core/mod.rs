//! Cache data model for nano-decode-attn.
//!
//! This module contains the storage side of decode attention:
//! - Quantized element codec
//! - Block tables, block layout and block pools
//! - Paged, streaming and linear cache addressors
//! - Dynamic sparse page remapping

pub mod block;
pub mod kv_cache;
pub mod quant;
pub mod sparse;
pub mod streaming;

pub use block::{BlockLayout, BlockPool, BlockTable};
pub use kv_cache::{
    CacheWrite, HeadKind, KvCacheAddressor, KvKind, KvStorage, LinearKvCache, PagedKvCache,
    SlotAddress, StreamingKvCache,
};
pub use quant::{BitWidth, KvCodec, QuantMode, TokenScale};
pub use sparse::{SparsePages, SparseRemap};
pub use streaming::StreamingWindow;

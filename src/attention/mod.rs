//! Decode attention engine.
//!
//! This module contains:
//! - Compute precision and lane emulation helpers
//! - Rotary position embedding for single decode vectors
//! - The attention reduction kernel and its split (multi-block) reduction
//! - Kernel selection and launch over a paged, quantized cache
//! - A float32 reference used for verification

pub mod dispatch;
pub mod element;
pub mod kernel;
pub mod multi_block;
pub mod params;
pub mod reference;
pub mod rotary;
pub mod simt;

pub use dispatch::{decode_attention, decode_attention_tensors, DecodeCaches, LaunchReport};
pub use element::Element;
pub use multi_block::{MultiBlockWorkspace, TilePlan};
pub use params::{AttentionParams, HeadRoute, HeadRouting};
pub use reference::{reference_decode_attention, reference_from_cache};
pub use rotary::RotaryEmbedding;

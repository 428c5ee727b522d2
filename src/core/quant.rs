//! Quantized element codec for the KV cache.
//!
//! Every cached token row (one head, `head_dim` channels) is stored with its
//! own affine parameters: `v ≈ q * scale + zero`. Parameters are kept as
//! `f16` in the block's metadata region, and quantization uses the rounded
//! `f16` values so that encode and decode agree exactly.
//!
//! ## Encodings
//!
//! | mode          | scale              | code range | stored as             |
//! |---------------|--------------------|------------|-----------------------|
//! | int8          | `max(|v|) / 127`   | -127..=127 | two's complement byte |
//! | int8 + zero   | `(max - min) / 255`| 0..=255    | unsigned byte         |
//! | int4          | `max(|v|) / 7`     | -7..=7     | nibble, offset by 8   |
//! | int4 + zero   | `(max - min) / 15` | 0..=15     | nibble                |
//!
//! Int4 packs channel `2i` into the low nibble and channel `2i + 1` into the
//! high nibble of byte `i`.

use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::attention::simt::tree_reduce;

/// Storage width of one cached element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitWidth {
    Int4,
    Int8,
}

impl BitWidth {
    /// Bits per element.
    pub fn bits(self) -> usize {
        match self {
            BitWidth::Int4 => 4,
            BitWidth::Int8 => 8,
        }
    }

    /// Bytes needed for `elems` packed elements.
    pub fn bytes_for(self, elems: usize) -> usize {
        match self {
            BitWidth::Int4 => elems.div_ceil(2),
            BitWidth::Int8 => elems,
        }
    }

    /// Largest code magnitude in symmetric mode.
    fn symmetric_max(self) -> f32 {
        match self {
            BitWidth::Int4 => 7.0,
            BitWidth::Int8 => 127.0,
        }
    }

    /// Largest code in zero-point mode.
    fn levels(self) -> f32 {
        match self {
            BitWidth::Int4 => 15.0,
            BitWidth::Int8 => 255.0,
        }
    }
}

/// Bit width plus zero-point flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuantMode {
    pub bits: BitWidth,
    pub with_zero_point: bool,
}

impl QuantMode {
    pub fn new(bits: BitWidth, with_zero_point: bool) -> Self {
        Self {
            bits,
            with_zero_point,
        }
    }
}

impl fmt::Display for QuantMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "int{}", self.bits.bits())?;
        if self.with_zero_point {
            write!(f, "+zero")?;
        }
        Ok(())
    }
}

/// Per-token, per-head dequantization parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TokenScale {
    pub scale: f16,
    pub zero: f16,
}

impl TokenScale {
    /// Compute the parameters for one token row.
    ///
    /// Max/min are found with a tree reduction over the row.
    pub fn compute(values: &[f32], mode: QuantMode) -> Self {
        if mode.with_zero_point {
            let max = tree_reduce(values.iter().copied(), f32::MIN, f32::max);
            let min = tree_reduce(values.iter().copied(), f32::MAX, f32::min);
            if values.is_empty() {
                return Self::default();
            }
            // The zero point never sits above the row minimum, so no code goes negative.
            let zero = f16_at_or_below(min);
            Self {
                scale: f16::from_f32((max - zero.to_f32()) / mode.bits.levels()),
                zero,
            }
        } else {
            let amax = tree_reduce(values.iter().map(|v| v.abs()), 0.0, f32::max);
            Self {
                scale: f16::from_f32(amax / mode.bits.symmetric_max()),
                zero: f16::ZERO,
            }
        }
    }

    /// Reciprocal of the stored scale, zero for a degenerate row.
    pub fn inv_scale(&self) -> f32 {
        let scale = self.scale.to_f32();
        if scale > 0.0 {
            1.0 / scale
        } else {
            0.0
        }
    }
}

/// Largest `f16` not greater than `x`.
fn f16_at_or_below(x: f32) -> f16 {
    let rounded = f16::from_f32(x);
    if rounded.to_f32() <= x || rounded.is_nan() {
        return rounded;
    }
    let bits = rounded.to_bits();
    let lower = if rounded.is_sign_negative() {
        bits + 1
    } else if bits == 0 {
        0x8001
    } else {
        bits - 1
    };
    f16::from_bits(lower)
}

/// Encoder/decoder for one storage width.
///
/// Kernels are instantiated per codec so the width is a compile-time choice.
pub trait KvCodec: Send + Sync + 'static {
    const WIDTH: BitWidth;

    /// Quantize `values` into `out` (`WIDTH.bytes_for(values.len())` bytes).
    fn encode(values: &[f32], params: TokenScale, with_zero: bool, out: &mut [u8]);

    /// Dequantize `out.len()` elements from `bytes`.
    fn decode(bytes: &[u8], params: TokenScale, with_zero: bool, out: &mut [f32]);
}

/// 8-bit codec.
#[derive(Debug, Clone, Copy)]
pub struct Int8Codec;

/// 4-bit codec, two elements per byte.
#[derive(Debug, Clone, Copy)]
pub struct Int4Codec;

#[inline]
fn quantize_level(v: f32, inv_scale: f32, zero: f32, with_zero: bool, width: BitWidth) -> i32 {
    if with_zero {
        ((v - zero) * inv_scale).round().clamp(0.0, width.levels()) as i32
    } else {
        let max = width.symmetric_max();
        (v * inv_scale).round().clamp(-max, max) as i32
    }
}

impl KvCodec for Int8Codec {
    const WIDTH: BitWidth = BitWidth::Int8;

    fn encode(values: &[f32], params: TokenScale, with_zero: bool, out: &mut [u8]) {
        let inv = params.inv_scale();
        let zero = params.zero.to_f32();
        for (byte, &v) in out.iter_mut().zip(values) {
            let q = quantize_level(v, inv, zero, with_zero, Self::WIDTH);
            *byte = if with_zero { q as u8 } else { q as i8 as u8 };
        }
    }

    fn decode(bytes: &[u8], params: TokenScale, with_zero: bool, out: &mut [f32]) {
        let scale = params.scale.to_f32();
        let zero = params.zero.to_f32();
        for (v, &byte) in out.iter_mut().zip(bytes) {
            *v = if with_zero {
                byte as f32 * scale + zero
            } else {
                (byte as i8) as f32 * scale
            };
        }
    }
}

impl KvCodec for Int4Codec {
    const WIDTH: BitWidth = BitWidth::Int4;

    fn encode(values: &[f32], params: TokenScale, with_zero: bool, out: &mut [u8]) {
        let inv = params.inv_scale();
        let zero = params.zero.to_f32();
        let code = |v: f32| {
            let q = quantize_level(v, inv, zero, with_zero, Self::WIDTH);
            (if with_zero { q } else { q + 8 }) as u8
        };
        for (byte, pair) in out.iter_mut().zip(values.chunks(2)) {
            let lo = code(pair[0]);
            let hi = pair.get(1).map_or(0, |&v| code(v));
            *byte = lo | (hi << 4);
        }
    }

    fn decode(bytes: &[u8], params: TokenScale, with_zero: bool, out: &mut [f32]) {
        let scale = params.scale.to_f32();
        let zero = params.zero.to_f32();
        let value = |nibble: u8| {
            if with_zero {
                nibble as f32 * scale + zero
            } else {
                (nibble as i32 - 8) as f32 * scale
            }
        };
        for (pair, &byte) in out.chunks_mut(2).zip(bytes) {
            pair[0] = value(byte & 0x0f);
            if let Some(hi) = pair.get_mut(1) {
                *hi = value(byte >> 4);
            }
        }
    }
}

/// Quantize one token row, returning the packed bytes and its parameters.
pub fn quantize(values: &[f32], mode: QuantMode) -> (Vec<u8>, TokenScale) {
    let params = TokenScale::compute(values, mode);
    let mut packed = vec![0u8; mode.bits.bytes_for(values.len())];
    encode_with(mode, values, params, &mut packed);
    (packed, params)
}

/// Dequantize `len` elements of a packed token row.
pub fn dequantize(packed: &[u8], params: TokenScale, mode: QuantMode, len: usize) -> Vec<f32> {
    let mut values = vec![0.0f32; len];
    decode_with(mode, packed, params, &mut values);
    values
}

/// Encode with the codec selected by `mode` at runtime.
pub fn encode_with(mode: QuantMode, values: &[f32], params: TokenScale, out: &mut [u8]) {
    match mode.bits {
        BitWidth::Int8 => Int8Codec::encode(values, params, mode.with_zero_point, out),
        BitWidth::Int4 => Int4Codec::encode(values, params, mode.with_zero_point, out),
    }
}

/// Decode with the codec selected by `mode` at runtime.
pub fn decode_with(mode: QuantMode, packed: &[u8], params: TokenScale, out: &mut [f32]) {
    match mode.bits {
        BitWidth::Int8 => Int8Codec::decode(packed, params, mode.with_zero_point, out),
        BitWidth::Int4 => Int4Codec::decode(packed, params, mode.with_zero_point, out),
    }
}

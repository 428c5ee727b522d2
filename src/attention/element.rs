//! Compute precision of Q/K/V and output buffers.

use candle_core::WithDType;
use half::{bf16, f16};

/// Floating point type the kernel loads and stores.
///
/// Scores and accumulators are always `f32`; this only fixes the buffer
/// type and the per-lane vector width (16 bytes per lane load).
pub trait Element: WithDType + Send + Sync {
    /// Elements in one 16-byte lane vector.
    const VEC_SIZE: usize = 16 / std::mem::size_of::<Self>();

    fn to_f32(self) -> f32;

    fn from_f32(value: f32) -> Self;
}

impl Element for f32 {
    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Element for f16 {
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl Element for bf16 {
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_sizes() {
        assert_eq!(<f32 as Element>::VEC_SIZE, 4);
        assert_eq!(<f16 as Element>::VEC_SIZE, 8);
        assert_eq!(<bf16 as Element>::VEC_SIZE, 8);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(<f16 as Element>::from_f32(1.5).to_f32(), 1.5);
        assert_eq!(<bf16 as Element>::from_f32(-2.0).to_f32(), -2.0);
    }
}

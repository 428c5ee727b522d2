//! Rotary Position Embeddings (RoPE) for single decode vectors.
//!
//! RoPE encodes position information by rotating pairs of elements in the
//! query and key vectors, so `dot(rotate(q, pos_q), rotate(k, pos_k))`
//! depends on `pos_q - pos_k`.
//!
//! Pairs follow the two-half (GPT-NeoX) scheme: channel `i` pairs with
//! channel `i + dim / 2`. Only the leading `dim` channels of a head are
//! rotated.
//!
//! Reference: <https://arxiv.org/abs/2104.09864>

use crate::config::{RotaryConfig, RotaryScaling};

/// Rotary embedding applied to one head vector at a time.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Rotated channels (0 disables rotation).
    dim: usize,
    base: f64,
    scaling: RotaryScaling,
    max_positions: usize,
    /// `base^(-2i/dim)` for i in 0..dim/2, at the unscaled base.
    inv_freq: Vec<f64>,
}

impl RotaryEmbedding {
    /// Creates an embedding rotating the first `dim` channels.
    ///
    /// # Panics
    ///
    /// Panics if `dim` is not even (rotation requires pairs).
    pub fn new(dim: usize, base: f32, scaling: RotaryScaling, max_positions: usize) -> Self {
        assert!(dim % 2 == 0, "RoPE dimension must be even");
        let base = base as f64;
        Self {
            dim,
            base,
            scaling,
            max_positions,
            inv_freq: Self::inv_freq(dim, base),
        }
    }

    /// Creates an embedding from configuration.
    pub fn from_config(config: &RotaryConfig) -> Self {
        Self::new(config.dim, config.base, config.scaling, config.max_positions)
    }

    fn inv_freq(dim: usize, base: f64) -> Vec<f64> {
        (0..dim / 2)
            .map(|i| 1.0 / base.powf(2.0 * i as f64 / dim as f64))
            .collect()
    }

    /// Returns the rotated dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Effective (base, position scale) for a sequence of `seq_len` tokens.
    pub fn base_and_scale(&self, seq_len: usize) -> (f64, f64) {
        match self.scaling {
            RotaryScaling::None => (self.base, 1.0),
            RotaryScaling::Linear { factor } => (self.base, 1.0 / factor as f64),
            RotaryScaling::DynamicNtk { factor } => {
                if seq_len <= self.max_positions || self.dim <= 2 {
                    return (self.base, 1.0);
                }
                let factor = factor as f64;
                let b = factor * seq_len as f64 / self.max_positions as f64 - (factor - 1.0);
                let p = self.dim as f64 / (self.dim as f64 - 2.0);
                (self.base * b.powf(p), 1.0)
            }
        }
    }

    /// Rotates `x` in place for token `position` of a `seq_len`-token sequence.
    ///
    /// Formula: `x_rot = x * cos + rotate_half(x) * sin`
    /// where `rotate_half([x1, x2]) = [-x2, x1]` over the two halves.
    pub fn apply(&self, x: &mut [f32], position: usize, seq_len: usize) {
        if self.dim == 0 {
            return;
        }
        let (base, scale) = self.base_and_scale(seq_len);
        let rescaled;
        let inv_freq = if base == self.base {
            &self.inv_freq
        } else {
            rescaled = Self::inv_freq(self.dim, base);
            &rescaled
        };

        let half = self.dim / 2;
        let pos = position as f64 * scale;
        let (x1, x2) = x[..self.dim].split_at_mut(half);
        for ((a, b), &freq) in x1.iter_mut().zip(x2.iter_mut()).zip(inv_freq) {
            let (sin, cos) = (pos * freq).sin_cos();
            let (sin, cos) = (sin as f32, cos as f32);
            let (lo, hi) = (*a, *b);
            *a = lo * cos - hi * sin;
            *b = hi * cos + lo * sin;
        }
    }
}

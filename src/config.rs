//! Configuration types for nano-decode-attn.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::attention::dispatch::SUPPORTED_HEAD_DIMS;
use crate::attention::simt::WARP_SIZE;
use crate::core::quant::{BitWidth, QuantMode};
use crate::error::{Error, Result};

/// Quantized cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per cache block (power of two).
    pub tokens_per_block: usize,
    /// Storage width of one cached element.
    pub bits: BitWidth,
    /// Store a per-token zero point next to the scale.
    pub with_zero_point: bool,
    /// Tokens per statistics sub-chunk for the external page scorer.
    /// `None` disables the statistics region.
    pub sub_chunk_tokens: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tokens_per_block: 64,
            bits: BitWidth::Int8,
            with_zero_point: false,
            sub_chunk_tokens: None,
        }
    }
}

impl CacheConfig {
    /// Quantization mode implied by this configuration.
    pub fn quant_mode(&self) -> QuantMode {
        QuantMode::new(self.bits, self.with_zero_point)
    }
}

/// Streaming (sink + rolling local window) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Tokens kept permanently at the start of the sequence.
    pub sink_tokens: usize,
    /// Blocks reserved for sink tokens.
    pub sink_blocks: usize,
    /// Size of the rolling local window in tokens.
    pub local_tokens: usize,
    /// Blocks the local window rotates through.
    pub local_blocks: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            sink_tokens: 64,
            sink_blocks: 1,
            local_tokens: 256,
            local_blocks: 4,
        }
    }
}

/// Split (multi-block) reduction configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiBlockConfig {
    /// Allow splitting long contexts across execution groups.
    pub enabled: bool,
    /// Iteration length above which splitting activates.
    pub switch_threshold: usize,
    /// Upper bound on partitions per (batch, head).
    pub max_seq_len_tile: usize,
    /// Lower bound on timesteps handled by one partition.
    pub min_timesteps_per_block: usize,
    /// Number of parallel processors the grid should cover.
    pub multi_processor_count: usize,
}

impl Default for MultiBlockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            switch_threshold: 2048,
            max_seq_len_tile: 64,
            min_timesteps_per_block: 256,
            multi_processor_count: 108,
        }
    }
}

/// Position scaling applied by the rotary embedding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RotaryScaling {
    /// Plain rotary embedding.
    None,
    /// Positions are divided by `factor`.
    Linear { factor: f32 },
    /// Base is rescaled once the sequence outgrows `max_positions`.
    DynamicNtk { factor: f32 },
}

/// Rotary embedding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotaryConfig {
    /// Number of leading channels rotated (0 disables rotary).
    pub dim: usize,
    /// Base frequency.
    pub base: f32,
    /// Position scaling.
    pub scaling: RotaryScaling,
    /// Trained context length, used by dynamic scaling.
    pub max_positions: usize,
}

impl Default for RotaryConfig {
    fn default() -> Self {
        Self {
            dim: 128,
            base: 10000.0,
            scaling: RotaryScaling::None,
            max_positions: 4096,
        }
    }
}

/// Execution group sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Scratch memory available to one execution group, in bytes.
    pub shared_memory_bytes: usize,
    /// Group sizes to try, largest first.
    pub threads_per_block_candidates: Vec<usize>,
    /// Iteration length up to which token metadata is gathered ahead of the key pass.
    pub smem_preload_switch: usize,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            shared_memory_bytes: 48 * 1024,
            threads_per_block_candidates: vec![256, 128, 64],
            smem_preload_switch: 2048,
        }
    }
}

/// Full decode attention configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of key/value heads (for GQA).
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    pub cache: CacheConfig,
    pub streaming: StreamingConfig,
    pub multi_block: MultiBlockConfig,
    pub rotary: RotaryConfig,
    pub launch: LaunchConfig,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        // Llama-style 8B geometry
        Self {
            num_heads: 32,
            num_kv_heads: 8,
            head_dim: 128,
            cache: CacheConfig::default(),
            streaming: StreamingConfig::default(),
            multi_block: MultiBlockConfig::default(),
            rotary: RotaryConfig::default(),
            launch: LaunchConfig::default(),
        }
    }
}

impl AttentionConfig {
    /// Query heads sharing one key/value head.
    pub fn qheads_per_kv(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Score scaling factor `1 / sqrt(head_dim)`.
    pub fn inv_sqrt_dh(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Check every configuration invariant the dispatcher relies on.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.num_kv_heads == 0 {
            return Err(Error::Config("head counts must be non-zero".into()));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(Error::Config(format!(
                "num_heads {} is not a multiple of num_kv_heads {}",
                self.num_heads, self.num_kv_heads
            )));
        }
        if !SUPPORTED_HEAD_DIMS.contains(&self.head_dim) {
            return Err(Error::UnsupportedHeadDim(self.head_dim));
        }

        let tpb = self.cache.tokens_per_block;
        if !tpb.is_power_of_two() {
            return Err(Error::InvalidBlockSize(tpb));
        }
        if let Some(sub) = self.cache.sub_chunk_tokens {
            if sub == 0 || tpb % sub != 0 {
                return Err(Error::Config(format!(
                    "sub_chunk_tokens {sub} must divide tokens_per_block {tpb}"
                )));
            }
        }

        let s = &self.streaming;
        if s.local_blocks == 0 || s.local_tokens == 0 {
            return Err(Error::Config("streaming local window cannot be empty".into()));
        }
        if s.sink_tokens > s.sink_blocks * tpb || s.local_tokens > s.local_blocks * tpb {
            return Err(Error::Config(format!(
                "streaming window {}+{} tokens does not fit {}+{} blocks of {tpb}",
                s.sink_tokens, s.local_tokens, s.sink_blocks, s.local_blocks
            )));
        }

        if self.rotary.dim > self.head_dim || self.rotary.dim % 2 != 0 {
            return Err(Error::Config(format!(
                "rotary dim {} must be even and at most head_dim {}",
                self.rotary.dim, self.head_dim
            )));
        }

        let mb = &self.multi_block;
        if mb.max_seq_len_tile == 0 || mb.min_timesteps_per_block == 0 {
            return Err(Error::Config("multi-block tile bounds must be non-zero".into()));
        }

        let candidates = &self.launch.threads_per_block_candidates;
        if candidates.is_empty() {
            return Err(Error::Config("no execution group size candidates".into()));
        }
        if let Some(bad) = candidates
            .iter()
            .find(|&&t| !t.is_power_of_two() || t < WARP_SIZE)
        {
            return Err(Error::Config(format!(
                "group size {bad} must be a power of two of at least {WARP_SIZE}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AttentionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.qheads_per_kv(), 4);
        assert!((config.inv_sqrt_dh() - 1.0 / 128f32.sqrt()).abs() < 1e-7);
    }

    #[test]
    fn test_rejects_non_power_of_two_block() {
        let mut config = AttentionConfig::default();
        config.cache.tokens_per_block = 48;
        assert!(matches!(config.validate(), Err(Error::InvalidBlockSize(48))));
    }

    #[test]
    fn test_rejects_unsupported_head_dim() {
        let mut config = AttentionConfig::default();
        config.head_dim = 72;
        config.rotary.dim = 64;
        assert!(matches!(config.validate(), Err(Error::UnsupportedHeadDim(72))));
    }

    #[test]
    fn test_rejects_overlapping_window() {
        let mut config = AttentionConfig::default();
        config.streaming.local_tokens = 5 * config.cache.tokens_per_block;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AttentionConfig =
            serde_json::from_str(r#"{"head_dim": 64, "rotary": {"dim": 64}}"#).unwrap();
        assert_eq!(config.head_dim, 64);
        assert_eq!(config.rotary.base, 10000.0);
        assert_eq!(config.cache.tokens_per_block, 64);
    }

    #[test]
    fn test_json_file_round_trip() {
        let mut config = AttentionConfig::default();
        config.cache.bits = BitWidth::Int4;
        config.rotary.scaling = RotaryScaling::DynamicNtk { factor: 2.0 };

        let path = std::env::temp_dir().join(format!(
            "nano-decode-attn-config-{}.json",
            std::process::id()
        ));
        config.to_json_file(&path).unwrap();
        let loaded = AttentionConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, config);
    }
}

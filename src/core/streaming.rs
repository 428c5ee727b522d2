//! Streaming window: permanent sink tokens plus a rolling local window.
//!
//! Logical blocks below `sink_blocks` map to themselves. Every later block
//! rotates through `local_blocks` table slots, so a new block overwrites the
//! oldest slot in its modulo class and no data ever moves:
//!
//! ```text
//! logical:  0 | 1 2 3 4 5 6 ...
//! slot:     0 | 1 2 1 2 1 2 ...      (sink_blocks = 1, local_blocks = 2)
//! ```
//!
//! Tokens are written in strictly increasing order, which is what makes the
//! overwritten slot the least recently used one.

use crate::config::StreamingConfig;
use crate::error::{Error, Result};

/// Sink and local window sizes for one streaming cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingWindow {
    sink_tokens: usize,
    sink_blocks: usize,
    local_tokens: usize,
    local_blocks: usize,
}

impl StreamingWindow {
    /// Create a window for blocks of `tokens_per_block` tokens.
    ///
    /// # Errors
    ///
    /// Fails if the local window is empty or either token range does not fit
    /// its blocks.
    pub fn new(
        sink_tokens: usize,
        sink_blocks: usize,
        local_tokens: usize,
        local_blocks: usize,
        tokens_per_block: usize,
    ) -> Result<Self> {
        if local_blocks == 0 || local_tokens == 0 {
            return Err(Error::Config("streaming local window cannot be empty".into()));
        }
        if sink_tokens > sink_blocks * tokens_per_block
            || local_tokens > local_blocks * tokens_per_block
        {
            return Err(Error::Config(format!(
                "streaming window {sink_tokens}+{local_tokens} tokens does not fit \
                 {sink_blocks}+{local_blocks} blocks of {tokens_per_block}"
            )));
        }
        Ok(Self {
            sink_tokens,
            sink_blocks,
            local_tokens,
            local_blocks,
        })
    }

    /// Build from configuration.
    pub fn from_config(config: &StreamingConfig, tokens_per_block: usize) -> Result<Self> {
        Self::new(
            config.sink_tokens,
            config.sink_blocks,
            config.local_tokens,
            config.local_blocks,
            tokens_per_block,
        )
    }

    pub fn sink_tokens(&self) -> usize {
        self.sink_tokens
    }

    pub fn sink_blocks(&self) -> usize {
        self.sink_blocks
    }

    pub fn local_tokens(&self) -> usize {
        self.local_tokens
    }

    pub fn local_blocks(&self) -> usize {
        self.local_blocks
    }

    /// Table slots a sequence needs once the window is full.
    pub fn table_blocks(&self) -> usize {
        self.sink_blocks + self.local_blocks
    }

    /// Map a logical block index to its block-table slot.
    pub fn remap_block(&self, logical_block: usize) -> usize {
        if logical_block < self.sink_blocks {
            logical_block
        } else {
            self.sink_blocks + (logical_block - self.sink_blocks) % self.local_blocks
        }
    }

    /// Number of history positions a step iterates for context length `ctx`.
    ///
    /// The current token is the remaining one of `sink + local`.
    pub fn valid_length(&self, ctx: usize) -> usize {
        (self.sink_tokens + self.local_tokens)
            .saturating_sub(1)
            .min(ctx)
    }

    /// Logical token visited at iteration position `i`, if it is visible.
    ///
    /// Positions past the sink jump over the evicted gap.
    pub fn logical_token(&self, i: usize, ctx: usize) -> Option<usize> {
        let gap = ctx - self.valid_length(ctx);
        let logical = if i >= self.sink_tokens { i + gap } else { i };
        self.is_visible(logical, ctx).then_some(logical)
    }

    /// Whether token `t` is still retained at context length `ctx`.
    pub fn is_visible(&self, t: usize, ctx: usize) -> bool {
        t < ctx && (t < self.sink_tokens || t + self.local_tokens >= ctx)
    }

    /// All history tokens a step at context length `ctx` attends to.
    pub fn visible_tokens(&self, ctx: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.valid_length(ctx)).filter_map(move |i| self.logical_token(i, ctx))
    }
}

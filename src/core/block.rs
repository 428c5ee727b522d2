//! Block abstractions for the paged, quantized KV cache.
//!
//! ## Memory Layout
//!
//! One cache block is a flat byte buffer:
//!
//! ```text
//! [heads, tokens_per_block, head_dim]   quantized elements
//! [tokens_per_block, heads]             f16 scales
//! [tokens_per_block, heads]             f16 zero points (zero-point mode only)
//! [sub_chunks, heads, head_dim]         f16 running max  (statistics only)
//! [sub_chunks, heads, head_dim]         f16 running min  (statistics only)
//! ```
//!
//! Int4 elements take half a byte, so a row of `head_dim` channels is
//! `head_dim / 2` bytes. Statistics are only kept on key blocks.

use half::f16;

use crate::core::quant::{QuantMode, TokenScale};
use crate::error::{Error, Result};

const HALF_BYTES: usize = std::mem::size_of::<f16>();

/// Maps a sequence's logical block positions to physical block IDs.
///
/// Token at position `p` is stored in:
/// - Logical block: `p / block_size`
/// - Slot within block: `p % block_size`
/// - Physical block: `block_ids[p / block_size]`
///
/// Streaming caches insert a remap between the logical block and the table
/// slot, see [`StreamingWindow`](super::streaming::StreamingWindow).
///
/// # Example
///
/// ```
/// use nano_decode_attn::core::block::BlockTable;
///
/// let mut table = BlockTable::new(16);
/// table.append_block(5);   // Tokens 0-15
/// table.append_block(12);  // Tokens 16-31
/// table.append_block(3);   // Tokens 32-47
///
/// // Token 20 -> logical block 1 -> physical block 12
/// assert_eq!(table.get_block_id(20 / 16).unwrap(), 12);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockTable {
    /// Physical block IDs in logical order.
    block_ids: Vec<usize>,
    /// Number of tokens per block.
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_ids: Vec::new(),
            block_size,
        }
    }

    /// Create a block table from existing physical IDs.
    pub fn from_ids(block_size: usize, block_ids: impl Into<Vec<usize>>) -> Self {
        Self {
            block_ids: block_ids.into(),
            block_size,
        }
    }

    /// Get the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get physical block ID for a logical block index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockIndexOutOfBounds`] if the logical block index
    /// is not allocated.
    pub fn get_block_id(&self, logical_block_idx: usize) -> Result<usize> {
        self.block_ids
            .get(logical_block_idx)
            .copied()
            .ok_or(Error::BlockIndexOutOfBounds {
                logical_idx: logical_block_idx,
                num_blocks: self.block_ids.len(),
            })
    }

    /// Physical block ID on the kernel hot path.
    ///
    /// Table capacity is checked once per launch, so this indexes directly.
    pub(crate) fn block_at(&self, table_slot: usize) -> usize {
        self.block_ids[table_slot]
    }

    /// Add a new physical block to the table.
    pub fn append_block(&mut self, block_id: usize) {
        self.block_ids.push(block_id);
    }

    /// Number of blocks allocated to this sequence.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Get all physical block IDs for this sequence.
    pub fn get_physical_block_ids(&self) -> &[usize] {
        &self.block_ids
    }
}

/// Compute number of blocks needed for a sequence of given length.
///
/// ```
/// use nano_decode_attn::core::block::compute_num_blocks;
///
/// assert_eq!(compute_num_blocks(35, 16), 3);
/// assert_eq!(compute_num_blocks(32, 16), 2);
/// assert_eq!(compute_num_blocks(0, 16), 0);
/// ```
pub fn compute_num_blocks(seq_len: usize, block_size: usize) -> usize {
    seq_len.div_ceil(block_size)
}

/// Byte layout of one cache block.
///
/// Fixed at construction; every offset below is a pure function of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    tokens_per_block: usize,
    num_heads: usize,
    head_dim: usize,
    mode: QuantMode,
    sub_chunk_tokens: Option<usize>,
}

impl BlockLayout {
    /// Layout without statistics.
    pub fn new(
        tokens_per_block: usize,
        num_heads: usize,
        head_dim: usize,
        mode: QuantMode,
    ) -> Self {
        Self {
            tokens_per_block,
            num_heads,
            head_dim,
            mode,
            sub_chunk_tokens: None,
        }
    }

    /// Add the per-sub-chunk (max, min) statistics region.
    ///
    /// A sub-chunk must be non-empty and evenly divide the block.
    pub fn with_statistics(mut self, sub_chunk_tokens: Option<usize>) -> Result<Self> {
        if let Some(sub) = sub_chunk_tokens {
            if sub == 0 || self.tokens_per_block % sub != 0 {
                return Err(Error::Config(format!(
                    "statistics sub-chunk of {sub} tokens does not divide a {}-token block",
                    self.tokens_per_block
                )));
            }
        }
        self.sub_chunk_tokens = sub_chunk_tokens;
        Ok(self)
    }

    /// Same layout with the statistics region dropped.
    pub fn without_statistics(mut self) -> Self {
        self.sub_chunk_tokens = None;
        self
    }

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }

    /// Heads stored in this cache (not the model's total).
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn mode(&self) -> QuantMode {
        self.mode
    }

    pub fn sub_chunk_tokens(&self) -> Option<usize> {
        self.sub_chunk_tokens
    }

    /// Bytes of one quantized token row.
    pub fn row_bytes(&self) -> usize {
        self.mode.bits.bytes_for(self.head_dim)
    }

    /// Bytes of the quantized element region.
    pub fn data_bytes(&self) -> usize {
        self.num_heads * self.tokens_per_block * self.row_bytes()
    }

    fn metadata_entries(&self) -> usize {
        self.tokens_per_block * self.num_heads
    }

    /// Offset of the scale region.
    pub fn scales_offset(&self) -> usize {
        self.data_bytes()
    }

    /// Offset of the zero-point region, if present.
    pub fn zeros_offset(&self) -> Option<usize> {
        self.mode
            .with_zero_point
            .then(|| self.scales_offset() + self.metadata_entries() * HALF_BYTES)
    }

    /// Bytes of the scale plus zero-point regions.
    pub fn metadata_bytes(&self) -> usize {
        let regions = if self.mode.with_zero_point { 2 } else { 1 };
        regions * self.metadata_entries() * HALF_BYTES
    }

    /// Number of statistics sub-chunks per block.
    pub fn num_sub_chunks(&self) -> usize {
        self.sub_chunk_tokens
            .map_or(0, |sub| self.tokens_per_block / sub)
    }

    /// Offset of the statistics region, if present.
    pub fn stats_offset(&self) -> Option<usize> {
        self.sub_chunk_tokens
            .map(|_| self.scales_offset() + self.metadata_bytes())
    }

    /// Elements of one statistics vector (all heads).
    fn indicator_elems(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Bytes of the statistics region.
    pub fn stats_bytes(&self) -> usize {
        2 * self.num_sub_chunks() * self.indicator_elems() * HALF_BYTES
    }

    /// Total bytes of one block.
    pub fn block_bytes(&self) -> usize {
        self.data_bytes() + self.metadata_bytes() + self.stats_bytes()
    }

    /// Byte offset of `channel` of token slot `local` for `head_rank`.
    pub fn element_offset(&self, local: usize, head_rank: usize, channel: usize) -> usize {
        let bits = self.mode.bits.bits();
        (head_rank * self.tokens_per_block + local) * self.row_bytes() + channel * bits / 8
    }

    /// Index of the (scale, zero) entry for a token slot and head.
    pub fn metadata_index(&self, local: usize, head_rank: usize) -> usize {
        local * self.num_heads + head_rank
    }

    /// Byte offsets of the running (max, min) vectors covering slot `local`.
    pub fn stats_offsets(&self, local: usize, head_rank: usize) -> Option<(usize, usize)> {
        let sub = self.sub_chunk_tokens?;
        let base = self.stats_offset()?;
        let elems = self.indicator_elems();
        let within = (local / sub) * elems + head_rank * self.head_dim;
        let max = base + within * HALF_BYTES;
        let min = base + (self.num_sub_chunks() * elems + within) * HALF_BYTES;
        Some((max, min))
    }
}

/// Arena of equally sized cache blocks.
///
/// Allocation policy lives outside this crate; the pool only owns bytes.
#[derive(Debug, Clone)]
pub struct BlockPool {
    layout: BlockLayout,
    num_blocks: usize,
    bytes: Vec<u8>,
}

impl BlockPool {
    /// Create a zeroed pool of `num_blocks` blocks.
    pub fn new(layout: BlockLayout, num_blocks: usize) -> Self {
        Self {
            layout,
            num_blocks,
            bytes: vec![0u8; layout.block_bytes() * num_blocks],
        }
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Raw bytes of one block.
    pub fn block(&self, block_id: usize) -> &[u8] {
        let size = self.layout.block_bytes();
        &self.bytes[block_id * size..(block_id + 1) * size]
    }

    fn block_mut(&mut self, block_id: usize) -> &mut [u8] {
        let size = self.layout.block_bytes();
        &mut self.bytes[block_id * size..(block_id + 1) * size]
    }

    /// Packed row of one token for one head.
    pub fn row(&self, block_id: usize, local: usize, head_rank: usize) -> &[u8] {
        let start = self.layout.element_offset(local, head_rank, 0);
        &self.block(block_id)[start..start + self.layout.row_bytes()]
    }

    /// Dequantization parameters of one token for one head.
    pub fn token_scale(&self, block_id: usize, local: usize, head_rank: usize) -> TokenScale {
        let block = self.block(block_id);
        let index = self.layout.metadata_index(local, head_rank);
        let scale = read_half(block, self.layout.scales_offset() + index * HALF_BYTES);
        let zero = self
            .layout
            .zeros_offset()
            .map_or(f16::ZERO, |off| read_half(block, off + index * HALF_BYTES));
        TokenScale { scale, zero }
    }

    /// Store one quantized row and its parameters.
    pub fn write_row(
        &mut self,
        block_id: usize,
        local: usize,
        head_rank: usize,
        packed: &[u8],
        params: TokenScale,
    ) {
        let layout = self.layout;
        let start = layout.element_offset(local, head_rank, 0);
        let index = layout.metadata_index(local, head_rank);
        let block = self.block_mut(block_id);

        block[start..start + layout.row_bytes()].copy_from_slice(packed);
        write_half(block, layout.scales_offset() + index * HALF_BYTES, params.scale);
        if let Some(off) = layout.zeros_offset() {
            write_half(block, off + index * HALF_BYTES, params.zero);
        }
    }

    /// Fold a key row into the running statistics of its sub-chunk.
    ///
    /// The first token of a sub-chunk resets the statistics to itself.
    pub fn update_statistics(
        &mut self,
        block_id: usize,
        local: usize,
        head_rank: usize,
        key: &[f32],
    ) {
        let layout = self.layout;
        let (Some((max_off, min_off)), Some(sub)) =
            (layout.stats_offsets(local, head_rank), layout.sub_chunk_tokens())
        else {
            return;
        };
        let reset = local % sub == 0;
        let block = self.block_mut(block_id);

        for (c, &k) in key.iter().enumerate().take(layout.head_dim()) {
            let max_at = max_off + c * HALF_BYTES;
            let min_at = min_off + c * HALF_BYTES;
            let k = f16::from_f32(k);
            let (max, min) = if reset {
                (k, k)
            } else {
                (read_half(block, max_at).max(k), read_half(block, min_at).min(k))
            };
            write_half(block, max_at, max);
            write_half(block, min_at, min);
        }
    }

    /// Running (max, min) vectors of one sub-chunk for one head.
    pub fn statistics(
        &self,
        block_id: usize,
        sub_chunk: usize,
        head_rank: usize,
    ) -> Option<(Vec<f32>, Vec<f32>)> {
        let sub = self.layout.sub_chunk_tokens()?;
        let (max_off, min_off) = self.layout.stats_offsets(sub_chunk * sub, head_rank)?;
        let block = self.block(block_id);
        let read = |base: usize| {
            (0..self.layout.head_dim())
                .map(|c| read_half(block, base + c * HALF_BYTES).to_f32())
                .collect::<Vec<_>>()
        };
        Some((read(max_off), read(min_off)))
    }
}

fn read_half(bytes: &[u8], offset: usize) -> f16 {
    f16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn write_half(bytes: &mut [u8], offset: usize, value: f16) {
    bytes[offset..offset + HALF_BYTES].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::quant::{quantize, BitWidth};

    fn int8() -> QuantMode {
        QuantMode::new(BitWidth::Int8, false)
    }

    #[test]
    fn test_block_table_basic() {
        let mut table = BlockTable::new(16);
        assert!(table.is_empty());

        table.append_block(5);
        table.append_block(12);
        table.append_block(3);

        assert_eq!(table.num_blocks(), 3);
        assert_eq!(table.get_physical_block_ids(), &[5, 12, 3]);
        assert_eq!(table.get_block_id(1).unwrap(), 12);
        assert!(table.get_block_id(3).is_err());
    }

    #[test]
    fn test_layout_int8_no_zero() {
        let layout = BlockLayout::new(16, 4, 64, int8());
        assert_eq!(layout.row_bytes(), 64);
        assert_eq!(layout.data_bytes(), 4 * 16 * 64);
        assert_eq!(layout.scales_offset(), 4096);
        assert_eq!(layout.zeros_offset(), None);
        assert_eq!(layout.metadata_bytes(), 16 * 4 * 2);
        assert_eq!(layout.block_bytes(), 4096 + 128);
        // head 2, slot 3, channel 5
        assert_eq!(layout.element_offset(3, 2, 5), 2 * 16 * 64 + 3 * 64 + 5);
        assert_eq!(layout.metadata_index(3, 2), 3 * 4 + 2);
    }

    #[test]
    fn test_layout_int4_zero_with_statistics() {
        let mode = QuantMode::new(BitWidth::Int4, true);
        let layout = BlockLayout::new(16, 2, 64, mode).with_statistics(Some(4)).unwrap();
        assert_eq!(layout.row_bytes(), 32);
        assert_eq!(layout.data_bytes(), 2 * 16 * 32);
        assert_eq!(layout.zeros_offset(), Some(1024 + 16 * 2 * 2));
        assert_eq!(layout.metadata_bytes(), 2 * 16 * 2 * 2);
        assert_eq!(layout.num_sub_chunks(), 4);
        assert_eq!(layout.stats_offset(), Some(1024 + 128));
        assert_eq!(layout.stats_bytes(), 2 * 4 * 128 * 2);
        // channel 7 sits in byte 3
        assert_eq!(layout.element_offset(0, 1, 7), 16 * 32 + 3);

        let (max, min) = layout.stats_offsets(9, 1).unwrap();
        assert_eq!(max, 1152 + (2 * 128 + 64) * 2);
        assert_eq!(min, 1152 + (4 * 128 + 2 * 128 + 64) * 2);
    }

    #[test]
    fn test_pool_row_and_scale() {
        let layout = BlockLayout::new(8, 2, 16, int8());
        let mut pool = BlockPool::new(layout, 3);
        let values: Vec<f32> = (0..16).map(|i| i as f32 - 8.0).collect();
        let (packed, params) = quantize(&values, int8());

        pool.write_row(2, 5, 1, &packed, params);
        assert_eq!(pool.row(2, 5, 1), packed.as_slice());
        assert_eq!(pool.token_scale(2, 5, 1), params);
        // neighbours untouched
        assert!(pool.row(2, 5, 0).iter().all(|&b| b == 0));
        assert!(pool.block(1).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_statistics_reset_and_fold() {
        let layout = BlockLayout::new(8, 1, 4, int8()).with_statistics(Some(4)).unwrap();
        let mut pool = BlockPool::new(layout, 1);

        pool.update_statistics(0, 4, 0, &[1.0, -1.0, 2.0, 0.5]);
        pool.update_statistics(0, 5, 0, &[3.0, -2.0, 1.0, 0.5]);
        let (max, min) = pool.statistics(0, 1, 0).unwrap();
        assert_eq!(max, vec![3.0, -1.0, 2.0, 0.5]);
        assert_eq!(min, vec![1.0, -2.0, 1.0, 0.5]);

        // sub-chunk 0 untouched
        let (max0, _) = pool.statistics(0, 0, 0).unwrap();
        assert_eq!(max0, vec![0.0; 4]);
    }
}

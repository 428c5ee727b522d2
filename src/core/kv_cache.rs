//! KV cache storage and the cache-addressor interface.
//!
//! A cache owns two [`BlockPool`]s (keys and values) and one pair of block
//! tables per sequence slot. How a logical token finds its block is the job
//! of the addressor:
//!
//! - [`PagedKvCache`]: `table[t >> log2(tpb)]`, slot `t & (tpb - 1)`.
//! - [`StreamingKvCache`]: as paged, with the block index passed through a
//!   [`StreamingWindow`] remap first.
//! - [`LinearKvCache`]: one block per sequence spanning `max_seq_len` tokens,
//!   so the element offset is `head * max_seq_len * dh + t * dh + c`.
//!
//! The kernel is generic over [`KvCacheAddressor`] and never sees which
//! variant it is driving.

use crate::core::block::{BlockLayout, BlockPool, BlockTable};
use crate::core::quant::{decode_with, encode_with, KvCodec, QuantMode, TokenScale};
use crate::core::streaming::StreamingWindow;
use crate::error::{Error, Result};

/// Which half of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvKind {
    Key,
    Value,
}

/// Which cache a key/value head lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadKind {
    /// Full (optionally dynamic sparse) history.
    Retrieval,
    /// Sink plus rolling local window.
    Streaming,
}

/// Key and value block tables of one sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceBlocks {
    pub keys: BlockTable,
    pub values: BlockTable,
}

/// Physical location of one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAddress {
    pub key_block: usize,
    pub value_block: usize,
    /// Token slot inside the block.
    pub local: usize,
}

/// Block pools plus per-sequence tables.
#[derive(Debug, Clone)]
pub struct KvStorage {
    keys: BlockPool,
    values: BlockPool,
    tables: Vec<SequenceBlocks>,
}

impl KvStorage {
    /// Create zeroed pools. Value blocks never carry statistics.
    pub fn new(key_layout: BlockLayout, num_blocks: usize, max_batch: usize) -> Self {
        let value_layout = key_layout.without_statistics();
        Self {
            keys: BlockPool::new(key_layout, num_blocks),
            values: BlockPool::new(value_layout, num_blocks),
            tables: vec![SequenceBlocks::default(); max_batch],
        }
    }

    pub fn key_pool(&self) -> &BlockPool {
        &self.keys
    }

    pub fn value_pool(&self) -> &BlockPool {
        &self.values
    }

    /// Layout of key blocks (value blocks differ only by statistics).
    pub fn layout(&self) -> &BlockLayout {
        self.keys.layout()
    }

    /// Number of sequence slots.
    pub fn max_batch(&self) -> usize {
        self.tables.len()
    }

    pub fn sequence(&self, seq: usize) -> Option<&SequenceBlocks> {
        self.tables.get(seq)
    }

    /// Install the block tables of one sequence slot.
    pub fn set_block_tables(
        &mut self,
        seq: usize,
        keys: BlockTable,
        values: BlockTable,
    ) -> Result<()> {
        let num_blocks = self.keys.num_blocks();
        let tpb = self.layout().tokens_per_block();
        for table in [&keys, &values] {
            if table.block_size() != tpb {
                return Err(Error::Config(format!(
                    "block table size {} does not match cache block size {tpb}",
                    table.block_size()
                )));
            }
            let ids = table.get_physical_block_ids();
            if let Some(&bad) = ids.iter().find(|&&id| id >= num_blocks) {
                return Err(Error::Config(format!(
                    "block id {bad} out of bounds (pool holds {num_blocks})"
                )));
            }
        }
        let slot = self.tables.get_mut(seq).ok_or_else(|| {
            Error::Config(format!("sequence slot {seq} out of range"))
        })?;
        *slot = SequenceBlocks { keys, values };
        Ok(())
    }

    /// Give every sequence slot `blocks_per_seq` consecutive blocks.
    pub fn assign_contiguous(&mut self, blocks_per_seq: usize) -> Result<()> {
        let tpb = self.layout().tokens_per_block();
        for seq in 0..self.max_batch() {
            let ids: Vec<usize> = (seq * blocks_per_seq..(seq + 1) * blocks_per_seq).collect();
            self.set_block_tables(
                seq,
                BlockTable::from_ids(tpb, ids.clone()),
                BlockTable::from_ids(tpb, ids),
            )?;
        }
        Ok(())
    }

    /// Store one token row pair and fold keys into the statistics.
    pub fn apply(&mut self, write: &CacheWrite) {
        let addr = write.address;
        self.keys
            .write_row(addr.key_block, addr.local, write.head_rank, &write.key, write.key_scale);
        self.values.write_row(
            addr.value_block,
            addr.local,
            write.head_rank,
            &write.value,
            write.value_scale,
        );
        if let Some(raw_key) = &write.raw_key {
            self.keys
                .update_statistics(addr.key_block, addr.local, write.head_rank, raw_key);
        }
    }
}

/// One token's quantized key and value rows for one head, ready to store.
///
/// Execution groups build these while the cache is shared read-only; the
/// launcher applies them once the grid has drained.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheWrite {
    pub address: SlotAddress,
    pub head_rank: usize,
    pub key: Vec<u8>,
    pub key_scale: TokenScale,
    pub value: Vec<u8>,
    pub value_scale: TokenScale,
    /// Unquantized key, kept when the cache tracks statistics.
    pub raw_key: Option<Vec<f32>>,
}

impl CacheWrite {
    /// Quantize with a compile-time codec.
    pub fn encode<C: KvCodec>(
        address: SlotAddress,
        head_rank: usize,
        key: &[f32],
        value: &[f32],
        with_zero: bool,
        track_statistics: bool,
    ) -> Self {
        let mode = QuantMode::new(C::WIDTH, with_zero);
        let key_scale = TokenScale::compute(key, mode);
        let value_scale = TokenScale::compute(value, mode);
        let mut packed_key = vec![0u8; C::WIDTH.bytes_for(key.len())];
        let mut packed_value = vec![0u8; C::WIDTH.bytes_for(value.len())];
        C::encode(key, key_scale, with_zero, &mut packed_key);
        C::encode(value, value_scale, with_zero, &mut packed_value);
        Self {
            address,
            head_rank,
            key: packed_key,
            key_scale,
            value: packed_value,
            value_scale,
            raw_key: track_statistics.then(|| key.to_vec()),
        }
    }

    /// Quantize with the codec picked from `mode` at runtime.
    pub fn encode_with_mode(
        mode: QuantMode,
        address: SlotAddress,
        head_rank: usize,
        key: &[f32],
        value: &[f32],
        track_statistics: bool,
    ) -> Self {
        let key_scale = TokenScale::compute(key, mode);
        let value_scale = TokenScale::compute(value, mode);
        let mut packed_key = vec![0u8; mode.bits.bytes_for(key.len())];
        let mut packed_value = vec![0u8; mode.bits.bytes_for(value.len())];
        encode_with(mode, key, key_scale, &mut packed_key);
        encode_with(mode, value, value_scale, &mut packed_value);
        Self {
            address,
            head_rank,
            key: packed_key,
            key_scale,
            value: packed_value,
            value_scale,
            raw_key: track_statistics.then(|| key.to_vec()),
        }
    }
}

/// Translates (sequence, logical token, head) into cache memory.
///
/// Implementations only decide which table slot and in-block slot a token
/// uses; reading and writing go through the shared [`KvStorage`].
pub trait KvCacheAddressor: Send + Sync {
    fn storage(&self) -> &KvStorage;

    fn storage_mut(&mut self) -> &mut KvStorage;

    /// Block-table slot holding logical token `token`.
    fn table_slot(&self, token: usize) -> usize;

    /// Token slot inside the block.
    fn local_index(&self, token: usize) -> usize;

    /// Table slots needed to address every token up to and including `token`.
    fn required_table_len(&self, token: usize) -> usize;

    /// Streaming window, for caches that evict.
    fn window(&self) -> Option<&StreamingWindow> {
        None
    }

    fn layout(&self) -> &BlockLayout {
        self.storage().layout()
    }

    fn tokens_per_block(&self) -> usize {
        self.layout().tokens_per_block()
    }

    /// Physical key and value blocks plus slot for a token.
    fn locate(&self, seq: usize, token: usize) -> SlotAddress {
        let blocks = &self.storage().tables[seq];
        let slot = self.table_slot(token);
        SlotAddress {
            key_block: blocks.keys.block_at(slot),
            value_block: blocks.values.block_at(slot),
            local: self.local_index(token),
        }
    }

    /// Physical block of `token` in the key or value pool.
    fn physical_block(&self, seq: usize, kind: KvKind, token: usize) -> usize {
        let addr = self.locate(seq, token);
        match kind {
            KvKind::Key => addr.key_block,
            KvKind::Value => addr.value_block,
        }
    }

    /// Byte offset of one element inside its block.
    fn element_offset(&self, local: usize, head_rank: usize, channel: usize) -> usize {
        self.layout().element_offset(local, head_rank, channel)
    }

    /// Check the tables of `seq` can address token `token`.
    fn check_capacity(&self, seq: usize, token: usize) -> Result<()> {
        let required = self.required_table_len(token);
        let blocks = self
            .storage()
            .sequence(seq)
            .ok_or_else(|| Error::Config(format!("sequence slot {seq} out of range")))?;
        let available = blocks.keys.num_blocks().min(blocks.values.num_blocks());
        if available < required {
            return Err(Error::BlockTableTooShort {
                sequence: seq,
                required,
                available,
            });
        }
        Ok(())
    }

    /// Quantize and store one token for one head.
    ///
    /// Uses the same codec and addressing as the kernel's store path.
    fn store_token(
        &mut self,
        seq: usize,
        token: usize,
        head_rank: usize,
        key: &[f32],
        value: &[f32],
    ) -> Result<()> {
        let layout = *self.layout();
        if head_rank >= layout.num_heads() {
            return Err(Error::Config(format!(
                "head rank {head_rank} out of range ({} heads)",
                layout.num_heads()
            )));
        }
        Error::check_len("key row", layout.head_dim(), key.len())?;
        Error::check_len("value row", layout.head_dim(), value.len())?;
        self.check_capacity(seq, token)?;

        let write = CacheWrite::encode_with_mode(
            layout.mode(),
            self.locate(seq, token),
            head_rank,
            key,
            value,
            layout.sub_chunk_tokens().is_some(),
        );
        self.storage_mut().apply(&write);
        Ok(())
    }

    /// Dequantized keys and values of `tokens`, each `[tokens.len(), head_dim]`.
    fn gather_dequantized(
        &self,
        seq: usize,
        head_rank: usize,
        tokens: &[usize],
    ) -> (Vec<f32>, Vec<f32>) {
        let layout = self.layout();
        let dh = layout.head_dim();
        let mode = layout.mode();
        let storage = self.storage();
        let mut keys = vec![0.0f32; tokens.len() * dh];
        let mut values = vec![0.0f32; tokens.len() * dh];

        for (i, &t) in tokens.iter().enumerate() {
            let addr = self.locate(seq, t);
            let kp = storage.key_pool();
            let vp = storage.value_pool();
            decode_with(
                mode,
                kp.row(addr.key_block, addr.local, head_rank),
                kp.token_scale(addr.key_block, addr.local, head_rank),
                &mut keys[i * dh..(i + 1) * dh],
            );
            decode_with(
                mode,
                vp.row(addr.value_block, addr.local, head_rank),
                vp.token_scale(addr.value_block, addr.local, head_rank),
                &mut values[i * dh..(i + 1) * dh],
            );
        }
        (keys, values)
    }
}

fn block_shift(tokens_per_block: usize) -> Result<u32> {
    if !tokens_per_block.is_power_of_two() {
        return Err(Error::InvalidBlockSize(tokens_per_block));
    }
    Ok(tokens_per_block.trailing_zeros())
}

/// Fully paged cache.
#[derive(Debug, Clone)]
pub struct PagedKvCache {
    storage: KvStorage,
    shift: u32,
}

impl PagedKvCache {
    /// Create a paged cache of `num_blocks` blocks for `max_batch` sequences.
    pub fn new(layout: BlockLayout, num_blocks: usize, max_batch: usize) -> Result<Self> {
        let shift = block_shift(layout.tokens_per_block())?;
        Ok(Self {
            storage: KvStorage::new(layout, num_blocks, max_batch),
            shift,
        })
    }
}

impl KvCacheAddressor for PagedKvCache {
    fn storage(&self) -> &KvStorage {
        &self.storage
    }

    fn storage_mut(&mut self) -> &mut KvStorage {
        &mut self.storage
    }

    fn table_slot(&self, token: usize) -> usize {
        token >> self.shift
    }

    fn local_index(&self, token: usize) -> usize {
        token & ((1 << self.shift) - 1)
    }

    fn required_table_len(&self, token: usize) -> usize {
        (token >> self.shift) + 1
    }
}

/// Paged cache with sink plus rolling local window eviction.
#[derive(Debug, Clone)]
pub struct StreamingKvCache {
    storage: KvStorage,
    shift: u32,
    window: StreamingWindow,
}

impl StreamingKvCache {
    /// Create a streaming cache. Statistics are never kept for streaming heads.
    pub fn new(
        layout: BlockLayout,
        window: StreamingWindow,
        num_blocks: usize,
        max_batch: usize,
    ) -> Result<Self> {
        let shift = block_shift(layout.tokens_per_block())?;
        Ok(Self {
            storage: KvStorage::new(layout.without_statistics(), num_blocks, max_batch),
            shift,
            window,
        })
    }
}

impl KvCacheAddressor for StreamingKvCache {
    fn storage(&self) -> &KvStorage {
        &self.storage
    }

    fn storage_mut(&mut self) -> &mut KvStorage {
        &mut self.storage
    }

    fn table_slot(&self, token: usize) -> usize {
        self.window.remap_block(token >> self.shift)
    }

    fn local_index(&self, token: usize) -> usize {
        token & ((1 << self.shift) - 1)
    }

    fn required_table_len(&self, token: usize) -> usize {
        ((token >> self.shift) + 1).min(self.window.table_blocks())
    }

    fn window(&self) -> Option<&StreamingWindow> {
        Some(&self.window)
    }
}

/// Contiguous (unpaged) cache: one block of `max_seq_len` tokens per sequence.
#[derive(Debug, Clone)]
pub struct LinearKvCache {
    storage: KvStorage,
    max_seq_len: usize,
}

impl LinearKvCache {
    /// Create a linear cache; sequence `s` owns block `s` of each pool.
    pub fn new(
        max_seq_len: usize,
        num_heads: usize,
        head_dim: usize,
        mode: QuantMode,
        max_batch: usize,
    ) -> Result<Self> {
        if max_seq_len == 0 {
            return Err(Error::Config("linear cache needs max_seq_len > 0".into()));
        }
        let layout = BlockLayout::new(max_seq_len, num_heads, head_dim, mode);
        let mut storage = KvStorage::new(layout, max_batch, max_batch);
        storage.assign_contiguous(1)?;
        Ok(Self {
            storage,
            max_seq_len,
        })
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }
}

impl KvCacheAddressor for LinearKvCache {
    fn storage(&self) -> &KvStorage {
        &self.storage
    }

    fn storage_mut(&mut self) -> &mut KvStorage {
        &mut self.storage
    }

    fn table_slot(&self, _token: usize) -> usize {
        0
    }

    fn local_index(&self, token: usize) -> usize {
        token
    }

    fn required_table_len(&self, _token: usize) -> usize {
        1
    }

    fn check_capacity(&self, seq: usize, token: usize) -> Result<()> {
        if token >= self.max_seq_len {
            return Err(Error::Config(format!(
                "token {token} of sequence {seq} exceeds linear cache length {}",
                self.max_seq_len
            )));
        }
        if seq >= self.storage.max_batch() {
            return Err(Error::Config(format!("sequence slot {seq} out of range")));
        }
        Ok(())
    }
}

//! Split (multi-block) reduction across context partitions.
//!
//! A long history is cut into `seq_len_tile` contiguous partitions. Each
//! partition runs the whole kernel and leaves an un-normalized partial
//! (max, sum, output) in its slot, then arrives on the completion latch of
//! its (batch, head). The partition that brings the latch to the partition
//! count combines every partial and resets the latch for the next step.
//!
//! ```text
//! partial_i = (m_i, s_i, o_i)
//! M   = max_i m_i
//! S   = sum_i exp(m_i - M) * s_i
//! out = sum_i exp(m_i - M) * o_i / (S + eps)
//! ```

use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::attention::kernel::SOFTMAX_EPSILON;
use crate::attention::simt::{block_allreduce, tree_reduce};
use crate::config::MultiBlockConfig;
use crate::error::{Error, Result};

/// Single-fire arrival counter for the partitions of one (batch, head).
#[derive(Debug, Default)]
pub struct CompletionLatch {
    arrived: AtomicU32,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished partition; `true` for the last of `partitions`.
    pub fn arrive(&self, partitions: usize) -> bool {
        let prev = self.arrived.fetch_add(1, Ordering::AcqRel);
        prev as usize + 1 == partitions
    }

    /// Re-arm the latch. Only the finalizer calls this.
    pub fn reset(&self) {
        self.arrived.store(0, Ordering::Release);
    }

    pub fn count(&self) -> u32 {
        self.arrived.load(Ordering::Acquire)
    }
}

/// Un-normalized result of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    /// Largest score seen by the partition.
    pub max: f32,
    /// `sum exp(score - max)` over the partition.
    pub sum: f32,
    /// `sum exp(score - max) * v` over the partition.
    pub out: Vec<f32>,
}

/// Combine partials into the normalized output, reducing across
/// partitions the way a group of `threads` lanes would.
pub fn combine_partials(partials: &[PartialResult], threads: usize) -> Vec<f32> {
    let Some(first) = partials.first() else {
        return Vec::new();
    };
    let width = threads.max(partials.len());

    let mut lanes = vec![f32::MIN; width];
    for (lane, p) in lanes.iter_mut().zip(partials) {
        *lane = p.max;
    }
    let global_max = block_allreduce(&lanes, f32::MIN, f32::max);

    let rescale: Vec<f32> = partials.iter().map(|p| (p.max - global_max).exp()).collect();
    let mut lanes = vec![0.0f32; width];
    for ((lane, p), r) in lanes.iter_mut().zip(partials).zip(&rescale) {
        *lane = r * p.sum;
    }
    let inv_sum = 1.0 / (block_allreduce(&lanes, 0.0, |a, b| a + b) + SOFTMAX_EPSILON);

    (0..first.out.len())
        .map(|c| {
            let acc = tree_reduce(
                partials.iter().zip(&rescale).map(|(p, r)| r * p.out[c]),
                0.0,
                |a, b| a + b,
            );
            acc * inv_sum
        })
        .collect()
}

/// How the history is cut into partitions for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    pub multi_block: bool,
    /// Partitions launched per (batch, head).
    pub seq_len_tile: usize,
    /// History positions per partition.
    pub timesteps_per_block: usize,
}

impl TilePlan {
    /// One partition covering everything.
    pub fn single(max_len: usize) -> Self {
        Self {
            multi_block: false,
            seq_len_tile: 1,
            timesteps_per_block: max_len.max(1),
        }
    }

    /// Plan partitions for the longest retrieval iteration `max_len`.
    pub fn plan(
        config: &MultiBlockConfig,
        batch_size: usize,
        num_heads: usize,
        max_len: usize,
    ) -> Self {
        if !config.enabled || max_len <= config.switch_threshold {
            return Self::single(max_len);
        }
        let groups = (batch_size * num_heads).max(1);
        let upper = config
            .max_seq_len_tile
            .min(max_len.div_ceil(config.min_timesteps_per_block))
            .max(1);
        let seq_len_tile = config.multi_processor_count.div_ceil(groups).clamp(1, upper);
        Self {
            multi_block: true,
            seq_len_tile,
            timesteps_per_block: max_len.div_ceil(seq_len_tile),
        }
    }

    /// Partitions actually used by a head iterating `len` positions.
    pub fn tiles_for(&self, len: usize) -> usize {
        if self.multi_block {
            len.div_ceil(self.timesteps_per_block).max(1)
        } else {
            1
        }
    }

    /// History positions of partition `tile`.
    pub fn range(&self, tile: usize, len: usize) -> Range<usize> {
        if !self.multi_block {
            return 0..len;
        }
        let start = (tile * self.timesteps_per_block).min(len);
        start..((tile + 1) * self.timesteps_per_block).min(len)
    }
}

/// Partial slots and completion latches reused across decode steps.
///
/// Slots are indexed by `(batch * num_heads + head) * max_seq_len_tile + tile`.
#[derive(Debug)]
pub struct MultiBlockWorkspace {
    max_batch: usize,
    num_heads: usize,
    max_seq_len_tile: usize,
    latches: Vec<CompletionLatch>,
    slots: Vec<Mutex<Option<PartialResult>>>,
}

impl MultiBlockWorkspace {
    pub fn new(max_batch: usize, num_heads: usize, max_seq_len_tile: usize) -> Self {
        let heads = max_batch * num_heads;
        Self {
            max_batch,
            num_heads,
            max_seq_len_tile,
            latches: (0..heads).map(|_| CompletionLatch::new()).collect(),
            slots: (0..heads * max_seq_len_tile).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Check a launch fits in this workspace.
    pub fn check_capacity(
        &self,
        batch_size: usize,
        num_heads: usize,
        seq_len_tile: usize,
    ) -> Result<()> {
        if batch_size > self.max_batch
            || num_heads != self.num_heads
            || seq_len_tile > self.max_seq_len_tile
        {
            return Err(Error::Config(format!(
                "multi-block workspace sized for {}x{}x{} cannot hold {batch_size}x{num_heads}x{seq_len_tile}",
                self.max_batch, self.num_heads, self.max_seq_len_tile
            )));
        }
        Ok(())
    }

    /// Flat (batch, head) index.
    pub fn head_index(&self, batch: usize, head: usize) -> usize {
        batch * self.num_heads + head
    }

    pub fn latch(&self, bhi: usize) -> &CompletionLatch {
        &self.latches[bhi]
    }

    /// Publish the partial of one partition.
    pub fn store(&self, bhi: usize, tile: usize, partial: PartialResult) {
        let slot = &self.slots[bhi * self.max_seq_len_tile + tile];
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(partial);
    }

    /// Arrive on the latch of `bhi`; `true` makes the caller the finalizer.
    pub fn arrive(&self, bhi: usize, partitions: usize) -> bool {
        self.latches[bhi].arrive(partitions)
    }

    /// Drain the partials of `bhi`, combine them and re-arm the latch.
    pub fn finalize(&self, bhi: usize, partitions: usize, threads: usize) -> Vec<f32> {
        let base = bhi * self.max_seq_len_tile;
        let partials: Vec<PartialResult> = self.slots[base..base + partitions]
            .iter()
            .filter_map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).take())
            .collect();
        debug_assert_eq!(partials.len(), partitions);
        self.latches[bhi].reset();
        combine_partials(&partials, threads)
    }

    /// No partition is in flight and no partial is left behind.
    pub fn is_idle(&self) -> bool {
        self.latches.iter().all(|l| l.count() == 0)
            && self
                .slots
                .iter()
                .all(|s| s.lock().unwrap_or_else(PoisonError::into_inner).is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial_of(scores: &[f32], values: &[[f32; 2]]) -> PartialResult {
        let max = scores.iter().copied().fold(f32::MIN, f32::max);
        let weights: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
        let mut out = vec![0.0; 2];
        for (w, v) in weights.iter().zip(values) {
            out[0] += w * v[0];
            out[1] += w * v[1];
        }
        PartialResult {
            max,
            sum: weights.iter().sum(),
            out,
        }
    }

    #[test]
    fn test_latch_fires_once_and_resets() {
        let latch = CompletionLatch::new();
        assert!(!latch.arrive(3));
        assert!(!latch.arrive(3));
        assert!(latch.arrive(3));
        assert_eq!(latch.count(), 3);
        latch.reset();
        assert_eq!(latch.count(), 0);
        assert!(latch.arrive(1));
    }

    #[test]
    fn test_latch_under_contention() {
        use rayon::prelude::*;
        let latch = CompletionLatch::new();
        let fired = (0..64).into_par_iter().filter(|_| latch.arrive(64)).count();
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_combine_matches_full_softmax() {
        let scores = [0.5f32, 2.0, -1.0, 1.5, 0.0];
        let values = [[1.0f32, 0.0], [0.0, 1.0], [2.0, 2.0], [-1.0, 1.0], [0.5, 0.5]];

        let full = partial_of(&scores, &values);
        let norm = full.sum + SOFTMAX_EPSILON;
        let expected: Vec<f32> = full.out.iter().map(|o| o / norm).collect();

        let parts = [
            partial_of(&scores[..2], &values[..2]),
            partial_of(&scores[2..4], &values[2..4]),
            partial_of(&scores[4..], &values[4..]),
        ];
        let combined = combine_partials(&parts, 64);
        for (a, b) in combined.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn test_tile_plan() {
        let config = MultiBlockConfig::default();
        assert!(!TilePlan::plan(&config, 1, 8, 2048).multi_block);

        // 108 processors over 8 groups -> 14, capped by ceil(4096 / 256) = 16
        let plan = TilePlan::plan(&config, 1, 8, 4096);
        assert!(plan.multi_block);
        assert_eq!(plan.seq_len_tile, 14);
        assert_eq!(plan.timesteps_per_block, 293);
        assert_eq!(plan.tiles_for(4096), 14);
        assert_eq!(plan.tiles_for(300), 2);
        assert_eq!(plan.tiles_for(0), 1);
        assert_eq!(plan.range(13, 4096), 3809..4096);
        assert_eq!(plan.range(1, 300), 293..300);

        let disabled = MultiBlockConfig {
            enabled: false,
            ..MultiBlockConfig::default()
        };
        assert!(!TilePlan::plan(&disabled, 1, 8, 100_000).multi_block);
    }

    #[test]
    fn test_workspace_finalize_drains_slots() {
        let ws = MultiBlockWorkspace::new(2, 2, 4);
        let bhi = ws.head_index(1, 0);
        ws.store(bhi, 0, partial_of(&[1.0], &[[1.0, 0.0]]));
        assert!(!ws.arrive(bhi, 2));
        ws.store(bhi, 1, partial_of(&[1.0], &[[0.0, 1.0]]));
        assert!(ws.arrive(bhi, 2));

        let out = ws.finalize(bhi, 2, 64);
        assert!((out[0] - 0.5).abs() < 1e-5);
        assert!((out[1] - 0.5).abs() < 1e-5);
        assert!(ws.is_idle());

        assert!(ws.check_capacity(2, 2, 4).is_ok());
        assert!(ws.check_capacity(3, 2, 4).is_err());
        assert!(ws.check_capacity(1, 2, 5).is_err());
    }
}

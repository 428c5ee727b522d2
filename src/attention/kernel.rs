//! Decode attention reduction kernel.
//!
//! One call of [`attend_group`] is one execution group: a (query head,
//! sequence, partition) triple of the launch grid. The group
//!
//! 1. loads Q and the new K/V, applies rotary at the true position,
//! 2. scores the new token exactly (no quantization),
//! 3. quantizes the new K/V into a [`CacheWrite`] (first query head of a
//!    GQA group, partition 0 only),
//! 4. scores every selected history token against dequantized keys,
//! 5. runs the softmax, normalizing now (single block) or later (split),
//! 6. accumulates dequantized values across cooperating lane sets,
//! 7. emits the output row or its partial.
//!
//! Lanes are emulated with the helpers in [`simt`](crate::attention::simt).
//! The cache is only read here; the launcher applies the returned writes
//! after every group of the step has finished.

use std::ops::Range;

use tracing::trace;

use crate::attention::element::Element;
use crate::attention::multi_block::{MultiBlockWorkspace, PartialResult, TilePlan};
use crate::attention::params::AttentionParams;
use crate::attention::rotary::RotaryEmbedding;
use crate::attention::simt::{block_allreduce, shuffle_xor_allreduce, WARP_SIZE};
use crate::core::kv_cache::{CacheWrite, HeadKind, KvCacheAddressor, SlotAddress};
use crate::core::quant::{KvCodec, TokenScale};
use crate::core::sparse::{SparseRemap, INVALID_TOKEN};
use crate::core::streaming::StreamingWindow;
use crate::error::{Error, Result};

/// Added to the softmax denominator.
pub const SOFTMAX_EPSILON: f32 = 1e-6;

/// Lane organisation of one execution group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionShape {
    pub threads: usize,
    pub head_dim: usize,
    /// Head dimension rounded up to a power of two.
    pub dh_max: usize,
    /// Elements per lane load of K and V.
    pub vec_size: usize,
    /// Lanes cooperating on one key.
    pub threads_per_key: usize,
    /// Keys scored concurrently.
    pub key_groups: usize,
    /// Elements per lane in the new-token dot product.
    pub qk_vec_size: usize,
    pub qk_lanes: usize,
    /// Lanes cooperating on one value row.
    pub threads_per_value: usize,
    /// Values accumulated concurrently.
    pub v_per_iter: usize,
}

impl ExecutionShape {
    pub fn new<T: Element>(head_dim: usize, dh_max: usize, threads: usize) -> Result<Self> {
        let vec_size = T::VEC_SIZE;
        if head_dim % vec_size != 0 {
            return Err(Error::VectorWidth { head_dim, vec_size });
        }
        let threads_per_key = (dh_max / vec_size).clamp(1, WARP_SIZE);
        let qk_vec_size = vec_size.max(dh_max / WARP_SIZE);
        let threads_per_value = (dh_max / vec_size).max(1);
        if threads < threads_per_value || threads < threads_per_key {
            return Err(Error::Config(format!(
                "group of {threads} lanes cannot cover head dim {dh_max} at {vec_size} elements per lane"
            )));
        }
        Ok(Self {
            threads,
            head_dim,
            dh_max,
            vec_size,
            threads_per_key,
            key_groups: threads / threads_per_key,
            qk_vec_size,
            qk_lanes: (dh_max / qk_vec_size).max(1),
            threads_per_value,
            v_per_iter: threads / threads_per_value,
        })
    }
}

/// State shared by every group of one launch.
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a, T> {
    pub params: &'a AttentionParams<'a, T>,
    pub shape: ExecutionShape,
    pub plan: TilePlan,
    pub rotary: &'a RotaryEmbedding,
    pub workspace: &'a MultiBlockWorkspace,
}

/// Position of a group in the launch grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCoord {
    pub head: usize,
    pub batch: usize,
    pub tile: usize,
}

/// What one group produced.
#[derive(Debug, Clone, Default)]
pub struct GroupOutcome {
    /// Final output row, `head_dim` long.
    pub output: Option<Vec<f32>>,
    /// New-token store for the cache this head lives in.
    pub cache_write: Option<(HeadKind, CacheWrite)>,
    /// The group exited without doing anything.
    pub skipped: bool,
    /// The group combined the partials of its (sequence, head).
    pub finalized: bool,
}

impl GroupOutcome {
    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// History positions a head iterates, and the tokens they stand for.
#[derive(Debug, Clone, Copy)]
pub enum Timeline<'a> {
    /// Every cached token, in order.
    Full { ctx: usize },
    /// Sink tokens then the local window, skipping the evicted gap.
    Streaming { window: &'a StreamingWindow, ctx: usize },
    /// Selected pages only.
    Sparse(SparseRemap<'a>),
}

impl<'a> Timeline<'a> {
    pub fn new(
        window: Option<&'a StreamingWindow>,
        sparse: Option<SparseRemap<'a>>,
        ctx: usize,
    ) -> Self {
        match (window, sparse) {
            (Some(window), _) => Timeline::Streaming { window, ctx },
            (None, Some(remap)) if remap.is_active() => Timeline::Sparse(remap),
            _ => Timeline::Full { ctx },
        }
    }

    /// Number of history positions to iterate.
    pub fn valid_length(&self) -> usize {
        match self {
            Timeline::Full { ctx } => *ctx,
            Timeline::Streaming { window, ctx } => window.valid_length(*ctx),
            Timeline::Sparse(remap) => remap.valid_length(),
        }
    }

    /// Logical token of history position `i`.
    pub fn logical(&self, i: usize) -> Option<usize> {
        match self {
            Timeline::Full { ctx } => (i < *ctx).then_some(i),
            Timeline::Streaming { window, ctx } => window.logical_token(i, *ctx),
            Timeline::Sparse(remap) => Some(remap.remap(i)).filter(|&t| t != INVALID_TOKEN),
        }
    }
}

/// Address and dequantization parameters of one history token.
#[derive(Debug, Clone, Copy)]
struct TokenMeta {
    addr: SlotAddress,
    key: TokenScale,
    value: TokenScale,
}

fn token_meta<A: KvCacheAddressor>(
    cache: &A,
    batch: usize,
    token: usize,
    rank: usize,
) -> TokenMeta {
    let addr = cache.locate(batch, token);
    let storage = cache.storage();
    TokenMeta {
        addr,
        key: storage.key_pool().token_scale(addr.key_block, addr.local, rank),
        value: storage.value_pool().token_scale(addr.value_block, addr.local, rank),
    }
}

/// Widen a `T` row into a zero-padded `f32` register file.
fn load_row<T: Element, const DH_MAX: usize>(row: &[T]) -> [f32; DH_MAX] {
    let mut regs = [0.0f32; DH_MAX];
    for (r, &x) in regs.iter_mut().zip(row) {
        *r = x.to_f32();
    }
    regs
}

/// Dot product split over `lanes` lanes of `vec` consecutive elements each,
/// chunks assigned round-robin, finished with a butterfly.
fn lane_dot(q: &[f32], k: &[f32], lanes: usize, vec: usize) -> f32 {
    let mut partial = vec![0.0f32; lanes];
    for (chunk, (qc, kc)) in q.chunks(vec).zip(k.chunks(vec)).enumerate() {
        partial[chunk % lanes] += qc.iter().zip(kc).map(|(a, b)| a * b).sum::<f32>();
    }
    shuffle_xor_allreduce(&mut partial, lanes, |a, b| a + b);
    partial[0]
}

/// Round through the compute type, as a value parked in group scratch would be.
fn through<T: Element>(x: f32) -> f32 {
    T::from_f32(x).to_f32()
}

/// Score of the new token against the (rotated) query.
pub fn current_score(q: &[f32], k: &[f32], shape: &ExecutionShape, inv_sqrt_dh: f32) -> f32 {
    lane_dot(q, k, shape.qk_lanes, shape.qk_vec_size) * inv_sqrt_dh
}

/// Run one execution group.
///
/// `C` fixes the storage width, `ZERO` the zero-point flag and
/// `MULTI_BLOCK` whether the group writes a partial instead of the output.
pub fn attend_group<
    T: Element,
    C: KvCodec,
    A: KvCacheAddressor,
    const DH_MAX: usize,
    const ZERO: bool,
    const MULTI_BLOCK: bool,
>(
    launch: &LaunchContext<'_, T>,
    cache: &A,
    coord: GroupCoord,
) -> GroupOutcome {
    let params = launch.params;
    let config = params.config;
    let shape = &launch.shape;
    let GroupCoord { head, batch, tile } = coord;

    if params.is_finished(batch) || (!MULTI_BLOCK && tile > 0) {
        return GroupOutcome::skipped();
    }

    let qpk = config.qheads_per_kv();
    let kv_head = head / qpk;
    let route = params.routing.route(kv_head);
    let rank = route.rank;
    let ctx = params.context_lengths[batch];
    let dh = config.head_dim;

    let sparse = match route.kind {
        HeadKind::Retrieval => params
            .sparse
            .map(|pages| pages.remap(batch, head, ctx, cache.tokens_per_block())),
        HeadKind::Streaming => None,
    };
    let timeline = Timeline::new(cache.window(), sparse, ctx);
    let len = timeline.valid_length();

    let tiles = if MULTI_BLOCK { launch.plan.tiles_for(len) } else { 1 };
    if tile >= tiles {
        return GroupOutcome::skipped();
    }
    let range = if MULTI_BLOCK { launch.plan.range(tile, len) } else { 0..len };
    let owns_current = tile + 1 == tiles;

    // 1. Q and the new K/V, rotated at the true position.
    let mut q = load_row::<T, DH_MAX>(params.q_row(batch, head));
    let mut k = load_row::<T, DH_MAX>(params.k_row(batch, kv_head));
    let v = load_row::<T, DH_MAX>(params.v_row(batch, kv_head));
    if launch.rotary.dim() > 0 {
        launch.rotary.apply(&mut q, ctx, ctx + 1);
        launch.rotary.apply(&mut k, ctx, ctx + 1);
        for x in q.iter_mut().chain(k.iter_mut()) {
            *x = through::<T>(*x);
        }
    }

    // 2. Exact score of the new token.
    let inv_sqrt_dh = config.inv_sqrt_dh();
    let qk_current = current_score(&q, &k, shape, inv_sqrt_dh);

    // 3. Store the new token once per key/value head.
    let cache_write = (head == kv_head * qpk && tile == 0).then(|| {
        let track = cache.layout().sub_chunk_tokens().is_some();
        let addr = cache.locate(batch, ctx);
        let write = CacheWrite::encode::<C>(addr, rank, &k[..dh], &v[..dh], ZERO, track);
        (route.kind, write)
    });

    // Token metadata for the partition, gathered ahead when it fits.
    let preload: Option<Vec<Option<TokenMeta>>> = (range.len() <= config.launch.smem_preload_switch)
        .then(|| {
            range
                .clone()
                .map(|i| timeline.logical(i).map(|t| token_meta(cache, batch, t, rank)))
                .collect()
        });
    let meta = |i: usize| -> Option<TokenMeta> {
        match &preload {
            Some(gathered) => gathered[i - range.start],
            None => timeline
                .logical(i)
                .map(|t| token_meta(cache, batch, t, rank)),
        }
    };

    // 4. History scores.
    let key_pool = cache.storage().key_pool();
    let mut logits = vec![f32::NEG_INFINITY; range.len()];
    let mut group_max = vec![f32::MIN; shape.key_groups];
    let mut key = [0.0f32; DH_MAX];
    for i in range.clone() {
        let Some(m) = meta(i) else { continue };
        C::decode(key_pool.row(m.addr.key_block, m.addr.local, rank), m.key, ZERO, &mut key[..dh]);
        let qk = key_dot(&q, &key, shape) * inv_sqrt_dh;
        let slot = i - range.start;
        logits[slot] = qk;
        let g = slot % shape.key_groups;
        group_max[g] = group_max[g].max(qk);
    }

    let mut lanes = vec![qk_current; shape.threads];
    for (lane, reg) in lanes.iter_mut().enumerate() {
        *reg = reg.max(group_max[lane / shape.threads_per_key]);
    }
    let qk_max = block_allreduce(&lanes, f32::MIN, f32::max);

    // 5. Softmax.
    let mut lanes = vec![0.0f32; shape.threads];
    for (slot, logit) in logits.iter_mut().enumerate() {
        *logit = (*logit - qk_max).exp();
        lanes[slot % shape.threads] += *logit;
    }
    let mut current_weight = 0.0;
    if owns_current {
        current_weight = (qk_current - qk_max).exp();
        lanes[0] += current_weight;
    }
    let sum = block_allreduce(&lanes, 0.0, |a, b| a + b);

    let scale = if MULTI_BLOCK {
        1.0
    } else {
        1.0 / (sum + SOFTMAX_EPSILON)
    };
    for logit in logits.iter_mut() {
        *logit = through::<T>(*logit * scale);
    }
    let current_weight = through::<T>(current_weight * scale);

    // 6. Value accumulation.
    let value_pool = cache.storage().value_pool();
    let mut acc = vec![[0.0f32; DH_MAX]; shape.v_per_iter];
    let mut value = [0.0f32; DH_MAX];
    for i in range.clone() {
        let slot = i - range.start;
        if logits[slot] == 0.0 {
            continue;
        }
        let Some(m) = meta(i) else { continue };
        let bytes = value_pool.row(m.addr.value_block, m.addr.local, rank);
        C::decode(bytes, m.value, ZERO, &mut value[..dh]);
        let group = &mut acc[slot % shape.v_per_iter];
        for (a, x) in group.iter_mut().zip(&value) {
            *a += logits[slot] * x;
        }
    }
    if owns_current {
        let group = &mut acc[range.len() % shape.v_per_iter];
        for (a, x) in group.iter_mut().zip(&v) {
            *a += current_weight * x;
        }
    }
    let out = reduce_value_groups(acc);

    // 7. Output or partial.
    if !MULTI_BLOCK {
        return GroupOutcome {
            output: Some(out[..dh].to_vec()),
            cache_write,
            ..GroupOutcome::default()
        };
    }

    let workspace = launch.workspace;
    let bhi = workspace.head_index(batch, head);
    workspace.store(
        bhi,
        tile,
        PartialResult {
            max: qk_max,
            sum,
            out: out[..dh].to_vec(),
        },
    );
    if !workspace.arrive(bhi, tiles) {
        return GroupOutcome {
            cache_write,
            ..GroupOutcome::default()
        };
    }
    trace!(batch, head, tile, tiles, "multi-block finalize");
    GroupOutcome {
        output: Some(workspace.finalize(bhi, tiles, shape.threads)),
        cache_write,
        finalized: true,
        ..GroupOutcome::default()
    }
}

/// Score one dequantized key the way a key group would: `threads_per_key`
/// lanes, `vec_size` elements per load.
fn key_dot(q: &[f32], k: &[f32], shape: &ExecutionShape) -> f32 {
    lane_dot(q, k, shape.threads_per_key, shape.vec_size)
}

/// Fold the value groups pairwise through scratch: the upper half writes,
/// the lower half adds, until one group is left.
fn reduce_value_groups<const DH_MAX: usize>(mut acc: Vec<[f32; DH_MAX]>) -> [f32; DH_MAX] {
    let mut active = acc.len();
    while active > 1 {
        let midpoint = active.div_ceil(2);
        let (lower, upper) = acc.split_at_mut(midpoint);
        for (dst, src) in lower.iter_mut().zip(&upper[..active - midpoint]) {
            for (d, s) in dst.iter_mut().zip(src) {
                *d += s;
            }
        }
        active = midpoint;
    }
    acc.first().copied().unwrap_or([0.0; DH_MAX])
}

/// Range of history positions each partition of a head covers.
pub fn partition_ranges(plan: &TilePlan, len: usize) -> Vec<Range<usize>> {
    (0..plan.tiles_for(len)).map(|t| plan.range(t, len)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_execution_shape() {
        let shape = ExecutionShape::new::<f32>(128, 128, 256).unwrap();
        assert_eq!(shape.vec_size, 4);
        assert_eq!(shape.threads_per_key, 32);
        assert_eq!(shape.key_groups, 8);
        assert_eq!(shape.qk_vec_size, 4);
        assert_eq!(shape.qk_lanes, 32);
        assert_eq!(shape.threads_per_value, 32);
        assert_eq!(shape.v_per_iter, 8);

        let shape = ExecutionShape::new::<f16>(96, 128, 128).unwrap();
        assert_eq!(shape.vec_size, 8);
        assert_eq!(shape.threads_per_key, 16);
        assert_eq!(shape.threads_per_value, 16);
        assert_eq!(shape.v_per_iter, 8);

        assert!(matches!(
            ExecutionShape::new::<f16>(36, 64, 128),
            Err(Error::VectorWidth { head_dim: 36, vec_size: 8 })
        ));
        assert!(ExecutionShape::new::<f32>(256, 256, 32).is_err());
    }

    #[test]
    fn test_lane_dot_matches_sequential() {
        let q: Vec<f32> = (0..128).map(|i| (i as f32 * 0.1).sin()).collect();
        let k: Vec<f32> = (0..128).map(|i| (i as f32 * 0.2).cos()).collect();
        let expected: f32 = q.iter().zip(&k).map(|(a, b)| a * b).sum();
        for (lanes, vec) in [(32, 4), (16, 8), (8, 4)] {
            assert!((lane_dot(&q, &k, lanes, vec) - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn test_reduce_value_groups() {
        let acc = vec![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, 8.0]];
        assert_eq!(reduce_value_groups(acc), [16.0, 20.0]);
        assert_eq!(reduce_value_groups(vec![[1.5f32; 4]]), [1.5; 4]);
    }

    #[test]
    fn test_timeline_selection() {
        let window = StreamingWindow::new(16, 1, 32, 2, 16).unwrap();
        let streaming = Timeline::new(Some(&window), None, 100);
        assert_eq!(streaming.valid_length(), 47);
        assert_eq!(streaming.logical(16), Some(69));

        let pages = [0u32, 3];
        let sparse = Timeline::new(None, Some(SparseRemap::new(&pages, 4, 16)), 16);
        assert_eq!(sparse.valid_length(), 8);
        assert_eq!(sparse.logical(4), Some(12));

        // budget covers everything -> plain history
        let all = [0u32, 1, 2, 3];
        let full = Timeline::new(None, Some(SparseRemap::new(&all, 4, 16)), 16);
        assert!(matches!(full, Timeline::Full { ctx: 16 }));
    }

    #[test]
    fn test_partition_ranges_cover_history() {
        let plan = TilePlan {
            multi_block: true,
            seq_len_tile: 4,
            timesteps_per_block: 10,
        };
        let ranges = partition_ranges(&plan, 35);
        assert_eq!(ranges, vec![0..10, 10..20, 20..30, 30..35]);
        assert_eq!(partition_ranges(&plan, 0), vec![0..0]);
    }
}

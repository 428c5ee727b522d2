//! Kernel selection, capacity query and launch.
//!
//! Every (head dimension, storage width, zero point, split) combination is
//! its own monomorphized [`attend_group`] instance. Selection happens once
//! per launch through a small table; nothing inside a group branches on
//! those axes at runtime.
//!
//! The grid is `[num_heads, batch, seq_len_tile]`. Groups run on the rayon
//! pool against shared read-only caches, and the new-token stores they
//! return are applied once the grid has drained.

use candle_core::{DType, Tensor};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::attention::element::Element;
use crate::attention::kernel::{
    attend_group, ExecutionShape, GroupCoord, GroupOutcome, LaunchContext, Timeline,
};
use crate::attention::multi_block::{MultiBlockWorkspace, TilePlan};
use crate::attention::params::{AttentionParams, HeadRouting};
use crate::attention::rotary::RotaryEmbedding;
use crate::config::AttentionConfig;
use crate::core::kv_cache::{HeadKind, KvCacheAddressor, StreamingKvCache};
use crate::core::quant::{BitWidth, Int4Codec, Int8Codec, QuantMode};
use crate::error::{Error, Result};

/// Head dimensions with a compiled kernel.
pub const SUPPORTED_HEAD_DIMS: [usize; 5] = [32, 64, 96, 128, 256];

/// Register width a head dimension runs at. Padded lanes contribute zero.
pub fn padded_head_dim(head_dim: usize) -> Result<usize> {
    if !SUPPORTED_HEAD_DIMS.contains(&head_dim) {
        return Err(Error::UnsupportedHeadDim(head_dim));
    }
    Ok(head_dim.next_power_of_two())
}

/// Compile-time axes of one kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub dh_max: usize,
    pub mode: QuantMode,
    pub multi_block: bool,
}

/// Entry point of one execution group.
pub type GroupKernel<T, A> = fn(&LaunchContext<'_, T>, &A, GroupCoord) -> GroupOutcome;

macro_rules! quant_variants {
    ($T:ty, $A:ty, $dh:literal, $key:expr) => {
        match ($key.mode.bits, $key.mode.with_zero_point, $key.multi_block) {
            (BitWidth::Int8, false, false) => {
                attend_group::<$T, Int8Codec, $A, $dh, false, false> as GroupKernel<$T, $A>
            }
            (BitWidth::Int8, false, true) => attend_group::<$T, Int8Codec, $A, $dh, false, true>,
            (BitWidth::Int8, true, false) => attend_group::<$T, Int8Codec, $A, $dh, true, false>,
            (BitWidth::Int8, true, true) => attend_group::<$T, Int8Codec, $A, $dh, true, true>,
            (BitWidth::Int4, false, false) => attend_group::<$T, Int4Codec, $A, $dh, false, false>,
            (BitWidth::Int4, false, true) => attend_group::<$T, Int4Codec, $A, $dh, false, true>,
            (BitWidth::Int4, true, false) => attend_group::<$T, Int4Codec, $A, $dh, true, false>,
            (BitWidth::Int4, true, true) => attend_group::<$T, Int4Codec, $A, $dh, true, true>,
        }
    };
}

/// Look up the kernel instance for `key`.
pub fn select_kernel<T: Element, A: KvCacheAddressor>(key: KernelKey) -> Result<GroupKernel<T, A>> {
    let kernel = match key.dh_max {
        32 => quant_variants!(T, A, 32, key),
        64 => quant_variants!(T, A, 64, key),
        128 => quant_variants!(T, A, 128, key),
        256 => quant_variants!(T, A, 256, key),
        other => return Err(Error::UnsupportedHeadDim(other)),
    };
    Ok(kernel)
}

/// Scratch bytes one group needs to iterate `len` history positions.
///
/// The softmax, value-reduction, rotary and split-combine regions reuse the
/// same memory; the metadata preload sits next to them.
pub fn shared_memory_bytes<T: Element>(
    shape: &ExecutionShape,
    len: usize,
    rotary_dim: usize,
    multi_block_tiles: Option<usize>,
    mode: QuantMode,
    preload_switch: usize,
) -> usize {
    let elem = T::DTYPE.size_in_bytes();
    let logits = if T::DTYPE == DType::F32 { 0 } else { (len + 1) * elem };
    let softmax = (len + 1).div_ceil(4) * 16 + logits;
    let red = (shape.v_per_iter / 2) * shape.dh_max * 4;
    let rotary = 2 * rotary_dim * elem;
    let combine = multi_block_tiles.map_or(0, |tiles| tiles * shape.dh_max * 4);
    let preload = if len <= preload_switch {
        let per_token = if mode.with_zero_point { 2 } else { 1 };
        (len + 1) * 2 * 2 * per_token * 2
    } else {
        0
    };
    softmax.max(red).max(rotary).max(combine) + preload
}

/// Walk the group size candidates, largest first, until one fits.
fn select_shape<T: Element>(
    config: &AttentionConfig,
    dh_max: usize,
    len: usize,
    plan: &TilePlan,
) -> Result<(ExecutionShape, usize)> {
    let launch = &config.launch;
    let available = launch.shared_memory_bytes;
    let tiles = plan.multi_block.then_some(config.multi_block.max_seq_len_tile);
    let mut smallest = None;

    for &threads in &launch.threads_per_block_candidates {
        let shape = match ExecutionShape::new::<T>(config.head_dim, dh_max, threads) {
            Ok(shape) => shape,
            Err(e @ Error::VectorWidth { .. }) => return Err(e),
            Err(_) => continue,
        };
        let required = shared_memory_bytes::<T>(
            &shape,
            len,
            config.rotary.dim,
            tiles,
            config.cache.quant_mode(),
            launch.smem_preload_switch,
        );
        if required <= available {
            return Ok((shape, required));
        }
        warn!(threads, required, available, "group size does not fit shared memory, falling back");
        smallest = Some(smallest.map_or(required, |s: usize| s.min(required)));
    }

    match smallest {
        Some(required) => Err(Error::SharedMemoryExhausted { required, available }),
        None => Err(Error::Config(format!(
            "no group size candidate covers head dim {}",
            config.head_dim
        ))),
    }
}

fn check_cache<A: KvCacheAddressor>(
    cache: &A,
    config: &AttentionConfig,
    heads: usize,
    sub_chunk_tokens: Option<usize>,
    name: &str,
) -> Result<()> {
    let layout = cache.layout();
    let mode = config.cache.quant_mode();
    if layout.mode() != mode {
        return Err(Error::QuantModeMismatch {
            cache: layout.mode().to_string(),
            requested: mode.to_string(),
        });
    }
    Error::check_len("cache head dim", config.head_dim, layout.head_dim())?;
    if layout.sub_chunk_tokens() != sub_chunk_tokens {
        return Err(Error::Config(format!(
            "{name} cache keeps statistics every {:?} tokens, configured {:?}",
            layout.sub_chunk_tokens(),
            sub_chunk_tokens
        )));
    }
    if layout.num_heads() < heads {
        return Err(Error::Config(format!(
            "{name} cache holds {} heads, routing needs {heads}",
            layout.num_heads()
        )));
    }
    Ok(())
}

/// The two caches a step reads and appends to.
pub struct DecodeCaches<'a, R, S> {
    pub retrieval: &'a mut R,
    pub streaming: Option<&'a mut S>,
}

impl<'a, R, S> DecodeCaches<'a, R, S> {
    pub fn new(retrieval: &'a mut R, streaming: &'a mut S) -> Self {
        Self {
            retrieval,
            streaming: Some(streaming),
        }
    }
}

impl<'a, R> DecodeCaches<'a, R, StreamingKvCache> {
    /// Every head is a retrieval head.
    pub fn retrieval_only(retrieval: &'a mut R) -> Self {
        Self {
            retrieval,
            streaming: None,
        }
    }
}

/// What a launch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    pub threads: usize,
    pub shared_memory_bytes: usize,
    pub plan: TilePlan,
    pub groups_run: usize,
    pub groups_skipped: usize,
    pub cache_stores: usize,
    pub finalizers: usize,
}

/// Run one decode step.
///
/// Writes `[batch, num_heads, head_dim]` into `out` (rows of finished
/// sequences are left untouched) and appends the step's K/V to the caches.
/// Every configuration check happens before any group runs.
pub fn decode_attention<T, R, S>(
    params: &AttentionParams<'_, T>,
    caches: DecodeCaches<'_, R, S>,
    workspace: &MultiBlockWorkspace,
    out: &mut [T],
) -> Result<LaunchReport>
where
    T: Element,
    R: KvCacheAddressor,
    S: KvCacheAddressor,
{
    params.validate()?;
    let config = params.config;
    let routing = params.routing;
    let (batch, heads, dh) = (params.batch_size, config.num_heads, config.head_dim);
    let qpk = config.qheads_per_kv();
    Error::check_len("output buffer", batch * heads * dh, out.len())?;

    let dh_max = padded_head_dim(dh)?;
    if dh % T::VEC_SIZE != 0 {
        return Err(Error::VectorWidth {
            head_dim: dh,
            vec_size: T::VEC_SIZE,
        });
    }
    let mode = config.cache.quant_mode();

    let DecodeCaches {
        retrieval,
        mut streaming,
    } = caches;
    check_cache(
        &*retrieval,
        config,
        routing.num_retrieval_kv_heads(),
        config.cache.sub_chunk_tokens,
        "retrieval",
    )?;
    if routing.num_streaming_kv_heads() > 0 {
        let cache = streaming.as_deref().ok_or_else(|| {
            Error::Config("streaming heads routed without a streaming cache".into())
        })?;
        check_cache(cache, config, routing.num_streaming_kv_heads(), None, "streaming")?;
    }

    // Capacity and iteration lengths of every live sequence.
    let mut retrieval_len = 0;
    let mut streaming_len = 0;
    for b in (0..batch).filter(|&b| !params.is_finished(b)) {
        let ctx = params.context_lengths[b];
        if routing.num_retrieval_kv_heads() > 0 {
            retrieval.check_capacity(b, ctx)?;
            let tpb = retrieval.tokens_per_block();
            if let Some(pages) = params.sparse {
                pages.validate(b, ctx, tpb, |h| {
                    routing.route(h / qpk).kind == HeadKind::Retrieval
                })?;
            }
            for h in (0..heads).filter(|h| routing.route(h / qpk).kind == HeadKind::Retrieval) {
                let remap = params.sparse.map(|pages| pages.remap(b, h, ctx, tpb));
                let len = Timeline::new(retrieval.window(), remap, ctx).valid_length();
                retrieval_len = retrieval_len.max(len);
            }
        }
        if let Some(cache) = streaming.as_deref().filter(|_| routing.num_streaming_kv_heads() > 0) {
            cache.check_capacity(b, ctx)?;
            let len = Timeline::new(cache.window(), None, ctx).valid_length();
            streaming_len = streaming_len.max(len);
        }
    }

    let plan = TilePlan::plan(&config.multi_block, batch, heads, retrieval_len);
    if plan.multi_block {
        workspace.check_capacity(batch, heads, plan.seq_len_tile)?;
    }
    let group_len = if plan.multi_block {
        plan.timesteps_per_block
    } else {
        retrieval_len
    }
    .max(streaming_len);
    let (shape, smem) = select_shape::<T>(config, dh_max, group_len, &plan)?;

    let retrieval_kernel = select_kernel::<T, R>(KernelKey {
        dh_max,
        mode,
        multi_block: plan.multi_block,
    })?;
    let streaming_kernel = select_kernel::<T, S>(KernelKey {
        dh_max,
        mode,
        multi_block: false,
    })?;

    debug!(
        threads = shape.threads,
        shared_memory = smem,
        multi_block = plan.multi_block,
        seq_len_tile = plan.seq_len_tile,
        timesteps_per_block = plan.timesteps_per_block,
        batch,
        "launching decode attention"
    );

    let rotary = RotaryEmbedding::from_config(&config.rotary);
    let launch = LaunchContext {
        params,
        shape,
        plan,
        rotary: &rotary,
        workspace,
    };
    let retrieval_cache: &R = retrieval;
    let streaming_cache: Option<&S> = streaming.as_deref();

    let grid: Vec<GroupCoord> = (0..heads)
        .flat_map(|head| {
            (0..batch).flat_map(move |b| {
                (0..plan.seq_len_tile).map(move |tile| GroupCoord { head, batch: b, tile })
            })
        })
        .collect();

    let outcomes: Vec<(GroupCoord, GroupOutcome)> = grid
        .into_par_iter()
        .map(|coord| {
            let outcome = match (routing.route(coord.head / qpk).kind, streaming_cache) {
                (HeadKind::Retrieval, _) => retrieval_kernel(&launch, retrieval_cache, coord),
                (HeadKind::Streaming, Some(cache)) => streaming_kernel(&launch, cache, coord),
                (HeadKind::Streaming, None) => GroupOutcome::skipped(),
            };
            (coord, outcome)
        })
        .collect();

    let mut report = LaunchReport {
        threads: shape.threads,
        shared_memory_bytes: smem,
        plan,
        groups_run: 0,
        groups_skipped: 0,
        cache_stores: 0,
        finalizers: 0,
    };
    for (coord, outcome) in outcomes {
        if outcome.skipped {
            report.groups_skipped += 1;
            continue;
        }
        report.groups_run += 1;
        if let Some(row) = outcome.output {
            let start = (coord.batch * heads + coord.head) * dh;
            for (o, x) in out[start..start + dh].iter_mut().zip(row) {
                *o = T::from_f32(x);
            }
        }
        if let Some((kind, write)) = outcome.cache_write {
            match kind {
                HeadKind::Retrieval => retrieval.storage_mut().apply(&write),
                HeadKind::Streaming => {
                    if let Some(cache) = streaming.as_deref_mut() {
                        cache.storage_mut().apply(&write);
                    }
                }
            }
            report.cache_stores += 1;
        }
        if outcome.finalized {
            report.finalizers += 1;
        }
    }
    Ok(report)
}

/// Tensor front end of [`decode_attention`].
///
/// `q` is `[batch, num_heads, head_dim]`, `k` and `v` are
/// `[batch, num_kv_heads, head_dim]`; all must already be of dtype `T`.
#[allow(clippy::too_many_arguments)]
pub fn decode_attention_tensors<T, R, S>(
    config: &AttentionConfig,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    context_lengths: &[usize],
    routing: &HeadRouting,
    caches: DecodeCaches<'_, R, S>,
    workspace: &MultiBlockWorkspace,
) -> Result<Tensor>
where
    T: Element,
    R: KvCacheAddressor,
    S: KvCacheAddressor,
{
    let (batch, num_heads, head_dim) = q.dims3()?;
    let (k_batch, num_kv_heads, k_dim) = k.dims3()?;
    Error::check_len("context lengths", batch, context_lengths.len())?;
    Error::check_len("key batch", batch, k_batch)?;
    Error::check_len("query heads", config.num_heads, num_heads)?;
    Error::check_len("key/value heads", config.num_kv_heads, num_kv_heads)?;
    Error::check_len("key head dim", head_dim, k_dim)?;
    Error::check_len("value elements", k.elem_count(), v.elem_count())?;

    let q_host = q.flatten_all()?.to_vec1::<T>()?;
    let k_host = k.flatten_all()?.to_vec1::<T>()?;
    let v_host = v.flatten_all()?.to_vec1::<T>()?;
    let params = AttentionParams::new(config, &q_host, &k_host, &v_host, context_lengths, routing);

    let mut out = vec![T::from_f32(0.0); batch * num_heads * head_dim];
    decode_attention(&params, caches, workspace, &mut out)?;
    Ok(Tensor::from_vec(out, (batch, num_heads, head_dim), q.device())?)
}

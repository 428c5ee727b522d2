//! Shared decode-step harness for the integration tests.

#![allow(dead_code)]

use nano_decode_attn::attention::reference::reference_head_attention;
use nano_decode_attn::attention::rotary::RotaryEmbedding;
use nano_decode_attn::attention::{
    reference_from_cache, Element, HeadRouting, LaunchReport, MultiBlockWorkspace,
};
use nano_decode_attn::config::{AttentionConfig, StreamingConfig};
use nano_decode_attn::core::block::{compute_num_blocks, BlockLayout};
use nano_decode_attn::core::sparse::SparsePages;
use nano_decode_attn::core::{
    BitWidth, HeadKind, KvCacheAddressor, PagedKvCache, StreamingKvCache, StreamingWindow,
};
use nano_decode_attn::{decode_attention, AttentionParams, DecodeCaches, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Small configuration: 16-token blocks, sink 16, local 32, no rotary.
pub fn test_config(
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    bits: BitWidth,
    zero: bool,
) -> AttentionConfig {
    let mut config = AttentionConfig::default();
    config.num_heads = num_heads;
    config.num_kv_heads = num_kv_heads;
    config.head_dim = head_dim;
    config.rotary.dim = 0;
    config.cache.tokens_per_block = 16;
    config.cache.bits = bits;
    config.cache.with_zero_point = zero;
    config.streaming = StreamingConfig {
        sink_tokens: 16,
        sink_blocks: 1,
        local_tokens: 32,
        local_blocks: 2,
    };
    config
}

pub fn random_row(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

/// Q/K/V of one step, as f32.
#[derive(Debug, Clone)]
pub struct StepInputs {
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
}

pub struct Harness {
    pub config: AttentionConfig,
    pub batch: usize,
    pub routing: HeadRouting,
    pub retrieval: PagedKvCache,
    pub streaming: StreamingKvCache,
    pub window: StreamingWindow,
    pub workspace: MultiBlockWorkspace,
    pub rotary: RotaryEmbedding,
    pub rng: StdRng,
    pub lens: Vec<usize>,
    /// Unquantized history per (sequence, kv head), flat `[t, head_dim]`.
    raw_keys: Vec<Vec<Vec<f32>>>,
    raw_values: Vec<Vec<Vec<f32>>>,
}

impl Harness {
    /// Caches sized for `max_tokens` per sequence.
    pub fn new(
        config: AttentionConfig,
        batch: usize,
        retrieval_flags: &[bool],
        max_tokens: usize,
        seed: u64,
    ) -> Self {
        let routing = HeadRouting::from_flags(retrieval_flags);
        let tpb = config.cache.tokens_per_block;
        let (dh, mode) = (config.head_dim, config.cache.quant_mode());

        let blocks_per_seq = compute_num_blocks(max_tokens, tpb);
        let layout = BlockLayout::new(tpb, routing.num_retrieval_kv_heads().max(1), dh, mode)
            .with_statistics(config.cache.sub_chunk_tokens)
            .unwrap();
        let mut retrieval = PagedKvCache::new(layout, blocks_per_seq * batch, batch).unwrap();
        retrieval.storage_mut().assign_contiguous(blocks_per_seq).unwrap();

        let window = StreamingWindow::from_config(&config.streaming, tpb).unwrap();
        let layout = BlockLayout::new(tpb, routing.num_streaming_kv_heads().max(1), dh, mode);
        let streaming_blocks = window.table_blocks() * batch;
        let mut streaming =
            StreamingKvCache::new(layout, window, streaming_blocks, batch).unwrap();
        streaming.storage_mut().assign_contiguous(window.table_blocks()).unwrap();

        let max_tile = config.multi_block.max_seq_len_tile;
        let workspace = MultiBlockWorkspace::new(batch, config.num_heads, max_tile);
        let rotary = RotaryEmbedding::from_config(&config.rotary);
        let kv_heads = config.num_kv_heads;
        Self {
            config,
            batch,
            routing,
            retrieval,
            streaming,
            window,
            workspace,
            rotary,
            rng: StdRng::seed_from_u64(seed),
            lens: vec![0; batch],
            raw_keys: vec![vec![Vec::new(); kv_heads]; batch],
            raw_values: vec![vec![Vec::new(); kv_heads]; batch],
        }
    }

    /// Fill sequence `b` with `lens[b]` random tokens.
    pub fn seed(&mut self, lens: &[usize]) {
        let dh = self.config.head_dim;
        for (b, &len) in lens.iter().enumerate() {
            for t in 0..len {
                for kv_head in 0..self.config.num_kv_heads {
                    let key = random_row(&mut self.rng, dh);
                    let value = random_row(&mut self.rng, dh);
                    let route = self.routing.route(kv_head);
                    let stored = match route.kind {
                        HeadKind::Retrieval => {
                            self.retrieval.store_token(b, t, route.rank, &key, &value)
                        }
                        HeadKind::Streaming => {
                            self.streaming.store_token(b, t, route.rank, &key, &value)
                        }
                    };
                    stored.unwrap();
                    self.raw_keys[b][kv_head].extend(key);
                    self.raw_values[b][kv_head].extend(value);
                }
            }
            self.lens[b] = len;
        }
    }

    pub fn inputs(&mut self) -> StepInputs {
        let (b, dh) = (self.batch, self.config.head_dim);
        StepInputs {
            q: random_row(&mut self.rng, b * self.config.num_heads * dh),
            k: random_row(&mut self.rng, b * self.config.num_kv_heads * dh),
            v: random_row(&mut self.rng, b * self.config.num_kv_heads * dh),
        }
    }

    /// Run one step in precision `T`. Output rows start at 7.0.
    pub fn run<T: Element>(
        &mut self,
        inputs: &StepInputs,
        finished: Option<&[bool]>,
        sparse: Option<SparsePages<'_>>,
    ) -> (Vec<f32>, LaunchReport) {
        self.try_run::<T>(inputs, finished, sparse).unwrap()
    }

    pub fn try_run<T: Element>(
        &mut self,
        inputs: &StepInputs,
        finished: Option<&[bool]>,
        sparse: Option<SparsePages<'_>>,
    ) -> Result<(Vec<f32>, LaunchReport)> {
        let to_t = |x: &[f32]| x.iter().map(|&e| T::from_f32(e)).collect::<Vec<T>>();
        let (q, k, v) = (to_t(&inputs.q), to_t(&inputs.k), to_t(&inputs.v));
        let mut params = AttentionParams::new(&self.config, &q, &k, &v, &self.lens, &self.routing);
        if let Some(finished) = finished {
            params = params.with_finished(finished);
        }
        if let Some(sparse) = sparse {
            params = params.with_sparse_pages(sparse);
        }

        let rows = self.batch * self.config.num_heads;
        let mut out = vec![T::from_f32(7.0); rows * self.config.head_dim];
        let report = decode_attention(
            &params,
            DecodeCaches::new(&mut self.retrieval, &mut self.streaming),
            &self.workspace,
            &mut out,
        )?;
        Ok((out.iter().map(|x| x.to_f32()).collect(), report))
    }

    fn rotated(&self, row: &[f32], ctx: usize) -> Vec<f32> {
        let mut x = row.to_vec();
        self.rotary.apply(&mut x, ctx, ctx + 1);
        x
    }

    fn current(&self, b: usize, h: usize, inputs: &StepInputs) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        let dh = self.config.head_dim;
        let kv_head = h / self.config.qheads_per_kv();
        let ctx = self.lens[b];
        let q_start = (b * self.config.num_heads + h) * dh;
        let kv_start = (b * self.config.num_kv_heads + kv_head) * dh;
        (
            self.rotated(&inputs.q[q_start..q_start + dh], ctx),
            self.rotated(&inputs.k[kv_start..kv_start + dh], ctx),
            inputs.v[kv_start..kv_start + dh].to_vec(),
        )
    }

    /// History tokens head `h` of sequence `b` attends to (without sparse pages).
    pub fn history(&self, b: usize, h: usize) -> Vec<usize> {
        let ctx = self.lens[b];
        match self.routing.route(h / self.config.qheads_per_kv()).kind {
            HeadKind::Retrieval => (0..ctx).collect(),
            HeadKind::Streaming => self.window.visible_tokens(ctx).collect(),
        }
    }

    /// Reference over the dequantized cache contents of `history`.
    pub fn expected_over(
        &self,
        b: usize,
        h: usize,
        inputs: &StepInputs,
        history: &[usize],
    ) -> Vec<f32> {
        let (q, k, v) = self.current(b, h, inputs);
        let route = self.routing.route(h / self.config.qheads_per_kv());
        let rank = route.rank;
        let expected = match route.kind {
            HeadKind::Retrieval => {
                reference_from_cache(&self.retrieval, b, rank, history, &q, &k, &v)
            }
            HeadKind::Streaming => {
                reference_from_cache(&self.streaming, b, rank, history, &q, &k, &v)
            }
        };
        expected.unwrap()
    }

    /// Reference over the dequantized cache, as the kernel reads it.
    pub fn expected(&self, b: usize, h: usize, inputs: &StepInputs) -> Vec<f32> {
        self.expected_over(b, h, inputs, &self.history(b, h))
    }

    /// Reference over the unquantized history.
    pub fn expected_raw(&self, b: usize, h: usize, inputs: &StepInputs) -> Vec<f32> {
        let dh = self.config.head_dim;
        let kv_head = h / self.config.qheads_per_kv();
        let (q, k, v) = self.current(b, h, inputs);
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for t in self.history(b, h) {
            keys.extend_from_slice(&self.raw_keys[b][kv_head][t * dh..(t + 1) * dh]);
            values.extend_from_slice(&self.raw_values[b][kv_head][t * dh..(t + 1) * dh]);
        }
        keys.extend(k);
        values.extend(v);
        reference_head_attention(&q, &keys, &values).unwrap()
    }

    /// Output row of (b, h).
    pub fn row<'a>(&self, out: &'a [f32], b: usize, h: usize) -> &'a [f32] {
        let dh = self.config.head_dim;
        let start = (b * self.config.num_heads + h) * dh;
        &out[start..start + dh]
    }

    /// Account for the token the step just appended.
    pub fn advance(&mut self, inputs: &StepInputs, finished: Option<&[bool]>) {
        let dh = self.config.head_dim;
        for b in 0..self.batch {
            if finished.is_some_and(|f| f[b]) {
                continue;
            }
            let ctx = self.lens[b];
            for kv_head in 0..self.config.num_kv_heads {
                let start = (b * self.config.num_kv_heads + kv_head) * dh;
                let k = self.rotated(&inputs.k[start..start + dh], ctx);
                self.raw_keys[b][kv_head].extend(k);
                self.raw_values[b][kv_head].extend_from_slice(&inputs.v[start..start + dh]);
            }
            self.lens[b] += 1;
        }
    }
}

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use nano_decode_attn::attention::rotary::RotaryEmbedding;
use nano_decode_attn::attention::{reference_from_cache, Element};
use nano_decode_attn::core::block::{compute_num_blocks, BlockLayout};
use nano_decode_attn::core::{
    BitWidth, KvCacheAddressor, PagedKvCache, StreamingKvCache, StreamingWindow,
};
use nano_decode_attn::{
    decode_attention, logging, AttentionConfig, AttentionParams, DecodeCaches, HeadRouting,
    MultiBlockWorkspace, Result,
};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Precision {
    F32,
    F16,
    Bf16,
}

#[derive(Parser, Debug)]
#[command(name = "nano-decode-attn")]
#[command(about = "Run decode attention steps over a paged, quantized KV cache")]
struct Args {
    /// JSON configuration file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the effective configuration as JSON and exit
    #[arg(long)]
    dump_config: Option<PathBuf>,

    /// Number of sequences
    #[arg(short, long, default_value = "2")]
    batch_size: usize,

    /// Tokens of random history seeded before the first step
    #[arg(long, default_value = "300")]
    history: usize,

    /// Decode steps to run
    #[arg(long, default_value = "4")]
    steps: usize,

    /// Trailing key/value heads routed to the streaming cache
    #[arg(long, default_value = "0")]
    streaming_heads: usize,

    /// Compute precision of Q/K/V and the output
    #[arg(long, value_enum, default_value = "f32")]
    precision: Precision,

    /// Random seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Compare every step against float32 reference attention
    #[arg(long)]
    verify: bool,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let config = match &args.config {
        Some(path) => AttentionConfig::from_json_file(path)?,
        None => AttentionConfig::default(),
    };
    config.validate()?;

    if let Some(path) = &args.dump_config {
        config.to_json_file(path)?;
        info!(path = %path.display(), "configuration written");
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        heads = config.num_heads,
        kv_heads = config.num_kv_heads,
        head_dim = config.head_dim,
        mode = %config.cache.quant_mode(),
        precision = ?args.precision,
        "nano-decode-attn"
    );

    match args.precision {
        Precision::F32 => run::<f32>(&args, &config),
        Precision::F16 => run::<f16>(&args, &config),
        Precision::Bf16 => run::<bf16>(&args, &config),
    }
}

fn random_row(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn run<T: Element>(args: &Args, config: &AttentionConfig) -> Result<()> {
    let batch = args.batch_size;
    let (heads, kv_heads, dh) = (config.num_heads, config.num_kv_heads, config.head_dim);
    let qpk = config.qheads_per_kv();
    let tpb = config.cache.tokens_per_block;
    let mode = config.cache.quant_mode();
    let mut rng = StdRng::seed_from_u64(args.seed);

    let streaming_heads = args.streaming_heads.min(kv_heads);
    let flags: Vec<bool> = (0..kv_heads).map(|h| h < kv_heads - streaming_heads).collect();
    let routing = HeadRouting::from_flags(&flags);

    let blocks_per_seq = compute_num_blocks(args.history + args.steps, tpb);
    let retrieval_layout = BlockLayout::new(tpb, routing.num_retrieval_kv_heads().max(1), dh, mode)
        .with_statistics(config.cache.sub_chunk_tokens)?;
    let mut retrieval = PagedKvCache::new(retrieval_layout, blocks_per_seq * batch, batch)?;
    retrieval.storage_mut().assign_contiguous(blocks_per_seq)?;

    let window = StreamingWindow::from_config(&config.streaming, tpb)?;
    let streaming_layout = BlockLayout::new(tpb, routing.num_streaming_kv_heads().max(1), dh, mode);
    let streaming_blocks = window.table_blocks() * batch;
    let mut streaming = StreamingKvCache::new(streaming_layout, window, streaming_blocks, batch)?;
    streaming.storage_mut().assign_contiguous(window.table_blocks())?;

    for b in 0..batch {
        for t in 0..args.history {
            for kv_head in 0..kv_heads {
                let (key, value) = (random_row(&mut rng, dh), random_row(&mut rng, dh));
                let route = routing.route(kv_head);
                if flags[kv_head] {
                    retrieval.store_token(b, t, route.rank, &key, &value)?;
                } else {
                    streaming.store_token(b, t, route.rank, &key, &value)?;
                }
            }
        }
    }
    info!(batch, history = args.history, blocks_per_seq, "history seeded");

    let workspace = MultiBlockWorkspace::new(batch, heads, config.multi_block.max_seq_len_tile);
    let rotary = RotaryEmbedding::from_config(&config.rotary);
    let tolerance = match mode.bits {
        BitWidth::Int8 => 0.05,
        BitWidth::Int4 => 0.5,
    };

    for step in 0..args.steps {
        let ctx = args.history + step;
        let lens = vec![ctx; batch];
        let to_t = |row: Vec<f32>| row.into_iter().map(T::from_f32).collect::<Vec<T>>();
        let q = to_t(random_row(&mut rng, batch * heads * dh));
        let k = to_t(random_row(&mut rng, batch * kv_heads * dh));
        let v = to_t(random_row(&mut rng, batch * kv_heads * dh));
        let params = AttentionParams::new(config, &q, &k, &v, &lens, &routing);

        let mut out = vec![T::from_f32(0.0); batch * heads * dh];
        let report = decode_attention(
            &params,
            DecodeCaches::new(&mut retrieval, &mut streaming),
            &workspace,
            &mut out,
        )?;
        info!(
            step,
            ctx,
            threads = report.threads,
            multi_block = report.plan.multi_block,
            tiles = report.plan.seq_len_tile,
            groups = report.groups_run,
            stores = report.cache_stores,
            finalizers = report.finalizers,
            "decode step"
        );

        if !args.verify {
            continue;
        }
        let mut max_err = 0.0f32;
        for b in 0..batch {
            for h in 0..heads {
                let kv_head = h / qpk;
                let route = routing.route(kv_head);
                let rotate = |row: &[T]| {
                    let mut x: Vec<f32> = row.iter().map(|&e| e.to_f32()).collect();
                    rotary.apply(&mut x, ctx, ctx + 1);
                    x
                };
                let q_rot = rotate(params.q_row(b, h));
                let k_rot = rotate(params.k_row(b, kv_head));
                let v_row: Vec<f32> =
                    params.v_row(b, kv_head).iter().map(|&e| e.to_f32()).collect();

                let rank = route.rank;
                let expected = if flags[kv_head] {
                    let history: Vec<usize> = (0..ctx).collect();
                    reference_from_cache(&retrieval, b, rank, &history, &q_rot, &k_rot, &v_row)?
                } else {
                    let history: Vec<usize> = window.visible_tokens(ctx).collect();
                    reference_from_cache(&streaming, b, rank, &history, &q_rot, &k_rot, &v_row)?
                };
                let start = (b * heads + h) * dh;
                for (got, want) in out[start..start + dh].iter().zip(&expected) {
                    max_err = max_err.max((got.to_f32() - want).abs());
                }
            }
        }
        if max_err > tolerance {
            warn!(step, max_err, tolerance, "output diverges from reference attention");
        } else {
            info!(step, max_err, "output matches reference attention");
        }
    }
    Ok(())
}

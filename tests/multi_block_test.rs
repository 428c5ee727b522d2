//! Split (multi-block) reduction across partitions of a long history.

mod common;

use common::{max_abs_diff, test_config, Harness};
use nano_decode_attn::core::sparse::SparseRemap;
use nano_decode_attn::core::{BitWidth, SparsePages};
use nano_decode_attn::AttentionConfig;

fn split_config(enabled: bool) -> AttentionConfig {
    let mut config = test_config(4, 2, 64, BitWidth::Int8, false);
    config.multi_block.enabled = enabled;
    config.multi_block.switch_threshold = 64;
    config.multi_block.min_timesteps_per_block = 32;
    config.multi_block.max_seq_len_tile = 8;
    config.multi_block.multi_processor_count = 64;
    config
}

#[test]
fn test_split_matches_single_block() {
    let mut split = Harness::new(split_config(true), 2, &[true, true], 320, 29);
    let mut single = Harness::new(split_config(false), 2, &[true, true], 320, 29);
    split.seed(&[300, 100]);
    single.seed(&[300, 100]);

    for step in 0..2 {
        let inputs = split.inputs();
        let _ = single.inputs();
        let (out, report) = split.run::<f32>(&inputs, None, None);
        let (reference, single_report) = single.run::<f32>(&inputs, None, None);

        assert!(report.plan.multi_block);
        assert!(!single_report.plan.multi_block);
        // 64 processors over 8 (sequence, head) pairs
        assert_eq!(report.plan.seq_len_tile, 8);
        assert_eq!(report.finalizers, 2 * 4);
        assert_eq!(report.cache_stores, 2 * 2);
        assert_eq!(single_report.finalizers, 0);
        assert!(split.workspace.is_idle(), "step {step} left partials behind");

        let diff = max_abs_diff(&out, &reference);
        assert!(diff < 1e-4, "step {step}: diff {diff}");
        for b in 0..2 {
            for head in 0..4 {
                let expected = split.expected(b, head, &inputs);
                let diff = max_abs_diff(split.row(&out, b, head), &expected);
                assert!(diff < 1e-4, "step {step} seq {b} head {head}: diff {diff}");
            }
        }
        split.advance(&inputs, None);
        single.advance(&inputs, None);
    }
}

#[test]
fn test_short_sequence_uses_fewer_partitions() {
    let mut h = Harness::new(split_config(true), 2, &[true, true], 320, 31);
    h.seed(&[300, 20]);
    let inputs = h.inputs();
    let (out, report) = h.run::<f32>(&inputs, None, None);

    // 300 positions over 8 partitions of 38; the 20-token sequence needs one
    assert_eq!(report.plan.timesteps_per_block, 38);
    let live_groups = 4 * 8 + 4;
    assert_eq!(report.groups_run, live_groups);
    assert_eq!(report.groups_skipped, 2 * 4 * 8 - live_groups);
    assert_eq!(report.finalizers, 8);

    for head in 0..4 {
        let diff = max_abs_diff(h.row(&out, 1, head), &h.expected(1, head, &inputs));
        assert!(diff < 1e-4, "head {head}: diff {diff}");
    }
}

#[test]
fn test_finished_sequence_skips_every_partition() {
    let mut h = Harness::new(split_config(true), 2, &[true, true], 320, 37);
    h.seed(&[300, 300]);
    let finished = [true, false];
    let inputs = h.inputs();
    let (out, report) = h.run::<f32>(&inputs, Some(&finished), None);

    assert_eq!(report.finalizers, 4);
    assert!(out[..4 * 64].iter().all(|&x| x == 7.0));
    assert!(h.workspace.is_idle());
    for head in 0..4 {
        let diff = max_abs_diff(h.row(&out, 1, head), &h.expected(1, head, &inputs));
        assert!(diff < 1e-4);
    }
}

#[test]
fn test_below_threshold_stays_single_block() {
    let mut h = Harness::new(split_config(true), 1, &[true, true], 320, 41);
    h.seed(&[64]);
    let inputs = h.inputs();
    let (_, report) = h.run::<f32>(&inputs, None, None);
    assert!(!report.plan.multi_block);
    assert_eq!(report.plan.seq_len_tile, 1);
}

#[test]
fn test_split_with_sparse_pages_matches_single_block() {
    let mut split = Harness::new(split_config(true), 1, &[true, true], 320, 43);
    let mut single = Harness::new(split_config(false), 1, &[true, true], 320, 43);
    split.seed(&[300]);
    single.seed(&[300]);

    // 19 pages of history; page 18 is the current one
    let selections: [[u32; 8]; 4] = [
        [0, 2, 5, 7, 9, 11, 13, 18],
        [1, 3, 4, 6, 8, 10, 12, 18],
        [14, 15, 16, 17, 0, 1, 2, 18],
        [3, 3, 9, 9, 12, 12, 17, 18],
    ];
    let flat: Vec<u32> = selections.iter().flatten().copied().collect();

    for step in 0..2 {
        let inputs = split.inputs();
        let _ = single.inputs();
        let pages = SparsePages::new(&flat, 1, 4, 8).unwrap();
        let (out, report) = split.run::<f32>(&inputs, None, Some(pages));
        let (reference, _) = single.run::<f32>(&inputs, None, Some(pages));

        // 7 full pages plus the current page's 12 + step tokens
        let budget: usize = 7 * 16 + 12 + step;
        assert!(report.plan.multi_block);
        assert_eq!(report.plan.seq_len_tile, 4);
        assert_eq!(report.plan.timesteps_per_block, budget.div_ceil(4));
        assert_eq!(report.finalizers, 4);
        assert!(split.workspace.is_idle());

        let diff = max_abs_diff(&out, &reference);
        assert!(diff < 1e-4, "step {step}: diff {diff}");
        for (head, selection) in selections.iter().enumerate() {
            let remap = SparseRemap::new(selection, 16, 300 + step);
            assert_eq!(remap.valid_length(), budget);
            let history: Vec<usize> = (0..budget).map(|i| remap.remap(i)).collect();
            let expected = split.expected_over(0, head, &inputs, &history);
            let diff = max_abs_diff(split.row(&out, 0, head), &expected);
            assert!(diff < 1e-4, "step {step} head {head}: diff {diff}");
        }
        split.advance(&inputs, None);
        single.advance(&inputs, None);
    }
}

#[test]
fn test_split_with_streaming_heads_matches_single_block() {
    let mut split = Harness::new(split_config(true), 2, &[true, false], 320, 47);
    let mut single = Harness::new(split_config(false), 2, &[true, false], 320, 47);
    split.seed(&[300, 100]);
    single.seed(&[300, 100]);

    for step in 0..3 {
        let inputs = split.inputs();
        let _ = single.inputs();
        let (out, report) = split.run::<f32>(&inputs, None, None);
        let (reference, _) = single.run::<f32>(&inputs, None, None);

        assert!(report.plan.multi_block);
        assert_eq!(report.plan.seq_len_tile, 8);
        // only the retrieval heads 0 and 1 are split
        assert_eq!(report.finalizers, 2 * 2);
        assert_eq!(report.cache_stores, 2 * 2);
        assert!(split.workspace.is_idle());

        let diff = max_abs_diff(&out, &reference);
        assert!(diff < 1e-4, "step {step}: diff {diff}");
        for b in 0..2 {
            for head in 0..4 {
                let expected = split.expected(b, head, &inputs);
                let diff = max_abs_diff(split.row(&out, b, head), &expected);
                assert!(diff < 1e-4, "step {step} seq {b} head {head}: diff {diff}");
            }
        }
        split.advance(&inputs, None);
        single.advance(&inputs, None);
    }
}

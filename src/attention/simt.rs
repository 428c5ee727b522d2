//! Lane-level emulation of a cooperative execution group.
//!
//! An execution group is `threads` lanes split into warps of [`WARP_SIZE`].
//! Per-lane registers are modelled as a slice indexed by lane id, and every
//! reduction keeps the shape it has on hardware:
//!
//! 1. butterfly exchange inside a warp (`shuffle_xor`),
//! 2. one value per warp relayed through a small scratch array,
//! 3. a final butterfly over the relay and a broadcast of lane 0.
//!
//! Running the same shape on the CPU keeps the floating point reduction
//! order of each step well defined, which matters when comparing the
//! single-block and split paths.

/// Lanes per warp.
pub const WARP_SIZE: usize = 32;

/// Butterfly all-reduce over aligned groups of `width` lanes.
///
/// After the call every lane of a group holds the group's reduction.
/// `width` must be a power of two dividing `lanes.len()`.
pub fn shuffle_xor_allreduce<F>(lanes: &mut [f32], width: usize, op: F)
where
    F: Fn(f32, f32) -> f32,
{
    debug_assert!(width.is_power_of_two());
    debug_assert_eq!(lanes.len() % width, 0);

    let mut exchanged = vec![0.0f32; lanes.len()];
    let mut mask = width / 2;
    while mask >= 1 {
        // All lanes read before any lane writes.
        for (lane, slot) in exchanged.iter_mut().enumerate() {
            *slot = lanes[lane ^ mask];
        }
        for (reg, other) in lanes.iter_mut().zip(&exchanged) {
            *reg = op(*reg, *other);
        }
        mask /= 2;
    }
}

/// Block-wide all-reduce using the warp / relay / broadcast scheme.
///
/// `lanes` holds one register per thread of the group.
pub fn block_allreduce<F>(lanes: &[f32], identity: f32, op: F) -> f32
where
    F: Fn(f32, f32) -> f32 + Copy,
{
    if lanes.is_empty() {
        return identity;
    }

    let num_warps = lanes.len().div_ceil(WARP_SIZE);
    let mut red_smem = vec![identity; num_warps];

    for (warp, slot) in red_smem.iter_mut().enumerate() {
        let start = warp * WARP_SIZE;
        let end = (start + WARP_SIZE).min(lanes.len());
        let mut regs = vec![identity; WARP_SIZE];
        regs[..end - start].copy_from_slice(&lanes[start..end]);
        shuffle_xor_allreduce(&mut regs, WARP_SIZE, op);
        *slot = regs[0];
    }

    // Lanes below num_warps pick up the relay, the rest hold the identity.
    let width = num_warps.next_power_of_two();
    let mut regs = vec![identity; width];
    regs[..num_warps].copy_from_slice(&red_smem);
    shuffle_xor_allreduce(&mut regs, width, op);
    regs[0]
}

/// Pairwise tree reduction of a value sequence.
pub fn tree_reduce<I, F>(values: I, identity: f32, op: F) -> f32
where
    I: IntoIterator<Item = f32>,
    F: Fn(f32, f32) -> f32,
{
    let mut level: Vec<f32> = values.into_iter().collect();
    if level.is_empty() {
        return identity;
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [a, b] => op(*a, *b),
                [a] => *a,
                _ => identity,
            })
            .collect();
    }
    level[0]
}

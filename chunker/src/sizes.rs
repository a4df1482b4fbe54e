// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Canonical-index arithmetic over tree sizes.
//!
//! The canonical index of a node is its 1-based post-order rank in the
//! content-addressed tree. For a branch factor `B` a full subtree of depth
//! `d` occupies `1 + B + B^2 + … + B^d` index positions, which lets the rank
//! of a root be computed from the byte size alone.

use braid_storage::{CHUNK_SIZE, MAX_BRANCH};

const CHUNK: u64 = CHUNK_SIZE as u64;
const BRANCH: u64 = MAX_BRANCH as u64;

/// Number of leaves of a full subtree of the given depth.
pub fn leaves_at(depth: u32) -> u64 {
    BRANCH.pow(depth)
}

/// Number of index positions a full subtree of the given depth occupies.
pub fn index_at(depth: u32) -> u64 {
    (0..=depth).map(leaves_at).sum()
}

/// Floor of `log_B(leaves)` plus whether `leaves` is an exact power of `B`.
fn tree_depth(leaves: u64) -> (u32, bool) {
    if leaves == 0 {
        return (0, false);
    }
    let mut depth = 0;
    let mut full = 1u64;
    while full * BRANCH <= leaves {
        full *= BRANCH;
        depth += 1;
    }
    (depth, full == leaves)
}

/// Index offset between consecutive full child subtrees directly below a
/// parent of the given standard subtree size.
pub fn child_offset_by_standard_size(size: u64) -> u64 {
    if size <= CHUNK {
        return 0;
    }
    let mut depth = 0;
    let mut cap = CHUNK * BRANCH;
    while size > cap {
        cap *= BRANCH;
        depth += 1;
    }
    index_at(depth)
}

/// Depth of a tree whose root carries the given canonical index.
pub fn depth_for_canonical_index(max_index: u64) -> u32 {
    let mut depth = 1;
    while max_index > index_at(depth - 1) {
        depth += 1;
    }
    depth
}

fn has_siblings_at_same_height(leaves: u64, prev_depth_ctr: u64, uneven: bool) -> bool {
    if leaves == 0 {
        prev_depth_ctr > 1 || (prev_depth_ctr == 1 && uneven)
    } else {
        leaves < BRANCH
    }
}

/// Canonical post-order index of the root of a tree holding `size` bytes.
///
/// Monotone non-decreasing in `size`. Walks the full subtrees the splitter
/// would produce left to right, accounting for the extra root each group of
/// uneven-height siblings introduces.
pub fn tree_index_by_size(size: u64) -> u64 {
    if size <= CHUNK {
        return 1;
    }

    let mut leaves = size / CHUNK;
    let mut index: u64 = 1;
    let (mut floor_depth, saturated) = tree_depth(leaves);
    let mut prev_depth = floor_depth;

    // A trailing partial chunk adds a leaf, and an extra subtree root when it
    // hangs off an otherwise saturated tree.
    if size % CHUNK != 0 {
        index = if floor_depth > 0 && saturated { 3 } else { 2 };
    }

    let mut prev_depth_ctr: u64 = 0;
    while leaves >= BRANCH {
        index += index_at(floor_depth);
        leaves -= leaves_at(floor_depth);

        let uneven = prev_depth != floor_depth;
        if uneven {
            index += 1;
        } else {
            prev_depth_ctr += 1;
        }
        prev_depth = floor_depth;
        floor_depth = tree_depth(leaves).0;

        if has_siblings_at_same_height(leaves, prev_depth_ctr, uneven) {
            index += 1;
        }
    }

    if leaves == 0 {
        index - 1
    } else {
        index + leaves
    }
}

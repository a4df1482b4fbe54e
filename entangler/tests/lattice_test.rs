// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use braid_chunker::{build_complete_tree, split, BuildTreeOptions, NoopRepairer};
use braid_entangler::{Config, Lattice, StrandClass};
use braid_storage::mem::MemChunkStore;
use braid_storage::{Address, CHUNK_SIZE};

const ZERO_ADDR: Address = [0u8; 32];

async fn build_lattice(size: u64) -> Lattice {
    let store = MemChunkStore::new();
    Lattice::new(
        Config::default(),
        size,
        Arc::new(store),
        ZERO_ADDR,
        vec![ZERO_ADDR; 3],
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn lattice_init_allocates_all_vertices() {
    let cases: &[(u64, i64)] = &[
        (7 * CHUNK_SIZE as u64 + 3500, 9),
        (25 * CHUNK_SIZE as u64 + 1, 27),
        (650 * CHUNK_SIZE as u64, 657),
        (5500 * CHUNK_SIZE as u64 + 250, 5545),
    ];

    for &(size, num_blocks) in cases {
        let lattice = build_lattice(size).await;
        assert_eq!(lattice.num_data_blocks, num_blocks, "size {size}");
        assert_eq!(
            lattice.blocks().len() as i64,
            num_blocks * 4,
            "size {size}: expected num_data_blocks * (alpha + 1) vertices"
        );

        for id in 0..num_blocks as usize {
            assert!(!lattice.block(id).is_parity, "size {size}, block {id}");
        }
    }
}

#[tokio::test]
async fn parities_connect_back_to_their_data_blocks() {
    let lattice = build_lattice(650 * CHUNK_SIZE as u64).await;
    let n = lattice.num_data_blocks as usize;

    for id in 0..n {
        let data = lattice.block(id);
        for k in 0..3 {
            let left_parity = lattice.block(data.left[k]);
            let right_parity = lattice.block(data.right[k]);

            assert_eq!(left_parity.class, right_parity.class, "block {id} class {k}");
            assert_eq!(
                left_parity.class,
                StrandClass::try_from_index(k).unwrap(),
                "block {id} class {k}"
            );

            // d.left[k].right[0] == d and d.right[k].left[0] == d.
            assert_eq!(left_parity.right[0], id, "block {id} class {k}");
            assert_eq!(right_parity.left[0], id, "block {id} class {k}");

            assert_ne!(data.left[k], data.right[k], "block {id} class {k}");
        }
    }
}

#[tokio::test]
async fn tree_relations_follow_known_hierarchy() {
    let lattice = build_lattice(650 * CHUNK_SIZE as u64).await;

    // Canonical index -> expected parent index.
    let parents: &[(i64, i64)] = &[
        (1, 129),
        (5, 129),
        (150, 258),
        (129, 657),
        (256, 258),
        (656, 657),
        (381, 387),
    ];
    for &(index, parent) in parents {
        let block = lattice.get_block(index);
        let parent_block = lattice.block(block.parent.expect("missing parent"));
        // Parent ids point at the parent's canonical arena slot, whose
        // position equals the canonical index even when the parent's
        // metadata was shifted elsewhere.
        assert_eq!(parent_block.position, parent, "parent of {index}");
    }

    let root = lattice.get_block(657);
    assert!(root.parent.is_none());
    assert_eq!(root.children.len(), 6);

    let first_im = lattice.get_block(129);
    assert_eq!(first_im.children.len(), 128);
}

#[tokio::test]
async fn internal_nodes_shift_matches_flatten_order() {
    let sizes: &[u64] = &[
        CHUNK_SIZE as u64 / 2,
        CHUNK_SIZE as u64,
        CHUNK_SIZE as u64 + CHUNK_SIZE as u64 / 2,
        2 * CHUNK_SIZE as u64,
        3 * CHUNK_SIZE as u64,
        127 * CHUNK_SIZE as u64,
        128 * CHUNK_SIZE as u64,
        128 * CHUNK_SIZE as u64 + 4064,
        129 * CHUNK_SIZE as u64,
        257 * CHUNK_SIZE as u64,
        650 * CHUNK_SIZE as u64,
    ];

    for &size in sizes {
        let store = MemChunkStore::new();
        let data: Vec<u8> = (0..size as usize).map(|i| (i % 249) as u8).collect();
        let root = split(&data, &store).unwrap();
        let tree = build_complete_tree(
            &root,
            BuildTreeOptions::default(),
            &NoopRepairer::new(store.clone()),
        )
        .await
        .unwrap();

        let flat = tree.flatten_tree_window(5, 5);
        let lattice = build_lattice(size).await;

        for (j, node) in flat.iter().enumerate() {
            let block = lattice.get_block(node.index as i64);
            assert_eq!(
                block.position,
                j as i64 + 1,
                "size {size}: canonical {} should sit at lattice position {}",
                node.index,
                j + 1
            );
        }
    }
}

#[tokio::test]
async fn shifted_blocks_carry_swapped_metadata() {
    // 650 chunks: internal node 129 is inside its children's window and must
    // have traded places with a leaf.
    let size = 650 * CHUNK_SIZE as u64;
    let lattice = build_lattice(size).await;

    let shifted = lattice.get_block(129);
    assert_ne!(shifted.position, 129);
    assert_eq!(shifted.children.len(), 128);
    assert_eq!(shifted.size, 128 * CHUNK_SIZE as u64);

    // The slot at position 129 now carries the displaced leaf's metadata.
    let occupant = lattice.block(128);
    assert_eq!(occupant.position, 129);
    assert!(occupant.children.is_empty());
    assert_eq!(occupant.size, CHUNK_SIZE as u64);
}

#[tokio::test]
async fn neighbours_expand_alternating_across_the_lattice() {
    let lattice = build_lattice(256 * CHUNK_SIZE as u64).await;
    assert_eq!(lattice.num_data_blocks, 259);

    let cases: &[(i64, bool, &[i64])] = &[
        (128, true, &[126, 127, 128, 129, 130, 131, 132, 133, 134, 135]),
        (128, false, &[121, 122, 123, 124, 125, 126, 127, 128, 129, 130]),
        (1, true, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]),
        (
            1,
            false,
            &[251, 256, 257, 255, 254, 258, 259, 1, 2, 3, 4, 5],
        ),
        (
            257,
            true,
            &[251, 256, 257, 255, 254, 258, 259, 1, 2, 3, 4, 5],
        ),
        (
            257,
            false,
            &[1, 4, 251, 252, 253, 254, 255, 256, 257, 258, 259, 5],
        ),
    ];

    for (position, to_right, expected) in cases {
        let neighbours = lattice.get_neighbours(*position as usize - 1, *to_right);
        let mut positions: Vec<i64> = neighbours
            .iter()
            .map(|&id| lattice.block(id).position)
            .collect();
        positions.sort_unstable();
        let mut want = expected.to_vec();
        want.sort_unstable();
        assert_eq!(
            positions, want,
            "neighbours of {position} (to_right: {to_right})"
        );
    }
}

#[tokio::test]
async fn repair_pairs_prioritize_horizontal_first() {
    let lattice = build_lattice(650 * CHUNK_SIZE as u64).await;

    // A block away from the extremes: exactly alpha pairs, classes in
    // priority order, endpoints matching its own parity wiring.
    let block = lattice.block(99);
    assert_eq!(block.repair_pairs.len(), 3);
    for (k, pair) in block.repair_pairs.iter().enumerate() {
        assert_eq!(pair.left, block.left[k], "pair {k}");
        assert_eq!(pair.right, block.right[k], "pair {k}");
        assert_eq!(
            lattice.block(pair.left).class,
            StrandClass::try_from_index(k).unwrap()
        );
    }
}

#[tokio::test]
async fn repair_pairs_substitute_replaced_parities() {
    let lattice = build_lattice(650 * CHUNK_SIZE as u64).await;

    // Positions 1..=5 own the replaced leading parities, so the blocks they
    // point at substitute the data block behind the replaced parity.
    for id in 0..lattice.num_data_blocks as usize {
        let block = lattice.block(id);
        for (k, pair) in block.repair_pairs.iter().enumerate().take(3) {
            let left = lattice.block(block.left[k]);
            if left.replace {
                // Substituted: pair.left must be the data block before the
                // replaced parity, not the parity itself.
                assert_eq!(pair.left, left.left[0], "block {id} pair {k}");
                assert!(!lattice.block(pair.left).is_parity);
            } else {
                assert_eq!(pair.left, block.left[k], "block {id} pair {k}");
            }
        }
    }

    // Blocks whose right parity is replaced gain extra cascade pairs.
    let with_extras = (0..lattice.num_data_blocks as usize)
        .filter(|&id| lattice.block(id).repair_pairs.len() > 3)
        .count();
    assert!(with_extras > 0);
}

#[tokio::test]
async fn parity_repair_pairs_follow_direction_rules() {
    let lattice = build_lattice(650 * CHUNK_SIZE as u64).await;

    for id in lattice.num_data_blocks as usize..lattice.blocks().len() {
        let parity = lattice.block(id);
        if parity.replace {
            assert_eq!(parity.repair_pairs.len(), 1, "replaced parity {id}");
        } else {
            assert_eq!(parity.repair_pairs.len(), 2, "parity {id}");
            // The right-going pair starts at the right data endpoint.
            assert_eq!(parity.repair_pairs[1].left, parity.right[0]);
        }
        // The left-going pair ends at the left data endpoint.
        assert_eq!(parity.repair_pairs[0].right, parity.left[0]);
    }
}

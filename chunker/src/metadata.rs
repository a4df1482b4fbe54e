// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use braid_storage::mem::MemChunkStore;

use crate::chunker::split;
use crate::tree::TreeChunk;
use crate::walker::{build_complete_tree, BuildTreeOptions, NoopRepairer};
use crate::Error;

/// Shape metadata of one tree node, indexed canonically.
#[derive(Debug, Clone, Default)]
pub struct ChunkMetadata {
    /// Byte size of the subtree rooted at the node.
    pub size: u64,
    /// Raw chunk length, size prefix included.
    pub length: u32,
    /// Canonical index of the parent, 0 for the root.
    pub parent: u64,
    /// Canonical indices of the children, in order.
    pub children: Vec<u64>,
}

/// Computes the shape metadata of the tree a file of `size` bytes splits
/// into. The shape only depends on the size, so the tree is built once over
/// zero bytes and walked with empty leaves.
pub async fn generate_chunk_metadata(size: u64) -> Result<Vec<ChunkMetadata>, Error> {
    let store = MemChunkStore::new();
    let data = vec![0u8; size as usize];
    let root = split(&data, &store)?;
    let tree = build_complete_tree(
        &root,
        BuildTreeOptions { empty_leaves: true },
        &NoopRepairer::new(store),
    )
    .await?;

    let mut list = vec![ChunkMetadata::default(); tree.index as usize];
    fill(&tree, 0, &mut list);
    Ok(list)
}

fn fill(node: &TreeChunk, parent: u64, list: &mut [ChunkMetadata]) {
    for child in &node.children {
        fill(child, node.index, list);
    }
    list[node.index as usize - 1] = ChunkMetadata {
        size: node.subtree_size,
        length: node.length,
        parent,
        children: node.children.iter().map(|c| c.index).collect(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_storage::CHUNK_SIZE;

    #[tokio::test]
    async fn single_chunk_file_has_one_entry() {
        let list = generate_chunk_metadata(CHUNK_SIZE as u64 / 2).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].parent, 0);
        assert!(list[0].children.is_empty());
        assert_eq!(list[0].size, CHUNK_SIZE as u64 / 2);
    }

    #[tokio::test]
    async fn five_node_tree_wires_parents_and_children() {
        let list = generate_chunk_metadata(4 * CHUNK_SIZE as u64).await.unwrap();
        assert_eq!(list.len(), 5);
        for leaf in &list[..4] {
            assert_eq!(leaf.parent, 5);
            assert!(leaf.children.is_empty());
            assert_eq!(leaf.size, CHUNK_SIZE as u64);
        }
        assert_eq!(list[4].parent, 0);
        assert_eq!(list[4].children, vec![1, 2, 3, 4]);
        assert_eq!(list[4].size, 4 * CHUNK_SIZE as u64);
    }

    #[tokio::test]
    async fn metadata_indices_cover_the_tree() {
        let list = generate_chunk_metadata(650 * CHUNK_SIZE as u64).await.unwrap();
        assert_eq!(list.len(), 657);
        // Canonical entry 129 is the first full level-1 root.
        assert_eq!(list[128].children.len(), 128);
        assert_eq!(list[128].parent, 657);
        assert_eq!(list[656].parent, 0);
        assert_eq!(list[656].children, vec![129, 258, 387, 516, 645, 656]);
    }
}

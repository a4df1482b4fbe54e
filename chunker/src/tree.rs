// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::Bytes;

use braid_storage::{chunk_span, Address, CHUNK_PREFIX, CHUNK_SIZE};

/// A node of the content-addressed tree, annotated with its canonical index.
#[derive(Debug, Clone)]
pub struct TreeChunk {
    pub depth: u32,
    /// Canonical (post-order) index of this node, 1-based.
    pub index: u64,
    /// Content address of the chunk.
    pub key: Address,
    /// Raw chunk data including the size prefix. May be cleared for leaves
    /// when the tree was built with `empty_leaves`.
    pub data: Bytes,
    /// Byte size of the subtree rooted here.
    pub subtree_size: u64,
    /// Raw chunk length in bytes (before any clearing).
    pub length: u32,
    pub children: Vec<TreeChunk>,
}

impl TreeChunk {
    pub fn new(depth: u32, index: u64, key: Address, data: Bytes) -> Self {
        let subtree_size = chunk_span(&data);
        let length = data.len() as u32;
        Self {
            depth,
            index,
            key,
            data,
            subtree_size,
            length,
            children: Vec::new(),
        }
    }

    /// The payload behind the size prefix.
    pub fn payload(&self) -> Bytes {
        self.data.slice(CHUNK_PREFIX..)
    }

    /// Gets the `index`-th (1-based) leaf below this node, assuming the whole
    /// tree is in memory. Descends by cumulative per-child leaf counts.
    pub fn get_child_from_mem(&self, index: u64) -> Result<&TreeChunk, crate::Error> {
        self.descend(index).ok_or(crate::Error::ChildNotFound)
    }

    fn descend(&self, index: u64) -> Option<&TreeChunk> {
        if self.data.is_empty()
            || index == 0
            || self.data.len() as u64 == self.subtree_size + CHUNK_PREFIX as u64
        {
            return Some(self);
        }

        let mut offset = 0u64;
        for child in &self.children {
            let leaves = child.subtree_size.div_ceil(CHUNK_SIZE as u64);
            if index <= offset + leaves {
                return child.descend(index - offset);
            }
            offset += leaves;
        }
        None
    }

    /// Flattens the tree into canonical order, then relocates every non-root
    /// internal node that would land inside an `s·p`-wide window around any
    /// of its own children. The displaced node swaps places with a leaf found
    /// by probing positions `s·p, 2·s·p + s, …` outside all child windows.
    pub fn flatten_tree_window(&self, s: usize, p: usize) -> Vec<&TreeChunk> {
        let mut out: Vec<&TreeChunk> = Vec::with_capacity(self.index as usize);
        let mut internal: Vec<&TreeChunk> = Vec::new();
        self.post_order(&mut |node| {
            if !node.children.is_empty() && node.index != self.index {
                internal.push(node);
            }
            out.push(node);
        });

        let window = (s * p) as i64;
        for im in internal {
            let lowest = im.children[0].index as i64;
            let highest = im.children[im.children.len() - 1].index as i64;
            let mut j = (s * p) as usize;
            while j < self.index as usize {
                let cand = out[j];
                let in_window = (cand.index as i64) > lowest - window
                    && (cand.index as i64) < highest + window;
                if !in_window && cand.children.is_empty() {
                    out.swap(im.index as usize - 1, j);
                    break;
                }
                j += s * p + s;
            }
        }

        out
    }

    /// Collects the nodes matching `filter` in canonical order.
    pub fn filter_chunks(&self, filter: impl Fn(&TreeChunk) -> bool) -> Vec<&TreeChunk> {
        let mut out = Vec::new();
        self.post_order(&mut |node| {
            if filter(node) {
                out.push(node);
            }
        });
        out
    }

    fn post_order<'a>(&'a self, visit: &mut impl FnMut(&'a TreeChunk)) {
        for child in &self.children {
            child.post_order(visit);
        }
        visit(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::split;
    use crate::walker::{build_complete_tree, BuildTreeOptions, NoopRepairer};
    use braid_storage::{mem::MemChunkStore, ChunkStore};

    async fn build(len: usize) -> TreeChunk {
        let store = MemChunkStore::new();
        let data: Vec<u8> = (0..len).map(|i| (i % 247) as u8).collect();
        let root = split(&data, &store).unwrap();
        build_complete_tree(&root, BuildTreeOptions::default(), &NoopRepairer::new(store))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn leaves_are_addressable_in_file_order() {
        for len in [
            CHUNK_SIZE / 2,
            CHUNK_SIZE,
            CHUNK_SIZE + CHUNK_SIZE / 2,
            CHUNK_SIZE * 3,
            CHUNK_SIZE * 128,
            CHUNK_SIZE * 128 + 4064,
            CHUNK_SIZE * 129,
            CHUNK_SIZE * 257,
        ] {
            let tree = build(len).await;
            let leaves = tree.filter_chunks(|c| c.children.is_empty());
            for (i, leaf) in leaves.iter().enumerate() {
                let got = tree.get_child_from_mem(i as u64 + 1).unwrap();
                assert_eq!(got.key, leaf.key, "leaf {} of {len}-byte tree", i + 1);
                assert_eq!(got.subtree_size, leaf.subtree_size);
            }
        }
    }

    #[tokio::test]
    async fn flatten_window_is_a_permutation() {
        let (s, p) = (5, 5);
        for len in [CHUNK_SIZE * 129, CHUNK_SIZE * 257, CHUNK_SIZE * 600] {
            let tree = build(len).await;
            let flat = tree.flatten_tree_window(s, p);
            assert_eq!(flat.len() as u64, tree.index);

            let mut seen: Vec<u64> = flat.iter().map(|c| c.index).collect();
            seen.sort_unstable();
            let expected: Vec<u64> = (1..=tree.index).collect();
            assert_eq!(seen, expected, "{len}-byte tree is not a permutation");
        }
    }

    #[tokio::test]
    async fn flatten_window_moves_parents_out_of_child_windows() {
        let (s, p) = (5usize, 5usize);
        let window = (s * p) as i64;
        for len in [CHUNK_SIZE * 129, CHUNK_SIZE * 300, CHUNK_SIZE * 600] {
            let tree = build(len).await;
            let flat = tree.flatten_tree_window(s, p);

            let mut pos_of = vec![0i64; tree.index as usize + 1];
            for (i, node) in flat.iter().enumerate() {
                pos_of[node.index as usize] = i as i64 + 1;
            }

            let mut moved = 0;
            for node in tree.filter_chunks(|c| !c.children.is_empty()) {
                if node.index == tree.index {
                    continue;
                }
                // In canonical order the parent sits right after its last
                // child, so every relocated parent must now be outside the
                // window spanned by its children's canonical indices.
                let parent_pos = pos_of[node.index as usize];
                if parent_pos == node.index as i64 {
                    continue;
                }
                moved += 1;
                let lowest = node.children[0].index as i64;
                let highest = node.children[node.children.len() - 1].index as i64;
                assert!(
                    parent_pos <= lowest - window || parent_pos >= highest + window,
                    "parent index {} at position {} inside window [{}, {}] ({len} bytes)",
                    node.index,
                    parent_pos,
                    lowest - window,
                    highest + window
                );
            }
            assert!(moved > 0, "no parent was relocated for {len} bytes");
        }
    }

    #[tokio::test]
    async fn payload_roundtrips_through_leaves() {
        let store = MemChunkStore::new();
        let data: Vec<u8> = (0..CHUNK_SIZE * 10 + 17).map(|i| (i % 253) as u8).collect();
        let root = split(&data, &store).unwrap();
        let tree =
            build_complete_tree(&root, BuildTreeOptions::default(), &NoopRepairer::new(store))
                .await
                .unwrap();

        let mut restored = Vec::new();
        for leaf in tree.filter_chunks(|c| c.children.is_empty()) {
            restored.extend_from_slice(&leaf.payload());
        }
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn store_contains_every_tree_node() {
        let store = MemChunkStore::new();
        let data = vec![3u8; CHUNK_SIZE * 130];
        let root = split(&data, &store).unwrap();
        let tree = build_complete_tree(
            &root,
            BuildTreeOptions::default(),
            &NoopRepairer::new(store.clone()),
        )
        .await
        .unwrap();

        for node in tree.filter_chunks(|_| true) {
            assert!(store.get(&node.key).is_ok());
        }
    }
}

// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use log::debug;
use tokio_util::sync::CancellationToken;

use braid_storage::{
    chunk_span, is_leaf_chunk, Address, Error as StorageError, Getter, CHUNK_PREFIX, HASH_LEN,
};

use crate::sizes::{depth_for_canonical_index, child_offset_by_standard_size, tree_index_by_size};
use crate::tree::TreeChunk;
use crate::Error;

/// Options for [`build_complete_tree`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildTreeOptions {
    /// Drop leaf payloads after walking them, keeping only metadata.
    pub empty_leaves: bool,
}

/// The repair collaborator the tree walker drives.
///
/// A real implementation resolves chunks through a lattice and falls back to
/// parity-based reconstruction; [`NoopRepairer`] simply forwards to a getter.
#[async_trait]
pub trait Repairer: Send + Sync {
    /// Fetches the chunk at `addr`, recording it under its canonical `index`.
    async fn get_chunk(&self, addr: &Address, index: u64) -> Result<Bytes, StorageError>;

    /// Fetches the `leaf_index`-th leaf (1-based) of the tree rooted at `root`.
    async fn get_leaf(&self, root: &Address, leaf_index: u64) -> Result<Bytes, StorageError>;

    /// Canonical index of the data root, when known up front.
    fn root_index(&self) -> Option<u64>;

    /// Reconstructs the chunk with the given canonical index.
    async fn repair_chunk(&self, index: u64) -> Result<Bytes, StorageError>;

    /// Attempts to fill every repairable block.
    async fn repair_all(&self);
}

/// Pass-through repairer without any reconstruction capability.
pub struct NoopRepairer<G: Getter> {
    getter: G,
}

impl<G: Getter> NoopRepairer<G> {
    pub fn new(getter: G) -> Self {
        Self { getter }
    }
}

#[async_trait]
impl<G: Getter> Repairer for NoopRepairer<G> {
    async fn get_chunk(&self, addr: &Address, _index: u64) -> Result<Bytes, StorageError> {
        self.getter.get_chunk(addr).await
    }

    async fn get_leaf(&self, root: &Address, leaf_index: u64) -> Result<Bytes, StorageError> {
        self.getter.get_leaf(root, leaf_index).await
    }

    fn root_index(&self) -> Option<u64> {
        None
    }

    async fn repair_chunk(&self, _index: u64) -> Result<Bytes, StorageError> {
        Ok(Bytes::new())
    }

    async fn repair_all(&self) {}
}

/// Reconstructs the whole tree below `root_addr`, annotating every node with
/// its canonical index.
///
/// Siblings are fetched concurrently; the first error cancels the walk. A
/// chunk the getter cannot resolve is handed to the repairer before the walk
/// gives up on it.
pub async fn build_complete_tree<R: Repairer>(
    root_addr: &Address,
    options: BuildTreeOptions,
    repairer: &R,
) -> Result<TreeChunk, Error> {
    let (root_chunk, root_index) = match repairer.root_index() {
        Some(index) => {
            let chunk = match repairer.get_chunk(root_addr, index).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("root fetch failed ({e}), attempting repair");
                    repairer.repair_chunk(index).await?
                }
            };
            (chunk, index)
        }
        None => {
            let chunk = repairer.get_chunk(root_addr, 0).await?;
            let index = tree_index_by_size(chunk_span(&chunk));
            (chunk, index)
        }
    };

    let depth = depth_for_canonical_index(root_index);
    let mut root = TreeChunk::new(depth, root_index, *root_addr, root_chunk);

    let token = CancellationToken::new();
    root.children = walk_children(
        root.data.clone(),
        root_index,
        depth,
        0,
        options,
        repairer,
        &token,
    )
    .await?;

    Ok(root)
}

/// Index offset between this parent's consecutive full child subtrees.
fn child_offset(subtree_size: u64, num_children: usize) -> u64 {
    if num_children > 1 {
        child_offset_by_standard_size(subtree_size)
    } else {
        tree_index_by_size(subtree_size)
    }
}

fn child_index(last_child: bool, parent_index: u64, parent_offset: u64, offset: u64, child_num: u64) -> u64 {
    if last_child {
        parent_index - 1
    } else {
        parent_offset + offset * child_num
    }
}

/// Offset the child passes on to its own children. The last child of an
/// uneven parent roots a smaller subtree, which shifts its children's base.
fn next_parent_offset(
    last_child: bool,
    has_children: bool,
    last_offset: u64,
    child_index: u64,
    offset: u64,
) -> u64 {
    let mut last_child_offset = 0;
    if last_child && has_children && last_offset < offset {
        last_child_offset = offset - last_offset;
    }
    child_index - offset + last_child_offset
}

fn walk_children<'a, R: Repairer>(
    data: Bytes,
    index: u64,
    depth: u32,
    parent_offset: u64,
    options: BuildTreeOptions,
    repairer: &'a R,
    token: &'a CancellationToken,
) -> BoxFuture<'a, Result<Vec<TreeChunk>, Error>> {
    async move {
        let subtree_size = chunk_span(&data);
        // A leaf holds all the bytes of its subtree.
        if is_leaf_chunk(&data) {
            return Ok(Vec::new());
        }

        let refs = data.slice(CHUNK_PREFIX..);
        let num_children = refs.len() / HASH_LEN;
        let offset = child_offset(subtree_size, num_children);

        let futures = (1..=num_children as u64).map(|child_num| {
            let refs = refs.clone();
            async move {
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let start = (child_num as usize - 1) * HASH_LEN;
                let mut addr: Address = [0u8; HASH_LEN];
                addr.copy_from_slice(&refs[start..start + HASH_LEN]);

                let last_child = start + HASH_LEN == refs.len();
                let index = child_index(last_child, index, parent_offset, offset, child_num);

                let chunk = match repairer.get_chunk(&addr, index).await {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!("chunk {index} failed to download ({e}), repairing");
                        match repairer.repair_chunk(index).await {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                token.cancel();
                                return Err(e.into());
                            }
                        }
                    }
                };
                if chunk.len() <= CHUNK_PREFIX {
                    token.cancel();
                    return Err(Error::EmptyChild);
                }

                let span = chunk_span(&chunk);
                let has_children = !is_leaf_chunk(&chunk);
                let next_parent = next_parent_offset(
                    last_child,
                    has_children,
                    tree_index_by_size(span),
                    index,
                    offset,
                );

                let mut child = TreeChunk::new(depth - 1, index, addr, chunk);
                if has_children {
                    child.children = walk_children(
                        child.data.clone(),
                        index,
                        depth - 1,
                        next_parent,
                        options,
                        repairer,
                        token,
                    )
                    .await?;
                } else if options.empty_leaves {
                    child.data = Bytes::new();
                }

                Ok(child)
            }
        });

        try_join_all(futures).await
    }
    .boxed()
}

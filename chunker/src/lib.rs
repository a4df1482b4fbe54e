// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Tree splitting, canonical indexing and tree walking for braid.
//!
//! Files are split into a content-addressed tree with branch factor 128
//! ([`chunker::split`]). Every node of such a tree carries a canonical index
//! — its 1-based post-order rank — computable from the tree's byte size alone
//! ([`sizes::tree_index_by_size`]). The walker ([`walker::build_complete_tree`])
//! rebuilds a tree from its root address, assigning those indices, and hands
//! unresolvable chunks to a [`walker::Repairer`].

pub mod chunker;
pub mod metadata;
pub mod sizes;
pub mod tree;
pub mod walker;

pub use chunker::split;
pub use metadata::{generate_chunk_metadata, ChunkMetadata};
pub use sizes::tree_index_by_size;
pub use tree::TreeChunk;
pub use walker::{build_complete_tree, BuildTreeOptions, NoopRepairer, Repairer};

/// Error type for tree building and walking.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] braid_storage::Error),

    #[error("could not find child")]
    ChildNotFound,

    #[error("empty child")]
    EmptyChild,

    #[error("tree walk cancelled")]
    Cancelled,
}

// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Storage contracts and backends for the braid entanglement engine.
//!
//! The [`Getter`](storage::Getter) trait is the single contract the tree
//! walker and the repair engine consume: resolve a chunk by content address,
//! or resolve the n-th leaf of a tree whose root address is known. The
//! [`ChunkStore`](storage::ChunkStore) trait is the write side used by the
//! splitter.
//!
//! Two backends are provided: [`MemChunkStore`](mem::MemChunkStore), an
//! in-memory content-addressed store that doubles as a failure-injecting
//! fetcher for tests, and [`HttpGetter`](http::HttpGetter) /
//! [`HttpPutter`](http::HttpPutter) talking to a local gateway node.

pub mod http;
pub mod mem;
pub mod storage;
pub use storage::*;

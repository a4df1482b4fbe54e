// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::{BufMut, BytesMut};

use braid_storage::{Address, ChunkStore, CHUNK_PREFIX, CHUNK_SIZE, MAX_BRANCH};

use crate::Error;

/// Splits `data` into a branch-128 content-addressed tree, storing every
/// chunk, and returns the root address.
///
/// Leaves carry up to [`CHUNK_SIZE`] payload bytes behind the 8-byte size
/// prefix. Internal chunks carry the concatenated addresses of their
/// children; each child except the last roots a full subtree of the next
/// standard size down.
pub fn split(data: &[u8], store: &impl ChunkStore) -> Result<Address, Error> {
    if data.len() <= CHUNK_SIZE {
        return store_leaf(data, store);
    }

    let mut subtree = CHUNK_SIZE;
    while subtree * MAX_BRANCH < data.len() {
        subtree *= MAX_BRANCH;
    }

    let mut chunk = BytesMut::with_capacity(CHUNK_PREFIX + CHUNK_SIZE);
    chunk.put_u64_le(data.len() as u64);
    for branch in data.chunks(subtree) {
        let addr = split(branch, store)?;
        chunk.put_slice(&addr);
    }
    Ok(store.put(chunk.freeze())?)
}

fn store_leaf(payload: &[u8], store: &impl ChunkStore) -> Result<Address, Error> {
    let mut chunk = BytesMut::with_capacity(CHUNK_PREFIX + payload.len());
    chunk.put_u64_le(payload.len() as u64);
    chunk.put_slice(payload);
    Ok(store.put(chunk.freeze())?)
}

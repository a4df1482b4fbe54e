// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror;

/// Payload capacity of a single chunk.
pub const CHUNK_SIZE: usize = 4096;

/// Every chunk starts with a little-endian u64 carrying the byte size of the
/// subtree rooted at the chunk (for leaves, the payload length).
pub const CHUNK_PREFIX: usize = 8;

/// Length of a content address.
pub const HASH_LEN: usize = 32;

/// Maximum number of child references an internal chunk can carry.
pub const MAX_BRANCH: usize = CHUNK_SIZE / HASH_LEN;

/// Content address of a chunk.
pub type Address = [u8; HASH_LEN];

/// Error type for storage operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The store returned no data for the address.
    #[error("chunk {0} not found")]
    ChunkNotFound(String),

    /// The returned data does not hash to the requested address.
    #[error("chunk {0} is corrupt")]
    ChunkCorrupt(String),

    /// A chunk smaller than its size prefix or larger than the chunk capacity.
    #[error("invalid chunk of {0} bytes")]
    InvalidChunk(usize),

    /// The supplied reference does not parse as a content address.
    #[error("invalid address {0}")]
    InvalidAddress(String),

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// A catch-all for backend failures.
    #[error("storage error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Reads the size prefix of a raw chunk.
pub fn chunk_span(data: &[u8]) -> u64 {
    let mut prefix = [0u8; CHUNK_PREFIX];
    prefix.copy_from_slice(&data[..CHUNK_PREFIX]);
    u64::from_le_bytes(prefix)
}

/// A chunk is a leaf when its payload holds the whole subtree.
pub fn is_leaf_chunk(data: &[u8]) -> bool {
    chunk_span(data) <= (data.len() - CHUNK_PREFIX) as u64
}

/// Content address of a raw chunk (size prefix included).
pub fn address_of(data: &[u8]) -> Result<Address, Error> {
    if data.len() < CHUNK_PREFIX || data.len() > CHUNK_SIZE + CHUNK_PREFIX {
        return Err(Error::InvalidChunk(data.len()));
    }
    let digest = Sha256::digest(data);
    let mut addr = [0u8; HASH_LEN];
    addr.copy_from_slice(&digest);
    Ok(addr)
}

/// Parses a hex reference, with or without a `0x` prefix.
pub fn parse_address(s: &str) -> Result<Address, Error> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let raw = hex::decode(s).map_err(|_| Error::InvalidAddress(s.to_string()))?;
    if raw.len() != HASH_LEN {
        return Err(Error::InvalidAddress(s.to_string()));
    }
    let mut addr = [0u8; HASH_LEN];
    addr.copy_from_slice(&raw);
    Ok(addr)
}

/// The chunk resolver the tree walker and the repair engine consume.
///
/// `get_leaf` addresses the `leaf_index`-th leaf (1-based) of the tree rooted
/// at `root`, for trees whose individual chunk addresses are not known to the
/// caller (the parity trees).
#[async_trait]
pub trait Getter: Send + Sync {
    async fn get_chunk(&self, addr: &Address) -> Result<Bytes, Error>;

    async fn get_leaf(&self, root: &Address, leaf_index: u64) -> Result<Bytes, Error>;
}

#[async_trait]
impl<'a, G: Getter + ?Sized> Getter for &'a G {
    async fn get_chunk(&self, addr: &Address) -> Result<Bytes, Error> {
        (**self).get_chunk(addr).await
    }

    async fn get_leaf(&self, root: &Address, leaf_index: u64) -> Result<Bytes, Error> {
        (**self).get_leaf(root, leaf_index).await
    }
}

#[async_trait]
impl<G: Getter + ?Sized> Getter for std::sync::Arc<G> {
    async fn get_chunk(&self, addr: &Address) -> Result<Bytes, Error> {
        (**self).get_chunk(addr).await
    }

    async fn get_leaf(&self, root: &Address, leaf_index: u64) -> Result<Bytes, Error> {
        (**self).get_leaf(root, leaf_index).await
    }
}

/// A writable content-addressed chunk store.
pub trait ChunkStore: Send + Sync {
    /// Stores a raw chunk and returns its content address.
    fn put(&self, data: Bytes) -> Result<Address, Error>;

    /// Retrieves a raw chunk by address.
    fn get(&self, addr: &Address) -> Result<Bytes, Error>;
}

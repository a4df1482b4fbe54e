// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::storage::{
    address_of, chunk_span, is_leaf_chunk, Address, ChunkStore, Error, Getter, CHUNK_PREFIX,
    CHUNK_SIZE, HASH_LEN,
};

/// How an injected failure manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The fetch succeeds after a delay.
    Delay,
    /// The fetch reports the chunk as missing.
    Unavailable,
    /// The fetch succeeds but returns garbage bytes.
    Corrupt,
}

/// A failure to inject for a specific chunk address or tree leaf.
#[derive(Debug, Clone, Copy)]
pub struct Failure {
    pub class: FailureClass,
    pub delay: Duration,
}

impl Failure {
    pub fn unavailable() -> Self {
        Self {
            class: FailureClass::Unavailable,
            delay: Duration::ZERO,
        }
    }

    pub fn corrupt() -> Self {
        Self {
            class: FailureClass::Corrupt,
            delay: Duration::ZERO,
        }
    }

    pub fn delay(delay: Duration) -> Self {
        Self {
            class: FailureClass::Delay,
            delay,
        }
    }
}

#[derive(Default)]
struct Inner {
    chunks: HashMap<Address, Bytes>,
    fail_chunks: HashMap<Address, Failure>,
    fail_leaves: HashMap<(Address, u64), Failure>,
}

/// In-memory content-addressed chunk store.
///
/// Doubles as the fetch backend for tests: failures can be injected per
/// chunk address or per `(tree root, leaf index)` pair, in which case fetches
/// are delayed, denied or answered with garbage.
#[derive(Clone, Default)]
pub struct MemChunkStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects a failure for the chunk at `addr`.
    pub fn fail_chunk(&self, addr: Address, failure: Failure) {
        self.inner.lock().unwrap().fail_chunks.insert(addr, failure);
    }

    /// Injects a failure for the `leaf_index`-th leaf of the tree at `root`.
    pub fn fail_leaf(&self, root: Address, leaf_index: u64, failure: Failure) {
        self.inner
            .lock()
            .unwrap()
            .fail_leaves
            .insert((root, leaf_index), failure);
    }

    /// Removes all injected failures.
    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_chunks.clear();
        inner.fail_leaves.clear();
    }

    fn lookup(&self, addr: &Address) -> (Option<Bytes>, Option<Failure>) {
        let inner = self.inner.lock().unwrap();
        (
            inner.chunks.get(addr).cloned(),
            inner.fail_chunks.get(addr).copied(),
        )
    }

    async fn apply_failure(
        &self,
        addr: &Address,
        failure: Failure,
    ) -> Result<Option<Bytes>, Error> {
        match failure.class {
            FailureClass::Unavailable => {
                if !failure.delay.is_zero() {
                    tokio::time::sleep(failure.delay).await;
                }
                Err(Error::ChunkNotFound(hex::encode(addr)))
            }
            FailureClass::Delay => {
                tokio::time::sleep(failure.delay).await;
                Ok(None)
            }
            FailureClass::Corrupt => {
                let mut garbage = vec![0u8; CHUNK_SIZE];
                rand::thread_rng().fill_bytes(&mut garbage);
                Ok(Some(Bytes::from(garbage)))
            }
        }
    }

    async fn get_checked(&self, addr: &Address) -> Result<Bytes, Error> {
        let (chunk, failure) = self.lookup(addr);
        if let Some(failure) = failure {
            if let Some(garbage) = self.apply_failure(addr, failure).await? {
                return Ok(garbage);
            }
        }
        chunk.ok_or_else(|| Error::ChunkNotFound(hex::encode(addr)))
    }
}

impl ChunkStore for MemChunkStore {
    fn put(&self, data: Bytes) -> Result<Address, Error> {
        let addr = address_of(&data)?;
        self.inner.lock().unwrap().chunks.insert(addr, data);
        Ok(addr)
    }

    fn get(&self, addr: &Address) -> Result<Bytes, Error> {
        self.inner
            .lock()
            .unwrap()
            .chunks
            .get(addr)
            .cloned()
            .ok_or_else(|| Error::ChunkNotFound(hex::encode(addr)))
    }
}

#[async_trait]
impl Getter for MemChunkStore {
    async fn get_chunk(&self, addr: &Address) -> Result<Bytes, Error> {
        self.get_checked(addr).await
    }

    async fn get_leaf(&self, root: &Address, leaf_index: u64) -> Result<Bytes, Error> {
        let failure = self
            .inner
            .lock()
            .unwrap()
            .fail_leaves
            .get(&(*root, leaf_index))
            .copied();
        if let Some(failure) = failure {
            if let Some(garbage) = self.apply_failure(root, failure).await? {
                return Ok(garbage);
            }
        }

        let mut chunk = self.get_checked(root).await?;
        let mut index = leaf_index;
        // Descend by cumulative leaf counts until the chunk holds its whole
        // subtree.
        while !is_leaf_chunk(&chunk) && index > 0 {
            let refs = &chunk[CHUNK_PREFIX..];
            let mut offset = 0u64;
            let mut next = None;
            for raw in refs.chunks(HASH_LEN) {
                let mut addr = [0u8; HASH_LEN];
                addr.copy_from_slice(raw);
                let child = self.get_checked(&addr).await?;
                let span = chunk_span(&child);
                let leaves = span.div_ceil(CHUNK_SIZE as u64).max(1);
                if index <= offset + leaves {
                    next = Some((child, index - offset));
                    break;
                }
                offset += leaves;
            }
            match next {
                Some((child, rel)) => {
                    chunk = child;
                    index = rel;
                }
                None => return Err(Error::ChunkNotFound(hex::encode(root))),
            }
        }
        Ok(chunk)
    }
}

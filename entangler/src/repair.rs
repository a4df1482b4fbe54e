// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;

use braid_chunker::Repairer;
use braid_storage::{Address, Error as StorageError, CHUNK_SIZE};

use crate::block::{BlockId, ParityFetch};
use crate::entangler::xor_byte_slices;
use crate::lattice::Lattice;
use crate::Error;

impl Lattice {
    /// Rebuilds `b` from a repair pair: both endpoints must hold data, and
    /// the block must still be empty (first writer wins).
    pub fn repair_from(&self, b: BlockId, v: BlockId, w: BlockId) -> Result<(), Error> {
        let (Some(vd), Some(wd)) = (self.block(v).data(), self.block(w).data()) else {
            return Err(Error::MissingData);
        };
        let xored = xor_byte_slices(&vd, &wd);
        if self.block(b).repair_success(&xored) {
            Ok(())
        } else {
            Err(Error::AlreadyHasData)
        }
    }

    /// Top-level entry: reconstructs the chunk with the given canonical
    /// index, cascading across the lattice as needed.
    ///
    /// Repairs are serialized on the lattice lock; while queueing, the block
    /// may be filled by the repair already in flight, in which case its data
    /// is returned immediately. A failure taints the lattice: every later
    /// call short-circuits with the sticky error.
    pub async fn repair_chunk(&self, index: i64) -> Result<Bytes, Error> {
        if self.parity_roots().len() < self.config.alpha {
            return Err(Error::MissingParityRoots(self.config.alpha));
        }

        let b = self.get_block_id(index);
        let _guard = loop {
            match self.block(b).data_or_subscribe() {
                Ok(data) => return Ok(data),
                Err(mut notified) => {
                    tokio::select! {
                        guard = self.repair_lock.lock() => {
                            if let Some(data) = self.block(b).data() {
                                return Ok(data);
                            }
                            break guard;
                        }
                        _ = &mut notified => continue,
                    }
                }
            }
        };

        if let Some(message) = self.recover_error() {
            return Err(Error::Recover(message));
        }

        let result = self.repair_block(b).await;
        if let Err(e) = &result {
            self.block(b).repair_failed();
            self.set_recover_error(e.to_string());
        }

        self.reset_mending_status();
        result
    }

    fn repair_block<'a>(&'a self, b: BlockId) -> BoxFuture<'a, Result<Bytes, Error>> {
        async move {
            if self.block(b).is_mending() {
                return Err(Error::AlreadyMending);
            }
            self.block(b).set_mending(true);

            if let Some(data) = self.repair_data_dl_adjacent(b).await {
                return Ok(data);
            }

            let mut old_has_data_cnt: i64 = -1;
            loop {
                let attempt = self.repair_data_rep_adjacent(b).await;
                self.reset_repair_status();
                let err = match attempt {
                    Ok(data) => return Ok(data),
                    Err(e) => e,
                };

                // Scan for failed internal tree nodes; repairing one may
                // unblock further leaf downloads, so retry the originator.
                let mut has_data_cnt: i64 = 0;
                for id in 0..self.blocks().len() {
                    if self.block(id).has_data() {
                        has_data_cnt += 1;
                    } else if self.block(id).internal_node_pending_repair()
                        && self.repair_block(id).await.is_ok()
                    {
                        has_data_cnt = old_has_data_cnt - 1;
                        break;
                    }
                }

                if has_data_cnt == old_has_data_cnt {
                    if let Some(data) = self.block(b).data() {
                        return Ok(data);
                    }
                    return Err(err);
                }
                old_has_data_cnt = has_data_cnt;
            }
        }
        .boxed()
    }

    /// First strategy: for each repair pair, download both endpoints
    /// concurrently and XOR. No recursive repair.
    async fn repair_data_dl_adjacent(&self, b: BlockId) -> Option<Bytes> {
        if let Some(data) = self.block(b).data() {
            return Some(data);
        }

        let pairs = self.block(b).repair_pairs.clone();
        for pair in pairs {
            tokio::join!(self.download_block(pair.left), self.download_block(pair.right));
            if self.repair_from(b, pair.left, pair.right).is_ok() {
                return self.block(b).data();
            }
        }
        None
    }

    /// Second strategy: recursively repair the endpoints of each pair.
    fn repair_data_rep_adjacent<'a>(&'a self, b: BlockId) -> BoxFuture<'a, Result<Bytes, Error>> {
        async move {
            let pairs = self.block(b).repair_pairs.clone();
            for pair in pairs {
                if let Some(data) = self.block(b).data() {
                    return Ok(data);
                }

                self.repair_parity(pair.right, true).await;
                self.repair_parity(pair.left, false).await;

                if self.repair_from(b, pair.left, pair.right).is_ok() {
                    if let Some(data) = self.block(b).data() {
                        return Ok(data);
                    }
                }
            }
            self.block(b)
                .data()
                .ok_or(Error::Unrepairable(self.block(b).position))
        }
        .boxed()
    }

    /// Fetches a block's payload if possible: parities download through the
    /// getter, data blocks wait for the tree walk's in-flight downloads.
    async fn download_block(&self, id: BlockId) {
        if self.block(id).has_data() {
            return;
        }
        if self.block(id).is_parity {
            if let Err(e) = self.get_parity(id).await {
                debug!(
                    "parity {}_{} failed to download: {e}",
                    self.block(id).left_index,
                    self.block(id).right_index
                );
            }
        } else if let Some(notified) = self.wait_for_no_pending_dl() {
            let _ = notified.await;
        }
    }

    /// Repairs a parity via its single left- or right-going pair, recursing
    /// into the pair's endpoints when the direct attempt fails.
    pub fn repair_parity<'a>(&'a self, id: BlockId, go_right: bool) -> BoxFuture<'a, ()> {
        async move {
            if let Some(notified) = self.wait_for_no_pending_dl() {
                let _ = notified.await;
            }

            let b = self.block(id);
            if !b.is_parity {
                // Dispatched a data block: give it the regular treatment.
                if b.repair_pending() && self.repair_data_dl_adjacent(id).await.is_none() {
                    let _ = self.repair_data_rep_adjacent(id).await;
                }
                return;
            }
            if !b.parity_should_repair() {
                return;
            }
            b.repair_pending();

            if b.replace && self.replaced_parity_repair(id).await {
                return;
            }

            let pairs = &b.repair_pairs;
            let pair = if go_right && !b.replace {
                pairs[1]
            } else {
                pairs[0]
            };

            tokio::join!(self.download_block(pair.left), self.download_block(pair.right));

            if self.repair_from(id, pair.left, pair.right).is_err() {
                self.repair_parity(pair.right, true).await;
                self.repair_parity(pair.left, false).await;

                if self.repair_from(id, pair.left, pair.right).is_err() {
                    b.repair_failed();
                }
            }
        }
        .boxed()
    }

    /// A replaced parity equals the XOR of the data blocks along its strand,
    /// walking right until the strand loops back to its own position. Fails
    /// if any block along the chain lacks data.
    async fn replaced_parity_repair(&self, id: BlockId) -> bool {
        let class = self.block(id).class.to_index();
        let position = self.block(id).position;
        let mut right = self.block(id).right[0];
        let mut acc = Bytes::from(vec![0u8; CHUNK_SIZE]);

        loop {
            if self.block(right).position == position {
                return self.block(id).repair_success(&acc);
            }
            if let Some(notified) = self.wait_for_no_pending_dl() {
                let _ = notified.await;
            }
            let Some(data) = self.block(right).data() else {
                return false;
            };
            acc = xor_byte_slices(&acc, &data);
            right = self.block(self.block(right).right[class]).right[0];
        }
    }

    /// Fetches the chunk at `addr` into the lattice block with the given
    /// canonical index, maintaining the pending-download edge.
    pub async fn fetch_chunk(&self, addr: &Address, index: i64) -> Result<Bytes, Error> {
        let b = self.get_block_id(index);
        if let Some(data) = self.block(b).data() {
            return Ok(data);
        }

        self.pending_dl_change(1);
        self.block(b).download_pending();
        self.block(b).set_identifier(*addr);

        let result = self.getter().get_chunk(addr).await;
        match &result {
            Ok(data) => {
                self.block(b).download_success(data);
            }
            Err(_) => {
                self.block(b).download_failed();
            }
        }
        self.pending_dl_change(-1);

        Ok(result?)
    }

    /// Downloads a parity leaf through the parity tree of its class,
    /// coordinating with concurrent fetchers of the same block.
    async fn get_parity(&self, id: BlockId) -> Result<(), Error> {
        match self.block(id).begin_parity_download() {
            ParityFetch::HasData => Ok(()),
            ParityFetch::Wait(notified) => {
                let _ = notified.await;
                if self.block(id).has_data() {
                    Ok(())
                } else {
                    Err(Error::Unrepairable(self.block(id).position))
                }
            }
            ParityFetch::Download => {
                let class = self.block(id).class.to_index();
                let root = self.parity_roots()[class];
                let position = self.block(id).position as u64;
                match self.getter().get_leaf(&root, position).await {
                    Ok(data) => {
                        self.block(id).download_success(&data);
                        Ok(())
                    }
                    Err(e) => {
                        self.block(id).download_failed();
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// Repairs every repairable block, passing over the lattice until a pass
    /// fills nothing new.
    pub async fn repair_all(&self) {
        let _guard = self.repair_lock.lock().await;
        let mut old_has_data_cnt: i64 = -1;
        loop {
            let mut has_data_cnt: i64 = 0;
            for id in 0..self.blocks().len() {
                if self.block(id).has_data() {
                    has_data_cnt += 1;
                    continue;
                }
                if self.block(id).is_parity {
                    self.repair_parity(id, true).await;
                } else {
                    let _ = self.repair_block(id).await;
                }
                if self.block(id).has_data() {
                    has_data_cnt += 1;
                }
            }
            if has_data_cnt == old_has_data_cnt {
                return;
            }
            old_has_data_cnt = has_data_cnt;
            self.reset_mending_status();
            self.reset_repair_status();
        }
    }

    /// Fills in the single block connected to both `a` and `b` through XOR.
    /// At least one operand must be a parity and both must hold data.
    pub fn xor_blocks(&self, a: BlockId, b: BlockId) -> Result<BlockId, Error> {
        let (Some(ad), Some(bd)) = (self.block(a).data(), self.block(b).data()) else {
            return Err(Error::MissingData);
        };
        let (pa, pb) = (self.block(a), self.block(b));

        if !pa.is_parity && !pb.is_parity {
            return Err(Error::NotParity);
        }

        if pa.is_parity && pb.is_parity {
            let xored = xor_byte_slices(&ad, &bd);
            if pa.right[0] == pb.left[0] && !pa.replace {
                self.block(pa.right[0]).repair_success(&xored);
                return Ok(pa.right[0]);
            } else if pa.left[0] == pb.right[0] && !pb.replace {
                self.block(pa.left[0]).repair_success(&xored);
                return Ok(pa.left[0]);
            }
            return Err(Error::NotConnected);
        }

        let (data, data_bytes, parity, parity_bytes) = if pa.is_parity {
            (b, bd, a, ad)
        } else {
            (a, ad, b, bd)
        };
        let class = self.block(parity).class.to_index();
        let data_block = self.block(data);

        if data_block.right.len() > class && data_block.right[class] == parity {
            // The parity sits to the right; reconstruct the left parity.
            let xored = xor_byte_slices(&data_bytes, &parity_bytes);
            let target = data_block.left[class];
            self.block(target).repair_success(&xored);
            Ok(target)
        } else if data_block.left.len() > class && data_block.left[class] == parity {
            let xored = xor_byte_slices(&data_bytes, &parity_bytes);
            let target = data_block.right[class];
            self.block(target).repair_success(&xored);
            Ok(target)
        } else if data_block.right.len() > class
            && self.block(data_block.right[class]).replace
            && self.block(data_block.right[class]).right[0] == self.block(parity).left[0]
        {
            // Crossing a replaced segment: the XOR lands on the data block
            // behind the replaced parity.
            let xored = xor_byte_slices(&data_bytes, &parity_bytes);
            let target = self.block(parity).left[0];
            self.block(target).repair_success(&xored);
            Ok(target)
        } else {
            Err(Error::NotConnected)
        }
    }
}

fn to_storage_error(e: Error) -> StorageError {
    match e {
        Error::Storage(inner) => inner,
        other => StorageError::Other(anyhow::Error::new(other)),
    }
}

#[async_trait]
impl Repairer for Lattice {
    async fn get_chunk(&self, addr: &Address, index: u64) -> Result<Bytes, StorageError> {
        self.fetch_chunk(addr, index as i64)
            .await
            .map_err(to_storage_error)
    }

    async fn get_leaf(&self, root: &Address, leaf_index: u64) -> Result<Bytes, StorageError> {
        self.getter().get_leaf(root, leaf_index).await
    }

    fn root_index(&self) -> Option<u64> {
        Some(self.num_data_blocks as u64)
    }

    async fn repair_chunk(&self, index: u64) -> Result<Bytes, StorageError> {
        Lattice::repair_chunk(self, index as i64)
            .await
            .map_err(to_storage_error)
    }

    async fn repair_all(&self) {
        Lattice::repair_all(self).await;
    }
}

// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::Bytes;
use log::trace;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

use braid_storage::{Address, CHUNK_PREFIX};

use crate::parity::StrandClass;

/// Arena index of a block inside its lattice.
pub type BlockId = usize;

/// A `(left, right)` pair of blocks whose XOR yields the owning block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairPair {
    pub left: BlockId,
    pub right: BlockId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadStatus {
    #[default]
    None,
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepairStatus {
    #[default]
    None,
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimePeriod {
    pub start: i64,
    pub end: i64,
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct BlockState {
    data: Option<Bytes>,
    identifier: Option<Address>,
    download_status: DownloadStatus,
    repair_status: RepairStatus,
    is_mending: bool,
    download_time: TimePeriod,
    repair_time: TimePeriod,
    subscribers: Vec<oneshot::Sender<()>>,
}

/// Mutable status snapshot of a block, for reporting.
#[derive(Debug, Clone, Copy)]
pub struct BlockSnapshot {
    pub has_data: bool,
    pub download_status: DownloadStatus,
    pub repair_status: RepairStatus,
    pub download_time: TimePeriod,
    pub repair_time: TimePeriod,
}

/// What a parity fetch should do next, decided atomically under the block
/// lock.
pub enum ParityFetch {
    /// The block already carries data.
    HasData,
    /// Another task is downloading; wait for its status change.
    Wait(oneshot::Receiver<()>),
    /// This task owns the download now.
    Download,
}

/// A vertex of the lattice: either a data block or a parity.
///
/// Wiring (`left`/`right` neighbour ids, repair pairs, tree relations) is
/// fixed at lattice construction; everything mutable lives behind the block
/// lock and follows first-writer-wins on the payload.
#[derive(Debug)]
pub struct Block {
    /// 1-based lattice position. A parity carries the position of its left
    /// data endpoint.
    pub position: i64,
    pub is_parity: bool,
    /// Strand class; meaningful for parities only.
    pub class: StrandClass,
    /// Set on the leading parities recomputed during closure.
    pub replace: bool,
    /// Endpoint positions, for parities.
    pub left_index: i64,
    pub right_index: i64,
    /// For a data block, the per-class adjacent parities; for a parity, its
    /// single data endpoint.
    pub left: Vec<BlockId>,
    pub right: Vec<BlockId>,
    /// Subtree byte size from the tree metadata (data blocks only).
    pub size: u64,
    /// Raw chunk length, prefix included (data blocks only).
    pub length: u32,
    pub parent: Option<BlockId>,
    pub children: Vec<BlockId>,
    /// Repair pairs in priority order, computed once after wiring.
    pub repair_pairs: Vec<RepairPair>,
    state: Mutex<BlockState>,
}

impl Block {
    pub(crate) fn new_data(position: i64, alpha: usize) -> Self {
        Self {
            position,
            is_parity: false,
            class: StrandClass::Horizontal,
            replace: false,
            left_index: 0,
            right_index: 0,
            left: vec![0; alpha],
            right: vec![0; alpha],
            size: 0,
            length: 0,
            parent: None,
            children: Vec::new(),
            repair_pairs: Vec::new(),
            state: Mutex::new(BlockState::default()),
        }
    }

    pub(crate) fn new_parity(position: i64, class: StrandClass, replace: bool) -> Self {
        Self {
            position,
            is_parity: true,
            class,
            replace,
            left_index: 0,
            right_index: 0,
            left: Vec::new(),
            right: Vec::new(),
            size: 0,
            length: 0,
            parent: None,
            children: Vec::new(),
            repair_pairs: Vec::new(),
            state: Mutex::new(BlockState::default()),
        }
    }

    pub fn has_data(&self) -> bool {
        self.state.lock().unwrap().data.is_some()
    }

    pub fn data(&self) -> Option<Bytes> {
        self.state.lock().unwrap().data.clone()
    }

    pub fn identifier(&self) -> Option<Address> {
        self.state.lock().unwrap().identifier
    }

    pub fn set_identifier(&self, addr: Address) {
        self.state.lock().unwrap().identifier = Some(addr);
    }

    pub fn is_mending(&self) -> bool {
        self.state.lock().unwrap().is_mending
    }

    pub fn set_mending(&self, mending: bool) {
        self.state.lock().unwrap().is_mending = mending;
    }

    pub fn snapshot(&self) -> BlockSnapshot {
        let st = self.state.lock().unwrap();
        BlockSnapshot {
            has_data: st.data.is_some(),
            download_status: st.download_status,
            repair_status: st.repair_status,
            download_time: st.download_time,
            repair_time: st.repair_time,
        }
    }

    /// An internal tree node whose download failed and that nobody repaired
    /// or started mending yet.
    pub fn internal_node_pending_repair(&self) -> bool {
        if self.is_parity || self.children.is_empty() {
            return false;
        }
        let st = self.state.lock().unwrap();
        st.download_status == DownloadStatus::Failed
            && st.repair_status == RepairStatus::None
            && !st.is_mending
    }

    /// Whether a parity repair attempt should proceed.
    pub fn parity_should_repair(&self) -> bool {
        let st = self.state.lock().unwrap();
        !(st.data.is_some()
            || st.repair_status == RepairStatus::Failed
            || st.repair_status == RepairStatus::Pending)
    }

    /// Returns the payload, or a receiver that fires on the next status
    /// change. Checked and subscribed under one lock acquisition.
    pub fn data_or_subscribe(&self) -> Result<Bytes, oneshot::Receiver<()>> {
        let mut st = self.state.lock().unwrap();
        if let Some(data) = st.data.clone() {
            return Ok(data);
        }
        let (tx, rx) = oneshot::channel();
        st.subscribers.push(tx);
        Err(rx)
    }

    /// Decides atomically whether a parity fetch is redundant, should wait
    /// on an in-flight download, or should start one.
    pub fn begin_parity_download(&self) -> ParityFetch {
        let mut st = self.state.lock().unwrap();
        if st.data.is_some() {
            return ParityFetch::HasData;
        }
        if st.download_status == DownloadStatus::Pending {
            let (tx, rx) = oneshot::channel();
            st.subscribers.push(tx);
            return ParityFetch::Wait(rx);
        }
        st.download_status = DownloadStatus::Pending;
        st.download_time.start = now_nanos();
        ParityFetch::Download
    }

    pub fn download_pending(&self) -> bool {
        self.set_data(None, now_nanos(), 0, Some(DownloadStatus::Pending), None)
    }

    pub fn download_failed(&self) -> bool {
        self.set_data(None, 0, now_nanos(), Some(DownloadStatus::Failed), None)
    }

    pub fn download_success(&self, data: &[u8]) -> bool {
        self.set_data(
            Some(data),
            0,
            now_nanos(),
            Some(DownloadStatus::Success),
            None,
        )
    }

    /// Marks the block repair-pending; returns false if it already was.
    pub fn repair_pending(&self) -> bool {
        {
            let st = self.state.lock().unwrap();
            if st.repair_status == RepairStatus::Pending {
                return false;
            }
        }
        self.set_data(None, now_nanos(), 0, None, Some(RepairStatus::Pending))
    }

    pub fn repair_failed(&self) -> bool {
        self.set_data(None, 0, now_nanos(), None, Some(RepairStatus::Failed))
    }

    pub fn repair_success(&self, data: &[u8]) -> bool {
        self.set_data(Some(data), 0, now_nanos(), None, Some(RepairStatus::Success))
    }

    pub(crate) fn reset_repair_status(&self) {
        let mut st = self.state.lock().unwrap();
        if st.repair_status == RepairStatus::Failed || st.repair_status == RepairStatus::Pending {
            st.repair_status = RepairStatus::None;
        }
    }

    /// Applies a payload and/or status transition. First writer wins: once
    /// the block has data, further calls change nothing. Subscribers are
    /// notified under the lock, exactly once each.
    fn set_data(
        &self,
        data: Option<&[u8]>,
        start: i64,
        end: i64,
        download: Option<DownloadStatus>,
        repair: Option<RepairStatus>,
    ) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.data.is_some() {
            return false;
        }

        if let Some(payload) = data {
            let mut buf = payload.to_vec();
            // Data blocks carry their true chunk length and subtree size in
            // the metadata; the XOR that produced `payload` garbled the size
            // prefix, so rewrite it and cut the payload to length.
            if self.length as usize >= CHUNK_PREFIX {
                buf.resize(self.length as usize, 0);
                buf[..CHUNK_PREFIX].copy_from_slice(&self.size.to_le_bytes());
            }
            st.data = Some(Bytes::from(buf));
        }

        if let Some(status) = download {
            st.download_status = status;
            if start != 0 {
                st.download_time.start = start;
            }
            if end != 0 {
                st.download_time.end = end;
            }
        }
        if let Some(status) = repair {
            st.repair_status = status;
            if start != 0 {
                st.repair_time.start = start;
            }
            if end != 0 {
                st.repair_time.end = end;
            }
        }

        trace!(
            "block {} (parity: {}) -> data: {}, dl: {:?}, repair: {:?}",
            self.position,
            self.is_parity,
            st.data.is_some(),
            st.download_status,
            st.repair_status
        );

        for subscriber in st.subscribers.drain(..) {
            let _ = subscriber.send(());
        }

        true
    }
}

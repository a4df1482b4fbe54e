// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use braid_chunker::{generate_chunk_metadata, ChunkMetadata};
use braid_storage::{Address, Getter};

use crate::block::{Block, BlockId, RepairPair};
use crate::config::Config;
use crate::index::{forward_neighbours, replacement_indices, wrap_position};
use crate::parity::StrandClass;
use crate::Error;

struct DlState {
    pending: i64,
    waiters: Vec<oneshot::Sender<()>>,
}

/// The in-memory entanglement lattice: an arena of data and parity vertices
/// wired into a closed torus, plus the bookkeeping the repair engine needs.
///
/// The arena owns every block; neighbour references are arena indices. The
/// first `num_data_blocks` entries are the data vertices in position order,
/// followed by `alpha` parities per data position.
pub struct Lattice {
    pub config: Config,
    pub num_data_blocks: i64,
    pub size: u64,
    blocks: Vec<Block>,
    /// Canonical index -> lattice position translation for the internal
    /// nodes moved out of their children's repair windows, in both
    /// directions.
    shift: HashMap<i64, i64>,
    getter: Arc<dyn Getter>,
    pub data_root: Address,
    parity_roots: Vec<Address>,
    pub(crate) repair_lock: tokio::sync::Mutex<()>,
    dl: Mutex<DlState>,
    recover_error: Mutex<Option<String>>,
}

impl Lattice {
    /// Builds the full lattice for a file of `size` bytes before any I/O:
    /// data vertices, tree relations, the parent-child anti-collision shift,
    /// and `alpha` parity vertices per data block with closure-aware
    /// endpoints.
    pub async fn new(
        config: Config,
        size: u64,
        getter: Arc<dyn Getter>,
        data_root: Address,
        parity_roots: Vec<Address>,
    ) -> Result<Self, Error> {
        let metadata = generate_chunk_metadata(size).await?;
        let num_data_blocks = metadata.len() as i64;
        let (s, p, alpha) = (config.s as i64, config.p as i64, config.alpha);

        let mut blocks: Vec<Block> = (0..num_data_blocks)
            .map(|i| Block::new_data(i + 1, alpha))
            .collect();

        let shift = wire_tree_relations(&mut blocks, &metadata, config.s, config.p);

        let replaced = replacement_indices(s, p, alpha, num_data_blocks);

        create_parities(&mut blocks, num_data_blocks, config, &replaced)?;

        let pairs: Vec<Vec<RepairPair>> = (0..blocks.len())
            .map(|id| compute_repair_pairs(&blocks, id))
            .collect();
        for (block, pairs) in blocks.iter_mut().zip(pairs) {
            block.repair_pairs = pairs;
        }

        Ok(Self {
            config,
            num_data_blocks,
            size,
            blocks,
            shift,
            getter,
            data_root,
            parity_roots,
            repair_lock: tokio::sync::Mutex::new(()),
            dl: Mutex::new(DlState {
                pending: 0,
                waiters: Vec::new(),
            }),
            recover_error: Mutex::new(None),
        })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    pub(crate) fn getter(&self) -> &Arc<dyn Getter> {
        &self.getter
    }

    pub(crate) fn parity_roots(&self) -> &[Address] {
        &self.parity_roots
    }

    /// Arena id of the block holding the node with the given canonical
    /// index, going through the shift translation.
    pub fn get_block_id(&self, canonical_index: i64) -> BlockId {
        let position = self
            .shift
            .get(&canonical_index)
            .copied()
            .unwrap_or(canonical_index);
        position as BlockId - 1
    }

    pub fn get_block(&self, canonical_index: i64) -> &Block {
        &self.blocks[self.get_block_id(canonical_index)]
    }

    /// Lattice position of the block's left neighbour for the given class,
    /// for reporting.
    pub fn left_pos(&self, id: BlockId, class: usize) -> i64 {
        let b = &self.blocks[id];
        if b.is_parity && b.left_index > 0 {
            b.left_index
        } else if b.left.len() > class {
            self.blocks[b.left[class]].position
        } else {
            0
        }
    }

    pub fn right_pos(&self, id: BlockId, class: usize) -> i64 {
        let b = &self.blocks[id];
        if b.is_parity && b.right_index > 0 {
            b.right_index
        } else if b.right.len() > class {
            self.blocks[b.right[class]].position
        } else {
            0
        }
    }

    /// Expands outwards from `block`, alternating direction on descent, up
    /// to roughly `2·alpha` distinct positions. The recovery heuristic
    /// prefers short alternating paths across the lattice.
    pub fn get_neighbours(&self, id: BlockId, to_right: bool) -> Vec<BlockId> {
        let mut neighbours = vec![id];
        let mut added: HashSet<i64> = HashSet::new();
        added.insert(self.blocks[id].position);

        let src = if to_right {
            self.blocks[id].right.clone()
        } else {
            self.blocks[id].left.clone()
        };
        self.expand_neighbours(&src, to_right, &mut neighbours, &mut added);
        neighbours
    }

    fn expand_neighbours(
        &self,
        src: &[BlockId],
        to_right: bool,
        neighbours: &mut Vec<BlockId>,
        added: &mut HashSet<i64>,
    ) {
        let mut deferred: Vec<BlockId> = Vec::new();
        for &s in src {
            let n = if to_right {
                self.blocks[s].right[0]
            } else {
                self.blocks[s].left[0]
            };
            if added.insert(self.blocks[n].position) {
                neighbours.push(n);
                deferred.push(n);
            }
        }
        // Deferred expansions run last-in-first-out, flipping direction.
        for &n in deferred.iter().rev() {
            let next = if to_right {
                self.blocks[n].left.clone()
            } else {
                self.blocks[n].right.clone()
            };
            self.expand_neighbours(&next, !to_right, neighbours, added);
        }
    }

    pub(crate) fn pending_dl_change(&self, diff: i64) {
        let mut dl = self.dl.lock().unwrap();
        dl.pending += diff;
        if dl.pending == 0 {
            for waiter in dl.waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    /// Returns a receiver released when the pending-download count next hits
    /// zero, or `None` when nothing is pending.
    pub fn wait_for_no_pending_dl(&self) -> Option<oneshot::Receiver<()>> {
        let mut dl = self.dl.lock().unwrap();
        if dl.pending == 0 {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        dl.waiters.push(tx);
        Some(rx)
    }

    /// Clears Pending/Failed repair statuses so a later path can retry.
    pub fn reset_repair_status(&self) {
        for block in &self.blocks {
            block.reset_repair_status();
        }
    }

    /// Unwinds the recursion guards at the end of a top-level repair.
    pub fn reset_mending_status(&self) {
        for block in &self.blocks[..self.num_data_blocks as usize] {
            if block.is_mending() {
                block.set_mending(false);
            }
        }
    }

    pub(crate) fn recover_error(&self) -> Option<String> {
        self.recover_error.lock().unwrap().clone()
    }

    pub(crate) fn set_recover_error(&self, message: String) {
        let mut guard = self.recover_error.lock().unwrap();
        if guard.is_none() {
            *guard = Some(message);
        }
    }

    /// Count of blocks currently holding data.
    pub fn has_data_count(&self) -> i64 {
        self.blocks.iter().filter(|b| b.has_data()).count() as i64
    }
}

/// Wires parent/children/size/length from the tree metadata, then moves
/// every non-root internal node whose children all fall inside its own
/// `s·p` repair window: its metadata swaps places with a leaf at a probe
/// position `s·p, 2·s·p + s, …` outside all child windows. Records the
/// translation in both directions.
fn wire_tree_relations(
    blocks: &mut [Block],
    metadata: &[ChunkMetadata],
    s: usize,
    p: usize,
) -> HashMap<i64, i64> {
    let mut shift: HashMap<i64, i64> = HashMap::new();
    let mut internal_order: Vec<usize> = Vec::new();

    for (i, meta) in metadata.iter().enumerate() {
        let block = &mut blocks[i];
        block.size = meta.size;
        block.length = meta.length;
        if meta.parent != 0 {
            block.parent = Some(meta.parent as BlockId - 1);
        }
        if !meta.children.is_empty() {
            block.children = meta.children.iter().map(|&c| c as BlockId - 1).collect();
            if meta.parent != 0 {
                internal_order.push(i);
            }
        }
    }

    let window = s * p;
    let num_blocks = metadata.len();

    for &can_ind in &internal_order {
        let children = &metadata[can_ind].children;
        let lowest = children[0] as i64;
        let highest = children[children.len() - 1] as i64;

        let mut j = window;
        while j < num_blocks {
            let pos = j as i64 + 1;
            let in_window = pos > lowest - window as i64 && pos < highest + window as i64;
            if !in_window && metadata[j].children.is_empty() {
                if shift.contains_key(&(can_ind as i64 + 1)) || shift.contains_key(&pos) {
                    j += window + s;
                    continue;
                }
                shift.insert(can_ind as i64 + 1, pos);
                shift.insert(pos, can_ind as i64 + 1);
                translate_blocks(blocks, can_ind, j);
                break;
            }
            j += window + s;
        }
    }

    shift
}

/// Swaps the tree metadata of two arena slots; the lattice wiring stays put.
fn translate_blocks(blocks: &mut [Block], a: usize, b: usize) {
    let (first, second) = if a < b { (a, b) } else { (b, a) };
    let (head, tail) = blocks.split_at_mut(second);
    let (x, y) = (&mut head[first], &mut tail[0]);
    std::mem::swap(&mut x.size, &mut y.size);
    std::mem::swap(&mut x.length, &mut y.length);
    std::mem::swap(&mut x.parent, &mut y.parent);
    std::mem::swap(&mut x.children, &mut y.children);
}

/// Allocates `alpha` parity vertices per data position and wires both sides,
/// wrapping right endpoints that overflow the lattice back to the left edge.
fn create_parities(
    blocks: &mut Vec<Block>,
    num_data_blocks: i64,
    config: Config,
    replaced: &HashSet<i64>,
) -> Result<(), Error> {
    let (s, p) = (config.s as i64, config.p as i64);

    for i in 0..num_data_blocks as usize {
        let position = i as i64 + 1;
        let (r, h, l) = forward_neighbours(position, s, p);
        let next = [h, r, l];
        let mut wrap: Option<[i64; 3]> = None;

        for (k, class) in StrandClass::list(config.alpha).into_iter().enumerate() {
            let mut nxt = next[k];
            if nxt > num_data_blocks {
                let w = *wrap.get_or_insert_with(|| {
                    let (rw, hw, lw) = wrap_position(position, s, p);
                    [hw, rw, lw]
                });
                nxt = w[k];
            }
            if nxt < 1 || nxt > num_data_blocks {
                return Err(Error::Construction(position));
            }

            let parity_id = blocks.len();
            let mut parity = Block::new_parity(position, class, replaced.contains(&position));

            parity.left = vec![i];
            parity.left_index = position;
            blocks[i].right[k] = parity_id;

            let right_data = nxt as usize - 1;
            parity.right = vec![right_data];
            parity.right_index = nxt;
            blocks[right_data].left[k] = parity_id;

            blocks.push(parity);
        }
    }

    Ok(())
}

/// Repair pairs in priority order.
///
/// Data blocks: one pair per class (horizontal, right, left), with a
/// replaced left parity substituted by the data block behind it, plus one
/// cascade pair per replaced right parity. Parities: the left-going pair
/// first; non-replaced parities also get the right-going pair.
fn compute_repair_pairs(blocks: &[Block], id: BlockId) -> Vec<RepairPair> {
    let b = &blocks[id];

    if b.is_parity {
        let left_data = b.left[0];
        let mut l = blocks[left_data].left[b.class.to_index()];
        if blocks[l].replace {
            l = blocks[l].left[0];
        }
        let mut pairs = vec![RepairPair {
            left: l,
            right: left_data,
        }];
        if !b.replace {
            let right_data = b.right[0];
            pairs.push(RepairPair {
                left: right_data,
                right: blocks[right_data].right[b.class.to_index()],
            });
        }
        pairs
    } else {
        let mut pairs = Vec::with_capacity(b.left.len());
        for k in 0..b.left.len() {
            let mut l = b.left[k];
            let r = b.right[k];
            if blocks[l].replace {
                l = blocks[l].left[0];
            }
            pairs.push(RepairPair { left: l, right: r });
        }
        for k in 0..b.right.len() {
            let r = b.right[k];
            if blocks[r].replace {
                let rr = blocks[r].right[0];
                pairs.push(RepairPair {
                    left: rr,
                    right: blocks[rr].right[k],
                });
            }
        }
        pairs
    }
}

// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::{Bytes, BytesMut};
use log::debug;
use std::fmt;

/// The three strand classes of the lattice. The order doubles as the repair
/// priority for data blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrandClass {
    Horizontal,
    Right,
    Left,
}

impl StrandClass {
    pub fn to_index(self) -> usize {
        match self {
            StrandClass::Horizontal => 0,
            StrandClass::Right => 1,
            StrandClass::Left => 2,
        }
    }

    pub fn try_from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(StrandClass::Horizontal),
            1 => Some(StrandClass::Right),
            2 => Some(StrandClass::Left),
            _ => None,
        }
    }

    /// The first `alpha` strand classes.
    pub fn list(alpha: usize) -> Vec<StrandClass> {
        (0..alpha).filter_map(StrandClass::try_from_index).collect()
    }
}

impl fmt::Display for StrandClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrandClass::Horizontal => write!(f, "horizontal"),
            StrandClass::Right => write!(f, "right"),
            StrandClass::Left => write!(f, "left"),
        }
    }
}

/// A parity emitted by the entangler: the running XOR between the data
/// blocks at `left_index` and `right_index` along one strand.
///
/// `left_index < 1` marks a pre-lattice edge emitted before the strand
/// reached its first data block; writers skip those. `replace` marks a
/// recomputed leading parity that supersedes the previously emitted parity
/// for the same edge.
#[derive(Debug, Clone)]
pub struct EntangledBlock {
    pub data: Bytes,
    pub left_index: i64,
    pub right_index: i64,
    pub class: StrandClass,
    pub replace: bool,
}

/// Accumulates the entangler's emissions and assembles the per-class parity
/// streams ready for re-upload.
#[derive(Debug)]
pub struct ParityCollector {
    alpha: usize,
    blocks: Vec<EntangledBlock>,
}

impl ParityCollector {
    pub fn new(alpha: usize) -> Self {
        Self {
            alpha,
            blocks: Vec::new(),
        }
    }

    /// Accepts one emission. Pre-lattice residue is dropped; a replacement
    /// overwrites the previously collected parity for the same edge.
    pub fn push(&mut self, block: EntangledBlock) {
        if block.left_index < 1 {
            return;
        }
        if block.replace {
            match self.blocks.iter_mut().find(|b| {
                b.class == block.class
                    && b.left_index == block.left_index
                    && b.right_index == block.right_index
            }) {
                Some(existing) => {
                    existing.data = block.data;
                    existing.replace = true;
                }
                None => debug!(
                    "dropping unmatched replacement parity {}_{} ({})",
                    block.left_index, block.right_index, block.class
                ),
            }
            return;
        }
        self.blocks.push(block);
    }

    pub fn blocks(&self) -> &[EntangledBlock] {
        &self.blocks
    }

    /// Parity payloads of one class, ascending by `left_index`.
    pub fn class_stream(&self, class: StrandClass) -> Bytes {
        let mut parities: Vec<&EntangledBlock> = self
            .blocks
            .iter()
            .filter(|b| b.class == class)
            .collect();
        parities.sort_by_key(|b| b.left_index);

        let mut stream = BytesMut::new();
        for parity in parities {
            stream.extend_from_slice(&parity.data);
        }
        stream.freeze()
    }

    /// All `alpha` parity streams, indexed by strand class.
    pub fn into_streams(self) -> Vec<Bytes> {
        StrandClass::list(self.alpha)
            .into_iter()
            .map(|class| self.class_stream(class))
            .collect()
    }
}

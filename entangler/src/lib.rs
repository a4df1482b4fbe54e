// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Alpha-entanglement over content-addressed trees.
//!
//! The [`Entangler`](entangler::Entangler) streams data chunks in canonical
//! order and produces `alpha` parallel parity strands over a closed 2-D
//! lattice; any data block can then be rebuilt as the XOR of two surviving
//! neighbours. The [`Lattice`](lattice::Lattice) materialises the full graph
//! of data and parity vertices for a file size, and its repair engine
//! cascades XOR reconstruction across strands until the requested blocks are
//! whole again.

pub mod block;
pub mod config;
pub mod entangler;
pub mod index;
pub mod lattice;
pub mod parity;
mod repair;

pub use block::{Block, BlockId, BlockSnapshot, DownloadStatus, RepairPair, RepairStatus};
pub use config::Config;
pub use entangler::{pad_byte_slices, xor_byte_slices, Entangler};
pub use lattice::Lattice;
pub use parity::{EntangledBlock, ParityCollector, StrandClass};

/// Error type for entanglement and repair.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid parameter {0}: {1}")]
    InvalidParameter(&'static str, usize),

    /// XOR attempted with an endpoint that holds no data yet; the caller
    /// should try another repair pair.
    #[error("missing data")]
    MissingData,

    /// The target block was filled by a concurrent repair.
    #[error("block already has data")]
    AlreadyHasData,

    /// Recursion guard: this block is being mended higher up the stack.
    #[error("block is already mending")]
    AlreadyMending,

    #[error("at least one block must be parity")]
    NotParity,

    #[error("blocks are not connected")]
    NotConnected,

    /// Fewer parity roots than strands; repair cannot start.
    #[error("missing parity roots: {0} required")]
    MissingParityRoots(usize),

    /// Every repair pair of the block was exhausted.
    #[error("block {0} could not be repaired")]
    Unrepairable(i64),

    /// Sticky lattice-wide failure; all further repairs short-circuit.
    #[error("recovery failed: {0}")]
    Recover(String),

    #[error("lattice construction failed at position {0}")]
    Construction(i64),

    #[error(transparent)]
    Storage(#[from] braid_storage::Error),

    #[error(transparent)]
    Chunker(#[from] braid_chunker::Error),
}

// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::Bytes;
use std::collections::HashSet;

use crate::config::Config;
use crate::index::{
    backward_neighbours, forward_neighbours, memory_slot, replacement_indices,
    right_extreme_indices, wrap_position,
};
use crate::parity::{EntangledBlock, StrandClass};

/// XOR of two byte slices, the shorter zero-padded to the longer.
pub fn xor_byte_slices(a: &[u8], b: &[u8]) -> Bytes {
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut out = long.to_vec();
    for (o, s) in out.iter_mut().zip(short.iter()) {
        *o ^= s;
    }
    Bytes::from(out)
}

/// Pads the shorter slice to the longer. With `zeros` the padding is zero
/// bytes; otherwise the tail of the longer slice is copied over. Production
/// paths only use `zeros = true`.
pub fn pad_byte_slices(a: &mut Vec<u8>, b: &mut Vec<u8>, zeros: bool) {
    let (longer, shorter) = if a.len() >= b.len() { (&*a, &mut *b) } else { (&*b, &mut *a) };
    if longer.len() == shorter.len() {
        return;
    }
    let old_len = shorter.len();
    shorter.resize(longer.len(), 0);
    if !zeros {
        shorter[old_len..].copy_from_slice(&longer[old_len..]);
    }
}

/// Streaming encoder producing `alpha` parity strands over data chunks fed
/// in canonical order.
///
/// Per strand class it keeps a bank of running parities, one slot per
/// strand; feeding chunk `i` emits the parity between `i` and its backward
/// neighbour (the pre-update slot content) and folds the chunk into the
/// slot. Closing the lattice connects the right extreme back to the left
/// edge and recomputes the leading parities whose chains started against a
/// zero prefix.
pub struct Entangler {
    config: Config,
    parity_memory: Vec<Vec<u8>>,
    left_extreme_memory: Vec<Bytes>,
    num_data_blocks: i64,
    right_extreme_index: Vec<i64>,
}

impl Entangler {
    pub fn new(config: Config, chunk_size: usize) -> Self {
        let total_slots = config.s + config.p + config.s;
        let extreme = config.s.max(config.p);
        Self {
            config,
            parity_memory: vec![vec![0u8; chunk_size]; total_slots],
            left_extreme_memory: vec![Bytes::from(vec![0u8; chunk_size]); extreme],
            num_data_blocks: 0,
            right_extreme_index: Vec::new(),
        }
    }

    pub fn num_data_blocks(&self) -> i64 {
        self.num_data_blocks
    }

    /// Folds the chunk at canonical position `index` (1-based) into the
    /// three running parities, emitting the parity each strand carried into
    /// this position.
    pub fn entangle(&mut self, chunk: &[u8], index: i64, emit: &mut dyn FnMut(EntangledBlock)) {
        let (s, p) = (self.config.s as i64, self.config.p as i64);

        if index > self.num_data_blocks {
            self.num_data_blocks = index;
        }
        if index as usize <= self.left_extreme_memory.len() {
            self.left_extreme_memory[index as usize - 1] = Bytes::copy_from_slice(chunk);
        }

        let (r_slot, h_slot, l_slot) = memory_slot(index, s, p);
        let (r_back, h_back, l_back) = backward_neighbours(index, s, p);

        for (slot, back, class) in [
            (r_slot, r_back, StrandClass::Right),
            (h_slot, h_back, StrandClass::Horizontal),
            (l_slot, l_back, StrandClass::Left),
        ] {
            emit(EntangledBlock {
                data: Bytes::copy_from_slice(&self.parity_memory[slot]),
                left_index: back,
                right_index: index,
                class,
                replace: false,
            });
            for (m, c) in self.parity_memory[slot].iter_mut().zip(chunk.iter()) {
                *m ^= c;
            }
        }
    }

    /// Closes the lattice into a torus: for every strand overflowing the
    /// right extreme, emits the parity binding it to the left edge plus the
    /// recomputed replacement for the edge out of the wrap target.
    pub fn wrap_lattice(&mut self, emit: &mut dyn FnMut(EntangledBlock)) {
        let (s, p) = (self.config.s as i64, self.config.p as i64);

        if self.right_extreme_index.is_empty() {
            self.set_datablocks_to_close();
        }

        for &index in &self.right_extreme_index {
            let (r_slot, h_slot, l_slot) = memory_slot(index, s, p);
            let (r_front, h_front, l_front) = forward_neighbours(index, s, p);
            let (r_first, h_first, l_first) = wrap_position(index, s, p);

            for (slot, front, first, class, pick) in [
                (r_slot, r_front, r_first, StrandClass::Right, 0usize),
                (h_slot, h_front, h_first, StrandClass::Horizontal, 1),
                (l_slot, l_front, l_first, StrandClass::Left, 2),
            ] {
                if front <= self.num_data_blocks {
                    continue;
                }

                // The running parity of this strand becomes the closing edge
                // back to the left extreme.
                emit(EntangledBlock {
                    data: Bytes::copy_from_slice(&self.parity_memory[slot]),
                    left_index: index,
                    right_index: first,
                    class,
                    replace: false,
                });

                // The original parity out of the wrap target was computed
                // against a zero prefix; recompute it now that the chain is
                // closed.
                let seconds = forward_neighbours(first, s, p);
                let second = [seconds.0, seconds.1, seconds.2][pick];
                let recomputed = xor_byte_slices(
                    &self.left_extreme_memory[first as usize - 1],
                    &self.parity_memory[slot],
                );
                emit(EntangledBlock {
                    data: recomputed,
                    left_index: first,
                    right_index: second,
                    class,
                    replace: true,
                });
            }
        }
    }

    /// The closure's replaced-parity positions; shared with lattice init.
    pub fn replaced_parity_indices(&mut self) -> HashSet<i64> {
        if self.right_extreme_index.is_empty() {
            self.set_datablocks_to_close();
        }
        replacement_indices(
            self.config.s as i64,
            self.config.p as i64,
            self.config.alpha,
            self.num_data_blocks,
        )
    }

    fn set_datablocks_to_close(&mut self) {
        self.right_extreme_index = right_extreme_indices(
            self.config.s as i64,
            self.config.p as i64,
            self.config.alpha,
            self.num_data_blocks,
        );
    }
}

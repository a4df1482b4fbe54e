// Copyright 2024 Braid Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Pure index arithmetic over the `(s, p)` lattice.
//!
//! Data positions are 1-based. Rows of the lattice are horizontal strands;
//! right- and left-helical strands wind around the `s × p` leap window, so
//! the helical neighbours of the top and bottom rows wrap inside the window.
//! All functions return raw positions; callers decide how positions beyond
//! the number of data blocks wrap around to the left edge.

use std::collections::HashSet;

/// Positions of the three forward neighbours of `index`, as
/// `(right, horizontal, left)`.
pub fn forward_neighbours(index: i64, s: i64, p: i64) -> (i64, i64, i64) {
    let node_pos = index.rem_euclid(s);
    let h = index + s;

    if node_pos == 1 {
        // Top row: right goes up-right, left wraps within the helical band.
        (index + s + 1, h, index + s * p - (s - 1) * (s - 1))
    } else if node_pos == 0 {
        // Bottom row: right wraps, left goes down-left.
        (index + s * p - (s * s - 1), h, index + s - 1)
    } else {
        (index + s + 1, h, index + s - 1)
    }
}

/// Mirror of [`forward_neighbours`].
pub fn backward_neighbours(index: i64, s: i64, p: i64) -> (i64, i64, i64) {
    let node_pos = index.rem_euclid(s);
    let h = index - s;

    if node_pos == 1 {
        (index - s * p + s * s - 1, h, index - (s - 1))
    } else if node_pos == 0 {
        (index - (s + 1), h, index - s * p + (s - 1) * (s - 1))
    } else {
        (index - (s + 1), h, index - (s - 1))
    }
}

/// Slots in the running-parity bank (size `s + p + s`) that hold the parities
/// being extended into `index`, as `(right, horizontal, left)`.
///
/// The horizontal slot follows directly from the row. The helical slots are
/// found by walking each strand backwards through the leap window until it
/// reaches the left column, which pins the strand's identity.
pub fn memory_slot(index: i64, s: i64, p: i64) -> (usize, usize, usize) {
    let h = ((index - 1).rem_euclid(s) + s) as usize;

    let mut indx = index.rem_euclid(s * p);
    if indx == 0 {
        indx = s * p;
    }

    let mut r = indx;
    while r > s {
        r = backward_neighbours(r, s, p).0;
    }
    let r = (1 - r).rem_euclid(s) as usize;

    let mut l = indx;
    while l > s {
        l = backward_neighbours(l, s, p).2;
    }
    let l = (2 * s + l.rem_euclid(s)) as usize;

    (r, h, l)
}

/// Data position on the left edge each strand of a right-extremum position
/// would connect to after closure, as `(right, horizontal, left)`.
pub fn wrap_position(index: i64, s: i64, p: i64) -> (i64, i64, i64) {
    let mut h = index.rem_euclid(s);
    if h == 0 {
        h = s;
    }

    let mut indx = index.rem_euclid(s * p);
    if indx == 0 {
        indx = s * p;
    }

    let mut r = indx;
    while r > s {
        r = backward_neighbours(r, s, p).0;
    }
    let mut l = indx;
    while l > s {
        l = backward_neighbours(l, s, p).2;
    }

    (r, h, l)
}

/// Like [`wrap_position`], but keeps the plain forward neighbour for every
/// strand that still fits inside a lattice of `max_index` data blocks.
pub fn wrap_position_max_len(index: i64, s: i64, p: i64, max_index: i64) -> (i64, i64, i64) {
    let (rw, hw, lw) = wrap_position(index, s, p);
    let (rn, hn, ln) = forward_neighbours(index, s, p);

    (
        if rn > max_index { rw } else { rn },
        if hn > max_index { hw } else { hn },
        if ln > max_index { lw } else { ln },
    )
}

/// Data positions on the right extreme of a lattice of `n` blocks: those with
/// at least one forward neighbour beyond `n`, collected walking backwards
/// until every strand has wrapped. Sorted ascending.
pub fn right_extreme_indices(s: i64, p: i64, alpha: usize, n: i64) -> Vec<i64> {
    let mut out = Vec::new();
    let max_wraps = (s.max(p) as usize) * alpha;
    let mut wraps = 0;
    let mut last = n;

    while wraps < max_wraps && last > 0 {
        let (r, h, l) = forward_neighbours(last, s, p);
        let mut did_wrap = false;
        if r > n {
            wraps += 1;
            did_wrap = true;
        }
        if h > n {
            wraps += 1;
            did_wrap = true;
        }
        if l > n {
            wraps += 1;
            did_wrap = true;
        }
        if wraps > 0 && did_wrap {
            out.push(last);
        }
        last -= 1;
    }

    out.sort_unstable();
    out
}

/// Positions whose leading parity is recomputed during closure. Entangler
/// closure and lattice construction must agree on this set.
pub fn replacement_indices(s: i64, p: i64, alpha: usize, n: i64) -> HashSet<i64> {
    let mut replaced = HashSet::new();

    for index in right_extreme_indices(s, p, alpha, n) {
        let (rf, hf, lf) = forward_neighbours(index, s, p);
        let (rw, hw, lw) = wrap_position(index, s, p);

        if rf > n {
            replaced.insert(rw);
        }
        if hf > n {
            replaced.insert(hw);
        }
        if lf > n {
            replaced.insert(lw);
        }
    }

    replaced
}

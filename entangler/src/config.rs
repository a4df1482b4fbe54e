/// Configuration for the entanglement lattice.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// The number of parity strands each data block participates in.
    pub alpha: usize,
    /// The number of horizontal strands.
    pub s: usize,
    /// The number of helical strands.
    pub p: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alpha: 3,
            s: 5,
            p: 5,
        }
    }
}

impl Config {
    /// Creates a new `Config` with the given parameters.
    pub fn new(alpha: usize, s: usize, p: usize) -> Result<Self, crate::Error> {
        if alpha == 0 || alpha > 3 {
            return Err(crate::Error::InvalidParameter("alpha", alpha));
        }
        // Fewer than three strands degenerates the helical classes into the
        // horizontal one.
        if s < 3 {
            return Err(crate::Error::InvalidParameter("s", s));
        }
        if p < 3 {
            return Err(crate::Error::InvalidParameter("p", p));
        }
        Ok(Self { alpha, s, p })
    }
}

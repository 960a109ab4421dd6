//! Loop-nest expansion with cut-and-retry.
//!
//! Pool and reorder kernels fully unroll their innermost blocks. The unrolled
//! body has to fit the device instruction budget, so the builder halves the
//! largest block until [`try_build`] produces a statement.

use std::fmt;

use primkit_core::{PrimError, Result};
use primkit_layout::Tile;
use tracing::debug;

/// Fixed per-loop bookkeeping instructions (counter, compare, branch).
const LOOP_OVERHEAD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopDim {
    pub letter: char,
    pub extent: usize,
    /// Unrolled block; the remaining `extent / block` trips stay a loop.
    pub block: usize,
    pub min_block: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub name: String,
    pub dims: Vec<LoopDim>,
    /// Instructions emitted per unrolled body element.
    pub insts_per_elem: usize,
    /// Instruction memory budget of the device.
    pub budget: usize,
}

impl LoopConfig {
    pub fn new(name: impl Into<String>, insts_per_elem: usize, budget: usize) -> Self {
        Self {
            name: name.into(),
            dims: Vec::new(),
            insts_per_elem,
            budget,
        }
    }

    /// Adds a loop; `block` is clamped to `[min_block, extent]`.
    pub fn with_dim(mut self, letter: char, extent: usize, block: usize, min_block: usize) -> Self {
        let extent = extent.max(1);
        let min_block = min_block.clamp(1, extent);
        self.dims.push(LoopDim {
            letter,
            extent,
            block: block.clamp(min_block, extent),
            min_block,
        });
        self
    }

    pub fn tile(&self) -> Tile {
        Tile::from_pairs(self.dims.iter().map(|d| (d.letter, d.block)))
    }

    /// Halves the largest block above its minimum; false when nothing is cuttable.
    pub fn cut(&mut self) -> bool {
        let candidate = self
            .dims
            .iter_mut()
            .enumerate()
            .filter(|(_, d)| d.block > d.min_block)
            .max_by_key(|(i, d)| (d.block, *i));
        match candidate {
            Some((_, d)) => {
                d.block = (d.block / 2).max(d.min_block);
                true
            }
            None => false,
        }
    }

    /// Upper bound on the number of successful cuts.
    pub fn max_cuts(&self) -> usize {
        self.dims
            .iter()
            .map(|d| log2_ceil(d.block) as usize)
            .sum()
    }
}

fn log2_ceil(v: usize) -> u32 {
    if v <= 1 {
        0
    } else {
        usize::BITS - (v - 1).leading_zeros()
    }
}

/// Unrolled loop nest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stmt {
    /// `(letter, trip count, unrolled block)`, outermost first.
    pub loops: Vec<(char, usize, usize)>,
    pub body_insts: usize,
    pub total_insts: usize,
}

impl Stmt {
    pub fn unroll(&self, letter: char) -> usize {
        self.loops
            .iter()
            .find(|(l, _, _)| *l == letter)
            .map_or(1, |(_, _, b)| *b)
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (depth, (letter, trips, block)) in self.loops.iter().enumerate() {
            writeln!(f, "{:indent$}for {letter} in 0..{trips} step {block}", "", indent = depth * 2)?;
        }
        write!(
            f,
            "{:indent$}body x{} insts",
            "",
            self.body_insts,
            indent = self.loops.len() * 2
        )
    }
}

/// Expands `config`; `None` when the unrolled code exceeds the budget.
pub fn try_build(config: &LoopConfig) -> Option<Stmt> {
    let unrolled: usize = config.dims.iter().map(|d| d.block).product();
    let body_insts = unrolled.checked_mul(config.insts_per_elem)?;
    let total_insts = body_insts.checked_add(config.dims.len() * LOOP_OVERHEAD)?;
    if total_insts > config.budget {
        return None;
    }
    let loops = config
        .dims
        .iter()
        .map(|d| (d.letter, d.extent.div_ceil(d.block), d.block))
        .collect();
    Some(Stmt {
        loops,
        body_insts,
        total_insts,
    })
}

/// Cut-and-retry until the loop nest fits.
pub fn build_with_cut(config: &mut LoopConfig) -> Result<Stmt> {
    let mut cuts = 0usize;
    loop {
        if let Some(stmt) = try_build(config) {
            if cuts > 0 {
                debug!(kernel = %config.name, cuts, tile = %config.tile(), "loop nest fits after cuts");
            }
            return Ok(stmt);
        }
        if !config.cut() {
            return Err(PrimError::RuntimeError(format!(
                "{}: minimal loop too large for budget {}",
                config.name, config.budget
            )));
        }
        cuts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fits_without_cut() {
        let mut cfg = LoopConfig::new("pool", 2, 1024)
            .with_dim('c', 64, 16, 1)
            .with_dim('w', 32, 4, 1);
        let stmt = build_with_cut(&mut cfg).unwrap();
        assert_eq!(stmt.loops, vec![('c', 4, 16), ('w', 8, 4)]);
        assert_eq!(stmt.body_insts, 128);
        assert_eq!(stmt.unroll('w'), 4);
        assert_eq!(stmt.unroll('h'), 1);
    }

    #[test]
    fn test_cut_halves_largest() {
        let mut cfg = LoopConfig::new("reorder", 1, 40)
            .with_dim('a', 64, 16, 1)
            .with_dim('b', 64, 8, 1);
        let stmt = build_with_cut(&mut cfg).unwrap();
        // 16x8 -> 8x8 -> 8x4 fits 32 + 6.
        assert_eq!(cfg.tile().to_string(), "a8b4");
        assert_eq!(stmt.total_insts, 38);
    }

    #[test]
    fn test_minimal_loop_too_large() {
        let mut cfg = LoopConfig::new("pool", 100, 50).with_dim('c', 16, 16, 8);
        let err = build_with_cut(&mut cfg).unwrap_err();
        assert!(matches!(err, PrimError::RuntimeError(_)));
        assert_eq!(cfg.dims[0].block, 8);
    }

    #[test]
    fn test_block_clamped() {
        let cfg = LoopConfig::new("x", 1, 10).with_dim('a', 4, 16, 8);
        assert_eq!(cfg.dims[0].block, 4);
        assert_eq!(cfg.dims[0].min_block, 4);
    }

    proptest! {
        #[test]
        fn prop_cut_retry_terminates_within_bound(
            blocks in proptest::collection::vec(1usize..=256, 1..4),
            budget in 1usize..4096,
            per_elem in 1usize..8,
        ) {
            let mut cfg = LoopConfig::new("p", per_elem, budget);
            for (i, b) in blocks.iter().enumerate() {
                cfg = cfg.with_dim((b'a' + i as u8) as char, 256, *b, 1);
            }
            let mut built = cfg.clone();
            let bound = cfg.max_cuts();
            let mut cuts = 0;
            let manual = loop {
                if let Some(stmt) = try_build(&cfg) {
                    break Some(stmt);
                }
                if !cfg.cut() {
                    break None;
                }
                cuts += 1;
                prop_assert!(cuts <= bound);
            };
            let result = build_with_cut(&mut built);
            prop_assert_eq!(result.is_ok(), manual.is_some());
            if let (Ok(stmt), Some(expected)) = (result, manual) {
                prop_assert_eq!(stmt, expected);
            }
            prop_assert_eq!(built, cfg);
        }
    }
}

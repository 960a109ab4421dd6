//! Execution argument keys.
//!
//! A key is a 32-bit integer: the low bits name the base argument, the high
//! bits name a category (scales, zero points, post-op `i`). Categories are
//! OR'd onto the base.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

const BASE_MASK: u32 = (1 << 11) - 1;
const POST_OP_SHIFT: u32 = 14;
const POST_OP_MAX: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgKey(pub u32);

impl ArgKey {
    pub const SRC: ArgKey = ArgKey(1);
    pub const SRC_1: ArgKey = ArgKey(2);
    pub const SRC_ITER: ArgKey = ArgKey(3);
    pub const DST: ArgKey = ArgKey(17);
    pub const DST_ITER: ArgKey = ArgKey(18);
    pub const WEIGHTS: ArgKey = ArgKey(33);
    pub const WEIGHTS_ITER: ArgKey = ArgKey(34);
    pub const BIAS: ArgKey = ArgKey(41);
    pub const MEAN: ArgKey = ArgKey(49);
    pub const VARIANCE: ArgKey = ArgKey(50);
    pub const WORKSPACE: ArgKey = ArgKey(64);
    pub const SCRATCHPAD: ArgKey = ArgKey(80);
    pub const DIFF_SRC: ArgKey = ArgKey(129);
    pub const DIFF_DST: ArgKey = ArgKey(145);
    pub const DIFF_WEIGHTS: ArgKey = ArgKey(161);
    pub const DIFF_BIAS: ArgKey = ArgKey(169);

    /// Stochastic rounding seed.
    pub const ROUNDING_SEED: ArgKey = ArgKey(1 << 11);
    /// Category bit: quantization scales of the base argument.
    pub const SCALES: ArgKey = ArgKey(1 << 12);
    /// Category bit: zero points of the base argument.
    pub const ZERO_POINTS: ArgKey = ArgKey(1 << 13);

    /// Category for post-op `index` (`MULTIPLE_POST_OP(i)`).
    pub fn post_op(index: usize) -> ArgKey {
        assert!(
            (index as u32) < POST_OP_MAX,
            "post-op index {index} out of range"
        );
        ArgKey((index as u32 + 1) << POST_OP_SHIFT)
    }

    pub fn scales(base: ArgKey) -> ArgKey {
        ArgKey::SCALES | base
    }

    pub fn zero_points(base: ArgKey) -> ArgKey {
        ArgKey::ZERO_POINTS | base
    }

    pub fn base(&self) -> ArgKey {
        ArgKey(self.0 & BASE_MASK)
    }

    pub fn is_scales(&self) -> bool {
        self.0 & ArgKey::SCALES.0 != 0
    }

    pub fn is_zero_points(&self) -> bool {
        self.0 & ArgKey::ZERO_POINTS.0 != 0
    }

    /// Post-op index encoded in the key, if any.
    pub fn post_op_index(&self) -> Option<usize> {
        let slot = self.0 >> POST_OP_SHIFT;
        (slot > 0).then(|| (slot - 1) as usize)
    }

    pub fn base_name(&self) -> &'static str {
        match self.base() {
            ArgKey::SRC => "src",
            ArgKey::SRC_1 => "src_1",
            ArgKey::SRC_ITER => "src_iter",
            ArgKey::DST => "dst",
            ArgKey::DST_ITER => "dst_iter",
            ArgKey::WEIGHTS => "weights",
            ArgKey::WEIGHTS_ITER => "weights_iter",
            ArgKey::BIAS => "bias",
            ArgKey::MEAN => "mean",
            ArgKey::VARIANCE => "variance",
            ArgKey::WORKSPACE => "workspace",
            ArgKey::SCRATCHPAD => "scratchpad",
            ArgKey::DIFF_SRC => "diff_src",
            ArgKey::DIFF_DST => "diff_dst",
            ArgKey::DIFF_WEIGHTS => "diff_weights",
            ArgKey::DIFF_BIAS => "diff_bias",
            _ if self.0 & ArgKey::ROUNDING_SEED.0 != 0 => "rounding_seed",
            _ => "unknown",
        }
    }
}

impl BitOr for ArgKey {
    type Output = ArgKey;

    fn bitor(self, rhs: ArgKey) -> ArgKey {
        ArgKey(self.0 | rhs.0)
    }
}

impl fmt::Display for ArgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(i) = self.post_op_index() {
            write!(f, "post_op{i}|")?;
        }
        if self.is_scales() {
            f.write_str("scales|")?;
        }
        if self.is_zero_points() {
            f.write_str("zero_points|")?;
        }
        f.write_str(self.base_name())
    }
}

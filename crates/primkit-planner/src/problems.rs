//! Random problem sets for benchmarking one kernel descriptor.
//!
//! Every generated problem is accepted by the descriptor: iteration dims are
//! multiples of the effective tile (and of any `%` requirement), bounds from
//! the requirements are honoured, and one dim per problem is pinned at its
//! smallest admissible value so tails and small shapes are represented.

use primkit_core::{PrimError, Result};
use primkit_kernels::{lcm, KernelDescriptor};
use primkit_layout::{
    DataType, HwDescriptor, LayoutTag, OpKind, OpParams, PoolAlg, Problem, TensorMeta,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

const MAX_ATTEMPTS: usize = 32;

/// One generated iteration axis.
#[derive(Debug, Clone, Copy)]
struct Axis {
    letter: char,
    name: &'static str,
    cap: usize,
}

const fn axis(letter: char, name: &'static str, cap: usize) -> Axis {
    Axis { letter, name, cap }
}

const MATMUL_AXES: [Axis; 3] = [axis('m', "m", 1024), axis('n', "n", 1024), axis('k', "k", 1024)];
const CONV_AXES: [Axis; 5] = [
    axis('n', "mb", 4),
    axis('o', "oc", 256),
    axis('i', "ic", 256),
    axis('h', "oh", 64),
    axis('w', "ow", 64),
];
const DW_CONV_AXES: [Axis; 4] = [
    axis('n', "mb", 4),
    axis('g', "g", 256),
    axis('h', "oh", 64),
    axis('w', "ow", 64),
];
const POOL_AXES: [Axis; 4] = [
    axis('n', "mb", 4),
    axis('c', "c", 256),
    axis('h', "oh", 64),
    axis('w', "ow", 64),
];
const REORDER_AXES: [Axis; 4] = [
    axis('a', "a", 64),
    axis('b', "b", 256),
    axis('c', "c", 64),
    axis('d', "d", 64),
];

/// Inputs of one bench: the descriptor under test and the problem-set shape.
#[derive(Debug, Clone)]
pub struct BenchInputParams {
    pub desc: KernelDescriptor,
    pub hw: HwDescriptor,
    pub nprbs: usize,
    pub seed: u64,
    /// Source data type; int8 sources get s8 weights and s32 outputs.
    pub dtype: DataType,
}

impl BenchInputParams {
    pub fn new(desc: KernelDescriptor, hw: HwDescriptor, nprbs: usize, seed: u64) -> Self {
        Self {
            desc,
            hw,
            nprbs,
            seed,
            dtype: DataType::F32,
        }
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    fn axes(&self) -> Result<&'static [Axis]> {
        Ok(match self.desc.op {
            OpKind::Matmul => &MATMUL_AXES,
            OpKind::Convolution if self.desc.is_dw => &DW_CONV_AXES,
            OpKind::Convolution => &CONV_AXES,
            OpKind::Pooling => &POOL_AXES,
            OpKind::Reorder => &REORDER_AXES,
            op => {
                return Err(PrimError::invalid(format!(
                    "no problem generator for {op}"
                )))
            }
        })
    }

    /// Deterministic for a given `(desc, hw, nprbs, seed, dtype)`.
    pub fn problems(&self) -> Result<Vec<Problem>> {
        let axes = self.axes()?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut out = Vec::with_capacity(self.nprbs);
        for i in 0..self.nprbs {
            let pinned = i % axes.len();
            let mut last_err = None;
            for _ in 0..MAX_ATTEMPTS {
                let dims: Vec<usize> = axes
                    .iter()
                    .enumerate()
                    .map(|(j, a)| self.pick(&mut rng, a, j == pinned))
                    .collect();
                match self.build(&dims).and_then(|p| self.desc.accepts(&p).map(|()| p)) {
                    Ok(p) => {
                        out.push(p);
                        last_err = None;
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            if let Some(e) = last_err {
                return Err(PrimError::invalid(format!(
                    "cannot generate a problem for {}: {e}",
                    self.desc
                )));
            }
        }
        debug!(kernel = %self.desc.kernel, count = out.len(), seed = self.seed, "problem set generated");
        Ok(out)
    }

    fn pick(&self, rng: &mut StdRng, a: &Axis, at_min: bool) -> usize {
        let reqs = &self.desc.reqs;
        if let Some(v) = reqs.fixed(a.name) {
            return v;
        }
        let tile = self.desc.effective_tile().get(a.letter, 1).max(1);
        let step = lcm(tile, reqs.divisor(a.name)).max(1);
        let mut lower = reqs.lower_bound(a.name).max(1);
        if self.desc.is_dw && a.name == "g" {
            lower = lower.max(2);
        }
        let lo = lower.div_ceil(step);
        let upper = reqs.upper_bound(a.name).map_or(a.cap, |u| u.min(a.cap));
        let hi = (upper / step).max(lo);
        let units = if at_min { lo } else { rng.gen_range(lo..=hi) };
        units * step
    }

    fn tag(tag: &LayoutTag, rank: usize) -> LayoutTag {
        if tag.is_any() {
            LayoutTag::plain(rank)
        } else {
            tag.clone()
        }
    }

    fn out_dtype(&self) -> DataType {
        if self.dtype.is_int8() {
            DataType::S32
        } else {
            self.dtype
        }
    }

    fn build(&self, d: &[usize]) -> Result<Problem> {
        let desc = &self.desc;
        let dt = self.dtype;
        let md = |shape: &[usize], dt: DataType, tag: &LayoutTag| {
            TensorMeta::new(shape, dt, Self::tag(tag, shape.len()))
        };
        let wei_dt = if dt.is_int8() { DataType::S8 } else { dt };
        let mut b = Problem::builder(desc.op, self.hw.clone()).prop(desc.prop);
        if desc.bias_dt != DataType::Undef {
            b = b.bias(desc.bias_dt);
        }
        b = match desc.op {
            OpKind::Matmul => {
                let (m, n, k) = (d[0], d[1], d[2]);
                b.src(md(&[m, k], dt, &LayoutTag::plain(2))?)
                    .wei(md(&[k, n], wei_dt, &LayoutTag::plain(2))?)
                    .dst(md(&[m, n], self.out_dtype(), &LayoutTag::plain(2))?)
            }
            OpKind::Convolution => {
                // 3x3 window, stride 1, padding 1: spatial dims are preserved.
                let (mb, g, oc, ic, h, w) = if desc.is_dw {
                    (d[0], d[1], 1, 1, d[2], d[3])
                } else {
                    (d[0], 1, d[1], d[2], d[3], d[4])
                };
                let wei_shape: Vec<usize> = if g > 1 {
                    vec![g, oc, ic, 3, 3]
                } else {
                    vec![oc, ic, 3, 3]
                };
                b.src(md(&[mb, g * ic, h, w], dt, &desc.src_tag)?)
                    .wei(md(&wei_shape, wei_dt, &desc.wei_tag)?)
                    .dst(md(&[mb, g * oc, h, w], self.out_dtype(), &desc.dst_tag)?)
                    .params(OpParams::Conv {
                        groups: g,
                        strides: vec![1, 1],
                        padding: vec![1, 1],
                        dilation: vec![0, 0],
                    })
            }
            OpKind::Pooling => {
                let shape = [d[0], d[1], d[2], d[3]];
                b.src(md(&shape, dt, &desc.src_tag)?)
                    .dst(md(&shape, dt, &desc.dst_tag)?)
                    .params(OpParams::Pool {
                        alg: PoolAlg::Max,
                        kernel: vec![3, 3],
                        strides: vec![1, 1],
                        padding: vec![1, 1],
                    })
            }
            OpKind::Reorder => b
                .src(md(d, dt, &desc.src_tag)?)
                .dst(md(d, dt, &desc.dst_tag)?),
            op => return Err(PrimError::invalid(format!("no problem generator for {op}"))),
        };
        b.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primkit_kernels::{jit_template, Predicate};

    fn xe_hpc() -> HwDescriptor {
        HwDescriptor::preset("xe_hpc").unwrap()
    }

    #[test]
    fn test_matmul_problems_respect_tiles_and_reqs() {
        let hw = xe_hpc();
        let mut desc = jit_template(OpKind::Matmul, &hw).unwrap();
        desc.reqs.push("k", Predicate::DivisibleBy(12));
        desc.reqs.push("m", Predicate::AtMost(256));
        let probs = BenchInputParams::new(desc.clone(), hw, 40, 3).problems().unwrap();
        assert_eq!(probs.len(), 40);
        let tile = desc.effective_tile();
        for p in &probs {
            assert!(desc.accepts(p).is_ok());
            let m = p.dim_value("m").unwrap();
            assert_eq!(m % tile.get('m', 1), 0);
            assert!(m <= 256);
            assert_eq!(p.dim_value("k").unwrap() % 12, 0);
        }
        // Problem 0 pins m at its minimum.
        assert_eq!(probs[0].dim_value("m").unwrap(), tile.get('m', 1));
    }

    #[test]
    fn test_same_seed_same_problems() {
        let hw = xe_hpc();
        let desc = jit_template(OpKind::Pooling, &hw).unwrap();
        let a = BenchInputParams::new(desc.clone(), hw.clone(), 10, 9).problems().unwrap();
        let b = BenchInputParams::new(desc.clone(), hw.clone(), 10, 9).problems().unwrap();
        let c = BenchInputParams::new(desc, hw, 10, 10).problems().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_depthwise_conv_problems() {
        let hw = xe_hpc();
        let desc = primkit_kernels::impls::conv::conv_jit_template(&hw, true);
        let probs = BenchInputParams::new(desc.clone(), hw, 8, 1).problems().unwrap();
        for p in &probs {
            assert!(p.is_depthwise());
            assert!(desc.accepts(p).is_ok());
        }
    }

    #[test]
    fn test_int8_matmul_outputs_s32() {
        let hw = xe_hpc();
        let desc = jit_template(OpKind::Matmul, &hw).unwrap();
        let probs = BenchInputParams::new(desc, hw, 4, 1)
            .with_dtype(DataType::S8)
            .problems()
            .unwrap();
        assert_eq!(probs[0].wei().unwrap().dtype(), DataType::S8);
        assert_eq!(probs[0].dst().dtype(), DataType::S32);
    }

    #[test]
    fn test_reorder_uses_descriptor_tags() {
        let hw = xe_hpc();
        let desc = jit_template(OpKind::Reorder, &hw).unwrap();
        let probs = BenchInputParams::new(desc, hw, 4, 5).problems().unwrap();
        assert_eq!(probs[0].dst().tag().as_str(), "acdb");
    }

    #[test]
    fn test_unsatisfiable_requirements() {
        let hw = xe_hpc();
        let mut desc = jit_template(OpKind::Matmul, &hw).unwrap();
        desc.reqs.push("m", Predicate::AtLeast(64));
        desc.reqs.push("m", Predicate::AtMost(32));
        assert!(BenchInputParams::new(desc, hw, 2, 0).problems().is_err());
    }

    #[test]
    fn test_ops_without_generator() {
        let desc = KernelDescriptor::new(OpKind::Shuffle, "shuffle_ref");
        assert!(BenchInputParams::new(desc, xe_hpc(), 1, 0).problems().is_err());
    }
}

//! Problem descriptors: the immutable dispatch key of a primitive.

use std::fmt;
use std::str::FromStr;

use primkit_core::{PrimError, Result};
use serde::{Deserialize, Serialize};

use crate::arg::ArgKey;
use crate::attr::{Attributes, EltwiseAlg};
use crate::dtype::DataType;
use crate::hw::HwDescriptor;
use crate::tensor::TensorMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Matmul,
    Convolution,
    Deconvolution,
    Eltwise,
    BatchNorm,
    LayerNorm,
    Pooling,
    Reorder,
    Rnn,
    Resampling,
    Shuffle,
}

impl OpKind {
    pub const ALL: [OpKind; 11] = [
        OpKind::Matmul,
        OpKind::Convolution,
        OpKind::Deconvolution,
        OpKind::Eltwise,
        OpKind::BatchNorm,
        OpKind::LayerNorm,
        OpKind::Pooling,
        OpKind::Reorder,
        OpKind::Rnn,
        OpKind::Resampling,
        OpKind::Shuffle,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Matmul => "matmul",
            OpKind::Convolution => "convolution",
            OpKind::Deconvolution => "deconvolution",
            OpKind::Eltwise => "eltwise",
            OpKind::BatchNorm => "batch_normalization",
            OpKind::LayerNorm => "layer_normalization",
            OpKind::Pooling => "pooling",
            OpKind::Reorder => "reorder",
            OpKind::Rnn => "rnn",
            OpKind::Resampling => "resampling",
            OpKind::Shuffle => "shuffle",
        }
    }

    /// Ops that carry a weights tensor.
    pub fn has_weights(&self) -> bool {
        matches!(
            self,
            OpKind::Matmul | OpKind::Convolution | OpKind::Deconvolution | OpKind::Rnn
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let alias = match s {
            "conv" => Some(OpKind::Convolution),
            "deconv" => Some(OpKind::Deconvolution),
            "bnorm" | "batch_norm" => Some(OpKind::BatchNorm),
            "lnorm" | "layer_norm" => Some(OpKind::LayerNorm),
            "pool" => Some(OpKind::Pooling),
            _ => None,
        };
        alias
            .or_else(|| OpKind::ALL.iter().copied().find(|op| op.name() == s))
            .ok_or_else(|| format!("unknown op '{s}'"))
    }
}

/// Propagation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prop {
    ForwardTraining,
    ForwardInference,
    BackwardData,
    BackwardWeights,
    Backward,
}

impl Prop {
    pub fn is_fwd(&self) -> bool {
        matches!(self, Prop::ForwardTraining | Prop::ForwardInference)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Prop::ForwardTraining => "fwd_training",
            Prop::ForwardInference => "fwd_inference",
            Prop::BackwardData => "bwd_data",
            Prop::BackwardWeights => "bwd_weights",
            Prop::Backward => "bwd",
        }
    }
}

impl fmt::Display for Prop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Prop {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        [
            Prop::ForwardTraining,
            Prop::ForwardInference,
            Prop::BackwardData,
            Prop::BackwardWeights,
            Prop::Backward,
        ]
        .into_iter()
        .find(|p| p.name() == s)
        .ok_or_else(|| format!("unknown prop kind '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolAlg {
    Max,
    AvgIncludePadding,
    AvgExcludePadding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingAlg {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RnnCell {
    Vanilla,
    Lstm,
    Gru,
}

impl RnnCell {
    pub fn gates(&self) -> usize {
        match self {
            RnnCell::Vanilla => 1,
            RnnCell::Lstm => 4,
            RnnCell::Gru => 3,
        }
    }
}

/// Op-specific parameters that are not captured by tensor shapes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpParams {
    #[default]
    None,
    Conv {
        groups: usize,
        strides: Vec<usize>,
        padding: Vec<usize>,
        /// oneDNN-style dilation: 0 means dense.
        dilation: Vec<usize>,
    },
    Eltwise {
        alg: EltwiseAlg,
        alpha: f32,
        beta: f32,
    },
    Pool {
        alg: PoolAlg,
        kernel: Vec<usize>,
        strides: Vec<usize>,
        padding: Vec<usize>,
    },
    Norm {
        epsilon: f32,
        use_scale: bool,
        use_shift: bool,
        global_stats: bool,
    },
    Rnn {
        cell: RnnCell,
        layers: usize,
        directions: usize,
    },
    Resampling {
        alg: ResamplingAlg,
    },
    Shuffle {
        axis: usize,
        group: usize,
    },
}

/// One axis of a problem's iteration space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterDim {
    /// Tile letter of the axis.
    pub letter: char,
    /// Name used by requirement predicates.
    pub name: &'static str,
    pub size: usize,
}

/// Immutable operator invocation signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    op: OpKind,
    prop: Prop,
    src: TensorMeta,
    wei: Option<TensorMeta>,
    dst: TensorMeta,
    bias_dt: DataType,
    attr: Attributes,
    params: OpParams,
    hw: HwDescriptor,
}

impl Problem {
    pub fn builder(op: OpKind, hw: HwDescriptor) -> ProblemBuilder {
        ProblemBuilder::new(op, hw)
    }

    pub fn op(&self) -> OpKind {
        self.op
    }

    pub fn prop(&self) -> Prop {
        self.prop
    }

    pub fn src(&self) -> &TensorMeta {
        &self.src
    }

    pub fn wei(&self) -> Option<&TensorMeta> {
        self.wei.as_ref()
    }

    pub fn dst(&self) -> &TensorMeta {
        &self.dst
    }

    pub fn bias_dt(&self) -> DataType {
        self.bias_dt
    }

    pub fn with_bias(&self) -> bool {
        self.bias_dt != DataType::Undef
    }

    pub fn attr(&self) -> &Attributes {
        &self.attr
    }

    pub fn params(&self) -> &OpParams {
        &self.params
    }

    pub fn hw(&self) -> &HwDescriptor {
        &self.hw
    }

    /// Tensor bound to a base argument key.
    pub fn arg_md(&self, arg: ArgKey) -> Option<&TensorMeta> {
        match arg.base() {
            ArgKey::SRC | ArgKey::DIFF_SRC => Some(&self.src),
            ArgKey::DST | ArgKey::DIFF_DST => Some(&self.dst),
            ArgKey::WEIGHTS | ArgKey::DIFF_WEIGHTS => self.wei.as_ref(),
            _ => None,
        }
    }

    /// Copy with a different set of attributes, revalidated.
    pub fn with_attr(&self, attr: Attributes) -> Result<Problem> {
        attr.validate(|a| self.arg_md(a), &self.dst)?;
        Ok(Problem {
            attr,
            ..self.clone()
        })
    }

    pub fn is_depthwise(&self) -> bool {
        match (&self.params, self.op) {
            (OpParams::Conv { groups, .. }, OpKind::Convolution | OpKind::Deconvolution) => {
                *groups > 1 && self.ic() == 1 && self.oc() == 1
            }
            _ => false,
        }
    }

    fn conv_groups(&self) -> usize {
        match &self.params {
            OpParams::Conv { groups, .. } => (*groups).max(1),
            _ => 1,
        }
    }

    fn spatial_rank(&self) -> usize {
        self.src.rank().saturating_sub(2)
    }

    /// Minibatch.
    pub fn mb(&self) -> usize {
        match self.op {
            OpKind::Matmul => self.batch(),
            _ => self.src.dim(0),
        }
    }

    fn batch(&self) -> usize {
        let r = self.dst.rank();
        self.dst.shape()[..r.saturating_sub(2)].iter().product()
    }

    /// Input channels (per group for convolutions, `K` for matmul).
    pub fn ic(&self) -> usize {
        match self.op {
            OpKind::Matmul => self.src.dim(self.src.rank() - 1),
            OpKind::Convolution | OpKind::Deconvolution => self.src.dim(1) / self.conv_groups(),
            _ => self.src.dim(1.min(self.src.rank() - 1)),
        }
    }

    /// Output channels (per group for convolutions, `N` for matmul).
    pub fn oc(&self) -> usize {
        match self.op {
            OpKind::Matmul => self.dst.dim(self.dst.rank() - 1),
            OpKind::Convolution | OpKind::Deconvolution => self.dst.dim(1) / self.conv_groups(),
            _ => self.dst.dim(1.min(self.dst.rank() - 1)),
        }
    }

    /// Iteration space the kernel tiles over.
    pub fn iter_dims(&self) -> Vec<IterDim> {
        let d = |letter, name, size| IterDim { letter, name, size };
        match self.op {
            OpKind::Matmul => {
                let r = self.dst.rank();
                vec![
                    d('b', "b", self.batch()),
                    d('m', "m", self.dst.dim(r - 2)),
                    d('n', "n", self.dst.dim(r - 1)),
                    d('k', "k", self.src.dim(self.src.rank() - 1)),
                ]
            }
            OpKind::Convolution | OpKind::Deconvolution => {
                let mut dims = vec![
                    d('n', "mb", self.src.dim(0)),
                    d('g', "g", self.conv_groups()),
                    d('o', "oc", self.oc()),
                    d('i', "ic", self.ic()),
                ];
                let names = [("od", 'd'), ("oh", 'h'), ("ow", 'w')];
                let sr = self.spatial_rank();
                for (k, (name, letter)) in names[3 - sr.min(3)..].iter().enumerate() {
                    dims.push(d(*letter, name, self.dst.dim(2 + k)));
                }
                dims
            }
            OpKind::Pooling => {
                let mut dims = vec![d('n', "mb", self.src.dim(0)), d('c', "c", self.src.dim(1))];
                let names = [("od", 'd'), ("oh", 'h'), ("ow", 'w')];
                let sr = self.spatial_rank();
                for (k, (name, letter)) in names[3 - sr.min(3)..].iter().enumerate() {
                    dims.push(d(*letter, name, self.dst.dim(2 + k)));
                }
                dims
            }
            _ => {
                const NAMES: [&str; 12] = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l"];
                (0..self.dst.rank())
                    .map(|axis| d((b'a' + axis as u8) as char, NAMES[axis], self.dst.dim(axis)))
                    .collect()
            }
        }
    }

    /// Named dimension lookup used by requirement predicates.
    pub fn dim_value(&self, name: &str) -> Option<usize> {
        if let Some(dim) = self
            .iter_dims()
            .into_iter()
            .find(|d| d.name == name || (name.len() == 1 && name.starts_with(d.letter)))
        {
            return Some(dim.size);
        }
        match name {
            "mb" => Some(self.mb()),
            "ic" => Some(self.ic()),
            "oc" => Some(self.oc()),
            "kd" | "kh" | "kw" => {
                let offset = ["kd", "kh", "kw"].iter().position(|n| *n == name)?;
                let sr = self.spatial_rank();
                let first = 3 - sr.min(3);
                if offset < first {
                    return Some(1);
                }
                match &self.params {
                    OpParams::Pool { kernel, .. } => kernel.get(offset - first).copied(),
                    OpParams::Conv { .. } => {
                        let wei = self.wei.as_ref()?;
                        wei.shape().get(wei.rank() - sr + offset - first).copied()
                    }
                    _ => Some(1),
                }
            }
            _ => None,
        }
    }

    /// Arithmetic operations of one execution (memory-bound ops count
    /// one op per dst element).
    pub fn flops(&self) -> f64 {
        match self.op {
            OpKind::Matmul => {
                let dims = self.iter_dims();
                2.0 * dims.iter().map(|d| d.size as f64).product::<f64>()
            }
            OpKind::Convolution | OpKind::Deconvolution => {
                let spatial: f64 = self
                    .iter_dims()
                    .iter()
                    .map(|d| d.size as f64)
                    .product();
                let kernel: f64 = ["kd", "kh", "kw"]
                    .iter()
                    .filter_map(|n| self.dim_value(n))
                    .map(|v| v as f64)
                    .product();
                2.0 * spatial * kernel
            }
            OpKind::Pooling => {
                let kernel: f64 = ["kd", "kh", "kw"]
                    .iter()
                    .filter_map(|n| self.dim_value(n))
                    .map(|v| v as f64)
                    .product();
                self.dst.nelems() as f64 * kernel
            }
            _ => self.dst.nelems() as f64,
        }
    }

    /// Bytes moved by one execution (inputs + outputs).
    pub fn bytes(&self) -> usize {
        self.src.size_bytes()
            + self.wei.as_ref().map_or(0, |w| w.size_bytes())
            + self.dst.size_bytes()
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} src={}:{}:{:?}",
            self.op,
            self.prop,
            self.src.dtype(),
            self.src.tag(),
            self.src.shape()
        )?;
        if let Some(w) = &self.wei {
            write!(f, " wei={}:{}:{:?}", w.dtype(), w.tag(), w.shape())?;
        }
        write!(
            f,
            " dst={}:{}:{:?}",
            self.dst.dtype(),
            self.dst.tag(),
            self.dst.shape()
        )
    }
}

/// Builder for [`Problem`]; `build` validates cross-tensor consistency.
#[derive(Debug, Clone)]
pub struct ProblemBuilder {
    op: OpKind,
    prop: Prop,
    src: Option<TensorMeta>,
    wei: Option<TensorMeta>,
    dst: Option<TensorMeta>,
    bias_dt: DataType,
    attr: Attributes,
    params: OpParams,
    hw: HwDescriptor,
}

impl ProblemBuilder {
    pub fn new(op: OpKind, hw: HwDescriptor) -> Self {
        Self {
            op,
            prop: Prop::ForwardInference,
            src: None,
            wei: None,
            dst: None,
            bias_dt: DataType::Undef,
            attr: Attributes::default(),
            params: OpParams::None,
            hw,
        }
    }

    pub fn prop(mut self, prop: Prop) -> Self {
        self.prop = prop;
        self
    }

    pub fn src(mut self, md: TensorMeta) -> Self {
        self.src = Some(md);
        self
    }

    pub fn wei(mut self, md: TensorMeta) -> Self {
        self.wei = Some(md);
        self
    }

    pub fn dst(mut self, md: TensorMeta) -> Self {
        self.dst = Some(md);
        self
    }

    pub fn bias(mut self, dt: DataType) -> Self {
        self.bias_dt = dt;
        self
    }

    pub fn attr(mut self, attr: Attributes) -> Self {
        self.attr = attr;
        self
    }

    pub fn params(mut self, params: OpParams) -> Self {
        self.params = params;
        self
    }

    pub fn build(self) -> Result<Problem> {
        let src = self
            .src
            .ok_or_else(|| PrimError::invalid(format!("{} requires src", self.op)))?;
        let dst = self
            .dst
            .ok_or_else(|| PrimError::invalid(format!("{} requires dst", self.op)))?;
        if self.op.has_weights() && self.wei.is_none() {
            return Err(PrimError::invalid(format!("{} requires weights", self.op)));
        }
        if !self.op.has_weights() && self.wei.is_some() {
            return Err(PrimError::invalid(format!("{} takes no weights", self.op)));
        }
        let problem = Problem {
            op: self.op,
            prop: self.prop,
            src,
            wei: self.wei,
            dst,
            bias_dt: self.bias_dt,
            attr: self.attr,
            params: self.params,
            hw: self.hw,
        };
        check_shapes(&problem)?;
        problem
            .attr
            .validate(|a| problem.arg_md(a), &problem.dst)?;
        Ok(problem)
    }
}

fn inconsistent(op: OpKind, what: impl fmt::Display) -> PrimError {
    PrimError::invalid(format!("{op}: {what}"))
}

fn check_shapes(p: &Problem) -> Result<()> {
    let (src, dst) = (&p.src, &p.dst);
    match p.op {
        OpKind::Matmul => {
            let wei = p.wei.as_ref().ok_or_else(|| inconsistent(p.op, "missing weights"))?;
            let r = src.rank();
            if r < 2 || wei.rank() != r || dst.rank() != r {
                return Err(inconsistent(p.op, "src/wei/dst ranks differ or are < 2"));
            }
            let (m, k) = (src.dim(r - 2), src.dim(r - 1));
            let (k2, n) = (wei.dim(r - 2), wei.dim(r - 1));
            if k != k2 || dst.dim(r - 2) != m || dst.dim(r - 1) != n {
                return Err(inconsistent(
                    p.op,
                    format!("{:?} x {:?} -> {:?}", src.shape(), wei.shape(), dst.shape()),
                ));
            }
            for axis in 0..r - 2 {
                let b = dst.dim(axis);
                for t in [src, wei] {
                    if t.dim(axis) != b && t.dim(axis) != 1 {
                        return Err(inconsistent(p.op, "batch dims are not broadcastable"));
                    }
                }
            }
        }
        OpKind::Convolution | OpKind::Deconvolution => {
            let wei = p.wei.as_ref().ok_or_else(|| inconsistent(p.op, "missing weights"))?;
            let OpParams::Conv {
                groups,
                strides,
                padding,
                dilation,
            } = &p.params
            else {
                return Err(inconsistent(p.op, "missing convolution parameters"));
            };
            let groups = (*groups).max(1);
            let r = src.rank();
            if !(3..=5).contains(&r) || dst.rank() != r {
                return Err(inconsistent(p.op, "src/dst rank must be 3..=5 and equal"));
            }
            let sr = r - 2;
            let grouped = usize::from(groups > 1);
            if wei.rank() != r + grouped {
                return Err(inconsistent(p.op, "weights rank does not match groups"));
            }
            if src.dim(0) != dst.dim(0) {
                return Err(inconsistent(p.op, "minibatch differs"));
            }
            if !src.dim(1).is_multiple_of(groups) || !dst.dim(1).is_multiple_of(groups) {
                return Err(inconsistent(p.op, "channels not divisible by groups"));
            }
            let (oc_w, ic_w) = (wei.dim(grouped), wei.dim(grouped + 1));
            let (ic, oc) = if p.op == OpKind::Convolution {
                (src.dim(1) / groups, dst.dim(1) / groups)
            } else {
                (dst.dim(1) / groups, src.dim(1) / groups)
            };
            if oc_w != oc || ic_w != ic || (grouped == 1 && wei.dim(0) != groups) {
                return Err(inconsistent(p.op, "weights channels mismatch"));
            }
            if strides.len() != sr || padding.len() != sr || dilation.len() != sr {
                return Err(inconsistent(p.op, "strides/padding/dilation rank mismatch"));
            }
            for i in 0..sr {
                let k = wei.dim(grouped + 2 + i);
                let ext = (k - 1) * (dilation[i] + 1) + 1;
                let (input, output) = if p.op == OpKind::Convolution {
                    (src.dim(2 + i), dst.dim(2 + i))
                } else {
                    (dst.dim(2 + i), src.dim(2 + i))
                };
                let padded = input + 2 * padding[i];
                if strides[i] == 0 || padded < ext || (padded - ext) / strides[i] + 1 != output {
                    return Err(inconsistent(p.op, format!("spatial dim {i} mismatch")));
                }
            }
        }
        OpKind::Pooling => {
            let OpParams::Pool {
                kernel,
                strides,
                padding,
                ..
            } = &p.params
            else {
                return Err(inconsistent(p.op, "missing pooling parameters"));
            };
            let r = src.rank();
            if !(3..=5).contains(&r) || dst.rank() != r {
                return Err(inconsistent(p.op, "src/dst rank must be 3..=5 and equal"));
            }
            if src.dim(0) != dst.dim(0) || src.dim(1) != dst.dim(1) {
                return Err(inconsistent(p.op, "minibatch or channels differ"));
            }
            let sr = r - 2;
            if kernel.len() != sr || strides.len() != sr || padding.len() != sr {
                return Err(inconsistent(p.op, "kernel/strides/padding rank mismatch"));
            }
            for i in 0..sr {
                let padded = src.dim(2 + i) + 2 * padding[i];
                if strides[i] == 0
                    || kernel[i] == 0
                    || padded < kernel[i]
                    || (padded - kernel[i]) / strides[i] + 1 != dst.dim(2 + i)
                {
                    return Err(inconsistent(p.op, format!("spatial dim {i} mismatch")));
                }
            }
        }
        OpKind::Resampling => {
            let r = src.rank();
            if !(3..=5).contains(&r) || dst.rank() != r {
                return Err(inconsistent(p.op, "src/dst rank must be 3..=5 and equal"));
            }
            if src.dim(0) != dst.dim(0) || src.dim(1) != dst.dim(1) {
                return Err(inconsistent(p.op, "minibatch or channels differ"));
            }
        }
        OpKind::Rnn => {
            let wei = p.wei.as_ref().ok_or_else(|| inconsistent(p.op, "missing weights"))?;
            let OpParams::Rnn {
                cell,
                layers,
                directions,
            } = &p.params
            else {
                return Err(inconsistent(p.op, "missing rnn parameters"));
            };
            // src: [T, N, C], wei: [L, D, C, G, C], dst: [T, N, D*C]
            if src.rank() != 3 || dst.rank() != 3 || wei.rank() != 5 {
                return Err(inconsistent(p.op, "expected src/dst rank 3 and weights rank 5"));
            }
            if src.dim(0) != dst.dim(0) || src.dim(1) != dst.dim(1) {
                return Err(inconsistent(p.op, "time steps or minibatch differ"));
            }
            if wei.dim(0) != *layers
                || wei.dim(1) != *directions
                || wei.dim(3) != cell.gates()
                || dst.dim(2) != wei.dim(4) * directions
            {
                return Err(inconsistent(p.op, "weights do not match cell configuration"));
            }
        }
        OpKind::Shuffle => {
            if src.shape() != dst.shape() {
                return Err(inconsistent(p.op, "src and dst shapes differ"));
            }
            let OpParams::Shuffle { axis, group } = &p.params else {
                return Err(inconsistent(p.op, "missing shuffle parameters"));
            };
            if *axis >= src.rank() || *group == 0 || !src.dim(*axis).is_multiple_of(*group) {
                return Err(inconsistent(p.op, "group does not divide the shuffled axis"));
            }
        }
        OpKind::Eltwise | OpKind::BatchNorm | OpKind::LayerNorm | OpKind::Reorder => {
            if src.shape() != dst.shape() {
                return Err(inconsistent(p.op, "src and dst shapes differ"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw() -> HwDescriptor {
        HwDescriptor::preset("xe_hpc").unwrap()
    }

    fn f32md(shape: &[usize]) -> TensorMeta {
        TensorMeta::plain(shape, DataType::F32).unwrap()
    }

    #[test]
    fn test_matmul_dims() {
        let p = Problem::builder(OpKind::Matmul, hw())
            .src(f32md(&[2, 64, 32]))
            .wei(f32md(&[1, 32, 48]))
            .dst(f32md(&[2, 64, 48]))
            .build()
            .unwrap();
        let dims: Vec<_> = p.iter_dims().iter().map(|d| (d.letter, d.size)).collect();
        assert_eq!(dims, vec![('b', 2), ('m', 64), ('n', 48), ('k', 32)]);
        assert_eq!(p.dim_value("k"), Some(32));
        assert_eq!(p.ic(), 32);
        assert_eq!(p.oc(), 48);
        assert_eq!(p.flops(), 2.0 * 2.0 * 64.0 * 48.0 * 32.0);
    }

    #[test]
    fn test_matmul_k_mismatch() {
        let err = Problem::builder(OpKind::Matmul, hw())
            .src(f32md(&[64, 32]))
            .wei(f32md(&[16, 48]))
            .dst(f32md(&[64, 48]))
            .build()
            .unwrap_err();
        assert!(matches!(err, PrimError::InvalidArguments(_)));
    }

    #[test]
    fn test_conv_dims() {
        let p = Problem::builder(OpKind::Convolution, hw())
            .src(f32md(&[8, 32, 14, 14]))
            .wei(f32md(&[64, 32, 3, 3]))
            .dst(f32md(&[8, 64, 14, 14]))
            .params(OpParams::Conv {
                groups: 1,
                strides: vec![1, 1],
                padding: vec![1, 1],
                dilation: vec![0, 0],
            })
            .build()
            .unwrap();
        assert_eq!(p.dim_value("mb"), Some(8));
        assert_eq!(p.dim_value("ic"), Some(32));
        assert_eq!(p.dim_value("oc"), Some(64));
        assert_eq!(p.dim_value("oh"), Some(14));
        assert_eq!(p.dim_value("kh"), Some(3));
        assert_eq!(p.dim_value("kd"), Some(1));
        assert!(!p.is_depthwise());
    }

    #[test]
    fn test_conv_bad_output_size() {
        let err = Problem::builder(OpKind::Convolution, hw())
            .src(f32md(&[8, 32, 14, 14]))
            .wei(f32md(&[64, 32, 3, 3]))
            .dst(f32md(&[8, 64, 13, 14]))
            .params(OpParams::Conv {
                groups: 1,
                strides: vec![1, 1],
                padding: vec![1, 1],
                dilation: vec![0, 0],
            })
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn test_depthwise() {
        let p = Problem::builder(OpKind::Convolution, hw())
            .src(f32md(&[1, 16, 8, 8]))
            .wei(f32md(&[16, 1, 1, 3, 3]))
            .dst(f32md(&[1, 16, 8, 8]))
            .params(OpParams::Conv {
                groups: 16,
                strides: vec![1, 1],
                padding: vec![1, 1],
                dilation: vec![0, 0],
            })
            .build()
            .unwrap();
        assert!(p.is_depthwise());
    }

    #[test]
    fn test_eltwise_requires_same_shape() {
        assert!(Problem::builder(OpKind::Eltwise, hw())
            .src(f32md(&[4, 4]))
            .dst(f32md(&[4, 5]))
            .build()
            .is_err());
        assert!(Problem::builder(OpKind::Eltwise, hw())
            .src(f32md(&[4, 4]))
            .wei(f32md(&[4, 4]))
            .dst(f32md(&[4, 4]))
            .build()
            .is_err());
    }

    #[test]
    fn test_op_names_parse() {
        for op in OpKind::ALL {
            assert_eq!(op.name().parse::<OpKind>().unwrap(), op);
        }
        assert_eq!("conv".parse::<OpKind>().unwrap(), OpKind::Convolution);
        assert!("gemm2".parse::<OpKind>().is_err());
    }
}

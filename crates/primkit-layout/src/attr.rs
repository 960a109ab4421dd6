//! Primitive attributes: quantization scales, zero points, post-ops and
//! rounding modes.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use primkit_core::{PrimError, Result};
use serde::{Deserialize, Serialize};

use crate::arg::ArgKey;
use crate::dtype::DataType;
use crate::tensor::TensorMeta;

/// Scales attached to one argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleEntry {
    /// Bitmask over tensor axes; 0 means a single common scale.
    pub mask: u32,
    /// Group sizes per axis, for grouped (block-wise) quantization.
    pub group_dims: Option<Vec<usize>>,
    pub dtype: DataType,
}

impl ScaleEntry {
    pub fn common() -> Self {
        Self {
            mask: 0,
            group_dims: None,
            dtype: DataType::F32,
        }
    }

    pub fn per_axis(mask: u32) -> Self {
        Self {
            mask,
            ..Self::common()
        }
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_groups(mut self, group_dims: Vec<usize>) -> Self {
        self.group_dims = Some(group_dims);
        self
    }

    pub fn is_common(&self) -> bool {
        self.mask == 0
    }

    pub fn has_default_dtype(&self) -> bool {
        self.dtype == DataType::F32
    }

    pub fn has_default_groups(&self) -> bool {
        self.group_dims
            .as_ref()
            .is_none_or(|g| g.iter().all(|&d| d <= 1))
    }

    /// Group size along `axis` (1 when ungrouped).
    pub fn group(&self, axis: usize) -> usize {
        self.group_dims
            .as_ref()
            .and_then(|g| g.get(axis).copied())
            .unwrap_or(1)
            .max(1)
    }

    /// Number of scale values for `md`: masked dims divided by groups.
    pub fn count(&self, md: &TensorMeta) -> usize {
        (0..md.rank())
            .filter(|axis| self.mask & (1 << axis) != 0)
            .map(|axis| md.dim(axis).div_ceil(self.group(axis)))
            .product()
    }
}

/// Scales keyed by base argument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scales {
    entries: BTreeMap<ArgKey, ScaleEntry>,
}

impl Scales {
    pub fn set(&mut self, arg: ArgKey, entry: ScaleEntry) {
        self.entries.insert(arg.base(), entry);
    }

    pub fn get(&self, arg: ArgKey) -> Option<&ScaleEntry> {
        self.entries.get(&arg.base())
    }

    pub fn has(&self, arg: ArgKey) -> bool {
        self.entries.contains_key(&arg.base())
    }

    pub fn is_default(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArgKey, &ScaleEntry)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }
}

/// Zero points attached to one argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZeroPointEntry {
    pub mask: u32,
    pub dtype: DataType,
    /// Supplied at execute time rather than baked into the kernel.
    pub runtime: bool,
}

impl ZeroPointEntry {
    pub fn common(dtype: DataType) -> Self {
        Self {
            mask: 0,
            dtype,
            runtime: true,
        }
    }

    pub fn per_axis(mask: u32, dtype: DataType) -> Self {
        Self {
            mask,
            dtype,
            runtime: true,
        }
    }

    pub fn compile_time(mut self) -> Self {
        self.runtime = false;
        self
    }

    pub fn is_common(&self) -> bool {
        self.mask == 0
    }
}

/// Zero points keyed by base argument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZeroPoints {
    entries: BTreeMap<ArgKey, ZeroPointEntry>,
}

impl ZeroPoints {
    pub fn set(&mut self, arg: ArgKey, entry: ZeroPointEntry) {
        self.entries.insert(arg.base(), entry);
    }

    pub fn get(&self, arg: ArgKey) -> Option<&ZeroPointEntry> {
        self.entries.get(&arg.base())
    }

    pub fn has(&self, arg: ArgKey) -> bool {
        self.entries.contains_key(&arg.base())
    }

    pub fn is_default(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArgKey, &ZeroPointEntry)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EltwiseAlg {
    Relu,
    Gelu,
    Tanh,
    Sigmoid,
    Swish,
    Linear,
    Clip,
    Exp,
    Sqrt,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryAlg {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

/// One entry of the post-op chain fused after the main computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostOp {
    Eltwise {
        alg: EltwiseAlg,
        alpha: f32,
        beta: f32,
    },
    Sum {
        scale: f32,
        zero_point: i32,
        dtype: DataType,
    },
    Binary {
        alg: BinaryAlg,
        rhs: TensorMeta,
    },
    Prelu {
        mask: u32,
    },
    /// Fused depthwise convolution; only a few kernels can absorb it.
    Depthwise {
        kernel: usize,
        stride: usize,
        dtype: DataType,
    },
}

impl PostOp {
    pub fn kind(&self) -> &'static str {
        match self {
            PostOp::Eltwise { .. } => "eltwise",
            PostOp::Sum { .. } => "sum",
            PostOp::Binary { .. } => "binary",
            PostOp::Prelu { .. } => "prelu",
            PostOp::Depthwise { .. } => "depthwise",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    #[default]
    Environment,
    Stochastic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScratchpadMode {
    /// The library allocates scratchpad memory per execution.
    #[default]
    Library,
    /// The caller passes scratchpad memory as an argument.
    User,
}

/// Optional post-processing directives attached to a primitive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    pub scales: Scales,
    pub zero_points: ZeroPoints,
    pub post_ops: Vec<PostOp>,
    pub rounding: BTreeMap<ArgKey, RoundingMode>,
    pub scratchpad_mode: ScratchpadMode,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scales(mut self, arg: ArgKey, entry: ScaleEntry) -> Self {
        self.scales.set(arg, entry);
        self
    }

    pub fn with_zero_points(mut self, arg: ArgKey, entry: ZeroPointEntry) -> Self {
        self.zero_points.set(arg, entry);
        self
    }

    pub fn with_post_op(mut self, op: PostOp) -> Self {
        self.post_ops.push(op);
        self
    }

    pub fn with_rounding(mut self, arg: ArgKey, mode: RoundingMode) -> Self {
        self.rounding.insert(arg.base(), mode);
        self
    }

    pub fn is_default(&self) -> bool {
        self.scales.is_default()
            && self.zero_points.is_default()
            && self.post_ops.is_empty()
            && !self.has_stochastic_rounding()
    }

    pub fn has_stochastic_rounding(&self) -> bool {
        self.rounding
            .values()
            .any(|m| *m == RoundingMode::Stochastic)
    }

    /// Checks masks against the tensors they index.
    ///
    /// `md_of` resolves a base argument to its tensor, `None` when the
    /// primitive has no such argument.
    pub fn validate<'a, F>(&self, md_of: F, dst: &TensorMeta) -> Result<()>
    where
        F: Fn(ArgKey) -> Option<&'a TensorMeta>,
    {
        for (arg, entry) in self.scales.iter() {
            let md = md_of(arg)
                .ok_or_else(|| PrimError::invalid(format!("scales for absent argument {arg}")))?;
            check_mask(entry.mask, md, "scales", arg)?;
            if let Some(groups) = &entry.group_dims {
                if groups.len() != md.rank() {
                    return Err(PrimError::invalid(format!(
                        "scale groups {groups:?} do not match rank of {arg}"
                    )));
                }
                for (axis, &g) in groups.iter().enumerate() {
                    if g > 1 && !md.dim(axis).is_multiple_of(g) {
                        return Err(PrimError::invalid(format!(
                            "scale group {g} does not divide dim {axis} of {arg}"
                        )));
                    }
                }
            }
        }
        for (arg, entry) in self.zero_points.iter() {
            let md = md_of(arg).ok_or_else(|| {
                PrimError::invalid(format!("zero points for absent argument {arg}"))
            })?;
            check_mask(entry.mask, md, "zero points", arg)?;
        }
        for (i, op) in self.post_ops.iter().enumerate() {
            match op {
                PostOp::Binary { rhs, .. } => {
                    if rhs.rank() != dst.rank() {
                        return Err(PrimError::invalid(format!(
                            "binary post-op {i} rank {} != dst rank {}",
                            rhs.rank(),
                            dst.rank()
                        )));
                    }
                    for axis in 0..dst.rank() {
                        let d = rhs.dim(axis);
                        if d != 1 && d != dst.dim(axis) {
                            return Err(PrimError::invalid(format!(
                                "binary post-op {i} dim {axis} is not broadcastable"
                            )));
                        }
                    }
                }
                PostOp::Prelu { mask } => check_mask(*mask, dst, "prelu", ArgKey::DST)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Short stable digest of everything that changes kernel selection.
    ///
    /// Mask values and dtypes are kept, runtime values (alpha, scale
    /// magnitudes) are dropped.
    pub fn digest(&self) -> String {
        let mut out = String::new();
        for (arg, e) in self.scales.iter() {
            let _ = write!(out, "sc:{}:{}:{}", arg.base_name(), e.mask, e.dtype);
            if !e.has_default_groups() {
                let _ = write!(out, ":g{:?}", e.group_dims.as_deref().unwrap_or(&[]));
            }
            out.push(';');
        }
        for (arg, e) in self.zero_points.iter() {
            let _ = write!(
                out,
                "zp:{}:{}:{}:{};",
                arg.base_name(),
                e.mask,
                e.dtype,
                if e.runtime { "rt" } else { "ct" }
            );
        }
        for op in &self.post_ops {
            match op {
                PostOp::Eltwise { alg, .. } => {
                    let _ = write!(out, "po:eltwise:{alg:?};");
                }
                PostOp::Sum { dtype, .. } => {
                    let _ = write!(out, "po:sum:{dtype};");
                }
                PostOp::Binary { alg, rhs } => {
                    let _ = write!(out, "po:binary:{alg:?}:{}:{};", rhs.dtype(), rhs.tag());
                }
                PostOp::Prelu { mask } => {
                    let _ = write!(out, "po:prelu:{mask};");
                }
                PostOp::Depthwise { kernel, stride, dtype } => {
                    let _ = write!(out, "po:dw:{kernel}:{stride}:{dtype};");
                }
            }
        }
        if self.has_stochastic_rounding() {
            out.push_str("rnd:stochastic;");
        }
        out
    }
}

fn check_mask(mask: u32, md: &TensorMeta, what: &str, arg: ArgKey) -> Result<()> {
    if mask >> md.rank() != 0 {
        return Err(PrimError::invalid(format!(
            "{what} mask {mask:#b} exceeds rank {} of {arg}",
            md.rank()
        )));
    }
    Ok(())
}

/// Shape of the PReLU weights tensor: dst dims where `mask` is set, 1 elsewhere.
pub fn prelu_weights_dims(mask: u32, dst: &TensorMeta) -> Vec<usize> {
    (0..dst.rank())
        .map(|axis| {
            if mask & (1 << axis) != 0 {
                dst.dim(axis)
            } else {
                1
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dst() -> TensorMeta {
        TensorMeta::plain(&[4, 8], DataType::F32).unwrap()
    }

    #[test]
    fn test_scale_count() {
        let md = TensorMeta::plain(&[64, 32], DataType::S8).unwrap();
        assert_eq!(ScaleEntry::common().count(&md), 1);
        assert_eq!(ScaleEntry::per_axis(0b10).count(&md), 32);
        assert_eq!(
            ScaleEntry::per_axis(0b11).with_groups(vec![16, 1]).count(&md),
            4 * 32
        );
    }

    #[test]
    fn test_validate_mask_exceeds_rank() {
        let d = dst();
        let attr = Attributes::new().with_scales(ArgKey::DST, ScaleEntry::per_axis(0b100));
        let err = attr
            .validate(|a| (a == ArgKey::DST).then_some(&d), &d)
            .unwrap_err();
        assert!(err.to_string().contains("exceeds rank"));
    }

    #[test]
    fn test_validate_absent_argument() {
        let d = dst();
        let attr = Attributes::new().with_zero_points(ArgKey::SRC, ZeroPointEntry::common(DataType::S32));
        assert!(attr.validate(|_| None, &d).is_err());
    }

    #[test]
    fn test_validate_binary_broadcast() {
        let d = dst();
        let ok = TensorMeta::plain(&[1, 8], DataType::F32).unwrap();
        let bad = TensorMeta::plain(&[3, 8], DataType::F32).unwrap();
        let attr = Attributes::new().with_post_op(PostOp::Binary {
            alg: BinaryAlg::Add,
            rhs: ok,
        });
        assert!(attr.validate(|_| None, &d).is_ok());
        let attr = Attributes::new().with_post_op(PostOp::Binary {
            alg: BinaryAlg::Add,
            rhs: bad,
        });
        assert!(attr.validate(|_| None, &d).is_err());
    }

    #[test]
    fn test_digest_ignores_runtime_values() {
        let a = Attributes::new().with_post_op(PostOp::Eltwise {
            alg: EltwiseAlg::Relu,
            alpha: 0.0,
            beta: 0.0,
        });
        let b = Attributes::new().with_post_op(PostOp::Eltwise {
            alg: EltwiseAlg::Relu,
            alpha: 0.5,
            beta: 0.0,
        });
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), Attributes::new().digest());
        assert!(Attributes::new().is_default());
        assert!(!a.is_default());
    }

    #[test]
    fn test_prelu_dims() {
        let d = TensorMeta::plain(&[2, 16, 7, 7], DataType::F32).unwrap();
        assert_eq!(prelu_weights_dims(0b10, &d), vec![1, 16, 1, 1]);
        assert_eq!(prelu_weights_dims(0, &d), vec![1, 1, 1, 1]);
    }
}

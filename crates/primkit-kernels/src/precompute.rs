//! Scale fusion, zero-point bookings and post-op auxiliary registration.
//!
//! Kernels consume a single float vector of output scales. When the raw
//! attribute scales cannot be passed through as-is (both src and weights
//! scales, an adjust factor, transposition, non-f32 or grouped weight
//! scales), they are fused here into the `precomputed_scales` scratchpad
//! buffer before launch.

use half::{bf16, f16};
use primkit_core::{PrimError, Result, UnsupportedKind};
use primkit_layout::attr::prelu_weights_dims;
use primkit_layout::{ArgKey, Attributes, DataType, PostOp, Scales, TensorMeta, ZeroPoints};
use rayon::prelude::*;
use tracing::debug;

use crate::scratchpad::{names, Grantor, Registrar, DEFAULT_ALIGNMENT};

/// Vector tail padding of the fused scale buffer.
pub const SIMD_WIDTH: usize = 16;

/// Below this many outputs the fan-out overhead is not worth it.
const PAR_THRESHOLD: usize = 4096;

/// Raw scale values as supplied at execute time.
#[derive(Debug, Clone, Copy)]
pub enum ScaleData<'a> {
    F32(&'a [f32]),
    F16(&'a [f16]),
    Bf16(&'a [bf16]),
    S32(&'a [i32]),
    S8(&'a [i8]),
    U8(&'a [u8]),
}

impl<'a> ScaleData<'a> {
    pub fn len(&self) -> usize {
        match self {
            ScaleData::F32(v) => v.len(),
            ScaleData::F16(v) => v.len(),
            ScaleData::Bf16(v) => v.len(),
            ScaleData::S32(v) => v.len(),
            ScaleData::S8(v) => v.len(),
            ScaleData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DataType {
        match self {
            ScaleData::F32(_) => DataType::F32,
            ScaleData::F16(_) => DataType::F16,
            ScaleData::Bf16(_) => DataType::Bf16,
            ScaleData::S32(_) => DataType::S32,
            ScaleData::S8(_) => DataType::S8,
            ScaleData::U8(_) => DataType::U8,
        }
    }

    /// Element `i` converted to f32.
    pub fn load_float(&self, i: usize) -> f32 {
        match self {
            ScaleData::F32(v) => v[i],
            ScaleData::F16(v) => v[i].to_f32(),
            ScaleData::Bf16(v) => v[i].to_f32(),
            ScaleData::S32(v) => v[i] as f32,
            ScaleData::S8(v) => f32::from(v[i]),
            ScaleData::U8(v) => f32::from(v[i]),
        }
    }

    /// The caller's slice when no conversion is needed.
    pub fn as_f32(&self) -> Option<&'a [f32]> {
        match *self {
            ScaleData::F32(v) => Some(v),
            _ => None,
        }
    }
}

/// Shape of the fused scale problem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleParams {
    pub ic: usize,
    pub oc: usize,
    pub per_ic: bool,
    pub per_oc: bool,
    /// Input channels sharing one weight scale.
    pub group_ic: usize,
    pub adjust: f32,
    pub transpose: bool,
}

impl Default for ScaleParams {
    fn default() -> Self {
        Self {
            ic: 1,
            oc: 1,
            per_ic: false,
            per_oc: false,
            group_ic: 1,
            adjust: 1.0,
            transpose: false,
        }
    }
}

/// True when the kernel cannot consume the raw scale arguments.
pub fn req_copy_scales(scales: &Scales, adjust: f32, transpose: bool) -> bool {
    let src = scales.get(ArgKey::SRC);
    let wei = scales.get(ArgKey::WEIGHTS);
    (src.is_some() && wei.is_some())
        || adjust != 1.0
        || transpose
        || wei.is_some_and(|w| !w.has_default_dtype() || !w.has_default_groups())
}

/// Books the fused scale buffer when [`req_copy_scales`] holds.
pub fn book_precomputed_scales(
    registrar: &mut Registrar,
    scales: &Scales,
    wei_count: usize,
    adjust: f32,
    transpose: bool,
) -> Result<()> {
    if !req_copy_scales(scales, adjust, transpose) {
        return Ok(());
    }
    let per_axis = scales.get(ArgKey::WEIGHTS).is_some_and(|w| !w.is_common());
    let count = if per_axis {
        wei_count.max(SIMD_WIDTH)
    } else {
        SIMD_WIDTH
    };
    registrar.book(
        names::PRECOMPUTED_SCALES,
        DataType::F32,
        count,
        DEFAULT_ALIGNMENT,
    )
}

/// Returns the scale vector the kernel should read.
///
/// Without fusion this is the caller's own slice (weights first). With
/// fusion the result lives in the grantor's `precomputed_scales` buffer and
/// stays valid for the grantor's lifetime.
pub fn precompute_scales<'a>(
    grantor: &'a mut Grantor<'_>,
    src: Option<&'a [f32]>,
    wei: Option<ScaleData<'a>>,
    scales: &Scales,
    p: &ScaleParams,
) -> Result<&'a [f32]> {
    let src_entry = scales.get(ArgKey::SRC);
    let wei_entry = scales.get(ArgKey::WEIGHTS);

    if wei.is_none() && src_entry.is_some_and(|e| !e.is_common() && !e.has_default_groups()) {
        return Err(PrimError::invalid(
            "grouped per-axis src scales without weights scales",
        ));
    }

    if !req_copy_scales(scales, p.adjust, p.transpose) {
        return match (wei, src) {
            (Some(w), _) => w.as_f32().ok_or_else(|| {
                PrimError::invalid(format!("{} weights scales need fusion", w.dtype()))
            }),
            (None, Some(s)) => Ok(s),
            (None, None) => Ok(&[]),
        };
    }

    if src_entry.is_some_and(|e| !e.is_common()) && wei.is_some() {
        return Err(PrimError::invalid(
            "per-axis src scales cannot be fused with weights scales",
        ));
    }
    let src0 = match src {
        Some(s) => *s
            .first()
            .ok_or_else(|| PrimError::invalid("empty src scales"))?,
        None => 1.0,
    };
    let factor = src0 * p.adjust;

    let buf: &'a mut [f32] = grantor.get::<f32>(names::PRECOMPUTED_SCALES)?;
    let capacity = buf.len();

    let wei_per_axis = wei_entry.is_some_and(|e| !e.is_common());
    let Some(w) = wei.filter(|w| wei_per_axis && w.len() > 1) else {
        let w0 = match wei {
            Some(w) if !w.is_empty() => w.load_float(0),
            Some(_) => return Err(PrimError::invalid("empty weights scales")),
            None => 1.0,
        };
        let n = capacity.min(SIMD_WIDTH);
        buf[..n].fill(factor * w0);
        return Ok(&buf[..n]);
    };

    let group_ic = p.group_ic.max(1);
    if p.per_ic && !p.ic.is_multiple_of(group_ic) {
        return Err(PrimError::invalid(format!(
            "ic {} not divisible by scale group {group_ic}",
            p.ic
        )));
    }
    let n_ic = if p.per_ic { p.ic } else { 1 };
    let n_oc = if p.per_oc { p.oc } else { 1 };
    let (stride_oc, stride_ic) = match (p.per_oc, p.per_ic) {
        (true, true) => (1, n_oc),
        (true, false) => (1, 0),
        (false, true) => (0, 1),
        (false, false) => (0, 0),
    };
    let wei_needed = (n_ic / group_ic).max(1) * n_oc;
    if w.len() < wei_needed {
        return Err(PrimError::invalid(format!(
            "weights scales hold {} values, mask implies {wei_needed}",
            w.len()
        )));
    }
    let total = n_ic * n_oc;
    if total == 0 {
        return Err(PrimError::invalid("zero channels in scale fusion"));
    }
    if capacity < total {
        return Err(PrimError::invalid(format!(
            "precomputed scale buffer holds {capacity}, need {total}"
        )));
    }
    debug!(
        n_ic,
        n_oc,
        transpose = p.transpose,
        dtype = %w.dtype(),
        "fusing per-axis scales"
    );

    let load = |ic: usize, oc: usize| factor * w.load_float(stride_oc * oc + stride_ic * (ic / group_ic));
    let out = &mut buf[..total];
    let row = if p.transpose { n_ic } else { n_oc };
    let fill_row = |(r, chunk): (usize, &mut [f32])| {
        for (c, v) in chunk.iter_mut().enumerate() {
            *v = if p.transpose { load(c, r) } else { load(r, c) };
        }
    };
    if total >= PAR_THRESHOLD {
        out.par_chunks_mut(row).enumerate().for_each(fill_row);
    } else {
        out.chunks_mut(row).enumerate().for_each(fill_row);
    }
    Ok(out)
}

/// Books runtime zero-point buffers for src, weights and dst.
///
/// `precomp_md` carries the caller's layout when a convolution
/// pre-compensation path owns the src zero points.
pub fn book_zero_points(
    registrar: &mut Registrar,
    zps: &ZeroPoints,
    ic: usize,
    oc: usize,
    precomp_md: Option<&TensorMeta>,
) -> Result<()> {
    if let Some(e) = zps.get(ArgKey::WEIGHTS).filter(|e| e.runtime) {
        if !e.is_common() {
            return Err(PrimError::unsupported(
                UnsupportedKind::Attr,
                "per-axis weights zero points",
            ));
        }
        registrar.book_arg(
            names::WEI_ZERO_POINTS,
            ArgKey::zero_points(ArgKey::WEIGHTS),
            e.dtype,
            1,
        )?;
    }
    if let Some(e) = zps.get(ArgKey::SRC).filter(|e| e.runtime) {
        let arg = ArgKey::zero_points(ArgKey::SRC);
        match precomp_md {
            Some(md) => registrar.book_md(names::SRC_ZERO_POINTS, arg, &md.with_dtype(e.dtype))?,
            None => {
                let count = if e.is_common() { 1 } else { ic };
                registrar.book_arg(names::SRC_ZERO_POINTS, arg, e.dtype, count)?;
            }
        }
    }
    if let Some(e) = zps.get(ArgKey::DST).filter(|e| e.runtime) {
        let count = if e.is_common() { 1 } else { oc };
        registrar.book_arg(
            names::DST_ZERO_POINTS,
            ArgKey::zero_points(ArgKey::DST),
            e.dtype,
            count,
        )?;
    }
    Ok(())
}

/// Registers auxiliary inputs of the post-op chain.
pub fn register_post_op_args(
    registrar: &mut Registrar,
    post_ops: &[PostOp],
    dst: &TensorMeta,
) -> Result<()> {
    for (i, op) in post_ops.iter().enumerate() {
        match op {
            PostOp::Eltwise { .. } | PostOp::Sum { .. } => {}
            PostOp::Binary { rhs, .. } => {
                registrar.book_md(&names::binary_rhs(i), ArgKey::post_op(i) | ArgKey::SRC_1, rhs)?;
            }
            PostOp::Prelu { mask } => {
                let dims = prelu_weights_dims(*mask, dst);
                let md = TensorMeta::plain(&dims, DataType::F32)?;
                registrar.book_md(&names::prelu_rhs(i), ArgKey::post_op(i) | ArgKey::WEIGHTS, &md)?;
            }
            other => {
                return Err(PrimError::unsupported(
                    UnsupportedKind::PostOp,
                    format!("unexpected post-op kind '{}' at {i}", other.kind()),
                ))
            }
        }
    }
    Ok(())
}

/// Books the stochastic rounding seed.
pub fn book_rounding_seed(registrar: &mut Registrar, attr: &Attributes) -> Result<()> {
    if attr.has_stochastic_rounding() {
        registrar.book_arg(names::ROUNDING_SEED, ArgKey::ROUNDING_SEED, DataType::U32, 1)?;
    }
    Ok(())
}

//! Convolution and deconvolution.

use primkit_core::Result;
use primkit_layout::{
    ArgKey, DataType, DeviceExt, HwDescriptor, OpKind, OpParams, PostOp, Problem, Prop,
    TensorMeta, Tile,
};

use super::{
    book_attr_scratchpad, book_attr_scratchpad_with, check_attr, check_dt_support,
    check_post_ops, jit_capable, jit_kernel_ctx, ref_kernel_ctx, require_fwd, resolve_desc,
    unsupported_params,
};
use crate::dispatch::{ImplEntry, InitCtx, KernelBinding};
use crate::kernel_desc::KernelDescriptor;
use crate::requirements::Predicate;
use crate::scratchpad::{names, Registrar, DEFAULT_ALIGNMENT};
use crate::v_dispatch;

pub const CONV_JIT: &str = "conv_jit";
pub const CONV_REF: &str = "conv_ref";
pub const DECONV_REF: &str = "deconv_ref";

pub fn conv_entries() -> Vec<ImplEntry> {
    vec![
        ImplEntry::new(CONV_JIT, conv_jit_init, jit_kernel_ctx),
        ImplEntry::new(CONV_REF, conv_ref_init, ref_kernel_ctx),
    ]
}

pub fn deconv_entries() -> Vec<ImplEntry> {
    vec![ImplEntry::new(DECONV_REF, deconv_ref_init, ref_kernel_ctx)]
}

/// f32 forward-inference descriptor the planner starts from.
pub fn conv_jit_template(hw: &HwDescriptor, is_dw: bool) -> KernelDescriptor {
    let simd = hw.simd.max(1) as usize;
    // Depthwise kernels vectorise over groups, dense ones over output channels.
    let channel = if is_dw { 'g' } else { 'o' };
    let mut desc = KernelDescriptor::new(OpKind::Convolution, CONV_JIT);
    desc.is_dw = is_dw;
    desc.iter_tile = Tile::from_pairs([(channel, simd.min(32)), ('w', 8)]);
    if hw.family.is_gpu() {
        desc.thread_group_tile = Tile::from_pairs([(channel, 2), ('w', 4)]);
    }
    desc
}

fn dense_dilation(p: &Problem) -> Result<bool> {
    match p.params() {
        OpParams::Conv { dilation, .. } => Ok(dilation.iter().all(|d| *d == 0)),
        _ => Err(unsupported_params(p)),
    }
}

fn wei_dt(p: &Problem) -> DataType {
    p.wei().map_or(DataType::Undef, |w| w.dtype())
}

fn conv_jit_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    v_dispatch!(jit_capable(ctx.engine), DeviceExt, "no code generation on {}", ctx.engine.hw());
    require_fwd(p)?;
    v_dispatch!(dense_dilation(p)?, InconsistentMds, "dilated convolution");
    let (src, wei, dst) = (p.src().dtype(), wei_dt(p), p.dst().dtype());
    let int8 = src.is_int8() && wei == DataType::S8;
    let fp = src == wei && matches!(src, DataType::F32 | DataType::F16 | DataType::Bf16);
    v_dispatch!(fp || int8, DataType, "{src} x {wei} not handled");
    if int8 {
        v_dispatch!(ctx.engine.mayiuse(DeviceExt::Int8Dot), DeviceExt, "int8 without dot product");
    }
    check_dt_support(ctx.engine, &[src, wei, dst])?;
    check_post_ops(p, true, true)?;
    check_attr(
        p,
        &[ArgKey::SRC, ArgKey::WEIGHTS, ArgKey::DST],
        &[ArgKey::SRC, ArgKey::DST],
    )?;

    let (desc, source) = resolve_desc(ctx, CONV_JIT, || {
        let mut desc = conv_jit_template(p.hw(), p.is_depthwise());
        desc.prop = p.prop();
        desc.bias_dt = p.bias_dt();
        if int8 && !desc.is_dw {
            desc.reqs.push("ic", Predicate::DivisibleBy(4));
        }
        desc
    })?;

    let mut registrar = Registrar::new();
    let post_ops = &p.attr().post_ops;
    let fused_dw = match post_ops.last() {
        Some(PostOp::Depthwise { kernel, stride, dtype }) => Some((*kernel, *stride, *dtype)),
        _ => None,
    };
    let chain = if fused_dw.is_some() {
        &post_ops[..post_ops.len() - 1]
    } else {
        &post_ops[..]
    };
    // Runtime src zero points are folded into a per-channel compensation.
    let precomp = match p.attr().zero_points.get(ArgKey::SRC) {
        Some(e) if e.runtime => Some(TensorMeta::plain(&[p.dst().dim(1)], DataType::S32)?),
        _ => None,
    };
    book_attr_scratchpad_with(&mut registrar, p, chain, precomp.as_ref())?;

    let mut binding = KernelBinding::new(CONV_JIT);
    if let Some((kernel, stride, dtype)) = fused_dw {
        registrar.book(names::DW_CONV_BUF, dtype, p.dst().nelems(), DEFAULT_ALIGNMENT)?;
        binding = binding
            .define("DW_KERNEL", kernel as i64)
            .define("DW_STRIDE", stride as i64);
    }
    Ok(binding.with_desc(desc, source).with_registrar(registrar))
}

fn check_ref_dtypes(ctx: &InitCtx<'_>) -> Result<()> {
    let p = ctx.problem;
    let (src, wei, dst) = (p.src().dtype(), wei_dt(p), p.dst().dtype());
    let int8 = src.is_int8() && wei.is_int8();
    v_dispatch!(src == wei || int8, DataType, "mixed {src} x {wei}");
    if int8 {
        require_fwd(p)?;
    }
    check_dt_support(ctx.engine, &[src, wei, dst])
}

fn conv_ref_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    dense_dilation(p)?;
    check_ref_dtypes(ctx)?;
    check_post_ops(p, true, false)?;
    let mut registrar = Registrar::new();
    book_attr_scratchpad(&mut registrar, p)?;
    Ok(KernelBinding::new(CONV_REF).with_registrar(registrar))
}

/// Deconvolution runs the reference convolution with src and dst roles swapped.
fn deconv_ref_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    dense_dilation(p)?;
    v_dispatch!(
        matches!(
            p.prop(),
            Prop::ForwardInference | Prop::ForwardTraining | Prop::BackwardData
        ),
        PropKind,
        "{} not handled",
        p.prop()
    );
    check_ref_dtypes(ctx)?;
    check_post_ops(p, true, false)?;
    let mut registrar = Registrar::new();
    book_attr_scratchpad(&mut registrar, p)?;
    Ok(KernelBinding::new(CONV_REF)
        .with_registrar(registrar)
        .define("DECONV", 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::sim::SimEngine;
    use primkit_layout::{Attributes, EltwiseAlg, ZeroPointEntry};

    fn hw() -> HwDescriptor {
        HwDescriptor::preset("xe_hpc").unwrap()
    }

    fn conv(groups: usize, ic: usize, oc: usize, dilation: usize) -> primkit_layout::ProblemBuilder {
        let f32 = |s: &[usize]| TensorMeta::plain(s, DataType::F32).unwrap();
        let wei = if groups > 1 {
            f32(&[groups, oc, ic, 3, 3])
        } else {
            f32(&[oc, ic, 3, 3])
        };
        let out = 8 - 2 * dilation;
        Problem::builder(OpKind::Convolution, hw())
            .src(f32(&[2, groups * ic, 8, 8]))
            .wei(wei)
            .dst(f32(&[2, groups * oc, out, out]))
            .params(OpParams::Conv {
                groups,
                strides: vec![1, 1],
                padding: vec![1, 1],
                dilation: vec![dilation, dilation],
            })
    }

    fn dispatch(p: &Problem) -> crate::dispatch::PrimitiveDesc {
        Dispatcher::default().dispatch(&SimEngine::new(hw()), p).unwrap()
    }

    #[test]
    fn test_dense_conv_uses_jit() {
        let pd = dispatch(&conv(1, 16, 32, 0).build().unwrap());
        assert_eq!(pd.impl_name, CONV_JIT);
        let desc = pd.desc.unwrap();
        assert!(!desc.is_dw);
        assert_eq!(desc.iter_tile.get('o', 1), 16);
    }

    #[test]
    fn test_depthwise_tiles_groups() {
        let p = conv(32, 1, 1, 0).build().unwrap();
        assert!(p.is_depthwise());
        let pd = dispatch(&p);
        let desc = pd.desc.unwrap();
        assert!(desc.is_dw);
        assert_eq!(desc.iter_tile.get('g', 1), 16);
        assert!(pd.kernel.ctx.has_option("IS_DW"));
    }

    #[test]
    fn test_fused_depthwise_books_buffer() {
        let attr = Attributes::new()
            .with_post_op(PostOp::Eltwise {
                alg: EltwiseAlg::Relu,
                alpha: 0.0,
                beta: 0.0,
            })
            .with_post_op(PostOp::Depthwise {
                kernel: 3,
                stride: 1,
                dtype: DataType::F32,
            });
        let pd = dispatch(&conv(1, 16, 16, 0).attr(attr).build().unwrap());
        assert_eq!(pd.impl_name, CONV_JIT);
        assert_eq!(pd.scratchpad.get(names::DW_CONV_BUF).unwrap().count, 2 * 16 * 8 * 8);
        assert_eq!(pd.kernel.ctx.get_int("DW_KERNEL"), Some(3));
    }

    #[test]
    fn test_src_zero_points_use_compensation_layout() {
        let i8 = |s: &[usize], dt| TensorMeta::plain(s, dt).unwrap();
        let p = Problem::builder(OpKind::Convolution, hw())
            .src(i8(&[1, 16, 8, 8], DataType::U8))
            .wei(i8(&[16, 16, 3, 3], DataType::S8))
            .dst(i8(&[1, 16, 8, 8], DataType::S8))
            .params(OpParams::Conv {
                groups: 1,
                strides: vec![1, 1],
                padding: vec![1, 1],
                dilation: vec![0, 0],
            })
            .attr(Attributes::new().with_zero_points(ArgKey::SRC, ZeroPointEntry::common(DataType::S32)))
            .build()
            .unwrap();
        let pd = dispatch(&p);
        assert_eq!(pd.impl_name, CONV_JIT);
        let zp = pd.scratchpad.get(names::SRC_ZERO_POINTS).unwrap();
        assert_eq!(zp.md.as_ref().unwrap().shape(), &[16]);
    }

    #[test]
    fn test_backward_and_dilated_use_reference() {
        let pd = dispatch(&conv(1, 8, 8, 0).prop(Prop::BackwardData).build().unwrap());
        assert_eq!(pd.impl_name, CONV_REF);
        let pd = dispatch(&conv(1, 8, 8, 1).build().unwrap());
        assert_eq!(pd.impl_name, CONV_REF);
    }

    #[test]
    fn test_deconv_reference() {
        let f32 = |s: &[usize]| TensorMeta::plain(s, DataType::F32).unwrap();
        let p = Problem::builder(OpKind::Deconvolution, hw())
            .src(f32(&[1, 8, 4, 4]))
            .wei(f32(&[8, 4, 3, 3]))
            .dst(f32(&[1, 4, 4, 4]))
            .params(OpParams::Conv {
                groups: 1,
                strides: vec![1, 1],
                padding: vec![1, 1],
                dilation: vec![0, 0],
            })
            .build()
            .unwrap();
        let pd = dispatch(&p);
        assert_eq!(pd.impl_name, DECONV_REF);
        assert_eq!(pd.kernel.ctx.get_int("DECONV"), Some(1));
        assert_eq!(pd.kernel.ctx.source(), CONV_REF);
    }
}

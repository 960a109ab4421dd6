//! Catalogue implementations and the checks they share.

pub mod conv;
pub mod eltwise;
pub mod matmul;
pub mod norm;
pub mod pool;
pub mod reorder;
pub mod resampling;
pub mod rnn;
pub mod shuffle;

use primkit_core::{PrimError, Result, UnsupportedKind};
use primkit_layout::{ArgKey, DataType, DeviceExt, DeviceFamily, PostOp, Problem, TensorMeta};

use crate::dispatch::{InitCtx, KernelBinding, PlanSource};
use crate::engine::Engine;
use crate::kernel_ctx::KernelCtx;
use crate::kernel_desc::KernelDescriptor;
use crate::precompute::{
    book_precomputed_scales, book_rounding_seed, book_zero_points, register_post_op_args,
};
use crate::scratchpad::Registrar;
use crate::v_dispatch;

/// Instruction memory budget for fully unrolled loop bodies.
pub(crate) fn unroll_budget(engine: &dyn Engine) -> usize {
    match engine.hw().family {
        DeviceFamily::Cpu => 16_384,
        DeviceFamily::IntelGpu => 8_192,
        DeviceFamily::NvidiaGpu | DeviceFamily::AmdGpu => 12_288,
    }
}

/// Whether the device can run generated kernels at all.
pub(crate) fn jit_capable(engine: &dyn Engine) -> bool {
    if engine.hw().family.is_gpu() {
        engine.mayiuse(DeviceExt::Subgroups)
    } else {
        engine.mayiuse(DeviceExt::Avx2)
            || engine.mayiuse(DeviceExt::Avx512)
            || engine.mayiuse(DeviceExt::Neon)
    }
}

/// Device support for every data type in use.
pub(crate) fn check_dt_support(engine: &dyn Engine, dts: &[DataType]) -> Result<()> {
    for dt in dts {
        let ext = match dt {
            DataType::F64 => Some(DeviceExt::Fp64),
            DataType::F16 => Some(DeviceExt::Fp16),
            DataType::Bf16 if engine.hw().family.is_gpu() => Some(DeviceExt::Bf16),
            _ => None,
        };
        if let Some(ext) = ext {
            v_dispatch!(
                engine.mayiuse(ext),
                DeviceExt,
                "{dt} needs {} on {}",
                ext.name(),
                engine.hw()
            );
        }
        v_dispatch!(*dt != DataType::Undef, DataType, "undefined data type");
    }
    Ok(())
}

/// Every tensor has a concrete dense tag (no `any`).
pub(crate) fn check_concrete_tags(p: &Problem) -> Result<()> {
    for md in [Some(p.src()), p.wei(), Some(p.dst())].into_iter().flatten() {
        v_dispatch!(!md.tag().is_any(), Tag, "layout not chosen for {:?}", md.shape());
    }
    Ok(())
}

/// Every tensor is plain row-major (or `any`).
pub(crate) fn check_plain_tags(p: &Problem) -> Result<()> {
    for md in [Some(p.src()), p.wei(), Some(p.dst())].into_iter().flatten() {
        let plain = md.tag().is_any() || *md.tag() == primkit_layout::LayoutTag::plain(md.rank());
        v_dispatch!(plain, Tag, "blocked layout {} not handled", md.tag());
    }
    Ok(())
}

/// Post-op chain without kinds the caller cannot fuse.
pub(crate) fn check_post_ops(p: &Problem, allow_binary: bool, allow_depthwise: bool) -> Result<()> {
    let n = p.attr().post_ops.len();
    for (i, op) in p.attr().post_ops.iter().enumerate() {
        match op {
            PostOp::Binary { .. } => {
                v_dispatch!(allow_binary, PostOp, "binary post-op {i}");
            }
            PostOp::Depthwise { .. } => {
                v_dispatch!(allow_depthwise, PostOp, "fused depthwise post-op {i}");
                v_dispatch!(i + 1 == n, PostOp, "fused depthwise must be the last post-op");
            }
            PostOp::Eltwise { .. } | PostOp::Sum { .. } | PostOp::Prelu { .. } => {}
        }
    }
    Ok(())
}

/// Attributes limited to the listed scale / zero-point arguments.
pub(crate) fn check_attr(p: &Problem, scales: &[ArgKey], zero_points: &[ArgKey]) -> Result<()> {
    for (arg, _) in p.attr().scales.iter() {
        v_dispatch!(scales.contains(&arg), Attr, "scales on {arg}");
    }
    for (arg, _) in p.attr().zero_points.iter() {
        v_dispatch!(zero_points.contains(&arg), Attr, "zero points on {arg}");
    }
    Ok(())
}

/// Books scale, zero-point, post-op and rounding scratchpad for `p`.
pub(crate) fn book_attr_scratchpad(registrar: &mut Registrar, p: &Problem) -> Result<()> {
    book_attr_scratchpad_with(registrar, p, &p.attr().post_ops, None)
}

/// As [`book_attr_scratchpad`] for a prefix of the post-op chain, with an
/// optional src zero-point compensation layout.
pub(crate) fn book_attr_scratchpad_with(
    registrar: &mut Registrar,
    p: &Problem,
    post_ops: &[PostOp],
    precomp_md: Option<&TensorMeta>,
) -> Result<()> {
    let attr = p.attr();
    let wei_count = match (attr.scales.get(ArgKey::WEIGHTS), p.wei()) {
        (Some(e), Some(md)) => e.count(md),
        _ => 1,
    };
    book_precomputed_scales(registrar, &attr.scales, wei_count, 1.0, false)?;
    book_zero_points(registrar, &attr.zero_points, p.ic(), p.oc(), precomp_md)?;
    register_post_op_args(registrar, post_ops, p.dst())?;
    book_rounding_seed(registrar, attr)
}

/// Picks the descriptor a JIT entry honours: override, tuned plan, or
/// the heuristic default.
pub(crate) fn resolve_desc(
    ctx: &InitCtx<'_>,
    entry: &str,
    heuristic: impl FnOnce() -> KernelDescriptor,
) -> Result<(KernelDescriptor, PlanSource)> {
    if let Some(desc) = ctx.desc_override {
        desc.accepts(ctx.problem)?;
        return Ok((desc.clone(), PlanSource::Override));
    }
    if let Some(desc) = ctx.plans.and_then(|plans| plans.lookup(ctx.problem)) {
        if desc.kernel == entry {
            match desc.accepts(ctx.problem) {
                Ok(()) => return Ok((desc, PlanSource::Registry)),
                Err(e) => tracing::debug!(kernel = entry, status = %e, "tuned plan rejected"),
            }
        }
    }
    let desc = heuristic();
    desc.accepts(ctx.problem)?;
    Ok((desc, PlanSource::Heuristic))
}

fn define_common(p: &Problem, ctx: &mut KernelCtx) {
    ctx.define_str("SRC_DT", p.src().dtype().name());
    ctx.define_str("DST_DT", p.dst().dtype().name());
    if let Some(w) = p.wei() {
        ctx.define_str("WEI_DT", w.dtype().name());
    }
    if p.with_bias() {
        ctx.define_str("BIAS_DT", p.bias_dt().name());
    }
    ctx.define_int("NDIMS", p.dst().rank() as i64);
    ctx.define_str("PROP", p.prop().name());
    let attr = p.attr();
    ctx.define_int("POST_OP_COUNT", attr.post_ops.len() as i64);
    for (i, op) in attr.post_ops.iter().enumerate() {
        ctx.define_str(&format!("PO_{i}_KIND"), op.kind());
    }
    for (arg, entry) in attr.scales.iter() {
        ctx.define_int(&format!("WITH_{}_SCALES", arg.base_name().to_uppercase()), 1);
        ctx.define_int(&format!("{}_SCALES_MASK", arg.base_name().to_uppercase()), entry.mask as i64);
    }
    for (arg, entry) in attr.zero_points.iter() {
        let name = arg.base_name().to_uppercase();
        ctx.define_int(&format!("WITH_{name}_ZPOINTS"), 1);
        if entry.runtime {
            ctx.add_option(&format!("{name}_ZPOINTS_RUNTIME"));
        }
    }
    if attr.has_stochastic_rounding() {
        ctx.add_option("WITH_SROUND");
    }
}

/// Kernel macros for generated kernels: common set plus tiles.
pub(crate) fn jit_kernel_ctx(p: &Problem, b: &KernelBinding, ctx: &mut KernelCtx) -> Result<()> {
    let desc = b.desc.as_ref().ok_or_else(|| {
        PrimError::RuntimeError(format!("{}: JIT binding without descriptor", b.source))
    })?;
    define_common(p, ctx);
    ctx.define_int("JIT", 1);
    ctx.define_int("SIMD", p.hw().simd as i64);
    ctx.define_tile("ITER", &desc.iter_tile);
    ctx.define_tile("TG", &desc.thread_group_tile);
    if desc.is_dw {
        ctx.add_option("IS_DW");
    }
    Ok(())
}

/// Kernel macros for hand-vectorised kernels without a descriptor.
pub(crate) fn vector_kernel_ctx(p: &Problem, _: &KernelBinding, ctx: &mut KernelCtx) -> Result<()> {
    define_common(p, ctx);
    ctx.define_int("JIT", 1);
    ctx.define_int("SIMD", p.hw().simd as i64);
    Ok(())
}

/// Kernel macros for reference kernels.
pub(crate) fn ref_kernel_ctx(p: &Problem, _: &KernelBinding, ctx: &mut KernelCtx) -> Result<()> {
    define_common(p, ctx);
    ctx.define_int("JIT", 0);
    Ok(())
}

pub(crate) fn require_fwd(p: &Problem) -> Result<()> {
    v_dispatch!(p.prop().is_fwd(), PropKind, "{} not handled", p.prop());
    Ok(())
}

pub(crate) fn unsupported_params(p: &Problem) -> PrimError {
    PrimError::unsupported(
        UnsupportedKind::InconsistentMds,
        format!("{} parameters missing or of the wrong kind", p.op()),
    )
}

//! Elementwise activations.

use primkit_core::Result;
use primkit_layout::{DataType, OpParams, PostOp, Problem};

use super::{
    book_attr_scratchpad, check_attr, check_concrete_tags, check_dt_support, check_post_ops,
    ref_kernel_ctx, require_fwd, unsupported_params, vector_kernel_ctx,
};
use crate::dispatch::{ImplEntry, InitCtx, KernelBinding};
use crate::scratchpad::Registrar;
use crate::v_dispatch;

pub const ELTWISE_GENERIC: &str = "eltwise_generic";
pub const ELTWISE_REF: &str = "eltwise_ref";

pub fn entries() -> Vec<ImplEntry> {
    vec![
        ImplEntry::new(ELTWISE_GENERIC, generic_init, vector_kernel_ctx),
        ImplEntry::new(ELTWISE_REF, ref_init, ref_kernel_ctx),
    ]
}

fn alg_code(p: &Problem) -> Result<i64> {
    match p.params() {
        OpParams::Eltwise { alg, .. } => Ok(*alg as i64),
        _ => Err(unsupported_params(p)),
    }
}

/// Dense same-layout forward pass over a flat element range.
fn generic_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    let alg = alg_code(p)?;
    require_fwd(p)?;
    let (src, dst) = (p.src().dtype(), p.dst().dtype());
    v_dispatch!(src == dst, DataType, "{src} -> {dst} conversion");
    v_dispatch!(
        matches!(src, DataType::F32 | DataType::F16 | DataType::Bf16),
        DataType,
        "{src} not vectorised"
    );
    check_dt_support(ctx.engine, &[src])?;
    check_concrete_tags(p)?;
    v_dispatch!(p.src().tag() == p.dst().tag(), Tag, "src and dst layouts differ");
    v_dispatch!(
        p.attr()
            .post_ops
            .iter()
            .all(|op| matches!(op, PostOp::Eltwise { .. } | PostOp::Sum { .. })),
        PostOp,
        "only eltwise and sum post-ops"
    );
    check_attr(p, &[], &[])?;
    let simd = i64::from(p.hw().simd.max(1));
    Ok(KernelBinding::new(ELTWISE_GENERIC)
        .define("ALG", alg)
        .define("VECT_SIZE", simd))
}

fn ref_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    let alg = alg_code(p)?;
    check_dt_support(ctx.engine, &[p.src().dtype(), p.dst().dtype()])?;
    check_post_ops(p, true, false)?;
    let mut registrar = Registrar::new();
    book_attr_scratchpad(&mut registrar, p)?;
    Ok(KernelBinding::new(ELTWISE_REF)
        .with_registrar(registrar)
        .define("ALG", alg))
}

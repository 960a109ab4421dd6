//! Matmul: tiled JIT GEMM and a reference fallback.

use primkit_core::Result;
use primkit_layout::{ArgKey, DataType, DeviceExt, HwDescriptor, OpKind, Problem, Tile};

use super::{
    book_attr_scratchpad, check_attr, check_dt_support, check_plain_tags, check_post_ops,
    jit_capable, jit_kernel_ctx, ref_kernel_ctx, require_fwd, resolve_desc,
};
use crate::dispatch::{ImplEntry, InitCtx, KernelBinding};
use crate::kernel_desc::KernelDescriptor;
use crate::requirements::Predicate;
use crate::scratchpad::{names, Registrar, DEFAULT_ALIGNMENT};
use crate::v_dispatch;

pub const GEMM_JIT: &str = "gemm_jit";
pub const GEMM_REF: &str = "gemm_ref";

pub fn entries() -> Vec<ImplEntry> {
    vec![
        ImplEntry::new(GEMM_JIT, gemm_jit_init, jit_kernel_ctx),
        ImplEntry::new(GEMM_REF, gemm_ref_init, ref_kernel_ctx),
    ]
}

/// f32 forward-inference descriptor the planner starts from.
pub fn gemm_jit_template(hw: &HwDescriptor) -> KernelDescriptor {
    let simd = hw.simd.max(1) as usize;
    let mut desc = KernelDescriptor::new(OpKind::Matmul, GEMM_JIT);
    desc.iter_tile = Tile::from_pairs([('m', 8), ('n', simd.min(32))]);
    if hw.family.is_gpu() {
        desc.thread_group_tile = Tile::from_pairs([('m', 4), ('n', 2)]);
    }
    desc
}

fn heuristic(p: &Problem, int8: bool) -> KernelDescriptor {
    let mut desc = gemm_jit_template(p.hw());
    desc.prop = p.prop();
    desc.bias_dt = p.bias_dt();
    if int8 {
        // Dot-product instructions consume four int8 values per lane.
        desc.reqs.push("k", Predicate::DivisibleBy(4));
    }
    desc
}

fn dtypes(p: &Problem) -> (DataType, DataType, DataType) {
    let wei = p.wei().map_or(DataType::Undef, |w| w.dtype());
    (p.src().dtype(), wei, p.dst().dtype())
}

fn gemm_jit_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    v_dispatch!(jit_capable(ctx.engine), DeviceExt, "no code generation on {}", ctx.engine.hw());
    require_fwd(p)?;
    let (src, wei, dst) = dtypes(p);
    let int8 = src.is_int8() && wei.is_int8();
    let fp = src == wei && matches!(src, DataType::F32 | DataType::F16 | DataType::Bf16);
    v_dispatch!(fp || int8, DataType, "{src} x {wei} not handled");
    if int8 {
        v_dispatch!(ctx.engine.mayiuse(DeviceExt::Int8Dot), DeviceExt, "int8 without dot product");
    }
    check_dt_support(ctx.engine, &[src, wei, dst])?;
    check_plain_tags(p)?;
    check_post_ops(p, true, false)?;
    check_attr(
        p,
        &[ArgKey::SRC, ArgKey::WEIGHTS, ArgKey::DST],
        &[ArgKey::SRC, ArgKey::DST],
    )?;

    let (desc, source) = resolve_desc(ctx, GEMM_JIT, || heuristic(p, int8))?;
    let mut registrar = Registrar::new();
    book_attr_scratchpad(&mut registrar, p)?;
    if int8 {
        let acc = desc.effective_tile().elems();
        registrar.book(names::GEMM_ACC, DataType::S32, acc, DEFAULT_ALIGNMENT)?;
    }
    Ok(KernelBinding::new(GEMM_JIT)
        .with_desc(desc, source)
        .with_registrar(registrar))
}

fn gemm_ref_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    require_fwd(p)?;
    let (src, wei, dst) = dtypes(p);
    v_dispatch!(
        src == wei || (src.is_int8() && wei.is_int8()),
        DataType,
        "mixed {src} x {wei}"
    );
    check_dt_support(ctx.engine, &[src, wei, dst])?;
    check_post_ops(p, true, false)?;
    let mut registrar = Registrar::new();
    book_attr_scratchpad(&mut registrar, p)?;
    Ok(KernelBinding::new(GEMM_REF).with_registrar(registrar))
}

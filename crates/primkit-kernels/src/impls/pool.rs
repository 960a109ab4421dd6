//! Pooling.
//!
//! The JIT kernel fully unrolls a block of channels and output columns
//! together with the kernel window; the unrolled nest goes through the
//! cut-and-retry builder so it always fits the instruction budget.

use primkit_core::Result;
use primkit_layout::{DataType, HwDescriptor, OpKind, OpParams, PoolAlg, Problem, Tile};

use super::{
    book_attr_scratchpad, check_attr, check_dt_support, check_post_ops, jit_capable,
    jit_kernel_ctx, ref_kernel_ctx, require_fwd, resolve_desc, unroll_budget, unsupported_params,
};
use crate::config_builder::{build_with_cut, LoopConfig};
use crate::dispatch::{ImplEntry, InitCtx, KernelBinding};
use crate::kernel_desc::KernelDescriptor;
use crate::scratchpad::Registrar;
use crate::v_dispatch;

pub const POOL_JIT: &str = "pool_jit";
pub const POOL_REF: &str = "pool_ref";

pub fn entries() -> Vec<ImplEntry> {
    vec![
        ImplEntry::new(POOL_JIT, pool_jit_init, jit_kernel_ctx),
        ImplEntry::new(POOL_REF, pool_ref_init, ref_kernel_ctx),
    ]
}

pub fn pool_jit_template(hw: &HwDescriptor) -> KernelDescriptor {
    let simd = hw.simd.max(1) as usize;
    let mut desc = KernelDescriptor::new(OpKind::Pooling, POOL_JIT);
    desc.iter_tile = Tile::from_pairs([('c', simd.min(32)), ('w', 4)]);
    if hw.family.is_gpu() {
        desc.thread_group_tile = Tile::from_pairs([('h', 2), ('w', 2)]);
    }
    desc
}

fn alg(p: &Problem) -> Result<PoolAlg> {
    match p.params() {
        OpParams::Pool { alg, .. } => Ok(*alg),
        _ => Err(unsupported_params(p)),
    }
}

fn pool_jit_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    let alg = alg(p)?;
    v_dispatch!(jit_capable(ctx.engine), DeviceExt, "no code generation on {}", ctx.engine.hw());
    require_fwd(p)?;
    let (src, dst) = (p.src().dtype(), p.dst().dtype());
    v_dispatch!(src == dst, DataType, "{src} -> {dst} conversion");
    v_dispatch!(
        matches!(
            src,
            DataType::F32 | DataType::F16 | DataType::Bf16 | DataType::S8 | DataType::U8
        ),
        DataType,
        "{src} pooling"
    );
    check_dt_support(ctx.engine, &[src])?;
    check_post_ops(p, true, false)?;
    check_attr(p, &[], &[])?;

    let (desc, source) = resolve_desc(ctx, POOL_JIT, || {
        let mut desc = pool_jit_template(p.hw());
        desc.prop = p.prop();
        desc
    })?;

    let kh = p.dim_value("kh").unwrap_or(1);
    let kw = p.dim_value("kw").unwrap_or(1);
    let ow = p.dim_value("ow").unwrap_or(1);
    let insts_per_elem = match alg {
        PoolAlg::Max => 2,
        PoolAlg::AvgIncludePadding | PoolAlg::AvgExcludePadding => 3,
    };
    // Kernel rows may be cut down to one; a kernel row itself is never split.
    let mut config = LoopConfig::new(POOL_JIT, insts_per_elem, unroll_budget(ctx.engine))
        .with_dim('c', p.src().dim(1), desc.iter_tile.get('c', 1), 1)
        .with_dim('w', ow, desc.iter_tile.get('w', 1), 1)
        .with_dim('y', kh, kh, 1)
        .with_dim('x', kw, kw, kw);
    let stmt = build_with_cut(&mut config)?;

    let mut registrar = Registrar::new();
    book_attr_scratchpad(&mut registrar, p)?;
    Ok(KernelBinding::new(POOL_JIT)
        .with_desc(desc, source)
        .with_registrar(registrar)
        .define("ALG", alg as i64)
        .define("KH", kh as i64)
        .define("KW", kw as i64)
        .define("UNROLL_C", stmt.unroll('c') as i64)
        .define("UNROLL_W", stmt.unroll('w') as i64)
        .define("UNROLL_KH", stmt.unroll('y') as i64)
        .define("UNROLL_KW", stmt.unroll('x') as i64))
}

fn pool_ref_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    let alg = alg(p)?;
    check_dt_support(ctx.engine, &[p.src().dtype(), p.dst().dtype()])?;
    check_post_ops(p, true, false)?;
    let mut registrar = Registrar::new();
    book_attr_scratchpad(&mut registrar, p)?;
    Ok(KernelBinding::new(POOL_REF)
        .with_registrar(registrar)
        .define("ALG", alg as i64))
}

//! Layout and data-type conversion.

use primkit_core::Result;
use primkit_layout::{ArgKey, DataType, HwDescriptor, LayoutTag, OpKind, PostOp, Tile};

use super::{
    book_attr_scratchpad, check_attr, check_concrete_tags, check_dt_support, jit_capable,
    jit_kernel_ctx, ref_kernel_ctx, resolve_desc, unroll_budget,
};
use crate::config_builder::{build_with_cut, LoopConfig};
use crate::dispatch::{ImplEntry, InitCtx, KernelBinding};
use crate::kernel_desc::KernelDescriptor;
use crate::scratchpad::{names, Registrar, DEFAULT_ALIGNMENT};
use crate::v_dispatch;

pub const REORDER_JIT: &str = "reorder_jit";
pub const REORDER_REF: &str = "reorder_ref";

pub fn entries() -> Vec<ImplEntry> {
    vec![
        ImplEntry::new(REORDER_JIT, reorder_jit_init, jit_kernel_ctx),
        ImplEntry::new(REORDER_REF, reorder_ref_init, ref_kernel_ctx),
    ]
}

fn letter(axis: usize) -> char {
    (b'a' + axis as u8) as char
}

fn heuristic_tiles(hw: &HwDescriptor, rank: usize) -> (Tile, Tile) {
    let simd = hw.simd.max(1).min(32) as usize;
    let iter = match rank {
        0 | 1 => Tile::from_pairs([('a', simd)]),
        2 => Tile::from_pairs([('a', 8), ('b', simd)]),
        r => Tile::from_pairs([('b', simd), (letter(r - 1), 8)]),
    };
    let tg = if hw.family.is_gpu() && rank > 2 {
        Tile::from_pairs([(letter(rank - 2), 2)])
    } else {
        Tile::new()
    };
    (iter, tg)
}

/// Channels-first to channels-last f32 descriptor the planner starts from.
pub fn reorder_jit_template(hw: &HwDescriptor) -> KernelDescriptor {
    let (iter, tg) = heuristic_tiles(hw, 4);
    let mut desc = KernelDescriptor::new(OpKind::Reorder, REORDER_JIT);
    desc.src_tag = LayoutTag::new("abcd");
    desc.dst_tag = LayoutTag::new("acdb");
    desc.iter_tile = iter;
    desc.thread_group_tile = tg;
    desc
}

fn convertible(dt: DataType) -> bool {
    matches!(
        dt,
        DataType::F32 | DataType::F16 | DataType::Bf16 | DataType::S32 | DataType::S8 | DataType::U8
    )
}

fn reorder_jit_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    v_dispatch!(jit_capable(ctx.engine), DeviceExt, "no code generation on {}", ctx.engine.hw());
    let (src, dst) = (p.src().dtype(), p.dst().dtype());
    v_dispatch!(convertible(src) && convertible(dst), DataType, "{src} -> {dst}");
    check_dt_support(ctx.engine, &[src, dst])?;
    check_concrete_tags(p)?;
    v_dispatch!(
        p.attr().post_ops.iter().all(|op| matches!(op, PostOp::Sum { .. })),
        PostOp,
        "only sum post-ops"
    );
    check_attr(p, &[ArgKey::SRC, ArgKey::DST], &[ArgKey::SRC, ArgKey::DST])?;

    let (desc, source) = resolve_desc(ctx, REORDER_JIT, || {
        let (iter, tg) = heuristic_tiles(p.hw(), p.dst().rank());
        let mut desc = KernelDescriptor::new(OpKind::Reorder, REORDER_JIT);
        desc.prop = p.prop();
        desc.iter_tile = iter;
        desc.thread_group_tile = tg;
        desc
    })?;

    let mut insts_per_elem = 2 + usize::from(src != dst);
    if !p.attr().scales.is_default() {
        insts_per_elem += 1;
    }
    let mut config = LoopConfig::new(REORDER_JIT, insts_per_elem, unroll_budget(ctx.engine));
    for (axis, &extent) in p.dst().shape().iter().enumerate() {
        let l = letter(axis);
        config = config.with_dim(l, extent, desc.iter_tile.get(l, 1), 1);
    }
    let stmt = build_with_cut(&mut config)?;

    let mut registrar = Registrar::new();
    book_attr_scratchpad(&mut registrar, p)?;
    let mut binding = KernelBinding::new(REORDER_JIT)
        .with_desc(desc, source)
        .with_registrar(registrar);
    for (l, _, block) in &stmt.loops {
        binding = binding.define(&format!("UNROLL_{}", l.to_ascii_uppercase()), *block as i64);
    }
    Ok(binding)
}

fn reorder_ref_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    let (src, dst) = (p.src().dtype(), p.dst().dtype());
    check_dt_support(ctx.engine, &[src, dst])?;
    let mut registrar = Registrar::new();
    book_attr_scratchpad(&mut registrar, p)?;
    // Narrow-to-narrow conversions go through an f32 staging buffer.
    if src != dst && src != DataType::F32 && dst != DataType::F32 {
        registrar.book(names::REORDER_TMP, DataType::F32, p.dst().nelems(), DEFAULT_ALIGNMENT)?;
    }
    Ok(KernelBinding::new(REORDER_REF).with_registrar(registrar))
}

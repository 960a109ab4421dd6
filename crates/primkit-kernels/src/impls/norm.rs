//! Batch and layer normalisation reference kernels.

use primkit_core::Result;
use primkit_layout::{ArgKey, DataType, OpParams, Problem};

use super::{
    book_attr_scratchpad, check_attr, check_dt_support, ref_kernel_ctx, unsupported_params,
};
use crate::dispatch::{ImplEntry, InitCtx, KernelBinding};
use crate::scratchpad::{names, Registrar, DEFAULT_ALIGNMENT};
use crate::v_dispatch;

pub const BNORM_REF: &str = "bnorm_ref";
pub const LNORM_REF: &str = "lnorm_ref";

pub fn bnorm_entries() -> Vec<ImplEntry> {
    vec![ImplEntry::new(BNORM_REF, bnorm_init, ref_kernel_ctx)]
}

pub fn lnorm_entries() -> Vec<ImplEntry> {
    vec![ImplEntry::new(LNORM_REF, lnorm_init, ref_kernel_ctx)]
}

struct NormFlags {
    use_scale: bool,
    use_shift: bool,
    /// Mean and variance have to be computed by the kernel.
    computes_stats: bool,
}

fn flags(p: &Problem) -> Result<NormFlags> {
    let OpParams::Norm {
        use_scale,
        use_shift,
        global_stats,
        ..
    } = p.params()
    else {
        return Err(unsupported_params(p));
    };
    Ok(NormFlags {
        use_scale: *use_scale,
        use_shift: *use_shift,
        computes_stats: !global_stats,
    })
}

fn check_common(ctx: &InitCtx<'_>) -> Result<NormFlags> {
    let p = ctx.problem;
    let flags = flags(p)?;
    let (src, dst) = (p.src().dtype(), p.dst().dtype());
    v_dispatch!(
        src.is_fp() || (src.is_int8() && p.prop().is_fwd()),
        DataType,
        "{src} normalisation for {}",
        p.prop()
    );
    check_dt_support(ctx.engine, &[src, dst])?;
    v_dispatch!(p.attr().post_ops.is_empty(), PostOp, "post-ops on normalisation");
    check_attr(p, &[ArgKey::SRC, ArgKey::DST], &[])?;
    Ok(flags)
}

fn binding(
    name: &'static str,
    p: &Problem,
    flags: &NormFlags,
    stat_count: usize,
) -> Result<KernelBinding> {
    let mut registrar = Registrar::new();
    book_attr_scratchpad(&mut registrar, p)?;
    if flags.computes_stats {
        // Interleaved mean and variance.
        registrar.book(names::NORM_STATS, DataType::F32, 2 * stat_count, DEFAULT_ALIGNMENT)?;
    }
    Ok(KernelBinding::new(name)
        .with_registrar(registrar)
        .define("USE_SCALE", i64::from(flags.use_scale))
        .define("USE_SHIFT", i64::from(flags.use_shift))
        .define("CALCULATE_STATS", i64::from(flags.computes_stats)))
}

/// Statistics per channel (axis 1).
fn bnorm_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let flags = check_common(ctx)?;
    let p = ctx.problem;
    v_dispatch!(p.src().rank() >= 2, InconsistentMds, "batch norm needs a channel axis");
    binding(BNORM_REF, p, &flags, p.src().dim(1))
}

/// Statistics per row of the last axis.
fn lnorm_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let flags = check_common(ctx)?;
    let p = ctx.problem;
    let src = p.src();
    let norm_axis = src.dim(src.rank() - 1).max(1);
    binding(LNORM_REF, p, &flags, src.nelems() / norm_axis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::sim::SimEngine;
    use primkit_layout::{HwDescriptor, OpKind, Prop, TensorMeta};

    fn problem(op: OpKind, prop: Prop, global_stats: bool) -> Problem {
        let md = TensorMeta::plain(&[4, 8, 16], DataType::F32).unwrap();
        Problem::builder(op, HwDescriptor::preset("sm_80").unwrap())
            .prop(prop)
            .src(md.clone())
            .dst(md)
            .params(OpParams::Norm {
                epsilon: 1e-5,
                use_scale: true,
                use_shift: false,
                global_stats,
            })
            .build()
            .unwrap()
    }

    fn engine() -> SimEngine {
        SimEngine::new(HwDescriptor::preset("sm_80").unwrap())
    }

    #[test]
    fn test_bnorm_training_books_channel_stats() {
        let pd = Dispatcher::default()
            .dispatch(&engine(), &problem(OpKind::BatchNorm, Prop::ForwardTraining, false))
            .unwrap();
        assert_eq!(pd.impl_name, BNORM_REF);
        assert_eq!(pd.scratchpad.get(names::NORM_STATS).unwrap().count, 16);
        assert_eq!(pd.kernel.ctx.get_int("USE_SCALE"), Some(1));
        assert_eq!(pd.kernel.ctx.get_int("USE_SHIFT"), Some(0));
    }

    #[test]
    fn test_global_stats_need_no_scratchpad() {
        let pd = Dispatcher::default()
            .dispatch(&engine(), &problem(OpKind::BatchNorm, Prop::ForwardInference, true))
            .unwrap();
        assert!(pd.scratchpad.get(names::NORM_STATS).is_none());
        assert_eq!(pd.kernel.ctx.get_int("CALCULATE_STATS"), Some(0));
    }

    #[test]
    fn test_lnorm_stats_per_row() {
        let pd = Dispatcher::default()
            .dispatch(&engine(), &problem(OpKind::LayerNorm, Prop::ForwardInference, false))
            .unwrap();
        assert_eq!(pd.impl_name, LNORM_REF);
        assert_eq!(pd.scratchpad.get(names::NORM_STATS).unwrap().count, 2 * 4 * 8);
    }
}

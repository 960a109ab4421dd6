//! Channel shuffle.

use primkit_core::Result;
use primkit_layout::{DataType, OpParams};

use super::{check_dt_support, ref_kernel_ctx, unsupported_params};
use crate::dispatch::{ImplEntry, InitCtx, KernelBinding};
use crate::v_dispatch;

pub const SHUFFLE_REF: &str = "shuffle_ref";

pub fn entries() -> Vec<ImplEntry> {
    vec![ImplEntry::new(SHUFFLE_REF, shuffle_ref_init, ref_kernel_ctx)]
}

/// Channel shuffle is a pure permutation: no conversions, no attributes.
fn shuffle_ref_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    let OpParams::Shuffle { axis, group } = p.params() else {
        return Err(unsupported_params(p));
    };
    let (src, dst) = (p.src().dtype(), p.dst().dtype());
    v_dispatch!(src == dst, DataType, "{src} -> {dst} conversion");
    v_dispatch!(src != DataType::Undef, DataType, "undefined data type");
    check_dt_support(ctx.engine, &[src])?;
    v_dispatch!(p.attr().is_default(), Attr, "attributes on shuffle");
    Ok(KernelBinding::new(SHUFFLE_REF)
        .define("AXIS", *axis as i64)
        .define("GROUP", *group as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::sim::SimEngine;
    use primkit_core::PrimError;
    use primkit_layout::{HwDescriptor, OpKind, Problem, TensorMeta};

    fn shuffle(src: DataType, dst: DataType) -> Problem {
        Problem::builder(OpKind::Shuffle, HwDescriptor::preset("xe_lp").unwrap())
            .src(TensorMeta::plain(&[2, 12, 4], src).unwrap())
            .dst(TensorMeta::plain(&[2, 12, 4], dst).unwrap())
            .params(OpParams::Shuffle { axis: 1, group: 3 })
            .build()
            .unwrap()
    }

    #[test]
    fn test_shuffle() {
        let engine = SimEngine::new(HwDescriptor::preset("xe_lp").unwrap());
        let pd = Dispatcher::default()
            .dispatch(&engine, &shuffle(DataType::F32, DataType::F32))
            .unwrap();
        assert_eq!(pd.impl_name, SHUFFLE_REF);
        assert_eq!(pd.kernel.ctx.get_int("GROUP"), Some(3));

        let err = Dispatcher::default()
            .dispatch(&engine, &shuffle(DataType::F32, DataType::F16))
            .unwrap_err();
        assert!(matches!(err, PrimError::Unimplemented(_)));
    }
}

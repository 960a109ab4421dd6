//! Spatial resampling.

use primkit_core::Result;
use primkit_layout::OpParams;

use super::{
    book_attr_scratchpad, check_dt_support, check_post_ops, ref_kernel_ctx, unsupported_params,
};
use crate::dispatch::{ImplEntry, InitCtx, KernelBinding};
use crate::scratchpad::Registrar;

pub const RESAMPLING_REF: &str = "resampling_ref";

pub fn entries() -> Vec<ImplEntry> {
    vec![ImplEntry::new(RESAMPLING_REF, resampling_ref_init, ref_kernel_ctx)]
}

fn resampling_ref_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    let OpParams::Resampling { alg } = p.params() else {
        return Err(unsupported_params(p));
    };
    check_dt_support(ctx.engine, &[p.src().dtype(), p.dst().dtype()])?;
    check_post_ops(p, true, false)?;
    let mut registrar = Registrar::new();
    book_attr_scratchpad(&mut registrar, p)?;
    Ok(KernelBinding::new(RESAMPLING_REF)
        .with_registrar(registrar)
        .define("ALG", *alg as i64))
}

//! Recurrent cells (vanilla, LSTM, GRU).

use primkit_core::Result;
use primkit_layout::{ArgKey, DataType, OpParams};

use super::{
    book_attr_scratchpad, check_attr, check_dt_support, ref_kernel_ctx, unsupported_params,
};
use crate::dispatch::{ImplEntry, InitCtx, KernelBinding};
use crate::scratchpad::{names, Registrar, DEFAULT_ALIGNMENT};
use crate::v_dispatch;

pub const RNN_REF: &str = "rnn_ref";

pub fn entries() -> Vec<ImplEntry> {
    vec![ImplEntry::new(RNN_REF, rnn_ref_init, ref_kernel_ctx)]
}

fn rnn_ref_init(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
    let p = ctx.problem;
    let OpParams::Rnn {
        cell,
        layers,
        directions,
    } = p.params()
    else {
        return Err(unsupported_params(p));
    };
    let (src, dst) = (p.src().dtype(), p.dst().dtype());
    let wei = p.wei().map_or(DataType::Undef, |w| w.dtype());
    let int8 = src == DataType::U8 && wei == DataType::S8;
    v_dispatch!(
        (src.is_fp() && src == wei) || (int8 && p.prop().is_fwd()),
        DataType,
        "{src} x {wei} cell for {}",
        p.prop()
    );
    check_dt_support(ctx.engine, &[src, wei, dst])?;
    v_dispatch!(p.attr().post_ops.is_empty(), PostOp, "post-ops on rnn");
    check_attr(p, &[ArgKey::SRC, ArgKey::WEIGHTS], &[ArgKey::SRC])?;

    // Gate pre-activations for every time step, batch row and direction.
    let (steps, batch) = (p.src().dim(0), p.src().dim(1));
    let hidden = p.wei().map_or(1, |w| w.dim(4));
    let gates = steps * batch * cell.gates() * hidden * directions;

    let mut registrar = Registrar::new();
    book_attr_scratchpad(&mut registrar, p)?;
    registrar.book(names::RNN_GATES, DataType::F32, gates, DEFAULT_ALIGNMENT)?;
    Ok(KernelBinding::new(RNN_REF)
        .with_registrar(registrar)
        .define("N_GATES", cell.gates() as i64)
        .define("N_LAYERS", *layers as i64)
        .define("N_DIR", *directions as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::sim::SimEngine;
    use primkit_layout::{HwDescriptor, OpKind, Problem, RnnCell, TensorMeta};

    #[test]
    fn test_lstm_books_gates() {
        let hw = HwDescriptor::preset("gfx90a").unwrap();
        let md = |s: &[usize]| TensorMeta::plain(s, DataType::F32).unwrap();
        let p = Problem::builder(OpKind::Rnn, hw.clone())
            .src(md(&[5, 2, 8]))
            .wei(md(&[1, 2, 8, 4, 8]))
            .dst(md(&[5, 2, 16]))
            .params(OpParams::Rnn {
                cell: RnnCell::Lstm,
                layers: 1,
                directions: 2,
            })
            .build()
            .unwrap();
        let pd = Dispatcher::default().dispatch(&SimEngine::new(hw), &p).unwrap();
        assert_eq!(pd.impl_name, RNN_REF);
        assert_eq!(pd.scratchpad.get(names::RNN_GATES).unwrap().count, 5 * 2 * 4 * 8 * 2);
        assert_eq!(pd.kernel.ctx.get_int("N_GATES"), Some(4));
    }
}

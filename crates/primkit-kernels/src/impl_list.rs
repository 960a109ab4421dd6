//! Built-in implementation catalogue.
//!
//! Every device family gets the same ordered lists: generated kernels
//! first, reference kernels last. Entries decline problems they cannot run,
//! so the reference kernel is the fallback of each list.

use primkit_layout::{DeviceFamily, HwDescriptor, OpKind};

use crate::dispatch::{ImplEntry, ImplList};
use crate::impls::{conv, eltwise, matmul, norm, pool, reorder, resampling, rnn, shuffle};
use crate::kernel_desc::KernelDescriptor;

const FAMILIES: [DeviceFamily; 4] = [
    DeviceFamily::Cpu,
    DeviceFamily::IntelGpu,
    DeviceFamily::NvidiaGpu,
    DeviceFamily::AmdGpu,
];

fn entries_for(op: OpKind) -> Vec<ImplEntry> {
    match op {
        OpKind::Matmul => matmul::entries(),
        OpKind::Convolution => conv::conv_entries(),
        OpKind::Deconvolution => conv::deconv_entries(),
        OpKind::Eltwise => eltwise::entries(),
        OpKind::BatchNorm => norm::bnorm_entries(),
        OpKind::LayerNorm => norm::lnorm_entries(),
        OpKind::Pooling => pool::entries(),
        OpKind::Reorder => reorder::entries(),
        OpKind::Rnn => rnn::entries(),
        OpKind::Resampling => resampling::entries(),
        OpKind::Shuffle => shuffle::entries(),
    }
}

pub fn default_catalogue() -> ImplList {
    let mut list = ImplList::new();
    for family in FAMILIES {
        for op in OpKind::ALL {
            for entry in entries_for(op) {
                list.push(op, family, entry);
            }
        }
    }
    list
}

/// Starting descriptor for tuning the generated kernel of `op`, if it has one.
pub fn jit_template(op: OpKind, hw: &HwDescriptor) -> Option<KernelDescriptor> {
    match op {
        OpKind::Matmul => Some(matmul::gemm_jit_template(hw)),
        OpKind::Convolution => Some(conv::conv_jit_template(hw, false)),
        OpKind::Pooling => Some(pool::pool_jit_template(hw)),
        OpKind::Reorder => Some(reorder::reorder_jit_template(hw)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_op_has_a_fallback_everywhere() {
        let list = default_catalogue();
        for family in FAMILIES {
            for op in OpKind::ALL {
                let entries = list.get(op, family);
                assert!(!entries.is_empty(), "{op} on {}", family.name());
                let last = entries[entries.len() - 1].name;
                assert!(last.ends_with("_ref"), "{op} ends with {last}");
            }
        }
    }

    #[test]
    fn test_order_jit_before_reference() {
        let list = default_catalogue();
        let names: Vec<_> = list
            .get(OpKind::Matmul, DeviceFamily::IntelGpu)
            .iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["gemm_jit", "gemm_ref"]);
    }

    #[test]
    fn test_templates_name_their_entries() {
        let hw = HwDescriptor::preset("xe_hpc").unwrap();
        let list = default_catalogue();
        for op in OpKind::ALL {
            if let Some(t) = jit_template(op, &hw) {
                assert_eq!(t.op, op);
                assert!(list.get(op, hw.family).iter().any(|e| e.name == t.kernel));
                assert!(!t.iter_tile.is_empty());
            }
        }
        assert!(jit_template(OpKind::Shuffle, &hw).is_none());
    }
}

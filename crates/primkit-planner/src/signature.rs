//! Shape-free problem signatures.
//!
//! Two problems share a signature when a tuned descriptor for one is a
//! candidate for the other: same op, propagation, data types, layouts,
//! ranks, attribute digest and device. Shapes are excluded; the
//! descriptor's requirements are checked against the concrete problem at
//! lookup time.

use primkit_layout::{Problem, TensorMeta};

/// Hex length of a signature (128-bit prefix of the blake3 digest).
pub const SIGNATURE_LEN: usize = 32;

fn tensor_key(md: Option<&TensorMeta>) -> String {
    match md {
        Some(md) => format!("{}:{}:r{}", md.dtype(), md.tag(), md.rank()),
        None => "-".to_string(),
    }
}

/// Canonical text the signature hashes.
pub fn signature_key(p: &Problem) -> String {
    [
        p.op().name().to_string(),
        p.prop().name().to_string(),
        tensor_key(Some(p.src())),
        tensor_key(p.wei()),
        tensor_key(Some(p.dst())),
        format!("bias:{}", p.bias_dt()),
        format!("dw:{}", u8::from(p.is_depthwise())),
        format!("attr:{}", p.attr().digest()),
        format!("hw:{}", p.hw().fingerprint()),
    ]
    .join("|")
}

pub fn signature(p: &Problem) -> String {
    let digest = blake3::hash(signature_key(p).as_bytes());
    digest.to_hex()[..SIGNATURE_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use primkit_layout::{
        ArgKey, Attributes, DataType, HwDescriptor, OpKind, ScaleEntry,
    };

    fn matmul(m: usize, dt: DataType, hw: &str) -> Problem {
        let md = |s: &[usize]| TensorMeta::plain(s, dt).unwrap();
        Problem::builder(OpKind::Matmul, HwDescriptor::preset(hw).unwrap())
            .src(md(&[m, 64]))
            .wei(md(&[64, 32]))
            .dst(md(&[m, 32]))
            .build()
            .unwrap()
    }

    #[test]
    fn test_shapes_do_not_change_signature() {
        let a = signature(&matmul(16, DataType::F32, "xe_hpc"));
        let b = signature(&matmul(48, DataType::F32, "xe_hpc"));
        assert_eq!(a, b);
        assert_eq!(a.len(), SIGNATURE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_dtype_hw_and_attr_change_signature() {
        let base = matmul(16, DataType::F32, "xe_hpc");
        assert_ne!(signature(&base), signature(&matmul(16, DataType::F16, "xe_hpc")));
        assert_ne!(signature(&base), signature(&matmul(16, DataType::F32, "sm_80")));
        let scaled = base
            .with_attr(Attributes::new().with_scales(ArgKey::WEIGHTS, ScaleEntry::per_axis(0b10)))
            .unwrap();
        assert_ne!(signature(&base), signature(&scaled));
    }
}

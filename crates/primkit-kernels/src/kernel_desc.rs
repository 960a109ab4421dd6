//! Kernel descriptors: parameterised recipes for one JIT kernel.
//!
//! A descriptor serialises to a single `;`-separated line so it can live in
//! one column of the plan registry:
//!
//! ```text
//! op=matmul;kernel=gemm_jit;prop=fwd_inference;src=ab;wei=ab;dst=ab;reqs=k%8==0;dw=0;bias=undef;iter=m8n8;tg=m2n2
//! ```

use std::fmt;
use std::str::FromStr;

use primkit_core::{PrimError, Result, UnsupportedKind};
use primkit_layout::layout::matches_tag;
use primkit_layout::{DataType, LayoutTag, OpKind, Problem, Prop, TensorMeta, Tile};

use serde::{Deserialize, Serialize};

use crate::requirements::Requirements;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct KernelDescriptor {
    pub op: OpKind,
    /// Name of the implementation that honours this descriptor.
    pub kernel: String,
    pub prop: Prop,
    pub src_tag: LayoutTag,
    pub wei_tag: LayoutTag,
    pub dst_tag: LayoutTag,
    pub reqs: Requirements,
    pub is_dw: bool,
    pub bias_dt: DataType,
    pub iter_tile: Tile,
    pub thread_group_tile: Tile,
}

impl KernelDescriptor {
    pub fn new(op: OpKind, kernel: impl Into<String>) -> Self {
        Self {
            op,
            kernel: kernel.into(),
            prop: Prop::ForwardInference,
            src_tag: LayoutTag::any(),
            wei_tag: LayoutTag::any(),
            dst_tag: LayoutTag::any(),
            reqs: Requirements::new(),
            is_dw: false,
            bias_dt: DataType::Undef,
            iter_tile: Tile::new(),
            thread_group_tile: Tile::new(),
        }
    }

    /// Per-workgroup tile: `iter_tile[d] * thread_group_tile[d]`.
    pub fn effective_tile(&self) -> Tile {
        self.iter_tile.mul(&self.thread_group_tile)
    }

    /// Stable identity used for tie-breaking and logging.
    pub fn fingerprint(&self) -> String {
        self.to_string()
    }

    /// Checks whether `problem` can run under this descriptor.
    pub fn accepts(&self, problem: &Problem) -> Result<()> {
        if problem.op() != self.op {
            return Err(PrimError::unsupported(
                UnsupportedKind::InconsistentMds,
                format!("descriptor is for {}, problem is {}", self.op, problem.op()),
            ));
        }
        if problem.prop() != self.prop {
            return Err(PrimError::unsupported(
                UnsupportedKind::PropKind,
                format!("descriptor wants {}, problem is {}", self.prop, problem.prop()),
            ));
        }
        if problem.bias_dt() != self.bias_dt {
            return Err(PrimError::unsupported(
                UnsupportedKind::DataType,
                format!("bias {} != {}", problem.bias_dt(), self.bias_dt),
            ));
        }
        if problem.is_depthwise() != self.is_dw {
            return Err(PrimError::unsupported(
                UnsupportedKind::InconsistentMds,
                "depthwise mismatch",
            ));
        }
        let tags = [
            (Some(problem.src()), &self.src_tag, "src"),
            (problem.wei(), &self.wei_tag, "wei"),
            (Some(problem.dst()), &self.dst_tag, "dst"),
        ];
        for (md, tag, what) in tags {
            if let Some(md) = md {
                if !tag_accepts(tag, md) {
                    return Err(PrimError::unsupported(
                        UnsupportedKind::Tag,
                        format!("{what} layout {} does not match {tag}", md.tag()),
                    ));
                }
            }
        }
        if let Some(r) = self.reqs.first_unmet(problem) {
            return Err(PrimError::unsupported(
                UnsupportedKind::Requirements,
                format!("{r} does not hold"),
            ));
        }
        Ok(())
    }
}

/// `any` on either side matches; otherwise canonical layouts must agree.
pub fn tag_accepts(tag: &LayoutTag, md: &TensorMeta) -> bool {
    if tag.is_any() || md.tag().is_any() || tag == md.tag() {
        return true;
    }
    if tag.ndims(md.rank()).ok() != Some(md.rank()) {
        return false;
    }
    md.layout()
        .is_some_and(|layout| matches_tag(&layout, tag.as_str(), md.shape()))
}

impl fmt::Display for KernelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "op={};kernel={};prop={};src={};wei={};dst={};reqs={};dw={};bias={};iter={};tg={}",
            self.op,
            self.kernel,
            self.prop,
            self.src_tag,
            self.wei_tag,
            self.dst_tag,
            self.reqs,
            u8::from(self.is_dw),
            self.bias_dt,
            self.iter_tile,
            self.thread_group_tile
        )
    }
}

impl FromStr for KernelDescriptor {
    type Err = PrimError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |what: &str| PrimError::invalid(format!("kernel descriptor '{s}': {what}"));
        let mut desc: Option<KernelDescriptor> = None;
        let mut kernel = None;
        let mut fields = Vec::new();
        for part in s.trim().split(';') {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| bad(&format!("field '{part}' has no '='")))?;
            match key.trim() {
                "op" => {
                    let op: OpKind = value.parse().map_err(|e: String| bad(&e))?;
                    desc = Some(KernelDescriptor::new(op, ""));
                }
                "kernel" => kernel = Some(value.trim().to_string()),
                _ => fields.push((key.trim(), value.trim())),
            }
        }
        let mut desc = desc.ok_or_else(|| bad("missing op"))?;
        desc.kernel = kernel
            .filter(|k| !k.is_empty())
            .ok_or_else(|| bad("missing kernel"))?;
        for (key, value) in fields {
            match key {
                "prop" => desc.prop = value.parse().map_err(|e: String| bad(&e))?,
                "src" => desc.src_tag = parse_tag(value).map_err(|e| bad(&e))?,
                "wei" => desc.wei_tag = parse_tag(value).map_err(|e| bad(&e))?,
                "dst" => desc.dst_tag = parse_tag(value).map_err(|e| bad(&e))?,
                "reqs" => desc.reqs = value.parse()?,
                "dw" => {
                    desc.is_dw = match value {
                        "0" => false,
                        "1" => true,
                        _ => return Err(bad("dw must be 0 or 1")),
                    }
                }
                "bias" => desc.bias_dt = value.parse().map_err(|e: String| bad(&e))?,
                "iter" => desc.iter_tile = value.parse().map_err(|e: String| bad(&e))?,
                "tg" => desc.thread_group_tile = value.parse().map_err(|e: String| bad(&e))?,
                other => return Err(bad(&format!("unknown field '{other}'"))),
            }
        }
        Ok(desc)
    }
}

impl From<KernelDescriptor> for String {
    fn from(desc: KernelDescriptor) -> Self {
        desc.to_string()
    }
}

impl TryFrom<String> for KernelDescriptor {
    type Error = PrimError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Validates tag text read from disk without panicking.
fn parse_tag(value: &str) -> std::result::Result<LayoutTag, String> {
    let tag = LayoutTag::new(value);
    if tag.is_any() {
        return Ok(tag);
    }
    tag.blocks(0).map_err(|e| e.to_string())?;
    Ok(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requirements::Predicate;
    use primkit_layout::HwDescriptor;

    fn gemm_desc() -> KernelDescriptor {
        let mut d = KernelDescriptor::new(OpKind::Matmul, "gemm_jit");
        d.src_tag = "ab".into();
        d.wei_tag = "ab".into();
        d.dst_tag = "ab".into();
        d.reqs = Requirements::new().with("k", Predicate::DivisibleBy(8));
        d.iter_tile = "m8n8".parse().unwrap();
        d.thread_group_tile = "m2n2".parse().unwrap();
        d
    }

    #[test]
    fn test_serialize_parse() {
        let d = gemm_desc();
        let text = d.to_string();
        assert_eq!(
            text,
            "op=matmul;kernel=gemm_jit;prop=fwd_inference;src=ab;wei=ab;dst=ab;reqs=k%8==0;dw=0;bias=undef;iter=m8n8;tg=m2n2"
        );
        assert_eq!(text.parse::<KernelDescriptor>().unwrap(), d);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<KernelDescriptor>().is_err());
        assert!("op=matmul".parse::<KernelDescriptor>().is_err());
        assert!("op=matmul;kernel=x;src=a1".parse::<KernelDescriptor>().is_err());
        assert!("op=matmul;kernel=x;dw=2".parse::<KernelDescriptor>().is_err());
        assert!("op=matmul;kernel=x;color=red".parse::<KernelDescriptor>().is_err());
    }

    #[test]
    fn test_json_is_the_line_format() {
        let d = gemm_desc();
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{d}\""));
        assert_eq!(serde_json::from_str::<KernelDescriptor>(&json).unwrap(), d);
    }

    #[test]
    fn test_effective_tile() {
        let d = gemm_desc();
        assert_eq!(d.effective_tile().to_string(), "m16n16");
    }

    #[test]
    fn test_accepts() {
        let hw = HwDescriptor::preset("xe_hpc").unwrap();
        let md = |s: &[usize]| TensorMeta::plain(s, DataType::F32).unwrap();
        let ok = Problem::builder(OpKind::Matmul, hw.clone())
            .src(md(&[32, 64]))
            .wei(md(&[64, 16]))
            .dst(md(&[32, 16]))
            .build()
            .unwrap();
        assert!(gemm_desc().accepts(&ok).is_ok());

        let odd_k = Problem::builder(OpKind::Matmul, hw)
            .src(md(&[32, 60]))
            .wei(md(&[60, 16]))
            .dst(md(&[32, 16]))
            .build()
            .unwrap();
        let err = gemm_desc().accepts(&odd_k).unwrap_err();
        assert!(matches!(
            err,
            PrimError::Unsupported {
                kind: UnsupportedKind::Requirements,
                ..
            }
        ));
    }
}

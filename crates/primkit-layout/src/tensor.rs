//! Tensor metadata (shape, type, layout).

use primkit_core::{PrimError, Result};
use serde::{Deserialize, Serialize};

use crate::dtype::DataType;
use crate::layout::{BlockedLayout, LayoutTag, MAX_NDIMS};

/// Shape, element type and layout tag of one tensor argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorMeta {
    shape: Vec<usize>,
    dtype: DataType,
    tag: LayoutTag,
}

impl TensorMeta {
    /// Validates `rank = |shape| = layout rank` and `rank ∈ [1, 12]`.
    pub fn new(shape: &[usize], dtype: DataType, tag: impl Into<LayoutTag>) -> Result<Self> {
        let tag = tag.into();
        if shape.is_empty() || shape.len() > MAX_NDIMS {
            return Err(PrimError::invalid(format!(
                "rank {} outside [1, {MAX_NDIMS}]",
                shape.len()
            )));
        }
        if shape.contains(&0) {
            return Err(PrimError::invalid(format!("zero dim in shape {shape:?}")));
        }
        if !tag.is_any() {
            let rank = tag.ndims(shape.len())?;
            if rank != shape.len() {
                return Err(PrimError::invalid(format!(
                    "layout '{tag}' has rank {rank}, shape {shape:?} has rank {}",
                    shape.len()
                )));
            }
        }
        Ok(Self {
            shape: shape.to_vec(),
            dtype,
            tag,
        })
    }

    /// Plain row-major tensor.
    pub fn plain(shape: &[usize], dtype: DataType) -> Result<Self> {
        Self::new(shape, dtype, LayoutTag::plain(shape.len()))
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.shape.get(axis).copied().unwrap_or(1)
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn tag(&self) -> &LayoutTag {
        &self.tag
    }

    pub fn nelems(&self) -> usize {
        self.shape.iter().product()
    }

    /// Dense layout for the tag; `None` while the tag is still `any`.
    pub fn layout(&self) -> Option<BlockedLayout> {
        if self.tag.is_any() {
            return None;
        }
        BlockedLayout::from_tag(&self.shape, self.tag.as_str()).ok()
    }

    pub fn padded_dims(&self) -> Vec<usize> {
        self.layout()
            .map(|l| l.padded_dims())
            .unwrap_or_else(|| self.shape.clone())
    }

    /// Storage size including block padding.
    pub fn size_bytes(&self) -> usize {
        let elems = self.layout().map(|l| l.elems()).unwrap_or_else(|| self.nelems());
        self.dtype.size_of(elems)
    }

    pub fn with_tag(&self, tag: impl Into<LayoutTag>) -> Result<Self> {
        Self::new(&self.shape, self.dtype, tag)
    }

    pub fn with_dtype(&self, dtype: DataType) -> Self {
        Self {
            dtype,
            ..self.clone()
        }
    }

    /// Product of the dims whose bit is set in `mask`.
    pub fn masked_count(&self, mask: u32) -> usize {
        (0..self.rank())
            .filter(|axis| mask & (1 << axis) != 0)
            .map(|axis| self.shape[axis])
            .product()
    }
}

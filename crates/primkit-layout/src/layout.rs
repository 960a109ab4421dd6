//! Letter-block layout tags.
//!
//! A tag such as `ABcd8a4b` lists dimensions outermost first. Each letter
//! names an axis (`a` is axis 0); a decimal prefix makes the occurrence an
//! inner block of that size, a bare letter is the outer (unblocked) part of
//! the axis. Uppercase marks an axis that also has inner blocks. `x` stands
//! for every remaining axis, unblocked.
//!
//! Parsed layouts list the inner blocks in declaration order, then the outer
//! letters innermost first: `parse_format("ABcd8a4b", 4)` yields
//! `[(0,8), (1,4), (3,0), (2,0), (1,0), (0,0)]`. [`BlockedLayout`] uses the
//! physical order instead, where the last declared block is innermost.

use std::fmt;

use primkit_core::{PrimError, Result};
use serde::{Deserialize, Serialize};

/// Maximum tensor rank handled by the layout algebra.
pub const MAX_NDIMS: usize = 12;

/// Splits a tag into `(letter, block)` pairs; block 0 is an outer occurrence.
pub fn parse_letter_blocks(format: &str) -> Result<Vec<(char, usize)>> {
    let mut out = Vec::new();
    let mut block: Option<usize> = None;
    for c in format.chars() {
        if let Some(d) = c.to_digit(10) {
            let acc = block.unwrap_or(0);
            let next = acc
                .checked_mul(10)
                .and_then(|v| v.checked_add(d as usize))
                .ok_or_else(|| PrimError::invalid(format!("block overflow in '{format}'")))?;
            block = Some(next);
            continue;
        }
        out.push((c, block.take().unwrap_or(0)));
    }
    if block.is_some() {
        return Err(PrimError::invalid(format!(
            "trailing digits without a letter in '{format}'"
        )));
    }
    Ok(out)
}

/// Fallible form of [`parse_format`], for text that did not come from code.
pub fn try_parse_format(format: &str, ndims_hint: usize) -> Result<Vec<(usize, usize)>> {
    let letters = parse_letter_blocks(format)?;

    let mut seen = [false; MAX_NDIMS];
    for &(c, _) in &letters {
        if c == 'x' {
            continue;
        }
        if !c.is_ascii_alphabetic() {
            return Err(PrimError::invalid(format!("bad letter '{c}' in '{format}'")));
        }
        let axis = (c.to_ascii_lowercase() as u8 - b'a') as usize;
        if axis >= MAX_NDIMS {
            return Err(PrimError::invalid(format!(
                "axis letter '{c}' out of range in '{format}'"
            )));
        }
        seen[axis] = true;
    }
    let letter_ndims = seen.iter().filter(|s| **s).count();
    if seen.iter().take(letter_ndims).any(|s| !s) {
        return Err(PrimError::invalid(format!(
            "axis letters in '{format}' are not a contiguous prefix"
        )));
    }

    let mut parts = Vec::with_capacity(letters.len() + ndims_hint);
    let mut seen_x = false;
    for (c, block) in letters {
        if c == 'x' {
            if seen_x || block != 0 {
                return Err(PrimError::invalid(format!("misplaced 'x' in '{format}'")));
            }
            if ndims_hint < letter_ndims {
                return Err(PrimError::invalid(format!(
                    "'{format}' names {letter_ndims} axes but only {ndims_hint} expected"
                )));
            }
            seen_x = true;
            parts.extend((letter_ndims..ndims_hint).map(|axis| (axis, 0)));
            continue;
        }
        let axis = (c.to_ascii_lowercase() as u8 - b'a') as usize;
        parts.push((axis, block));
    }

    let total = if seen_x { ndims_hint } else { letter_ndims };
    for axis in 0..total {
        let outer = parts.iter().filter(|(a, b)| *a == axis && *b == 0).count();
        if outer != 1 {
            return Err(PrimError::invalid(format!(
                "axis {axis} must have exactly one outer occurrence in '{format}'"
            )));
        }
    }

    let (inner, mut outer): (Vec<_>, Vec<_>) = parts.into_iter().partition(|(_, b)| *b > 0);
    outer.reverse();
    Ok(inner.into_iter().chain(outer).collect())
}

/// Parses a tag into `(axis, block)` pairs: inner blocks as declared, then
/// outer letters innermost first.
///
/// # Panics
///
/// On a malformed tag. Tags handed to this function come from kernel code,
/// never from users; use [`try_parse_format`] for anything read from disk.
pub fn parse_format(format: &str, ndims_hint: usize) -> Vec<(usize, usize)> {
    try_parse_format(format, ndims_hint)
        .unwrap_or_else(|e| panic!("malformed layout tag '{format}': {e}"))
}

/// Renders a [`parse_format`] list back to tag text.
pub fn render_format(parts: &[(usize, usize)]) -> String {
    let letter = |axis: usize| (b'a' + axis as u8) as char;
    let mut out = String::new();
    for &(axis, _) in parts.iter().rev().filter(|(_, b)| *b == 0) {
        let blocked = parts.iter().any(|&(a, b)| a == axis && b > 0);
        let c = letter(axis);
        out.push(if blocked { c.to_ascii_uppercase() } else { c });
    }
    for &(axis, block) in parts.iter().filter(|(_, b)| *b > 0) {
        out.push_str(&block.to_string());
        out.push(letter(axis));
    }
    out
}

/// Physical order of a [`parse_format`] list: innermost block first.
fn physical_order(parts: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    let (mut inner, outer): (Vec<_>, Vec<_>) = parts.into_iter().partition(|(_, b)| *b > 0);
    inner.reverse();
    inner.extend(outer);
    inner
}

/// Layout tag text, or `any` to let the implementation choose.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayoutTag(String);

impl LayoutTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn any() -> Self {
        Self("any".into())
    }

    /// Plain row-major tag (`a`, `ab`, `abc`, ...).
    pub fn plain(ndims: usize) -> Self {
        Self((0..ndims).map(|i| (b'a' + i as u8) as char).collect())
    }

    pub fn is_any(&self) -> bool {
        self.0 == "any"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Block list in [`parse_format`] order.
    pub fn blocks(&self, ndims_hint: usize) -> Result<Vec<(usize, usize)>> {
        if self.is_any() {
            return Err(PrimError::invalid("layout 'any' has no blocks"));
        }
        try_parse_format(&self.0, ndims_hint)
    }

    /// Inner blocks only (`block > 0`), as declared.
    pub fn inner_blocks(&self, ndims_hint: usize) -> Result<Vec<(usize, usize)>> {
        Ok(self
            .blocks(ndims_hint)?
            .into_iter()
            .filter(|(_, b)| *b > 0)
            .collect())
    }

    /// Rank implied by the tag (the hint is used for `x`).
    pub fn ndims(&self, ndims_hint: usize) -> Result<usize> {
        let blocks = self.blocks(ndims_hint)?;
        Ok(blocks.iter().map(|(a, _)| a + 1).max().unwrap_or(0))
    }

    pub fn is_blocked(&self, ndims_hint: usize) -> bool {
        self.inner_blocks(ndims_hint)
            .map(|b| !b.is_empty())
            .unwrap_or(false)
    }

    /// Product of the inner block sizes of `axis`.
    pub fn inner_block_of(&self, axis: usize, ndims_hint: usize) -> usize {
        self.inner_blocks(ndims_hint)
            .map(|b| b.iter().filter(|(a, _)| *a == axis).map(|(_, s)| *s).product())
            .unwrap_or(1)
    }
}

impl fmt::Display for LayoutTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LayoutTag {
    fn from(s: &str) -> Self {
        LayoutTag::new(s)
    }
}

/// One dimension of a blocked layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub axis: usize,
    pub size: usize,
    pub stride: usize,
}

/// Canonical dense layout of a tensor: blocks innermost first with strides.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockedLayout {
    pub dims: Vec<usize>,
    pub blocks: Vec<Block>,
}

impl BlockedLayout {
    /// Builds the dense layout the tag describes for `dims`.
    pub fn from_tag(dims: &[usize], tag: &str) -> Result<Self> {
        let parts = physical_order(try_parse_format(tag, dims.len())?);
        let rank = parts.iter().map(|(a, _)| a + 1).max().unwrap_or(0);
        if rank != dims.len() {
            return Err(PrimError::invalid(format!(
                "tag '{tag}' has rank {rank}, dims have rank {}",
                dims.len()
            )));
        }
        let mut inner = vec![1usize; dims.len()];
        for &(axis, block) in &parts {
            if block > 0 {
                inner[axis] *= block;
            }
        }
        let mut stride = 1usize;
        let mut blocks = Vec::with_capacity(parts.len());
        for (axis, block) in parts {
            let size = if block > 0 {
                block
            } else {
                dims[axis].div_ceil(inner[axis])
            };
            blocks.push(Block { axis, size, stride });
            stride *= size;
        }
        Ok(Self {
            dims: dims.to_vec(),
            blocks,
        })
    }

    /// Dims rounded up to their inner block products.
    pub fn padded_dims(&self) -> Vec<usize> {
        let mut padded = vec![1usize; self.dims.len()];
        for b in &self.blocks {
            padded[b.axis] *= b.size;
        }
        padded
    }

    /// Number of elements including padding.
    pub fn elems(&self) -> usize {
        self.blocks.iter().map(|b| b.size).product()
    }

    /// Drops size-1 blocks and coalesces adjacent blocks of the same axis.
    pub fn normalized(&self) -> Self {
        let mut blocks: Vec<Block> = Vec::with_capacity(self.blocks.len());
        for b in self.blocks.iter().filter(|b| b.size != 1) {
            if let Some(last) = blocks.last_mut() {
                if last.axis == b.axis && last.stride * last.size == b.stride {
                    last.size *= b.size;
                    continue;
                }
            }
            blocks.push(*b);
        }
        Self {
            dims: self.dims.clone(),
            blocks,
        }
    }

    /// Equality under normalisation.
    pub fn is_equivalent(&self, other: &BlockedLayout) -> bool {
        self.dims == other.dims && self.normalized().blocks == other.normalized().blocks
    }
}

/// True when `layout` is the dense layout `tag` describes for `dims`.
pub fn matches_tag(layout: &BlockedLayout, tag: &str, dims: &[usize]) -> bool {
    BlockedLayout::from_tag(dims, tag)
        .map(|canonical| layout.is_equivalent(&canonical))
        .unwrap_or(false)
}

//! Shape, type and layout vocabulary shared by the dispatcher and planner.
//!
//! - [`layout`]: layout tag grammar and blocked-layout matching
//! - [`tile`]: axis-letter tiles
//! - [`tensor`]: tensor metadata
//! - [`attr`]: scales, zero points, post-ops, rounding
//! - [`problem`]: operator problem descriptors
//! - [`hw`]: hardware descriptors

pub mod arg;
pub mod attr;
pub mod dtype;
pub mod hw;
pub mod layout;
pub mod problem;
pub mod tensor;
pub mod tile;

pub use arg::ArgKey;
pub use attr::{
    Attributes, BinaryAlg, EltwiseAlg, PostOp, RoundingMode, ScaleEntry, Scales, ScratchpadMode,
    ZeroPointEntry, ZeroPoints,
};
pub use dtype::DataType;
pub use hw::{DeviceExt, DeviceFamily, HwDescriptor};
pub use layout::{parse_format, render_format, try_parse_format, BlockedLayout, LayoutTag};
pub use problem::{IterDim, OpKind, OpParams, PoolAlg, Problem, ProblemBuilder, Prop, ResamplingAlg, RnnCell};
pub use tensor::TensorMeta;
pub use tile::Tile;

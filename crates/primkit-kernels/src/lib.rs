//! Kernel dispatch and JIT configuration.
//!
//! - [`KernelDescriptor`] / [`Requirements`]: parameterised kernel recipes
//! - [`Dispatcher`]: ordered implementation lists with `v_dispatch!` checks
//! - [`precompute`]: scale fusion and scratchpad booking for attributes
//! - [`config_builder`]: loop unrolling with cut-and-retry
//! - [`sim`]: deterministic simulated device used by tests and the planner

pub mod config_builder;
pub mod dispatch;
pub mod engine;
pub mod impl_list;
pub mod impls;
pub mod kernel_ctx;
pub mod kernel_desc;
pub mod precompute;
pub mod requirements;
pub mod scratchpad;
pub mod sim;

#[doc(hidden)]
pub use primkit_core as __core;

pub use config_builder::{build_with_cut, try_build, LoopConfig, LoopDim, Stmt};
pub use dispatch::{
    Dispatcher, ImplEntry, ImplList, InitCtx, KernelBinding, PlanLookup, PlanSource,
    PrimitiveDesc,
};
pub use engine::{Engine, KernelHandle, Stream};
pub use impl_list::{default_catalogue, jit_template};
pub use kernel_ctx::{KernelCtx, MacroValue};
pub use kernel_desc::{tag_accepts, KernelDescriptor};
pub use precompute::{precompute_scales, ScaleData, ScaleParams};
pub use requirements::{lcm, Predicate, Requirement, Requirements};
pub use scratchpad::{Grantor, Registrar, ScratchpadRegistry};
pub use sim::SimEngine;

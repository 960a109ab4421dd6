//! primkit: kernel dispatch, scratchpad precompute and empirical plan
//! selection for deep-learning primitives.
//!
//! Re-exports the workspace crates and provides [`PrimitiveEngine`], the
//! entry point that pairs a device with a frozen view of the plan registry.

use std::sync::Arc;

pub use {primkit_core, primkit_kernels, primkit_layout, primkit_planner};

pub use primkit_core::{AppConfig, PlannerConfig, PrimError, Result, Status};
pub use primkit_kernels::{Dispatcher, Engine, KernelDescriptor, PlanSource, PrimitiveDesc, SimEngine};
pub use primkit_layout::{Attributes, DataType, HwDescriptor, OpKind, Problem, TensorMeta};
pub use primkit_planner::{PlanRegistry, RegistrySnapshot};

/// Device plus dispatcher; tuned plans are read from the registry snapshot
/// taken when the engine was created.
#[derive(Clone)]
pub struct PrimitiveEngine {
    engine: Arc<dyn Engine>,
    dispatcher: Dispatcher,
    snapshot: Arc<RegistrySnapshot>,
}

impl PrimitiveEngine {
    pub fn new(engine: Arc<dyn Engine>, registry: &PlanRegistry) -> Self {
        let snapshot = registry.snapshot();
        Self {
            engine,
            dispatcher: Dispatcher::default().with_plans(snapshot.clone()),
            snapshot,
        }
    }

    /// Engine without tuned plans; JIT entries use their heuristics.
    pub fn untuned(engine: Arc<dyn Engine>) -> Self {
        Self::new(engine, &PlanRegistry::in_memory())
    }

    pub fn hw(&self) -> &HwDescriptor {
        self.engine.hw()
    }

    /// Number of plans visible to this engine.
    pub fn plans(&self) -> usize {
        self.snapshot.len()
    }

    pub fn create_primitive(&self, problem: &Problem) -> Result<PrimitiveDesc> {
        self.dispatcher.dispatch(self.engine.as_ref(), problem)
    }

    /// Dispatch forcing `desc` onto the implementation it names.
    pub fn create_primitive_with(
        &self,
        problem: &Problem,
        desc: &KernelDescriptor,
    ) -> Result<PrimitiveDesc> {
        self.dispatcher
            .dispatch_with(self.engine.as_ref(), problem, Some(desc))
    }
}

impl std::fmt::Debug for PrimitiveEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveEngine")
            .field("hw", self.engine.hw())
            .field("plans", &self.snapshot.len())
            .finish()
    }
}

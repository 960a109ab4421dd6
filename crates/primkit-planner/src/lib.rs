//! Empirical plan selection for JIT kernel descriptors.
//!
//! - [`registry`]: signature-keyed persistent store of winning descriptors
//! - [`problems`]: random problem sets a descriptor accepts
//! - [`bench`]: device session and per-descriptor timing
//! - [`planner`]: candidate expansion, selection and registry upsert

pub mod bench;
pub mod planner;
pub mod problems;
pub mod registry;
pub mod signature;

use primkit_kernels::Dispatcher;

pub use bench::{BenchData, BenchManager, BenchRow, BenchRunner};
pub use planner::{
    expand_candidates, plan_or_reuse, prepare_plan_registry_entry, select_best, PlanOutcome,
};
pub use problems::BenchInputParams;
pub use registry::{PlanRegistry, PlanRegistryEntry, RegistrySnapshot, REGISTRY_HEADER};
pub use signature::{signature, signature_key, SIGNATURE_LEN};

/// Default dispatcher reading tuned plans from a snapshot of `registry`.
pub fn dispatcher_for(registry: &PlanRegistry) -> Dispatcher {
    Dispatcher::default().with_plans(registry.snapshot())
}

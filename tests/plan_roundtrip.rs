//! Plan roundtrip: registry miss → plan → save → reopen → registry hit.

use std::path::Path;
use std::sync::Arc;

use primkit::primkit_kernels::jit_template;
use primkit::primkit_planner::{
    plan_or_reuse, prepare_plan_registry_entry, BenchInputParams, BenchManager,
};
use primkit::{
    Engine, HwDescriptor, OpKind, PlanRegistry, PlanSource, PlannerConfig, PrimitiveEngine,
    SimEngine,
};
use tempfile::TempDir;

fn hw() -> HwDescriptor {
    HwDescriptor::preset("xe_hpc").unwrap()
}

fn device() -> Arc<dyn Engine> {
    Arc::new(SimEngine::new(hw()))
}

fn config() -> PlannerConfig {
    PlannerConfig {
        nprbs: 4,
        max_candidates: 6,
        ..PlannerConfig::default()
    }
}

fn params(op: OpKind) -> BenchInputParams {
    BenchInputParams::new(jit_template(op, &hw()).unwrap(), hw(), 4, 11)
}

fn plan_into(path: &Path, op: OpKind) -> primkit::primkit_planner::PlanOutcome {
    let registry = PlanRegistry::open(path).unwrap();
    let mut mgr = BenchManager::new(device(), config(), registry).unwrap();
    let outcome = prepare_plan_registry_entry(&mut mgr, &params(op)).unwrap();
    mgr.into_registry().save().unwrap();
    outcome
}

#[test]
fn test_miss_then_plan_then_hit() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("plans.txt");
    let problem = params(OpKind::Matmul).problems().unwrap().remove(0);

    let cold = PrimitiveEngine::new(device(), &PlanRegistry::open(&path).unwrap());
    assert_eq!(cold.plans(), 0);
    let pd = cold.create_primitive(&problem).unwrap();
    assert_eq!(pd.impl_name, "gemm_jit");
    assert_eq!(pd.plan_source, PlanSource::Heuristic);

    let outcome = plan_into(&path, OpKind::Matmul);
    assert!(!outcome.reused);

    let reopened = PlanRegistry::open(&path).unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened.get(&outcome.entry.sig), Some(&outcome.entry));

    let warm = PrimitiveEngine::new(device(), &reopened);
    let pd = warm.create_primitive(&problem).unwrap();
    assert_eq!(pd.impl_name, "gemm_jit");
    assert_eq!(pd.plan_source, PlanSource::Registry);
    assert_eq!(pd.desc.as_ref(), Some(&outcome.entry.desc));
}

#[test]
fn test_rerun_skips_registered_signature() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("plans.txt");
    let first = plan_into(&path, OpKind::Reorder);

    let mut mgr = BenchManager::new(device(), config(), PlanRegistry::open(&path).unwrap()).unwrap();
    let second = plan_or_reuse(&mut mgr, &params(OpKind::Reorder)).unwrap();
    assert!(second.reused);
    assert_eq!(second.benched, 0);
    assert_eq!(second.entry, first.entry);
}

#[test]
fn test_plans_for_different_ops_coexist() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("plans.txt");
    let mm = plan_into(&path, OpKind::Matmul);
    let pool = plan_into(&path, OpKind::Pooling);
    assert_ne!(mm.entry.sig, pool.entry.sig);

    let reg = PlanRegistry::open(&path).unwrap();
    assert_eq!(reg.len(), 2);
    assert!(reg.get(&mm.entry.sig).is_some());
    assert!(reg.get(&pool.entry.sig).is_some());
}

#[test]
fn test_engine_snapshot_is_frozen() {
    let registry = PlanRegistry::in_memory();
    let engine = PrimitiveEngine::new(device(), &registry);
    let problem = params(OpKind::Matmul).problems().unwrap().remove(0);

    let mut mgr = BenchManager::new(device(), config(), registry).unwrap();
    prepare_plan_registry_entry(&mut mgr, &params(OpKind::Matmul)).unwrap();
    assert_eq!(mgr.registry().len(), 1);

    assert_eq!(engine.plans(), 0);
    let pd = engine.create_primitive(&problem).unwrap();
    assert_eq!(pd.plan_source, PlanSource::Heuristic);

    let refreshed = PrimitiveEngine::new(device(), mgr.registry());
    assert_eq!(refreshed.plans(), 1);
    let pd = refreshed.create_primitive(&problem).unwrap();
    assert_eq!(pd.plan_source, PlanSource::Registry);
}

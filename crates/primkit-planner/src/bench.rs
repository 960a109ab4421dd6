//! Bench harness: time one kernel descriptor over a problem set.
//!
//! A [`BenchManager`] owns the device side of a planner session (engine,
//! one stream, dispatcher, registry handle). A [`BenchRunner`] borrows it
//! to measure descriptors over a shared problem set:
//!
//! - each problem is instantiated through the dispatcher with the
//!   descriptor as override, so only the implementation it names can run;
//! - one warm-up submission, then `timed_iters` timed ones;
//! - a measurement whose stddev exceeds `variance_gate` of the mean is
//!   repeated up to `max_retries` times, then the row is invalid;
//! - at `invalid_ratio` invalid rows the whole bench is unreliable and
//!   scores `+inf`.

use std::sync::Arc;
use std::time::Duration;

use primkit_core::{PlannerConfig, PrimError, Result};
use primkit_kernels::{Dispatcher, Engine, KernelDescriptor, Stream};
use primkit_layout::{HwDescriptor, Problem};
use tracing::{debug, warn};

use crate::registry::PlanRegistry;

/// Device-side state of one planner session.
pub struct BenchManager {
    engine: Arc<dyn Engine>,
    stream: Box<dyn Stream>,
    hw: HwDescriptor,
    dispatcher: Dispatcher,
    config: PlannerConfig,
    registry: PlanRegistry,
}

impl BenchManager {
    pub fn new(engine: Arc<dyn Engine>, config: PlannerConfig, registry: PlanRegistry) -> Result<Self> {
        config.validate()?;
        let stream = engine.create_stream()?;
        let hw = engine.hw().clone();
        debug!(hw = %hw, "bench manager created");
        Ok(Self {
            engine,
            stream,
            hw,
            dispatcher: Dispatcher::default(),
            config,
            registry,
        })
    }

    /// Replaces the dispatcher (custom catalogues in tests and tools).
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn hw(&self) -> &HwDescriptor {
        &self.hw
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn registry(&self) -> &PlanRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PlanRegistry {
        &mut self.registry
    }

    /// Hands the registry back, releasing the device.
    pub fn into_registry(mut self) -> PlanRegistry {
        std::mem::take(&mut self.registry)
    }
}

impl Drop for BenchManager {
    fn drop(&mut self) {
        debug!(hw = %self.hw, "bench manager released");
    }
}

/// Measurement of one problem.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchRow {
    pub problem: usize,
    pub mean_ns: f64,
    pub min_ns: f64,
    pub stddev_ns: f64,
    pub flops: f64,
    /// Why the row does not count, if it does not.
    pub invalid: Option<String>,
}

impl BenchRow {
    fn invalid(problem: usize, reason: String) -> Self {
        Self {
            problem,
            mean_ns: f64::INFINITY,
            min_ns: f64::INFINITY,
            stddev_ns: 0.0,
            flops: 0.0,
            invalid: Some(reason),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.invalid.is_none()
    }
}

/// Aggregate of one descriptor over the problem set.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchData {
    pub desc: KernelDescriptor,
    pub rows: Vec<BenchRow>,
    /// Mean latency over valid rows; `+inf` when unreliable.
    pub score_ns: f64,
    pub min_ns: f64,
    pub gflops: f64,
    pub unreliable: Option<String>,
}

impl BenchData {
    pub fn is_reliable(&self) -> bool {
        self.unreliable.is_none() && self.score_ns.is_finite()
    }

    pub fn invalid_rows(&self) -> usize {
        self.rows.iter().filter(|r| !r.is_valid()).count()
    }

    /// `BenchUnreliable` error for an unreliable bench.
    pub fn to_error(&self) -> Option<PrimError> {
        self.unreliable.as_ref().map(|reason| PrimError::BenchUnreliable {
            reason: format!("{}: {reason}", self.desc.kernel),
        })
    }
}

fn stats(samples: &[f64]) -> (f64, f64, f64) {
    let n = samples.len().max(1) as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    (mean, min, var.sqrt())
}

fn nanos(d: Duration) -> f64 {
    d.as_secs_f64() * 1e9
}

pub struct BenchRunner<'a> {
    mgr: &'a mut BenchManager,
    problems: &'a [Problem],
}

impl<'a> BenchRunner<'a> {
    pub fn new(mgr: &'a mut BenchManager, problems: &'a [Problem]) -> Self {
        Self { mgr, problems }
    }

    pub fn bench(&mut self, desc: &KernelDescriptor) -> BenchData {
        let rows: Vec<BenchRow> = (0..self.problems.len())
            .map(|i| match self.bench_one(i, desc) {
                Ok(row) => row,
                Err(e) => BenchRow::invalid(i, e.to_string()),
            })
            .collect();
        self.aggregate(desc, rows)
    }

    fn bench_one(&mut self, index: usize, desc: &KernelDescriptor) -> Result<BenchRow> {
        let problems = self.problems;
        let problem = &problems[index];
        let mgr = &mut *self.mgr;
        let pd = mgr
            .dispatcher
            .dispatch_with(mgr.engine.as_ref(), problem, Some(desc))?;
        if pd.impl_name != desc.kernel {
            return Err(PrimError::RuntimeError(format!(
                "dispatched to {} instead of {}",
                pd.impl_name, desc.kernel
            )));
        }

        let stream = mgr.stream.as_mut();
        stream.submit(&pd.kernel, problem)?;
        stream.wait()?;

        let cfg = &mgr.config;
        let iters = cfg.timed_iters.max(1);
        let mut last_cv = 0.0;
        for attempt in 0..=cfg.max_retries {
            let mut samples = Vec::with_capacity(iters);
            for _ in 0..iters {
                stream.submit(&pd.kernel, problem)?;
                samples.push(nanos(stream.wait()?));
            }
            let (mean, min, stddev) = stats(&samples);
            last_cv = if mean > 0.0 { stddev / mean } else { 0.0 };
            if last_cv <= cfg.variance_gate {
                return Ok(BenchRow {
                    problem: index,
                    mean_ns: mean,
                    min_ns: min,
                    stddev_ns: stddev,
                    flops: problem.flops(),
                    invalid: None,
                });
            }
            debug!(problem = index, attempt, cv = last_cv, "noisy measurement, repeating");
        }
        Err(PrimError::BenchUnreliable {
            reason: format!(
                "stddev {:.1}% of mean after {} retries",
                last_cv * 100.0,
                cfg.max_retries
            ),
        })
    }

    fn aggregate(&self, desc: &KernelDescriptor, rows: Vec<BenchRow>) -> BenchData {
        let total = rows.len();
        let valid: Vec<&BenchRow> = rows.iter().filter(|r| r.is_valid()).collect();
        let invalid = total - valid.len();
        let ratio = if total == 0 { 1.0 } else { invalid as f64 / total as f64 };

        let unreliable = if total == 0 {
            Some("empty problem set".to_string())
        } else if valid.is_empty() || ratio >= self.mgr.config.invalid_ratio {
            let first = rows.iter().find_map(|r| r.invalid.clone()).unwrap_or_default();
            Some(format!("{invalid}/{total} rows invalid (first: {first})"))
        } else {
            None
        };

        if let Some(reason) = &unreliable {
            warn!(kernel = %desc.kernel, desc = %desc, "candidate rejected: {reason}");
            return BenchData {
                desc: desc.clone(),
                rows,
                score_ns: f64::INFINITY,
                min_ns: f64::INFINITY,
                gflops: 0.0,
                unreliable,
            };
        }

        let n = valid.len() as f64;
        let score_ns = valid.iter().map(|r| r.mean_ns).sum::<f64>() / n;
        let min_ns = valid.iter().map(|r| r.min_ns).fold(f64::INFINITY, f64::min);
        let total_ns: f64 = valid.iter().map(|r| r.mean_ns).sum();
        let total_flops: f64 = valid.iter().map(|r| r.flops).sum();
        let gflops = if total_ns > 0.0 { total_flops / total_ns } else { 0.0 };
        debug!(kernel = %desc.kernel, score_ns, gflops, invalid, "candidate measured");
        BenchData {
            desc: desc.clone(),
            rows,
            score_ns,
            min_ns,
            gflops,
            unreliable: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problems::BenchInputParams;
    use primkit_kernels::{
        jit_template, v_dispatch, ImplEntry, ImplList, InitCtx, KernelBinding, KernelCtx, SimEngine,
    };
    use primkit_layout::{DataType, OpKind, TensorMeta};

    fn manager(engine: SimEngine, config: PlannerConfig) -> BenchManager {
        BenchManager::new(Arc::new(engine), config, PlanRegistry::in_memory()).unwrap()
    }

    fn matmul_set(hw: &HwDescriptor, n: usize) -> (KernelDescriptor, Vec<Problem>) {
        let desc = jit_template(OpKind::Matmul, hw).unwrap();
        let probs = BenchInputParams::new(desc.clone(), hw.clone(), n, 11)
            .problems()
            .unwrap();
        (desc, probs)
    }

    fn declines_single_row(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
        v_dispatch!(ctx.problem.src().shape()[0] != 1, InconsistentMds, "m = 1");
        Ok(KernelBinding::new("gemm_jit"))
    }

    fn no_ctx(_: &Problem, _: &KernelBinding, _: &mut KernelCtx) -> Result<()> {
        Ok(())
    }

    /// A gemm catalogue that declines exactly the `m = 1` problem.
    fn picky_manager(hw: &HwDescriptor) -> BenchManager {
        let mut list = ImplList::new();
        list.push(
            OpKind::Matmul,
            hw.family,
            ImplEntry::new("gemm_jit", declines_single_row, no_ctx),
        );
        manager(SimEngine::new(hw.clone()), PlannerConfig::default())
            .with_dispatcher(Dispatcher::new(list))
    }

    fn matmuls(hw: &HwDescriptor, rows: usize) -> Vec<Problem> {
        let md = |s: &[usize]| TensorMeta::plain(s, DataType::F32).unwrap();
        (1..=rows)
            .map(|m| {
                Problem::builder(OpKind::Matmul, hw.clone())
                    .src(md(&[m, 16]))
                    .wei(md(&[16, 16]))
                    .dst(md(&[m, 16]))
                    .build()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_invalid_ratio_at_threshold_is_unreliable() {
        let hw = HwDescriptor::preset("xe_hpc").unwrap();
        let mut mgr = picky_manager(&hw);
        let desc = jit_template(OpKind::Matmul, &hw).unwrap();
        let probs = matmuls(&hw, 10);
        let data = BenchRunner::new(&mut mgr, &probs).bench(&desc);
        assert_eq!(data.invalid_rows(), 1);
        assert!(!data.is_reliable());
        assert_eq!(data.score_ns, f64::INFINITY);
        assert!(data.unreliable.as_deref().is_some_and(|r| r.starts_with("1/10")));
    }

    #[test]
    fn test_invalid_ratio_below_threshold_is_reliable() {
        let hw = HwDescriptor::preset("xe_hpc").unwrap();
        let mut mgr = picky_manager(&hw);
        let desc = jit_template(OpKind::Matmul, &hw).unwrap();
        let probs = matmuls(&hw, 11);
        let data = BenchRunner::new(&mut mgr, &probs).bench(&desc);
        assert_eq!(data.invalid_rows(), 1);
        assert!(data.is_reliable(), "{:?}", data.unreliable);
        assert!(data.score_ns.is_finite());
    }

    #[test]
    fn test_quiet_device_is_reliable() {
        let hw = HwDescriptor::preset("xe_hpc").unwrap();
        let mut mgr = manager(SimEngine::new(hw.clone()), PlannerConfig::default());
        let (desc, probs) = matmul_set(&hw, 12);
        let data = BenchRunner::new(&mut mgr, &probs).bench(&desc);
        assert!(data.is_reliable(), "{:?}", data.unreliable);
        assert_eq!(data.rows.len(), 12);
        assert!(data.score_ns.is_finite() && data.score_ns > 0.0);
        assert!(data.min_ns <= data.score_ns);
        assert!(data.gflops > 0.0);
    }

    #[test]
    fn test_noisy_device_is_unreliable() {
        let hw = HwDescriptor::preset("xe_hpc").unwrap();
        let config = PlannerConfig {
            variance_gate: 0.01,
            max_retries: 1,
            ..PlannerConfig::default()
        };
        let mut mgr = manager(SimEngine::new(hw.clone()).with_noise(0.9, 4), config);
        let (desc, probs) = matmul_set(&hw, 6);
        let data = BenchRunner::new(&mut mgr, &probs).bench(&desc);
        assert!(!data.is_reliable());
        assert_eq!(data.score_ns, f64::INFINITY);
        assert!(matches!(data.to_error(), Some(PrimError::BenchUnreliable { .. })));
    }

    #[test]
    fn test_rejected_descriptor_rows_are_invalid() {
        // No subgroups: the JIT entry declines every problem.
        let hw = HwDescriptor::new(primkit_layout::DeviceFamily::IntelGpu, "gen9", 24, 8);
        let mut mgr = manager(SimEngine::new(hw.clone()), PlannerConfig::default());
        let (desc, probs) = matmul_set(&hw, 5);
        let data = BenchRunner::new(&mut mgr, &probs).bench(&desc);
        assert_eq!(data.invalid_rows(), 5);
        assert!(!data.is_reliable());
    }

    #[test]
    fn test_compile_failure_counts_as_invalid() {
        let hw = HwDescriptor::preset("sm_80").unwrap();
        let engine = SimEngine::new(hw.clone()).with_failing_kernel("gemm_jit");
        let mut mgr = manager(engine, PlannerConfig::default());
        let (desc, probs) = matmul_set(&hw, 3);
        let data = BenchRunner::new(&mut mgr, &probs).bench(&desc);
        assert!(data.rows.iter().all(|r| r.invalid.as_deref().is_some_and(|m| m.contains("failed"))));
    }

    #[test]
    fn test_into_registry_returns_entries() {
        let hw = HwDescriptor::preset("xe_hpc").unwrap();
        let mgr = manager(SimEngine::new(hw), PlannerConfig::default());
        assert!(mgr.into_registry().is_empty());
    }
}

//! Deterministic simulated device.
//!
//! `SimEngine` stands in for a vendor runtime: kernel creation is a pure
//! function of `(name, ctx)`, and stream timings come from a roofline cost
//! model driven by the problem and the tiles frozen in the kernel context.
//! Optional seeded jitter lets the bench variance gate be exercised.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use primkit_core::{PrimError, Result};
use primkit_layout::{DeviceFamily, HwDescriptor, Problem, Tile};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::{Engine, KernelHandle, Stream};
use crate::kernel_ctx::KernelCtx;

/// Kernel option that makes simulated submission fail.
pub const SIM_FAIL_OPTION: &str = "SIM_FAIL";

const LAUNCH_OVERHEAD_NS: f64 = 2_000.0;

#[derive(Debug)]
pub struct SimEngine {
    hw: HwDescriptor,
    noise: f64,
    seed: u64,
    failing: HashSet<String>,
    kernels_created: AtomicUsize,
}

impl SimEngine {
    pub fn new(hw: HwDescriptor) -> Self {
        Self {
            hw,
            noise: 0.0,
            seed: 0,
            failing: HashSet::new(),
            kernels_created: AtomicUsize::new(0),
        }
    }

    /// Relative timing jitter in `[0, 1)`, drawn from a seeded RNG per stream.
    pub fn with_noise(mut self, noise: f64, seed: u64) -> Self {
        self.noise = noise.clamp(0.0, 0.99);
        self.seed = seed;
        self
    }

    /// Makes `create_kernel` fail for `name`.
    pub fn with_failing_kernel(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    pub fn kernels_created(&self) -> usize {
        self.kernels_created.load(Ordering::Relaxed)
    }
}

impl Engine for SimEngine {
    fn hw(&self) -> &HwDescriptor {
        &self.hw
    }

    fn create_kernel(&self, name: &str, ctx: &KernelCtx) -> Result<KernelHandle> {
        if self.failing.contains(name) {
            return Err(PrimError::RuntimeError(format!(
                "compilation of '{name}' failed on {}",
                self.hw
            )));
        }
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        ctx.hash(&mut hasher);
        self.kernels_created.fetch_add(1, Ordering::Relaxed);
        Ok(KernelHandle {
            id: hasher.finish(),
            name: name.to_string(),
            ctx: ctx.clone(),
        })
    }

    fn create_stream(&self) -> Result<Box<dyn Stream>> {
        Ok(Box::new(SimStream {
            hw: self.hw.clone(),
            noise: self.noise,
            rng: StdRng::seed_from_u64(self.seed),
            pending_ns: 0.0,
        }))
    }
}

pub struct SimStream {
    hw: HwDescriptor,
    noise: f64,
    rng: StdRng,
    pending_ns: f64,
}

impl Stream for SimStream {
    fn submit(&mut self, kernel: &KernelHandle, problem: &Problem) -> Result<()> {
        if kernel.ctx.has_option(SIM_FAIL_OPTION) {
            return Err(PrimError::RuntimeError(format!(
                "kernel '{}' faulted",
                kernel.name
            )));
        }
        let mut ns = estimate_ns(&self.hw, &kernel.ctx, problem);
        if self.noise > 0.0 {
            ns *= 1.0 + self.rng.gen_range(-self.noise..self.noise);
        }
        self.pending_ns += ns;
        Ok(())
    }

    fn wait(&mut self) -> Result<Duration> {
        let ns = std::mem::take(&mut self.pending_ns);
        Ok(Duration::from_nanos(ns.round() as u64))
    }
}

/// Roofline estimate adjusted for tail waste, occupancy and register pressure.
pub fn estimate_ns(hw: &HwDescriptor, ctx: &KernelCtx, problem: &Problem) -> f64 {
    let (peak_flops_ns, bw_bytes_ns) = device_rates(hw);
    let iter = ctx.tile("ITER");
    let tg = ctx.tile("TG");
    let wg = iter.mul(&tg);

    let mut tail_eff = 1.0;
    let mut groups = 1.0;
    for d in problem.iter_dims() {
        let t = wg.get(d.letter, 1).min(d.size).max(1);
        let padded = d.size.div_ceil(t) * t;
        tail_eff *= d.size as f64 / padded as f64;
        groups *= d.size.div_ceil(t) as f64;
    }
    let occupancy = (groups / hw.eu_count.max(1) as f64).min(1.0);

    let reg_eff = register_efficiency(&iter, hw.simd as usize);
    let reuse = reuse_efficiency(&iter);
    let compute_eff = (tail_eff * occupancy.max(0.05) * reg_eff * reuse).max(1e-3);

    let jit = ctx.get_int("JIT").unwrap_or(0) != 0;
    let ref_penalty = if jit { 1.0 } else { 8.0 };

    let compute_ns = problem.flops() / (peak_flops_ns * compute_eff) * ref_penalty;
    let memory_ns = problem.bytes() as f64 / bw_bytes_ns;
    LAUNCH_OVERHEAD_NS + compute_ns.max(memory_ns)
}

fn device_rates(hw: &HwDescriptor) -> (f64, f64) {
    let lanes = (hw.eu_count.max(1) * hw.simd.max(1)) as f64;
    match hw.family {
        // (flops per ns, bytes per ns): 2 flops per FMA lane times clock in GHz
        DeviceFamily::Cpu => (lanes * 2.0 * 2.5, 100.0),
        DeviceFamily::IntelGpu => (lanes * 2.0 * 1.5, 1_000.0),
        DeviceFamily::NvidiaGpu => (lanes * 2.0 * 1.4, 1_500.0),
        DeviceFamily::AmdGpu => (lanes * 2.0 * 1.7, 1_600.0),
    }
}

/// Tiles larger than the register file spill.
fn register_efficiency(iter: &Tile, simd: usize) -> f64 {
    let regs = simd.max(1) * 16;
    let elems = iter.elems();
    if elems <= regs {
        1.0
    } else {
        regs as f64 / elems as f64
    }
}

/// Larger square-ish tiles reuse loaded operands better.
fn reuse_efficiency(iter: &Tile) -> f64 {
    let sizes: Vec<f64> = iter.iter().map(|(_, s)| s as f64).collect();
    match sizes.as_slice() {
        [] => 0.25,
        [a] => (a / (a + 1.0)).min(0.5),
        _ => {
            let (a, b) = (sizes[0], sizes[1]);
            let intensity = a * b / (a + b);
            (intensity / (intensity + 2.0)).clamp(0.25, 1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primkit_layout::{DataType, OpKind, TensorMeta};

    fn matmul(m: usize, n: usize, k: usize) -> Problem {
        let md = |s: &[usize]| TensorMeta::plain(s, DataType::F32).unwrap();
        Problem::builder(OpKind::Matmul, HwDescriptor::preset("xe_hpc").unwrap())
            .src(md(&[m, k]))
            .wei(md(&[k, n]))
            .dst(md(&[m, n]))
            .build()
            .unwrap()
    }

    fn ctx(iter: &str, tg: &str) -> KernelCtx {
        let mut c = KernelCtx::new("gemm_jit");
        c.define_int("JIT", 1);
        c.define_tile("ITER", &iter.parse().unwrap());
        c.define_tile("TG", &tg.parse().unwrap());
        c
    }

    #[test]
    fn test_kernel_ids_are_deterministic() {
        let engine = SimEngine::new(HwDescriptor::preset("xe_hpc").unwrap());
        let a = engine.create_kernel("gemm_jit", &ctx("m8n8", "m2n2")).unwrap();
        let b = engine.create_kernel("gemm_jit", &ctx("m8n8", "m2n2")).unwrap();
        let c = engine.create_kernel("gemm_jit", &ctx("m8n16", "m2n2")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.id, c.id);
        assert_eq!(engine.kernels_created(), 3);
    }

    #[test]
    fn test_failing_kernel() {
        let engine = SimEngine::new(HwDescriptor::preset("sm_80").unwrap())
            .with_failing_kernel("gemm_jit");
        let err = engine
            .create_kernel("gemm_jit", &KernelCtx::new("gemm_jit"))
            .unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_timing_without_noise_is_stable() {
        let engine = SimEngine::new(HwDescriptor::preset("xe_hpc").unwrap());
        let kernel = engine.create_kernel("gemm_jit", &ctx("m8n8", "m2n2")).unwrap();
        let mut stream = engine.create_stream().unwrap();
        let p = matmul(512, 512, 512);
        stream.submit(&kernel, &p).unwrap();
        let t1 = stream.wait().unwrap();
        stream.submit(&kernel, &p).unwrap();
        let t2 = stream.wait().unwrap();
        assert_eq!(t1, t2);
        assert!(t1 > Duration::ZERO);
        assert_eq!(stream.wait().unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_reference_kernels_are_slower() {
        let hw = HwDescriptor::preset("xe_hpc").unwrap();
        let p = matmul(1024, 1024, 1024);
        let jit = estimate_ns(&hw, &ctx("m8n8", "m2n2"), &p);
        let mut reference = ctx("m8n8", "m2n2");
        reference.define_int("JIT", 0);
        assert!(estimate_ns(&hw, &reference, &p) > jit);
    }

    #[test]
    fn test_submit_fault() {
        let engine = SimEngine::new(HwDescriptor::preset("xe_hpc").unwrap());
        let mut c = ctx("m8n8", "1");
        c.add_option(SIM_FAIL_OPTION);
        let kernel = engine.create_kernel("gemm_jit", &c).unwrap();
        let mut stream = engine.create_stream().unwrap();
        assert!(stream.submit(&kernel, &matmul(8, 8, 8)).is_err());
    }
}

//! Planner loop: expand a descriptor, bench the candidates, keep the best.

use std::time::Instant;

use primkit_core::{PrimError, Result};
use primkit_kernels::KernelDescriptor;
use primkit_layout::Tile;
use tracing::{debug, info, warn};

use crate::bench::{BenchData, BenchManager, BenchRunner};
use crate::problems::BenchInputParams;
use crate::registry::{now_unix, PlanRegistryEntry};
use crate::signature::signature;

/// Largest per-axis iteration tile the expansion proposes.
pub const ITER_TILE_CAP: usize = 64;

/// Result of one planner session.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub entry: PlanRegistryEntry,
    /// The registry already held a plan; nothing was benched.
    pub reused: bool,
    pub benched: usize,
    pub rejected: usize,
    /// The wall-clock budget ran out before every candidate was benched.
    pub budget_expired: bool,
}

fn pow2_between(lo: usize, hi: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut v = 1;
    while v <= hi {
        if v >= lo {
            out.push(v);
        }
        v *= 2;
    }
    out
}

fn log_distance(tile: &Tile, base: &Tile) -> f64 {
    tile.letters()
        .chain(base.letters())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .map(|l| {
            let (a, b) = (tile.get(l, 1) as f64, base.get(l, 1) as f64);
            (a.log2() - b.log2()).abs()
        })
        .sum()
}

/// Per-axis options: `(letter, sizes)`.
fn axis_options(base: &Tile, lo_div: usize, hi_mul: usize, cap: usize) -> Vec<(char, Vec<usize>)> {
    base.iter()
        .map(|(l, size)| {
            let hi = (size * hi_mul).min(cap.max(size));
            let mut opts = pow2_between((size / lo_div).max(1), hi);
            if !opts.contains(&size) {
                opts.push(size);
                opts.sort_unstable();
            }
            (l, opts)
        })
        .collect()
}

fn cartesian(axes: &[(char, Vec<usize>)]) -> Vec<Tile> {
    axes.iter().fold(vec![Tile::new()], |acc, (l, opts)| {
        acc.iter()
            .flat_map(|t| opts.iter().map(move |&v| t.clone().with(*l, v)))
            .collect()
    })
}

/// Candidate descriptors around `base`, nearest first, at most `max` of them.
///
/// Iteration tiles range over powers of two in `[base/4, base*4]` capped at
/// [`ITER_TILE_CAP`]; thread-group tiles over powers of two in `[1, base*2]`.
/// Every other field, requirements included, is copied from `base`.
pub fn expand_candidates(base: &KernelDescriptor, max: usize) -> Vec<KernelDescriptor> {
    let iters = cartesian(&axis_options(&base.iter_tile, 4, 4, ITER_TILE_CAP));
    let tgs = cartesian(&axis_options(&base.thread_group_tile, usize::MAX, 2, usize::MAX));
    let mut out: Vec<(f64, KernelDescriptor)> = iters
        .iter()
        .flat_map(|it| {
            tgs.iter().map(move |tg| {
                let mut d = base.clone();
                d.iter_tile = it.clone();
                d.thread_group_tile = tg.clone();
                let dist = log_distance(it, &base.iter_tile)
                    + log_distance(tg, &base.thread_group_tile);
                (dist, d)
            })
        })
        .collect();
    out.sort_by(|(da, a), (db, b)| {
        da.total_cmp(db)
            .then_with(|| a.fingerprint().cmp(&b.fingerprint()))
    });
    out.dedup_by(|(_, a), (_, b)| a == b);
    out.truncate(max.max(1));
    out.into_iter().map(|(_, d)| d).collect()
}

/// Picks the winner among benched candidates.
///
/// Unreliable results are ignored. Every reliable score within `tol` of the
/// fastest one counts as tied; the tie goes to the smallest thread-group
/// tile, then to the smallest fingerprint. The result does not depend on the
/// order of `results`.
pub fn select_best(results: &[BenchData], tol: f64) -> Option<&BenchData> {
    let reliable = || results.iter().filter(|d| d.is_reliable());
    let fastest = reliable().map(|d| d.score_ns).min_by(f64::total_cmp)?;
    let cutoff = fastest + tol * fastest;
    reliable()
        .filter(|d| d.score_ns <= cutoff)
        .min_by(|a, b| {
            a.desc
                .thread_group_tile
                .elems()
                .cmp(&b.desc.thread_group_tile.elems())
                .then_with(|| a.desc.fingerprint().cmp(&b.desc.fingerprint()))
        })
}

/// Benches every candidate of `params.desc` and upserts the winner.
///
/// Fails with `BenchUnreliable` when no candidate produced a reliable score.
pub fn prepare_plan_registry_entry(
    mgr: &mut BenchManager,
    params: &BenchInputParams,
) -> Result<PlanOutcome> {
    let problems = params.problems()?;
    let first = problems
        .first()
        .ok_or_else(|| PrimError::invalid("empty problem set"))?;
    let sig = signature(first);
    let config = mgr.config().clone();
    let candidates = expand_candidates(&params.desc, config.max_candidates);
    info!(
        kernel = %params.desc.kernel,
        candidates = candidates.len(),
        problems = problems.len(),
        "planning {sig}"
    );

    let started = Instant::now();
    let mut runner = BenchRunner::new(mgr, &problems);
    let mut scored = Vec::new();
    let mut benched = 0;
    let mut rejected = 0;
    let mut budget_expired = false;
    for (i, cand) in candidates.iter().enumerate() {
        if let Some(budget) = config.max_wallclock_secs {
            if i > 0 && started.elapsed().as_secs_f64() >= budget {
                warn!(benched, remaining = candidates.len() - i, "wall-clock budget exhausted");
                budget_expired = true;
                break;
            }
        }
        let data = runner.bench(cand);
        benched += 1;
        if !data.is_reliable() {
            rejected += 1;
            continue;
        }
        debug!(iter = %cand.iter_tile, tg = %cand.thread_group_tile, score_ns = data.score_ns, "candidate scored");
        scored.push(data);
    }

    let Some(best) = select_best(&scored, config.tie_tolerance) else {
        return Err(PrimError::BenchUnreliable {
            reason: format!(
                "no viable plan for {} ({rejected} of {benched} candidates rejected)",
                params.desc.kernel
            ),
        });
    };
    let entry = PlanRegistryEntry {
        sig,
        op: best.desc.op,
        desc: best.desc.clone(),
        hw: params.hw.fingerprint(),
        score_ns: best.score_ns,
        gflops: best.gflops,
        seed: params.seed,
        timestamp: now_unix(),
    };
    info!(
        iter = %entry.desc.iter_tile,
        tg = %entry.desc.thread_group_tile,
        score_ns = entry.score_ns,
        gflops = entry.gflops,
        "best plan selected"
    );
    mgr.registry_mut().upsert(entry.clone());
    Ok(PlanOutcome {
        entry,
        reused: false,
        benched,
        rejected,
        budget_expired,
    })
}

/// Like [`prepare_plan_registry_entry`], but returns a stored plan for the
/// same signature and kernel without benching.
pub fn plan_or_reuse(mgr: &mut BenchManager, params: &BenchInputParams) -> Result<PlanOutcome> {
    let single = BenchInputParams {
        nprbs: 1,
        ..params.clone()
    };
    let problems = single.problems()?;
    if let Some(existing) = problems
        .first()
        .and_then(|p| mgr.registry().lookup(p))
        .filter(|e| e.desc.kernel == params.desc.kernel)
    {
        info!(sig = %existing.sig, "plan already registered, skipping");
        return Ok(PlanOutcome {
            entry: existing.clone(),
            reused: true,
            benched: 0,
            rejected: 0,
            budget_expired: false,
        });
    }
    prepare_plan_registry_entry(mgr, params)
}

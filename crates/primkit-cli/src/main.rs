//! Offline planner: benchmarks candidate descriptors for one operation and
//! records the winner in the plan registry.
//!
//! Exit status: 0 on success, 1 on I/O or argument errors, 2 when no
//! candidate produced a reliable measurement.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context};
use clap::Parser;
use colored::Colorize;
use once_cell::sync::OnceCell;
use primkit_core::config::ENV_VERBOSE;
use primkit_core::logging::{init_json_logging, init_logging};
use primkit_core::{AppConfig, PrimError};
use primkit_kernels::{jit_template, SimEngine};
use primkit_layout::{DataType, HwDescriptor, OpKind};
use primkit_planner::{plan_or_reuse, prepare_plan_registry_entry, BenchInputParams, BenchManager, PlanOutcome, PlanRegistry};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "planner")]
#[command(about = "Benchmark JIT kernel descriptors and record the best plan", long_about = None)]
#[command(version)]
struct Cli {
    /// Operation to plan (matmul, conv, pool, reorder, ...)
    op: OpKind,

    /// Random problems per candidate
    #[arg(long)]
    nprbs: Option<usize>,

    /// Wall-clock budget in seconds
    #[arg(long)]
    budget: Option<f64>,

    /// Plan registry file (overrides config and PLAN_REGISTRY_PATH)
    #[arg(long)]
    out: Option<PathBuf>,

    /// Target device: `auto` for the host, a preset id, or a fingerprint
    #[arg(long, default_value = "auto")]
    hw: String,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Problem-set seed
    #[arg(long)]
    seed: Option<u64>,

    /// Source data type of the generated problems
    #[arg(long, default_value = "f32")]
    dt: DataType,

    /// Bench even if the registry already holds a plan
    #[arg(long)]
    force: bool,

    /// Print the winning entry as JSON
    #[arg(long)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

static REGISTRY: OnceCell<Mutex<PlanRegistry>> = OnceCell::new();

/// Process-wide registry; the first path opened wins.
fn registry(path: &Path) -> anyhow::Result<&'static Mutex<PlanRegistry>> {
    let reg = REGISTRY.get_or_try_init(|| PlanRegistry::open(path).map(Mutex::new))?;
    if let Ok(guard) = reg.lock() {
        if guard.path() != Some(path) {
            warn!(
                requested = %path.display(),
                "plan registry already opened at {:?}",
                guard.path()
            );
        }
    }
    Ok(reg)
}

fn resolve_hw(id: &str) -> anyhow::Result<HwDescriptor> {
    if id.eq_ignore_ascii_case("auto") {
        return Ok(HwDescriptor::host());
    }
    HwDescriptor::preset(id)
        .map(Ok)
        .unwrap_or_else(|| HwDescriptor::from_fingerprint(id))
        .map_err(|e| anyhow!("unknown hardware '{id}': {e}"))
}

/// Layered configuration plus the `VERBOSE` value that had to be ignored.
fn load_config(cli: &Cli) -> anyhow::Result<(AppConfig, Option<String>)> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };
    let ignored_verbose = config.apply_env();
    if let Some(n) = cli.nprbs {
        config.planner.nprbs = n;
    }
    if let Some(budget) = cli.budget {
        config.planner.max_wallclock_secs = Some(budget);
    }
    if let Some(seed) = cli.seed {
        config.planner.seed = seed;
    }
    if let Some(out) = &cli.out {
        config.registry.path = out.clone();
    }
    config.verbose = config.verbose.max(cli.verbose.min(3));
    config.validate()?;
    Ok((config, ignored_verbose))
}

fn run(cli: &Cli) -> anyhow::Result<PlanOutcome> {
    let (config, ignored_verbose) = load_config(cli)?;
    if cli.log_json {
        init_json_logging(config.verbose);
    } else {
        init_logging(config.verbose);
    }
    if let Some(raw) = ignored_verbose {
        warn!(value = %raw, "ignoring unparsable {ENV_VERBOSE}");
    }

    let hw = resolve_hw(&cli.hw)?;
    let template = jit_template(cli.op, &hw).ok_or_else(|| PrimError::BenchUnreliable {
        reason: format!("{} has no generated kernel to plan", cli.op),
    })?;
    info!(op = %cli.op, hw = %hw.fingerprint(), "planner session");

    let reg = registry(&config.registry.path)?;
    let mut guard = reg
        .lock()
        .map_err(|_| anyhow!("plan registry lock poisoned"))?;
    let engine = Arc::new(SimEngine::new(hw.clone()));
    let mut mgr = BenchManager::new(engine, config.planner.clone(), std::mem::take(&mut *guard))?;

    let params = BenchInputParams::new(template, hw, config.planner.nprbs, config.planner.seed)
        .with_dtype(cli.dt);
    let outcome = if cli.force {
        prepare_plan_registry_entry(&mut mgr, &params)
    } else {
        plan_or_reuse(&mut mgr, &params)
    };
    *guard = mgr.into_registry();
    let outcome = outcome?;
    if !outcome.reused {
        guard.save()?;
    }
    Ok(outcome)
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<PrimError>() {
        Some(PrimError::BenchUnreliable { .. }) => 2,
        _ => 1,
    }
}

fn report(cli: &Cli, outcome: &PlanOutcome, elapsed: f64) -> anyhow::Result<()> {
    let e = &outcome.entry;
    if cli.json {
        println!("{}", e.to_json()?);
        return Ok(());
    }
    if outcome.reused {
        println!("{} plan already registered for {}", "=".yellow(), e.sig.cyan());
    } else {
        println!(
            "{} planned {} in {:.2}s ({} benched, {} rejected{})",
            "✓".green(),
            e.op.to_string().bold(),
            elapsed,
            outcome.benched,
            outcome.rejected,
            if outcome.budget_expired { ", budget expired" } else { "" }
        );
    }
    println!("  {} {}", "Signature:".cyan(), e.sig);
    println!("  {} {}", "Descriptor:".cyan(), e.desc);
    println!(
        "  {} {:.0} ns, {:.2} GFLOP/s",
        "Score:".cyan(),
        e.score_ns,
        e.gflops
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let start = Instant::now();
    let result = run(&cli).and_then(|outcome| report(&cli, &outcome, start.elapsed().as_secs_f64()));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::from(exit_code(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses_spec_flags() {
        let cli = Cli::try_parse_from([
            "planner", "conv", "--nprbs", "16", "--budget", "2.5", "--hw", "xe_hpc", "--seed", "7",
        ])
        .unwrap();
        assert_eq!(cli.op, OpKind::Convolution);
        assert_eq!(cli.nprbs, Some(16));
        assert_eq!(cli.budget, Some(2.5));
        assert_eq!(cli.dt, DataType::F32);
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        assert!(Cli::try_parse_from(["planner", "fft"]).is_err());
    }

    #[test]
    fn test_resolve_hw() {
        assert_eq!(resolve_hw("sm_80").unwrap(), HwDescriptor::preset("sm_80").unwrap());
        let fp = HwDescriptor::preset("gfx90a").unwrap().fingerprint();
        assert_eq!(resolve_hw(&fp).unwrap().isa, "gfx90a");
        assert!(resolve_hw("nope").is_err());
    }

    #[test]
    fn test_exit_codes() {
        let unreliable = anyhow::Error::from(PrimError::BenchUnreliable { reason: "x".into() });
        assert_eq!(exit_code(&unreliable), 2);
        let io = anyhow::Error::from(PrimError::Io(std::io::Error::other("disk")));
        assert_eq!(exit_code(&io), 1);
    }

    #[test]
    fn test_op_without_jit_kernel_has_no_plan() {
        let cli = Cli::try_parse_from(["planner", "shuffle", "--hw", "xe_hpc"]).unwrap();
        let err = run(&cli).unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn test_run_writes_then_reuses() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("plans.txt");
        let out_arg = out.to_string_lossy().to_string();
        let args = [
            "planner", "matmul", "--nprbs", "4", "--hw", "xe_hpc", "--out", out_arg.as_str(),
        ];
        let first = run(&Cli::try_parse_from(args).unwrap()).unwrap();
        assert!(!first.reused);
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.starts_with(primkit_planner::REGISTRY_HEADER));
        assert!(text.contains(&first.entry.sig));
        let second = run(&Cli::try_parse_from(args).unwrap()).unwrap();
        assert!(second.reused);
    }
}

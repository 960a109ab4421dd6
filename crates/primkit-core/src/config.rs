//! Centralized configuration management with TOML support.
//!
//! Provides structured configs for the planner session and the plan
//! registry, with load/save capabilities and environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PrimError, Result};

/// Environment variable overriding the plan registry location.
pub const ENV_REGISTRY_PATH: &str = "PLAN_REGISTRY_PATH";
/// Environment variable selecting the diagnostic level (0-3).
pub const ENV_VERBOSE: &str = "VERBOSE";

/// Bench and planner-loop tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Number of random problems generated per descriptor.
    pub nprbs: usize,
    /// Maximum accepted stddev / mean ratio of the timed iterations.
    pub variance_gate: f64,
    /// How many times a noisy measurement is repeated before giving up.
    pub max_retries: usize,
    /// Timed iterations per problem (after one warm-up).
    pub timed_iters: usize,
    /// Fraction of failed rows at which a bench is marked unreliable.
    pub invalid_ratio: f64,
    /// Relative latency difference under which candidates are considered tied.
    pub tie_tolerance: f64,
    /// Wall-clock budget for one planner session, in seconds.
    pub max_wallclock_secs: Option<f64>,
    /// Upper bound on the number of candidates expanded from one descriptor.
    pub max_candidates: usize,
    /// Seed for problem-set generation.
    pub seed: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            nprbs: 250,
            variance_gate: 0.20,
            max_retries: 3,
            timed_iters: 5,
            invalid_ratio: 0.10,
            tie_tolerance: 0.03,
            max_wallclock_secs: None,
            max_candidates: 64,
            seed: 0x5eed,
        }
    }
}

impl PlannerConfig {
    /// Validate planner configuration.
    pub fn validate(&self) -> Result<()> {
        if self.nprbs == 0 {
            return Err(PrimError::invalid("nprbs must be > 0"));
        }
        if self.timed_iters < 5 {
            return Err(PrimError::invalid("timed_iters must be >= 5"));
        }
        if !self.variance_gate.is_finite() || self.variance_gate <= 0.0 {
            return Err(PrimError::invalid("variance_gate must be a positive ratio"));
        }
        if !(0.0..=1.0).contains(&self.invalid_ratio) {
            return Err(PrimError::invalid("invalid_ratio must lie in [0, 1]"));
        }
        if !(0.0..1.0).contains(&self.tie_tolerance) {
            return Err(PrimError::invalid("tie_tolerance must lie in [0, 1)"));
        }
        if let Some(budget) = self.max_wallclock_secs {
            if budget.is_nan() || budget <= 0.0 {
                return Err(PrimError::invalid("max_wallclock_secs must be > 0"));
            }
        }
        if self.max_candidates == 0 {
            return Err(PrimError::invalid("max_candidates must be > 0"));
        }
        Ok(())
    }
}

/// Plan registry location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("plan_registry.txt"),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub planner: PlannerConfig,
    pub registry: RegistryConfig,
    /// Diagnostic level 0-3 (warn, info, debug, trace).
    pub verbose: u8,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            planner: PlannerConfig::default(),
            registry: RegistryConfig::default(),
            verbose: 0,
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PrimError::Other(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| PrimError::Other(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Apply `PLAN_REGISTRY_PATH` and `VERBOSE` from the process environment.
    ///
    /// Returns the `VERBOSE` value that was ignored, if any, so the caller
    /// can report it once logging is up.
    pub fn apply_env(&mut self) -> Option<String> {
        let verbose = std::env::var(ENV_VERBOSE).ok();
        self.apply_overrides(
            std::env::var(ENV_REGISTRY_PATH).ok().as_deref(),
            verbose.as_deref(),
        )
        .map(str::to_string)
    }

    /// Apply explicit override values. An unparsable verbosity is ignored
    /// and handed back.
    pub fn apply_overrides<'a>(
        &mut self,
        registry_path: Option<&str>,
        verbose: Option<&'a str>,
    ) -> Option<&'a str> {
        if let Some(path) = registry_path.filter(|p| !p.is_empty()) {
            self.registry.path = PathBuf::from(path);
        }
        match verbose.map(|v| (v, v.trim().parse::<u8>())) {
            Some((_, Ok(level))) => {
                self.verbose = level.min(3);
                None
            }
            Some((raw, Err(_))) => Some(raw),
            None => None,
        }
    }

    /// Validate all sub-configs.
    pub fn validate(&self) -> Result<()> {
        self.planner.validate()?;
        if self.verbose > 3 {
            return Err(PrimError::invalid("verbose must lie in 0..=3"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_are_valid() {
        PlannerConfig::default().validate().unwrap();
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_bench_constants_default() {
        let cfg = PlannerConfig::default();
        assert_eq!(cfg.nprbs, 250);
        assert_eq!(cfg.max_retries, 3);
        assert!((cfg.variance_gate - 0.20).abs() < 1e-12);
        assert!((cfg.invalid_ratio - 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_too_few_iterations_rejected() {
        let cfg = PlannerConfig {
            timed_iters: 3,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = AppConfig::default();
        assert_eq!(cfg.apply_overrides(Some("/tmp/plans.txt"), Some("7")), None);
        assert_eq!(cfg.registry.path, PathBuf::from("/tmp/plans.txt"));
        assert_eq!(cfg.verbose, 3);

        assert_eq!(cfg.apply_overrides(Some(""), Some("loud")), Some("loud"));
        assert_eq!(cfg.registry.path, PathBuf::from("/tmp/plans.txt"));
        assert_eq!(cfg.verbose, 3);
        assert_eq!(cfg.apply_overrides(None, None), None);
    }

    #[test]
    fn test_config_roundtrip() {
        let mut cfg = AppConfig::default();
        cfg.planner.nprbs = 32;
        cfg.planner.max_wallclock_secs = Some(12.5);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        cfg.save(tmp.path()).unwrap();
        let loaded = AppConfig::from_file(tmp.path()).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("verbose = 2\n[planner]\nnprbs = 10\n").unwrap();
        assert_eq!(cfg.verbose, 2);
        assert_eq!(cfg.planner.nprbs, 10);
        assert_eq!(cfg.planner.timed_iters, 5);
    }
}

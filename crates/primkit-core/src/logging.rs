//! Structured logging with tracing.
//!
//! The `VERBOSE` diagnostic level (0-3) selects the default filter;
//! `RUST_LOG` takes precedence when it is set.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directive for a `VERBOSE` level.
pub fn filter_for_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "warn,primkit_kernels=info,primkit_planner=info,planner=info",
        2 => "info,primkit_kernels=debug,primkit_planner=debug,planner=debug",
        _ => "debug,primkit_kernels=trace,primkit_planner=trace,planner=trace",
    }
}

/// Initialize console logging for the given diagnostic level.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(verbose: u8) {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter_for_level(verbose).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}

/// Initialize JSON logging (for planner runs collected by CI).
pub fn init_json_logging(verbose: u8) {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter_for_level(verbose).into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_monotone() {
        assert!(filter_for_level(0).starts_with("warn"));
        assert!(filter_for_level(2).contains("debug"));
        assert_eq!(filter_for_level(3), filter_for_level(9));
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_logging(1);
        init_logging(2);
    }
}

//! Core types and utilities shared across primkit crates.
//!
//! Provides:
//! - Centralized error types via thiserror
//! - Configuration management with TOML support
//! - Logging initialisation via tracing-subscriber

pub mod config;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use config::{AppConfig, PlannerConfig, RegistryConfig};
pub use error::{PrimError, Result, Status, UnsupportedKind};

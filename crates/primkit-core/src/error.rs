//! Centralized error types for primkit.
//!
//! Uses thiserror for ergonomic error handling with context. The variants
//! follow the dispatch status taxonomy: dispatch misses are swallowed by the
//! implementation list, validation and runtime failures surface to callers.

use std::path::PathBuf;

use thiserror::Error;

/// Reason an implementation declined a problem during `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnsupportedKind {
    /// Propagation kind not handled by the implementation.
    PropKind,
    /// Data type combination not handled.
    DataType,
    /// Memory descriptors disagree with each other.
    InconsistentMds,
    /// Attribute (scales, zero points, rounding) not handled.
    Attr,
    /// Post-op chain not handled.
    PostOp,
    /// Layout tag not handled.
    Tag,
    /// Device lacks a required extension.
    DeviceExt,
    /// Kernel descriptor requirements are not met by the problem.
    Requirements,
}

impl UnsupportedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PropKind => "bad_prop_kind",
            Self::DataType => "unsupported_dt",
            Self::InconsistentMds => "inconsistent_mds",
            Self::Attr => "unsupported_attr",
            Self::PostOp => "unsupported_post_op",
            Self::Tag => "unsupported_tag",
            Self::DeviceExt => "unsupported_device_ext",
            Self::Requirements => "requirements_unmet",
        }
    }
}

impl std::fmt::Display for UnsupportedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse status code, one per error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Unimplemented,
    InvalidArguments,
    Unsupported(UnsupportedKind),
    RuntimeError,
    OutOfMemory,
    BenchUnreliable,
    RegistryIoError,
}

/// Main error type for primkit operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PrimError {
    /// No implementation in the catalogue accepted the problem.
    #[error("unimplemented: no implementation matched {0}")]
    Unimplemented(String),

    /// Descriptor violates an invariant (rank mismatch, bad mask, ...).
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Per-implementation dispatch predicate failure.
    #[error("{kind}: {reason}")]
    Unsupported {
        kind: UnsupportedKind,
        reason: String,
    },

    /// Kernel creation failed on a matched implementation.
    #[error("runtime error: {0}")]
    RuntimeError(String),

    /// Scratchpad allocation failed.
    #[error("out of memory: requested={requested} bytes, limit={limit} bytes")]
    OutOfMemory { requested: usize, limit: usize },

    /// Benchmark results were too noisy or had too many failed rows.
    #[error("bench unreliable: {reason}")]
    BenchUnreliable { reason: String },

    /// Plan registry persistence failed.
    #[error("plan registry I/O error at {path}: {source}")]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, PrimError>;

impl PrimError {
    pub fn unsupported(kind: UnsupportedKind, reason: impl Into<String>) -> Self {
        PrimError::Unsupported {
            kind,
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        PrimError::InvalidArguments(reason.into())
    }

    /// Status code for this error.
    pub fn status(&self) -> Status {
        match self {
            PrimError::Unimplemented(_) => Status::Unimplemented,
            PrimError::InvalidArguments(_) => Status::InvalidArguments,
            PrimError::Unsupported { kind, .. } => Status::Unsupported(*kind),
            PrimError::RuntimeError(_) => Status::RuntimeError,
            PrimError::OutOfMemory { .. } => Status::OutOfMemory,
            PrimError::BenchUnreliable { .. } => Status::BenchUnreliable,
            PrimError::RegistryIo { .. } => Status::RegistryIoError,
            PrimError::Io(_) | PrimError::Json(_) | PrimError::Toml(_) | PrimError::Other(_) => {
                Status::RuntimeError
            }
        }
    }

    /// Errors the implementation list treats as "advance to the next factory".
    pub fn is_dispatch_miss(&self) -> bool {
        matches!(
            self,
            PrimError::Unsupported { .. } | PrimError::Unimplemented(_)
        )
    }

    /// Errors that end a primitive creation or planner session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PrimError::RuntimeError(_) | PrimError::OutOfMemory { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_display() {
        let err = PrimError::unsupported(UnsupportedKind::DataType, "u8 src");
        assert_eq!(err.to_string(), "unsupported_dt: u8 src");
        assert!(err.is_dispatch_miss());
        assert!(!err.is_terminal());
        assert_eq!(err.status(), Status::Unsupported(UnsupportedKind::DataType));
    }

    #[test]
    fn test_runtime_error_is_terminal() {
        let err = PrimError::RuntimeError("kernel build failed".into());
        assert!(err.is_terminal());
        assert!(!err.is_dispatch_miss());
        assert_eq!(err.status(), Status::RuntimeError);
    }

    #[test]
    fn test_oom_display() {
        let err = PrimError::OutOfMemory {
            requested: 4096,
            limit: 1024,
        };
        assert!(err.to_string().contains("requested=4096"));
        assert_eq!(err.status(), Status::OutOfMemory);
    }

    #[test]
    fn test_registry_io_keeps_source() {
        let err = PrimError::RegistryIo {
            path: PathBuf::from("/nonexistent/plans.txt"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("/nonexistent/plans.txt"));
        assert!(std::error::Error::source(&err).is_some());
    }
}

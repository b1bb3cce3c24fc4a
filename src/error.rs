//! Error taxonomy for the publish pipeline.
//!
//! Every terminal failure carries a short machine-readable code (for API
//! consumers) plus a human message. Resolver and bundler errors abort a build
//! with no partial artifacts; executor errors carry the captured stderr tail.

use std::time::Duration;
use thiserror::Error;

/// Result type used across the pipeline.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Maximum length of an error message persisted on a job record.
pub const MAX_ERROR_LEN: usize = 500;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// No asynchronous queue backend is configured. Callers should fall back
    /// to the synchronous build path rather than retry.
    #[error("build queue is disabled")]
    QueueDisabled,

    /// Bare specifier not covered by the pin map or allow-list.
    #[error("package '{0}' is not in the import allow-list")]
    NotAllowed(String),

    /// The CDN mirror could not be fetched (non-2xx or unreachable host).
    #[error("failed to fetch '{url}': {reason}")]
    Unreachable { url: String, reason: String },

    /// Bare specifiers survived bundling. Always fatal, never warned-and-shipped.
    #[error("unresolved bare imports remain in bundle output: {}", .0.join(", "))]
    UnresolvedImports(Vec<String>),

    /// Install or build step failed (non-zero exit or spawn error).
    #[error("build failed: {stderr_tail}")]
    BuildFailed { stderr_tail: String },

    /// The wall-clock deadline for install+build expired.
    #[error("build timed out after {0:?}")]
    Timeout(Duration),

    /// A nominally-completed build is missing expected artifacts.
    #[error("expected artifacts missing: {}", .0.join(", "))]
    ArtifactsMissing(Vec<String>),

    /// Per-owner application quota reached (pre-flight, before enqueue).
    #[error("application limit reached ({limit})")]
    MaxApps { limit: usize },

    /// Submitted source contains a known sandbox-escape construct.
    #[error("submitted source contains a forbidden construct: {0}")]
    DangerousPattern(String),

    /// Inline source references a local module that was not provided.
    #[error("unknown local module '{0}'")]
    UnknownLocalModule(String),

    /// Build id failed traversal-safety validation.
    #[error("invalid build id '{0}'")]
    InvalidBuildId(String),

    /// A job/listing record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller is not the owner of the listing.
    #[error("forbidden")]
    Forbidden,

    /// Illegal job state machine transition (terminal states are immutable).
    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueDisabled => "queue_disabled",
            Self::NotAllowed(_) => "not_allowed",
            Self::Unreachable { .. } => "unreachable",
            Self::UnresolvedImports(_) => "unresolved_imports",
            Self::BuildFailed { .. } => "build_failed",
            Self::Timeout(_) => "timeout",
            Self::ArtifactsMissing(_) => "artifacts_missing",
            Self::MaxApps { .. } => "max_apps",
            Self::DangerousPattern(_) => "dangerous_pattern",
            Self::UnknownLocalModule(_) => "unknown_local_module",
            Self::InvalidBuildId(_) => "invalid_build_id",
            Self::NotFound(_) => "not_found",
            Self::Forbidden => "forbidden",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Io(_) => "io_error",
            Self::Json(_) => "serialization_error",
        }
    }

    /// Message suitable for persisting on a job record (capped length).
    pub fn capped_message(&self) -> String {
        let mut msg = self.to_string();
        if msg.len() > MAX_ERROR_LEN {
            let mut cut = MAX_ERROR_LEN;
            while !msg.is_char_boundary(cut) {
                cut -= 1;
            }
            msg.truncate(cut);
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(PipelineError::QueueDisabled.code(), "queue_disabled");
        assert_eq!(
            PipelineError::NotAllowed("lodash".into()).code(),
            "not_allowed"
        );
        assert_eq!(
            PipelineError::Timeout(Duration::from_millis(100)).code(),
            "timeout"
        );
    }

    #[test]
    fn test_capped_message_truncates() {
        let err = PipelineError::BuildFailed {
            stderr_tail: "x".repeat(4000),
        };
        assert!(err.capped_message().len() <= MAX_ERROR_LEN);
    }

    #[test]
    fn test_capped_message_respects_char_boundaries() {
        let err = PipelineError::BuildFailed {
            stderr_tail: "é".repeat(1000),
        };
        let msg = err.capped_message();
        assert!(msg.len() <= MAX_ERROR_LEN);
        // Must still be valid UTF-8 after the cut
        assert!(msg.chars().count() > 0);
    }
}

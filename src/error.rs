//! Error taxonomy for the map-reduce orchestrator.
//!
//! Library code returns [`QaError`]. Per-document failures in the map stage
//! (`ModelTimeout`, `ModelError`, `MalformedOutput`) are folded into failed
//! [`AnswerRecord`](crate::models::AnswerRecord)s by the worker and never abort
//! a run; everything else propagates to the caller with enough context
//! (run ID, path, template name) to retry.
//!
//! The CLI wraps these in `anyhow` and uses [`QaError::exit_code`] to give
//! each failure kind its own process exit status.

use std::path::PathBuf;

use crate::templates::Role;

/// Top-level error type for all orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum QaError {
    /// The template name is not registered for the requested role.
    #[error("unknown {role} template '{name}' (available: {})", available.join(", "))]
    UnknownTemplate {
        role: Role,
        name: String,
        available: Vec<String>,
    },

    /// A template failed placeholder validation when it was registered.
    #[error("invalid template '{name}': {message}")]
    TemplateInvalid { name: String, message: String },

    /// The inference endpoint could not be reached, or the model is not present.
    #[error("model endpoint unavailable at {url}: {reason}")]
    ModelUnavailable { url: String, reason: String },

    /// A generation call exceeded its timeout.
    #[error("model '{model}' timed out after {timeout_secs}s")]
    ModelTimeout { model: String, timeout_secs: u64 },

    /// Non-2xx or malformed response from the endpoint.
    #[error("model '{model}' failed: {message}")]
    ModelError { model: String, message: String },

    /// Structured output requested but the model output did not parse.
    #[error("malformed structured output: {reason}")]
    MalformedOutput { reason: String },

    /// Every per-document record of the run failed; nothing to reduce.
    #[error("run {run_id} has no usable records ({failed} failed)")]
    NoUsableRecords { run_id: String, failed: usize },

    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("run already exists: {run_id}")]
    RunExists { run_id: String },

    #[error("invalid run id '{run_id}'")]
    InvalidRunId { run_id: String },

    /// The requested operation is not allowed from the run's current status.
    #[error("run {run_id} is '{status}', refusing to continue (use --force to override)")]
    InvalidRunState { run_id: String, status: String },

    #[error("no documents found under {}", root.display())]
    EmptyCorpus { root: PathBuf },

    /// Reading or writing run storage failed.
    #[error("storage failure at {}: {source}", path.display())]
    StorageFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {message}")]
    Config { message: String },
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, QaError>;

impl QaError {
    /// Wrap an I/O error with the path it happened at.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StorageFailure {
            path: path.into(),
            source,
        }
    }

    /// Build a storage failure from a serialization problem.
    pub fn corrupt(path: impl Into<PathBuf>, err: serde_json::Error) -> Self {
        Self::StorageFailure {
            path: path.into(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Stable snake_case identifier, stored in failed records and printed by the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            QaError::UnknownTemplate { .. } => "unknown_template",
            QaError::TemplateInvalid { .. } => "template_invalid",
            QaError::ModelUnavailable { .. } => "model_unavailable",
            QaError::ModelTimeout { .. } => "model_timeout",
            QaError::ModelError { .. } => "model_error",
            QaError::MalformedOutput { .. } => "malformed_output",
            QaError::NoUsableRecords { .. } => "no_usable_records",
            QaError::RunNotFound { .. } => "run_not_found",
            QaError::RunExists { .. } => "run_exists",
            QaError::InvalidRunId { .. } => "invalid_run_id",
            QaError::InvalidRunState { .. } => "invalid_run_state",
            QaError::EmptyCorpus { .. } => "empty_corpus",
            QaError::StorageFailure { .. } => "storage_failure",
            QaError::Config { .. } => "config",
        }
    }

    /// Process exit code for this failure kind. `1` is reserved for
    /// errors that are not a `QaError`.
    pub fn exit_code(&self) -> u8 {
        match self {
            QaError::Config { .. } => 2,
            QaError::UnknownTemplate { .. } | QaError::TemplateInvalid { .. } => 3,
            QaError::ModelUnavailable { .. } => 4,
            QaError::ModelTimeout { .. } => 5,
            QaError::ModelError { .. } => 6,
            QaError::MalformedOutput { .. } => 7,
            QaError::NoUsableRecords { .. } => 8,
            QaError::RunNotFound { .. } => 9,
            QaError::RunExists { .. } | QaError::InvalidRunId { .. } => 10,
            QaError::InvalidRunState { .. } => 11,
            QaError::EmptyCorpus { .. } => 12,
            QaError::StorageFailure { .. } => 13,
        }
    }

    /// Exit code for a kind string stored in a failed record.
    pub fn exit_code_for_kind(kind: &str) -> u8 {
        match kind {
            "model_unavailable" => 4,
            "model_timeout" => 5,
            "model_error" => 6,
            "malformed_output" => 7,
            "storage_failure" => 13,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_template_lists_alternatives() {
        let err = QaError::UnknownTemplate {
            role: Role::Aggregate,
            name: "nope".into(),
            available: vec!["consensus".into(), "compare".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("aggregate template 'nope'"));
        assert!(msg.contains("consensus, compare"));
        assert_eq!(err.kind(), "unknown_template");
    }

    #[test]
    fn exit_codes_distinguish_model_failures() {
        let timeout = QaError::ModelTimeout {
            model: "m".into(),
            timeout_secs: 1,
        };
        let unavailable = QaError::ModelUnavailable {
            url: "http://x".into(),
            reason: "refused".into(),
        };
        assert_ne!(timeout.exit_code(), unavailable.exit_code());
        assert_eq!(QaError::exit_code_for_kind(timeout.kind()), timeout.exit_code());
    }
}

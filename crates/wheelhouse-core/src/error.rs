//! Error taxonomy for wheelhouse.
//!
//! [`StageError`] is local to one job: every variant is fatal to the job
//! that produced it and to nothing else. [`WheelhouseError`] covers the
//! surrounding plumbing (configuration, matrix validation, IO).

use crate::matrix::Platform;

/// Errors raised by a single pipeline stage of one job.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Dependency resolution or installation failed.
    #[error("dependency resolution failed at {step}: {reason}")]
    Dependency { step: String, reason: String },

    /// A build sub-stage (compile or packaging) failed.
    #[error("build failed at sub-stage {sub_stage}: {reason}")]
    Build { sub_stage: String, reason: String },

    /// The static-analysis gate for the job's platform did not pass.
    #[error("lint gate failed for {platform}: {reason}")]
    Lint { platform: Platform, reason: String },

    /// The test suite ran and reported failures.
    #[error("test suite failed ({failed} failure(s)): {summary}")]
    TestFailure { failed: usize, summary: String },

    /// The build reported success but no artifact matched the job's patterns.
    #[error("no artifacts collected from {searched}")]
    Collection { searched: String },

    /// Credential or network failure while publishing.
    #[error("publication step {action} failed: {reason}")]
    Publish { action: String, reason: String },

    /// The event this job belongs to was cancelled.
    #[error("cancelled before stage {stage} completed")]
    Cancelled { stage: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    /// Short machine-readable class name, used in event logs and reports.
    pub fn class(&self) -> &'static str {
        match self {
            StageError::Dependency { .. } => "dependency_error",
            StageError::Build { .. } => "build_error",
            StageError::Lint { .. } => "lint_error",
            StageError::TestFailure { .. } => "test_failure",
            StageError::Collection { .. } => "collection_error",
            StageError::Publish { .. } => "publish_error",
            StageError::Cancelled { .. } => "cancelled",
            StageError::Io(_) => "io_error",
        }
    }
}

/// Result type for stage execution.
pub type StageResult<T> = std::result::Result<T, StageError>;

/// Errors from configuration, matrix validation and orchestration plumbing.
#[derive(Debug, thiserror::Error)]
pub enum WheelhouseError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid matrix: {0}")]
    InvalidMatrix(String),

    #[error("unknown trigger event: {0}")]
    UnknownEvent(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for wheelhouse plumbing.
pub type Result<T> = std::result::Result<T, WheelhouseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_classes_are_distinct() {
        let errors = [
            StageError::Dependency {
                step: "pip".into(),
                reason: "x".into(),
            },
            StageError::Build {
                sub_stage: "build_ext".into(),
                reason: "x".into(),
            },
            StageError::Lint {
                platform: Platform::Linux,
                reason: "x".into(),
            },
            StageError::TestFailure {
                failed: 1,
                summary: "x".into(),
            },
            StageError::Collection {
                searched: "dist".into(),
            },
            StageError::Publish {
                action: "publish_index".into(),
                reason: "x".into(),
            },
            StageError::Cancelled {
                stage: "build".into(),
            },
        ];
        let classes: std::collections::HashSet<_> = errors.iter().map(|e| e.class()).collect();
        assert_eq!(classes.len(), errors.len());
    }

    #[test]
    fn test_build_error_names_sub_stage() {
        let err = StageError::Build {
            sub_stage: "build_ext".to_string(),
            reason: "exit code 1".to_string(),
        };
        assert!(err.to_string().contains("build_ext"));
        assert!(err.to_string().contains("exit code 1"));
    }

    #[test]
    fn test_wheelhouse_error_display() {
        let err = WheelhouseError::InvalidMatrix("no platforms".to_string());
        assert!(err.to_string().contains("invalid matrix"));
    }
}

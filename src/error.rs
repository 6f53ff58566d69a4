//! Error Types
//!
//! Configuration problems are fatal and surface before any work unit runs.
//! Everything that goes wrong while a node executes is recorded against
//! that node instead (see [`crate::execution::report`]).

use std::io;

use thiserror::Error;

/// Wiring problems in a pipeline definition, reported at construction time.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Task '{task}' references undeclared upstream task '{upstream}'")]
    UnknownUpstream { task: String, upstream: String },

    #[error("Task '{0}' needs an upstream task")]
    MissingUpstream(String),

    #[error("Originate task '{0}' cannot have an upstream task")]
    OriginateWithUpstream(String),

    #[error("Task '{task}' is missing its {field}")]
    MissingField { task: String, field: &'static str },

    #[error("Duplicate task name: '{0}'")]
    DuplicateTask(String),

    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Template '{template}' references unknown capture '{name}'")]
    UnknownCapture { template: String, name: String },

    #[error("Template '{0}' has an unterminated placeholder")]
    UnterminatedPlaceholder(String),

    #[error("Merge task '{task}' output '{template}' cannot use per-file captures")]
    MergeCapture { task: String, template: String },

    #[error("Output '{path}' is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        path: String,
        first: String,
        second: String,
    },

    #[error("No stage registered for task '{0}'")]
    UnknownStage(String),

    #[error("Unknown task: '{0}'")]
    UnknownTask(String),

    #[error("Task '{task}': command uses unknown placeholder '{{{name}}}'")]
    UnknownPlaceholder { task: String, name: String },

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse pipeline YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Failure of a stage to build its work unit for one node.
#[derive(Error, Debug)]
pub enum StageError {
    /// Auxiliary data the stage needs for this node is absent.
    #[error("missing data: {0}")]
    MissingData(String),

    #[error("{0}")]
    Template(String),
}

/// Failures talking to a job-execution backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("submission of '{stage}' failed: {source}")]
    Submit {
        stage: String,
        #[source]
        source: io::Error,
    },

    #[error("unknown job handle '{0}'")]
    UnknownJob(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Top-level errors for a pipeline invocation.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("Failed to write run report: {0}")]
    Report(#[from] serde_json::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_upstream_message() {
        let err = ConfigError::UnknownUpstream {
            task: "align".to_string(),
            upstream: "validate".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Task 'align' references undeclared upstream task 'validate'"
        );
    }

    #[test]
    fn test_unknown_placeholder_message() {
        let err = ConfigError::UnknownPlaceholder {
            task: "fastq2bam".to_string(),
            name: "sampel".to_string(),
        };
        assert!(err.to_string().contains("{sampel}"));
    }

    #[test]
    fn test_config_error_converts_to_pipeline_error() {
        let err: PipelineError = ConfigError::DuplicateTask("x".to_string()).into();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}

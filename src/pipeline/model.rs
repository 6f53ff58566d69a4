//! Pipeline Data Model
//!
//! Declarative task definitions. A [`PipelineDef`] is an ordered list of
//! [`TaskSpec`]s; a task may only name an upstream task that was declared
//! before it, which keeps the task graph acyclic by construction.
//!
//! # Example
//!
//! ```
//! use fastflow::pipeline::{PipelineDef, TaskSpec};
//!
//! let mut pipeline = PipelineDef::new("fastq2bam");
//! pipeline.add(TaskSpec::originate("original_files")).unwrap();
//! pipeline
//!     .add(
//!         TaskSpec::transform(
//!             "fastq2bam",
//!             "original_files",
//!             r"(?P<path>.+)/(?P<sample>[a-zA-Z0-9]+)_R1.fastq.gz",
//!             "{path}/{sample}.bam",
//!         )
//!         .unwrap()
//!         .with_companion("{path}/{sample}_R2.fastq.gz")
//!         .unwrap()
//!         .with_extra("{sample}")
//!         .unwrap(),
//!     )
//!     .unwrap();
//!
//! assert_eq!(pipeline.len(), 2);
//! ```

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use super::pattern::{Pattern, Template};
use crate::error::ConfigError;

/// How a task instantiates nodes from its upstream outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Graph root: one node per literal input file.
    Originate,
    /// One node per matching upstream output.
    Transform,
    /// One node aggregating every matching upstream output.
    Merge,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Originate => "originate",
            Self::Transform => "transform",
            Self::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// Immutable definition of one pipeline task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub kind: TaskKind,
    pub upstream: Option<String>,
    /// Filter applied to each upstream output. `None` accepts every output
    /// (only allowed for merge tasks).
    pub input_pattern: Option<Pattern>,
    pub companions: Vec<Template>,
    pub extras: Vec<Template>,
    /// `None` only for originate tasks, whose output is the input file.
    pub output: Option<Template>,
}

impl TaskSpec {
    pub fn originate(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            kind: TaskKind::Originate,
            upstream: None,
            input_pattern: None,
            companions: Vec::new(),
            extras: Vec::new(),
            output: None,
        }
    }

    /// Declares a one-to-one task. Every placeholder in `output` must be a
    /// capture group of `pattern`.
    pub fn transform(
        name: impl Into<String>,
        upstream: impl Into<String>,
        pattern: &str,
        output: &str,
    ) -> Result<Self, ConfigError> {
        let name = name.into().trim().to_string();
        let pattern = Pattern::new(pattern)?;
        let output = Template::parse(output)?;
        output.check_against(&pattern)?;

        Ok(Self {
            name,
            kind: TaskKind::Transform,
            upstream: Some(upstream.into()),
            input_pattern: Some(pattern),
            companions: Vec::new(),
            extras: Vec::new(),
            output: Some(output),
        })
    }

    /// Declares a many-to-one task. The output is fixed: it cannot depend on
    /// the captures of any single input.
    pub fn merge(
        name: impl Into<String>,
        upstream: impl Into<String>,
        pattern: Option<&str>,
        output: &str,
    ) -> Result<Self, ConfigError> {
        let name = name.into().trim().to_string();
        let pattern = pattern.map(Pattern::new).transpose()?;
        let output = Template::parse(output)?;
        if output.has_placeholders() {
            return Err(ConfigError::MergeCapture {
                task: name,
                template: output.as_str().to_string(),
            });
        }

        Ok(Self {
            name,
            kind: TaskKind::Merge,
            upstream: Some(upstream.into()),
            input_pattern: pattern,
            companions: Vec::new(),
            extras: Vec::new(),
            output: Some(output),
        })
    }

    /// Adds a companion input rendered from the input's captures.
    pub fn with_companion(mut self, template: &str) -> Result<Self, ConfigError> {
        let template = self.checked_template(template)?;
        self.companions.push(template);
        Ok(self)
    }

    /// Adds an extra (non-file) parameter rendered from the input's captures.
    pub fn with_extra(mut self, template: &str) -> Result<Self, ConfigError> {
        let template = self.checked_template(template)?;
        self.extras.push(template);
        Ok(self)
    }

    fn checked_template(&self, source: &str) -> Result<Template, ConfigError> {
        let template = Template::parse(source)?;
        match (self.kind, &self.input_pattern) {
            (TaskKind::Transform, Some(pattern)) => template.check_against(pattern)?,
            _ if template.has_placeholders() => {
                return Err(ConfigError::MergeCapture {
                    task: self.name.clone(),
                    template: source.to_string(),
                })
            }
            _ => {}
        }
        Ok(template)
    }

    pub fn is_originate(&self) -> bool {
        self.kind == TaskKind::Originate
    }
}

/// An ordered, validated set of task declarations.
#[derive(Debug, Clone, Default)]
pub struct PipelineDef {
    pub name: String,
    tasks: Vec<TaskSpec>,
}

impl PipelineDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
        }
    }

    /// Appends a task declaration.
    ///
    /// Fails if the name is taken or the upstream task has not been declared
    /// yet.
    pub fn add(&mut self, spec: TaskSpec) -> Result<(), ConfigError> {
        if self.get(&spec.name).is_some() {
            return Err(ConfigError::DuplicateTask(spec.name));
        }

        match (&spec.kind, &spec.upstream) {
            (TaskKind::Originate, Some(_)) => {
                return Err(ConfigError::OriginateWithUpstream(spec.name));
            }
            (TaskKind::Originate, None) => {}
            (_, None) => return Err(ConfigError::MissingUpstream(spec.name)),
            (_, Some(upstream)) => {
                if self.get(upstream).is_none() {
                    return Err(ConfigError::UnknownUpstream {
                        task: spec.name.clone(),
                        upstream: upstream.clone(),
                    });
                }
            }
        }

        debug!(
            "Declared {} task '{}' (upstream: {:?})",
            spec.kind, spec.name, spec.upstream
        );
        self.tasks.push(spec);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    /// Tasks that consume the output of `name` directly.
    pub fn consumers_of(&self, name: &str) -> Vec<&TaskSpec> {
        self.tasks
            .iter()
            .filter(|t| t.upstream.as_deref() == Some(name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const R1: &str = r"(?P<path>.+)/(?P<sample>[a-zA-Z0-9]+)_R1.fastq.gz";

    fn fastq_pipeline() -> PipelineDef {
        let mut pipeline = PipelineDef::new("test");
        pipeline.add(TaskSpec::originate("original_files")).unwrap();
        pipeline
            .add(
                TaskSpec::transform("fastq2bam", "original_files", R1, "{path}/{sample}.bam")
                    .unwrap(),
            )
            .unwrap();
        pipeline
    }

    #[test]
    fn test_transform_declaration() {
        let spec = TaskSpec::transform("fastq2bam", "original_files", R1, "{path}/{sample}.bam")
            .unwrap()
            .with_companion("{path}/{sample}_R2.fastq.gz")
            .unwrap()
            .with_extra("{sample}")
            .unwrap();

        assert_eq!(spec.kind, TaskKind::Transform);
        assert_eq!(spec.upstream.as_deref(), Some("original_files"));
        assert_eq!(spec.companions.len(), 1);
        assert_eq!(spec.extras.len(), 1);
    }

    #[test]
    fn test_output_with_unknown_capture_rejected() {
        let err = TaskSpec::transform("t", "u", R1, "{path}/{lane}.bam").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownCapture { .. }));
    }

    #[test]
    fn test_companion_with_unknown_capture_rejected() {
        let err = TaskSpec::transform("t", "u", R1, "{path}/{sample}.bam")
            .unwrap()
            .with_companion("{path}/{flowcell}_R2.fastq.gz")
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownCapture { .. }));
    }

    #[test]
    fn test_merge_output_cannot_use_captures() {
        let err = TaskSpec::merge("m", "u", Some(R1), "{sample}_merged.bam").unwrap_err();
        assert!(matches!(err, ConfigError::MergeCapture { .. }));
        assert!(TaskSpec::merge("m", "u", None, "all_merged.bam").is_ok());
    }

    #[test]
    fn test_add_rejects_undeclared_upstream() {
        let mut pipeline = PipelineDef::new("test");
        pipeline.add(TaskSpec::originate("original_files")).unwrap();

        let spec = TaskSpec::transform("align", "validate", R1, "{sample}.bam").unwrap();
        let err = pipeline.add(spec).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownUpstream { .. }));
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn test_add_rejects_forward_reference() {
        let mut pipeline = PipelineDef::new("test");
        pipeline.add(TaskSpec::originate("a")).unwrap();

        // "c" is declared after "b", so "b" may not consume it.
        let b = TaskSpec::transform("b", "c", R1, "{sample}.b").unwrap();
        assert!(pipeline.add(b).is_err());
    }

    #[test]
    fn test_add_rejects_duplicate_name() {
        let mut pipeline = fastq_pipeline();
        let err = pipeline.add(TaskSpec::originate("fastq2bam")).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTask(_)));
    }

    #[test]
    fn test_consumers_of() {
        let pipeline = fastq_pipeline();
        let consumers = pipeline.consumers_of("original_files");
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].name, "fastq2bam");
    }
}

//! Pipeline Configuration Files
//!
//! Loads a pipeline from YAML: the input file list, global and per-stage
//! options, and the ordered task declarations with their command templates.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: fastq2bam
//! files: [data/s1_R1.fastq.gz, data/s1_R2.fastq.gz]
//! options:
//!   reference: /ref/hg38.fa
//! stages:
//!   fastq2bam: { local: true, cores: 2 }
//! tasks:
//!   - name: original_files
//!     kind: originate
//!   - name: fastq2bam
//!     kind: transform
//!     upstream: original_files
//!     input: '(?P<path>.+)/(?P<sample>[a-zA-Z0-9]+)_R1.fastq.gz'
//!     add_inputs: '{path}/{sample}_R2.fastq.gz'
//!     extras: '{sample}'
//!     output: '{path}/out/{sample}.bam'
//!     command: convert --r1 {input} --r2 {companion0} --bam {output}
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_yaml::Value;

use super::context::PipelineContext;
use super::model::{PipelineDef, TaskKind, TaskSpec};
use super::stage::{ShellStage, StageRegistry};
use crate::error::ConfigError;

/// Top-level layout of a pipeline file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub files: Vec<String>,

    #[serde(default)]
    pub options: BTreeMap<String, Value>,

    /// Options per stage, keyed by task name.
    #[serde(default)]
    pub stages: BTreeMap<String, BTreeMap<String, Value>>,

    pub tasks: Vec<TaskDecl>,
}

/// One task declaration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDecl {
    pub name: String,
    pub kind: TaskKind,

    #[serde(default)]
    pub upstream: Option<String>,

    /// Input pattern.
    #[serde(default)]
    pub input: Option<String>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub add_inputs: Vec<String>,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub extras: Vec<String>,

    #[serde(default)]
    pub output: Option<String>,

    #[serde(default)]
    pub command: Option<String>,
}

/// Everything needed to build and run a task graph.
#[derive(Debug)]
pub struct LoadedPipeline {
    pub def: PipelineDef,
    pub context: PipelineContext,
    pub registry: StageRegistry,
}

/// Deserializes either a single string or a list of strings.
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Sequence(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in list")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or list of strings")),
    }
}

impl PipelineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading pipeline from: {}", path.display());

        let yaml = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        debug!("YAML content loaded ({} bytes)", yaml.len());

        let config = Self::from_yaml(&yaml)?;
        info!(
            "Parsed {} tasks, {} input files",
            config.tasks.len(),
            config.files.len()
        );
        Ok(config)
    }

    /// Builds declarations, context and stages.
    ///
    /// `source` is the file the configuration came from; its modification
    /// time makes outputs older than the configuration stale.
    pub fn build(self, source: Option<&Path>) -> Result<LoadedPipeline, ConfigError> {
        let name = self
            .name
            .clone()
            .or_else(|| {
                source
                    .and_then(|p| p.file_stem())
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "pipeline".to_string());

        let mut def = PipelineDef::new(name);
        let mut registry = StageRegistry::new();

        for decl in &self.tasks {
            def.add(decl.to_spec()?)?;
            if let Some(stage) = decl.stage()? {
                registry.register(decl.name.clone(), stage);
            }
        }

        for stage in self.stages.keys() {
            if def.get(stage).is_none() {
                warn!("Options given for unknown stage '{}'", stage);
            }
        }

        let mut context = PipelineContext::new(self.files);
        for (key, value) in self.options {
            context = context.with_option(key, value);
        }
        for (stage, options) in self.stages {
            for (key, value) in options {
                context = context.with_stage_option(stage.clone(), key, value);
            }
        }
        if let Some(path) = source {
            context = context.with_source(path);
        }

        registry.resolve(&def)?;

        Ok(LoadedPipeline {
            def,
            context,
            registry,
        })
    }
}

impl TaskDecl {
    fn require<'a>(
        &self,
        value: &'a Option<String>,
        field: &'static str,
    ) -> Result<&'a str, ConfigError> {
        value.as_deref().ok_or_else(|| ConfigError::MissingField {
            task: self.name.clone(),
            field,
        })
    }

    fn to_spec(&self) -> Result<TaskSpec, ConfigError> {
        let mut spec = match self.kind {
            TaskKind::Originate => {
                if self.upstream.is_some() {
                    return Err(ConfigError::OriginateWithUpstream(self.name.clone()));
                }
                return Ok(TaskSpec::originate(self.name.clone()));
            }
            TaskKind::Transform => TaskSpec::transform(
                self.name.clone(),
                self.require(&self.upstream, "upstream")?,
                self.require(&self.input, "input pattern")?,
                self.require(&self.output, "output")?,
            )?,
            TaskKind::Merge => TaskSpec::merge(
                self.name.clone(),
                self.require(&self.upstream, "upstream")?,
                self.input.as_deref(),
                self.require(&self.output, "output")?,
            )?,
        };

        for companion in &self.add_inputs {
            spec = spec.with_companion(companion)?;
        }
        for extra in &self.extras {
            spec = spec.with_extra(extra)?;
        }
        Ok(spec)
    }

    fn stage(&self) -> Result<Option<ShellStage>, ConfigError> {
        if self.kind == TaskKind::Originate {
            if self.command.is_some() {
                warn!("Originate task '{}' ignores its command", self.name);
            }
            return Ok(None);
        }
        let command = self.require(&self.command, "command")?;
        Ok(Some(ShellStage::new(command)?))
    }
}

/// Loads and builds a pipeline file in one step.
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<LoadedPipeline, ConfigError> {
    let path = path.as_ref();
    PipelineConfig::load(path)?.build(Some(path))
}

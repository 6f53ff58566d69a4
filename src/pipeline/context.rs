//! Pipeline Context
//!
//! Read-only configuration shared by every task of a run: the literal input
//! file list, global options and per-stage options. It is built once (usually
//! by [`crate::pipeline::config::load_pipeline`]) and then handed around
//! behind an `Arc`; nothing mutates it afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_yaml::Value;

/// Resource and routing hints for one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSettings {
    /// `Some(true)` forces local execution even when a job backend is set.
    pub local: Option<bool>,
    pub cores: Option<u64>,
    pub mem: Option<String>,
    pub walltime: Option<String>,
    pub queue: Option<String>,
}

/// Shared, read-only lookup of pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    files: Vec<String>,
    options: BTreeMap<String, Value>,
    stage_options: BTreeMap<String, BTreeMap<String, Value>>,
    source: Option<PathBuf>,
    source_modified: Option<SystemTime>,
}

impl PipelineContext {
    /// Creates a context over a literal file list.
    ///
    /// Duplicate paths are dropped, keeping the first occurrence.
    pub fn new(files: Vec<String>) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(files.len());
        for file in files {
            let file = file.trim().to_string();
            if !file.is_empty() && !unique.contains(&file) {
                unique.push(file);
            }
        }

        Self {
            files: unique,
            ..Self::default()
        }
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn with_stage_option(
        mut self,
        stage: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.stage_options
            .entry(stage.into())
            .or_default()
            .insert(name.into(), value.into());
        self
    }

    /// Records the configuration file this context was loaded from.
    ///
    /// Its modification time takes part in staleness checks.
    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.source_modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        self.source = Some(path);
        self
    }

    /// The literal input files that seed originate tasks.
    pub fn input_files(&self) -> &[String] {
        &self.files
    }

    pub fn get_option(&self, name: &str) -> Option<&Value> {
        self.options.get(name)
    }

    /// Looks up one option for a stage, falling back to the global option of
    /// the same name.
    pub fn get_stage_option(&self, stage: &str, name: &str) -> Option<&Value> {
        self.stage_options
            .get(stage)
            .and_then(|opts| opts.get(name))
            .or_else(|| self.get_option(name))
    }

    pub fn get_stage_options(&self, stage: &str, names: &[&str]) -> Vec<Option<&Value>> {
        names
            .iter()
            .map(|name| self.get_stage_option(stage, name))
            .collect()
    }

    pub fn stage_str(&self, stage: &str, name: &str) -> Option<String> {
        self.get_stage_option(stage, name).and_then(value_to_string)
    }

    pub fn stage_bool(&self, stage: &str, name: &str) -> Option<bool> {
        self.get_stage_option(stage, name).and_then(Value::as_bool)
    }

    pub fn stage_u64(&self, stage: &str, name: &str) -> Option<u64> {
        self.get_stage_option(stage, name).and_then(Value::as_u64)
    }

    pub fn stage_settings(&self, stage: &str) -> StageSettings {
        StageSettings {
            local: self.stage_bool(stage, "local"),
            cores: self.stage_u64(stage, "cores"),
            mem: self.stage_str(stage, "mem"),
            walltime: self.stage_str(stage, "walltime"),
            queue: self.stage_str(stage, "queue"),
        }
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn source_modified(&self) -> Option<SystemTime> {
        self.source_modified
    }
}

/// Renders scalar YAML values as strings; mappings and sequences yield `None`.
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

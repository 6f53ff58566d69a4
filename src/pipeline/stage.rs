//! Stages and Work Units
//!
//! A [`Stage`] turns one concrete [`TaskNode`] into a [`WorkUnit`]: the
//! opaque action that produces the node's output. Stages are registered by
//! task name in a [`StageRegistry`] and resolved once, when the task graph is
//! built.
//!
//! [`ShellStage`] covers the common case of a command template:
//!
//! | Placeholder     | Value                                             |
//! |-----------------|---------------------------------------------------|
//! | `{input}`       | primary input(s), space-separated                 |
//! | `{inputs}`      | primary inputs followed by companions             |
//! | `{companionN}`  | the N-th companion input                          |
//! | `{extraN}`      | the N-th extra parameter                          |
//! | `{output}`      | the output path                                   |
//! | `{opt.NAME}`    | stage option `NAME` from the pipeline context     |
//! | `{name}`        | any capture group of the task's input pattern     |
//!
//! File and capture values are shell-quoted when they contain anything
//! beyond `[A-Za-z0-9_-./=:,+@%]`. Option values are pasted verbatim, so an
//! option may carry several flags.
//!
//! A `workdir` stage option runs the command in that directory, relative to
//! the runner's working directory.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use super::context::PipelineContext;
use super::graph::TaskNode;
use super::model::{PipelineDef, TaskSpec};
use super::pattern::Template;
use crate::error::{ConfigError, StageError};

/// Prefix for placeholders that read stage options from the context.
const OPTION_PREFIX: &str = "opt.";

/// Stage option naming the directory a command runs in.
const WORKDIR_OPTION: &str = "workdir";

/// Closure executed on a blocking worker thread.
pub type InProcessFn = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

/// A shell command line plus the directory to run it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub command: String,
    pub working_dir: Option<PathBuf>,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// The action that produces a node's output.
pub enum WorkUnit {
    /// Nothing to execute; the node succeeds immediately.
    Noop,
    /// Run through a job backend (local subprocess or external scheduler).
    Shell(ShellCommand),
    /// Run in this process.
    InProcess(InProcessFn),
}

impl WorkUnit {
    pub fn shell(command: impl Into<String>) -> Self {
        Self::Shell(ShellCommand::new(command))
    }

    pub fn in_process<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        Self::InProcess(Box::new(f))
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop => f.write_str("Noop"),
            Self::Shell(cmd) => f.debug_tuple("Shell").field(cmd).finish(),
            Self::InProcess(_) => f.write_str("InProcess(..)"),
        }
    }
}

/// Executable behaviour of a task.
pub trait Stage: Send + Sync {
    /// Builds the work unit for one node.
    fn work_unit(&self, node: &TaskNode, ctx: &PipelineContext) -> Result<WorkUnit, StageError>;

    /// Validates the stage against its task declaration at build time.
    fn check(&self, _spec: &TaskSpec) -> Result<(), ConfigError> {
        Ok(())
    }
}

impl<F> Stage for F
where
    F: Fn(&TaskNode, &PipelineContext) -> Result<WorkUnit, StageError> + Send + Sync,
{
    fn work_unit(&self, node: &TaskNode, ctx: &PipelineContext) -> Result<WorkUnit, StageError> {
        self(node, ctx)
    }
}

/// A stage defined by a command template.
#[derive(Debug, Clone)]
pub struct ShellStage {
    template: Template,
}

impl ShellStage {
    pub fn new(command: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            template: Template::parse(command)?,
        })
    }

    fn is_known(spec: &TaskSpec, name: &str) -> bool {
        if matches!(name, "input" | "inputs" | "output") || name.starts_with(OPTION_PREFIX) {
            return true;
        }
        if let Some(n) = indexed(name, "companion") {
            return n < spec.companions.len();
        }
        if let Some(n) = indexed(name, "extra") {
            return n < spec.extras.len();
        }
        spec.input_pattern
            .as_ref()
            .is_some_and(|p| p.has_capture(name))
    }

    /// Renders the command for `node`.
    pub fn render(&self, node: &TaskNode, ctx: &PipelineContext) -> Result<String, StageError> {
        let mut missing_option = None;

        let rendered = self.template.render_with(|name| {
            if let Some(option) = name.strip_prefix(OPTION_PREFIX) {
                let value = ctx.stage_str(&node.task, option);
                if value.is_none() {
                    missing_option = Some(option.to_string());
                }
                return value;
            }
            placeholder_value(node, name)
        });

        match rendered {
            Ok(command) => Ok(command),
            Err(_) if missing_option.is_some() => Err(StageError::MissingData(format!(
                "option '{}' is not set for stage '{}'",
                missing_option.unwrap_or_default(),
                node.task
            ))),
            Err(e) => Err(StageError::Template(e.to_string())),
        }
    }
}

impl Stage for ShellStage {
    fn work_unit(&self, node: &TaskNode, ctx: &PipelineContext) -> Result<WorkUnit, StageError> {
        let command = self.render(node, ctx)?;
        debug!("{}: {}", node.label(), command);

        let mut cmd = ShellCommand::new(command);
        if let Some(dir) = ctx.stage_str(&node.task, WORKDIR_OPTION) {
            cmd = cmd.in_dir(dir);
        }
        Ok(WorkUnit::Shell(cmd))
    }

    fn check(&self, spec: &TaskSpec) -> Result<(), ConfigError> {
        match self.template.placeholders().find(|name| !Self::is_known(spec, name)) {
            Some(name) => Err(ConfigError::UnknownPlaceholder {
                task: spec.name.clone(),
                name: name.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Parses `companion3` style names into their index.
fn indexed(name: &str, prefix: &str) -> Option<usize> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// Quotes `value` for `sh` unless it is made of safe characters only.
pub fn shell_quote(value: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c);
    if !value.is_empty() && value.chars().all(safe) {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn quote_all<'a>(values: impl Iterator<Item = &'a String>) -> String {
    values
        .map(|v| shell_quote(v))
        .collect::<Vec<_>>()
        .join(" ")
}

fn placeholder_value(node: &TaskNode, name: &str) -> Option<String> {
    match name {
        "input" => Some(quote_all(node.inputs.iter())),
        "inputs" => Some(quote_all(node.inputs.iter().chain(&node.companions))),
        "output" => Some(shell_quote(&node.output)),
        _ => {
            if let Some(n) = indexed(name, "companion") {
                return node.companions.get(n).map(|v| shell_quote(v));
            }
            if let Some(n) = indexed(name, "extra") {
                return node.extras.get(n).map(|v| shell_quote(v));
            }
            node.binding.get(name).map(shell_quote)
        }
    }
}

/// Stages keyed by task name.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: impl Into<String>, stage: impl Stage + 'static) {
        self.stages.insert(task.into(), Arc::new(stage));
    }

    pub fn get(&self, task: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(task).cloned()
    }

    /// Checks that every non-originate task has a stage that accepts its
    /// declaration.
    pub fn resolve(&self, pipeline: &PipelineDef) -> Result<(), ConfigError> {
        for spec in pipeline.tasks().iter().filter(|t| !t.is_originate()) {
            let stage = self
                .stages
                .get(&spec.name)
                .ok_or_else(|| ConfigError::UnknownStage(spec.name.clone()))?;
            stage.check(spec)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.stages.keys().collect();
        names.sort();
        f.debug_struct("StageRegistry").field("stages", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::graph::NodeId;
    use crate::pipeline::model::{TaskKind, TaskSpec};
    use crate::pipeline::pattern::Binding;

    const R1: &str = r"(?P<path>.+)/(?P<sample>[a-zA-Z0-9]+)_R1.fastq.gz";

    fn spec() -> TaskSpec {
        TaskSpec::transform("fastq2bam", "original_files", R1, "{path}/out/{sample}.bam")
            .unwrap()
            .with_companion("{path}/{sample}_R2.fastq.gz")
            .unwrap()
            .with_extra("{sample}")
            .unwrap()
    }

    fn node() -> TaskNode {
        let mut binding = Binding::new();
        binding.insert("path", "/data");
        binding.insert("sample", "s1");

        TaskNode {
            id: NodeId(1),
            task: "fastq2bam".to_string(),
            kind: TaskKind::Transform,
            inputs: vec!["/data/s1_R1.fastq.gz".to_string()],
            companions: vec!["/data/s1_R2.fastq.gz".to_string()],
            extras: vec!["s1".to_string()],
            output: "/data/out/s1.bam".to_string(),
            binding,
        }
    }

    #[test]
    fn test_shell_stage_renders_placeholders() {
        let stage = ShellStage::new(
            "convert --r1 {input} --r2 {companion0} --sample {extra0} --bam {output} --dir {path}",
        )
        .unwrap();

        let command = stage.render(&node(), &PipelineContext::default()).unwrap();
        assert_eq!(
            command,
            "convert --r1 /data/s1_R1.fastq.gz --r2 /data/s1_R2.fastq.gz --sample s1 \
             --bam /data/out/s1.bam --dir /data"
        );
    }

    #[test]
    fn test_shell_stage_inputs_include_companions() {
        let stage = ShellStage::new("cat {inputs}").unwrap();
        let command = stage.render(&node(), &PipelineContext::default()).unwrap();
        assert_eq!(command, "cat /data/s1_R1.fastq.gz /data/s1_R2.fastq.gz");
    }

    #[test]
    fn test_shell_stage_check_rejects_unknown_placeholder() {
        let stage = ShellStage::new("convert {input} {lane}").unwrap();
        let err = stage.check(&spec()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPlaceholder { ref name, .. } if name == "lane"));

        let stage = ShellStage::new("convert {companion1}").unwrap();
        assert!(stage.check(&spec()).is_err());
    }

    #[test]
    fn test_shell_stage_check_accepts_known_placeholders() {
        let stage =
            ShellStage::new("x {input} {inputs} {output} {companion0} {extra0} {sample} {opt.ref}")
                .unwrap();
        assert!(stage.check(&spec()).is_ok());
    }

    #[test]
    fn test_shell_stage_option_lookup() {
        let stage = ShellStage::new("bwa mem {opt.reference} {input}").unwrap();
        let ctx = PipelineContext::default().with_stage_option("fastq2bam", "reference", "/ref.fa");

        let command = stage.render(&node(), &ctx).unwrap();
        assert_eq!(command, "bwa mem /ref.fa /data/s1_R1.fastq.gz");
    }

    #[test]
    fn test_shell_stage_missing_option_is_missing_data() {
        let stage = ShellStage::new("bwa mem {opt.reference} {input}").unwrap();
        let err = stage.render(&node(), &PipelineContext::default()).unwrap_err();
        assert!(matches!(err, StageError::MissingData(_)));
    }

    #[test]
    fn test_shell_stage_quotes_unsafe_paths() {
        let mut node = node();
        node.inputs = vec!["/data/run 1/s1_R1.fastq.gz".to_string()];
        node.output = "/data/it's.bam".to_string();

        let stage = ShellStage::new("convert {input} {output} {sample}").unwrap();
        let command = stage.render(&node, &PipelineContext::default()).unwrap();
        assert_eq!(
            command,
            r"convert '/data/run 1/s1_R1.fastq.gz' '/data/it'\''s.bam' s1"
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/data/out/s1.bam"), "/data/out/s1.bam");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a;rm -rf x"), "'a;rm -rf x'");
        assert_eq!(shell_quote("$(id)"), "'$(id)'");
    }

    #[test]
    fn test_shell_stage_option_is_not_quoted() {
        let stage = ShellStage::new("sort {opt.flags} {input}").unwrap();
        let ctx = PipelineContext::default().with_stage_option("fastq2bam", "flags", "-k 2 -n");

        let command = stage.render(&node(), &ctx).unwrap();
        assert_eq!(command, "sort -k 2 -n /data/s1_R1.fastq.gz");
    }

    #[test]
    fn test_shell_stage_workdir_option() {
        let stage = ShellStage::new("convert {input}").unwrap();
        let unit = stage.work_unit(&node(), &PipelineContext::default()).unwrap();
        assert!(matches!(unit, WorkUnit::Shell(ref c) if c.working_dir.is_none()));

        let ctx = PipelineContext::default().with_stage_option("fastq2bam", "workdir", "scratch");
        let unit = stage.work_unit(&node(), &ctx).unwrap();
        assert!(matches!(
            unit,
            WorkUnit::Shell(ref c) if c.working_dir == Some(PathBuf::from("scratch"))
        ));
    }

    #[test]
    fn test_registry_resolve() {
        let mut pipeline = PipelineDef::new("test");
        pipeline.add(TaskSpec::originate("original_files")).unwrap();
        pipeline.add(spec()).unwrap();

        let mut registry = StageRegistry::new();
        assert!(matches!(
            registry.resolve(&pipeline),
            Err(ConfigError::UnknownStage(_))
        ));

        registry.register("fastq2bam", ShellStage::new("convert {input}").unwrap());
        assert!(registry.resolve(&pipeline).is_ok());
    }

    #[test]
    fn test_closure_stage() {
        let stage = |node: &TaskNode, _: &PipelineContext| -> Result<WorkUnit, StageError> {
            Ok(WorkUnit::shell(format!("touch {}", node.output)))
        };
        let unit = stage.work_unit(&node(), &PipelineContext::default()).unwrap();
        assert!(matches!(unit, WorkUnit::Shell(ref c) if c.command == "touch /data/out/s1.bam"));
    }
}

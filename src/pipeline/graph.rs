//! Task Graph Construction
//!
//! Expands a [`PipelineDef`] over the context's input files into concrete
//! [`TaskNode`]s:
//!
//! - originate: one node per input file, whose output is the file itself
//! - transform: one node per upstream output matching the input pattern
//! - merge: one node aggregating every matching upstream output
//!
//! Nodes are created task by task in declaration order and every edge points
//! from a later node to an earlier one, so node ids are already a
//! topological order.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Write as _};
use std::path::Path;

use log::{debug, info};
use serde::Serialize;

use super::context::PipelineContext;
use super::model::{PipelineDef, TaskKind, TaskSpec};
use super::pattern::{Binding, MatchOutcome, Template};
use super::stage::StageRegistry;
use crate::error::ConfigError;

/// Index of a node in its [`TaskGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One concrete instantiation of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    pub id: NodeId,
    /// Name of the owning task.
    pub task: String,
    pub kind: TaskKind,
    /// Primary inputs: one for transform, all matches for merge, none for
    /// originate.
    pub inputs: Vec<String>,
    pub companions: Vec<String>,
    pub extras: Vec<String>,
    pub output: String,
    /// Captures of the primary input (empty for originate and merge).
    pub binding: Binding,
}

impl TaskNode {
    /// Human-readable identifier, e.g. `fastq2bam[s1.bam]`.
    pub fn label(&self) -> String {
        let file = Path::new(&self.output)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.output);
        format!("{}[{}]", self.task, file)
    }

    /// Primary and companion inputs.
    pub fn all_inputs(&self) -> impl Iterator<Item = &String> {
        self.inputs.iter().chain(&self.companions)
    }

    pub fn is_originate(&self) -> bool {
        self.kind == TaskKind::Originate
    }

    pub fn log_out_path(&self) -> String {
        format!("{}.log.out", self.output)
    }

    pub fn log_err_path(&self) -> String {
        format!("{}.log.err", self.output)
    }
}

/// The fully expanded dependency graph.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    pipeline: String,
    nodes: Vec<TaskNode>,
    deps: Vec<Vec<NodeId>>,
    dependents: Vec<Vec<NodeId>>,
    /// Declared tasks in order, with the nodes each produced.
    tasks: Vec<(String, TaskKind, Vec<NodeId>)>,
}

impl TaskGraph {
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn node(&self, id: NodeId) -> &TaskNode {
        &self.nodes[id.0]
    }

    /// Nodes in topological order.
    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    /// Nodes `id` consumes output from.
    pub fn dependencies(&self, id: NodeId) -> &[NodeId] {
        &self.deps[id.0]
    }

    /// Nodes consuming the output of `id`.
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        &self.dependents[id.0]
    }

    /// Nodes produced by `task`, or `None` for an unknown task.
    pub fn nodes_of(&self, task: &str) -> Option<&[NodeId]> {
        self.tasks
            .iter()
            .find(|(name, _, _)| name == task)
            .map(|(_, _, ids)| ids.as_slice())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Marks the nodes of `targets` and everything they depend on.
    ///
    /// An empty target list selects the whole graph.
    pub fn select(&self, targets: &[String]) -> Result<Vec<bool>, ConfigError> {
        if targets.is_empty() {
            return Ok(vec![true; self.nodes.len()]);
        }

        let mut selected = vec![false; self.nodes.len()];
        let mut stack = Vec::new();
        for target in targets {
            let ids = self
                .nodes_of(target)
                .ok_or_else(|| ConfigError::UnknownTask(target.clone()))?;
            stack.extend_from_slice(ids);
        }

        while let Some(id) = stack.pop() {
            if selected[id.0] {
                continue;
            }
            selected[id.0] = true;
            stack.extend_from_slice(self.dependencies(id));
        }
        Ok(selected)
    }

    /// Every node transitively reachable downstream of `id`.
    pub fn descendants(&self, id: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeId> = self.dependents(id).to_vec();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend_from_slice(self.dependents(next));
            }
        }
        seen
    }

    /// Indented listing of tasks, their nodes and dependencies.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for (name, kind, ids) in &self.tasks {
            let _ = writeln!(out, "{} ({}, {} nodes)", name, kind, ids.len());
            for id in ids {
                let node = self.node(*id);
                let _ = writeln!(out, "  {} -> {}", node.label(), node.output);
                for dep in self.dependencies(*id) {
                    let _ = writeln!(out, "      <- {}", self.node(*dep).label());
                }
            }
        }
        out
    }

    /// Graphviz rendering, one cluster per task.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", escape_dot(&self.pipeline));
        let _ = writeln!(out, "  rankdir=LR;");
        for (i, (name, _, ids)) in self.tasks.iter().enumerate() {
            let _ = writeln!(out, "  subgraph cluster_{} {{", i);
            let _ = writeln!(out, "    label=\"{}\";", escape_dot(name));
            for id in ids {
                let _ = writeln!(
                    out,
                    "    n{} [label=\"{}\"];",
                    id.0,
                    escape_dot(&self.node(*id).label())
                );
            }
            let _ = writeln!(out, "  }}");
        }
        for node in &self.nodes {
            for dep in self.dependencies(node.id) {
                let _ = writeln!(out, "  n{} -> n{};", dep.0, node.id.0);
            }
        }
        out.push_str("}\n");
        out
    }
}

fn escape_dot(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Builds a [`TaskGraph`] from declarations and input files.
pub struct TaskGraphBuilder<'a> {
    pipeline: &'a PipelineDef,
    context: &'a PipelineContext,
    registry: Option<&'a StageRegistry>,
}

impl<'a> TaskGraphBuilder<'a> {
    pub fn new(pipeline: &'a PipelineDef, context: &'a PipelineContext) -> Self {
        Self {
            pipeline,
            context,
            registry: None,
        }
    }

    /// Also validates that every task has a usable stage.
    pub fn with_registry(mut self, registry: &'a StageRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<TaskGraph, ConfigError> {
        if let Some(registry) = self.registry {
            registry.resolve(self.pipeline)?;
        }

        let mut state = BuildState::default();

        for spec in self.pipeline.tasks() {
            let nodes = match spec.kind {
                TaskKind::Originate => self.originate(spec),
                TaskKind::Transform => state.transform(spec)?,
                TaskKind::Merge => state.merge(spec)?,
            };
            state.commit(spec, nodes)?;
        }

        let BuildState {
            nodes,
            deps,
            tasks,
            ..
        } = state;

        let mut dependents = vec![Vec::new(); nodes.len()];
        for (id, node_deps) in deps.iter().enumerate() {
            for dep in node_deps {
                dependents[dep.0].push(NodeId(id));
            }
        }

        info!(
            "Built task graph '{}': {} tasks, {} nodes",
            self.pipeline.name,
            tasks.len(),
            nodes.len()
        );

        Ok(TaskGraph {
            pipeline: self.pipeline.name.clone(),
            nodes,
            deps,
            dependents,
            tasks,
        })
    }

    fn originate(&self, spec: &TaskSpec) -> Vec<PendingNode> {
        self.context
            .input_files()
            .iter()
            .map(|file| PendingNode {
                inputs: Vec::new(),
                companions: Vec::new(),
                extras: Vec::new(),
                output: file.clone(),
                binding: Binding::new(),
                upstream: Vec::new(),
            })
            .inspect(|n| debug!("{}: originate {}", spec.name, n.output))
            .collect()
    }
}

/// A node whose id has not been assigned yet.
struct PendingNode {
    inputs: Vec<String>,
    companions: Vec<String>,
    extras: Vec<String>,
    output: String,
    binding: Binding,
    /// Upstream-task nodes consumed as primary inputs.
    upstream: Vec<NodeId>,
}

#[derive(Default)]
struct BuildState {
    nodes: Vec<TaskNode>,
    deps: Vec<Vec<NodeId>>,
    tasks: Vec<(String, TaskKind, Vec<NodeId>)>,
    /// Output path -> producing node, for already-committed tasks.
    producers: HashMap<String, NodeId>,
}

impl BuildState {
    fn upstream_nodes(&self, spec: &TaskSpec) -> Result<&[NodeId], ConfigError> {
        let upstream = spec
            .upstream
            .as_deref()
            .ok_or_else(|| ConfigError::MissingUpstream(spec.name.clone()))?;

        self.tasks
            .iter()
            .find(|(name, _, _)| name == upstream)
            .map(|(_, _, ids)| ids.as_slice())
            .ok_or_else(|| ConfigError::UnknownUpstream {
                task: spec.name.clone(),
                upstream: upstream.to_string(),
            })
    }

    fn transform(&self, spec: &TaskSpec) -> Result<Vec<PendingNode>, ConfigError> {
        let pattern = spec
            .input_pattern
            .as_ref()
            .ok_or_else(|| missing_field(spec, "input pattern"))?;
        let output = spec
            .output
            .as_ref()
            .ok_or_else(|| missing_field(spec, "output"))?;

        let mut pending = Vec::new();
        for up in self.upstream_nodes(spec)? {
            let input = &self.nodes[up.0].output;
            let binding = match pattern.match_path(input) {
                MatchOutcome::Matched(binding) => binding,
                MatchOutcome::NotMatched => {
                    debug!("{}: '{}' does not match, skipped", spec.name, input);
                    continue;
                }
            };

            let node = PendingNode {
                inputs: vec![input.clone()],
                companions: render_all(&spec.companions, &binding, spec)?,
                extras: render_all(&spec.extras, &binding, spec)?,
                output: render_one(output, &binding, spec)?,
                binding,
                upstream: vec![*up],
            };
            debug!("{}: {} -> {}", spec.name, input, node.output);
            pending.push(node);
        }
        Ok(pending)
    }

    fn merge(&self, spec: &TaskSpec) -> Result<Vec<PendingNode>, ConfigError> {
        let output = spec
            .output
            .as_ref()
            .ok_or_else(|| missing_field(spec, "output"))?;

        let mut inputs = Vec::new();
        let mut upstream = Vec::new();
        for up in self.upstream_nodes(spec)? {
            let input = &self.nodes[up.0].output;
            let accepted = spec
                .input_pattern
                .as_ref()
                .map_or(true, |p| matches!(p.match_path(input), MatchOutcome::Matched(_)));
            if accepted {
                inputs.push(input.clone());
                upstream.push(*up);
            }
        }

        if inputs.is_empty() {
            info!("{}: no matching inputs, nothing to merge", spec.name);
            return Ok(Vec::new());
        }

        let empty = Binding::new();
        Ok(vec![PendingNode {
            inputs,
            companions: render_all(&spec.companions, &empty, spec)?,
            extras: render_all(&spec.extras, &empty, spec)?,
            output: render_one(output, &empty, spec)?,
            binding: empty,
            upstream,
        }])
    }

    /// Assigns ids, wires edges and indexes outputs of one task's nodes.
    fn commit(&mut self, spec: &TaskSpec, pending: Vec<PendingNode>) -> Result<(), ConfigError> {
        let mut ids = Vec::with_capacity(pending.len());
        let mut outputs: HashMap<String, NodeId> = HashMap::new();

        for p in pending {
            let id = NodeId(self.nodes.len());

            // Originate files listed twice were already deduplicated by the
            // context; any remaining collision is a wiring error.
            let clash = outputs
                .get(&p.output)
                .or_else(|| self.producers.get(&p.output))
                .copied();
            if let Some(first) = clash {
                return Err(ConfigError::DuplicateOutput {
                    path: p.output,
                    first: self.nodes[first.0].task.clone(),
                    second: spec.name.clone(),
                });
            }

            let mut deps = p.upstream;
            for companion in &p.companions {
                if let Some(producer) = self.producers.get(companion) {
                    deps.push(*producer);
                }
            }
            deps.sort();
            deps.dedup();

            outputs.insert(p.output.clone(), id);
            self.deps.push(deps);
            self.nodes.push(TaskNode {
                id,
                task: spec.name.clone(),
                kind: spec.kind,
                inputs: p.inputs,
                companions: p.companions,
                extras: p.extras,
                output: p.output,
                binding: p.binding,
            });
            ids.push(id);
        }

        self.producers.extend(outputs);
        self.tasks.push((spec.name.clone(), spec.kind, ids));
        Ok(())
    }
}

fn missing_field(spec: &TaskSpec, field: &'static str) -> ConfigError {
    ConfigError::MissingField {
        task: spec.name.clone(),
        field,
    }
}

fn render_one(
    template: &Template,
    binding: &Binding,
    spec: &TaskSpec,
) -> Result<String, ConfigError> {
    template.render(binding).map_err(|e| ConfigError::UnknownCapture {
        template: format!("{} (task '{}')", e.template, spec.name),
        name: e.name,
    })
}

fn render_all(
    templates: &[Template],
    binding: &Binding,
    spec: &TaskSpec,
) -> Result<Vec<String>, ConfigError> {
    templates
        .iter()
        .map(|t| render_one(t, binding, spec))
        .collect()
}

//! Staleness Checking
//!
//! Decides whether a node's output must be regenerated. A node is stale when
//! it is forced, when something it depends on runs in this invocation, when
//! its output is missing, or when the output is older than any of its inputs
//! (companions included) or the pipeline configuration file.
//!
//! Upstream work dominates timestamps: once a dependency runs, every
//! dependent runs too, whatever its files look like.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use log::debug;

use super::context::PipelineContext;
use super::graph::{NodeId, TaskGraph, TaskNode};

/// Outcome of a staleness check, with the reason when stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    UpToDate,
    Forced,
    UpstreamWillRun,
    MissingOutput(String),
    InputNewer { input: String, output: String },
    ConfigChanged { output: String },
}

impl Freshness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Self::UpToDate)
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => write!(f, "up to date"),
            Self::Forced => write!(f, "forced"),
            Self::UpstreamWillRun => write!(f, "upstream runs"),
            Self::MissingOutput(path) => write!(f, "missing output {}", path),
            Self::InputNewer { input, .. } => write!(f, "{} is newer than output", input),
            Self::ConfigChanged { .. } => write!(f, "configuration changed"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StalenessChecker {
    config_modified: Option<SystemTime>,
    /// Directory relative paths are resolved against.
    base_dir: Option<PathBuf>,
}

impl StalenessChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the modification time of the context's configuration file, if
    /// it was loaded from one.
    pub fn for_context(ctx: &PipelineContext) -> Self {
        Self {
            config_modified: ctx.source_modified(),
            base_dir: None,
        }
    }

    pub fn with_base_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.base_dir = dir;
        self
    }

    pub fn with_config_modified(mut self, time: Option<SystemTime>) -> Self {
        self.config_modified = time;
        self
    }

    fn modified(&self, path: &str) -> Option<SystemTime> {
        let path = match &self.base_dir {
            Some(dir) => dir.join(path),
            None => PathBuf::from(path),
        };
        fs::metadata(path).and_then(|m| m.modified()).ok()
    }

    /// Full decision for one node.
    pub fn evaluate(&self, node: &TaskNode, forced: bool, upstream_will_run: bool) -> Freshness {
        if forced {
            Freshness::Forced
        } else if upstream_will_run {
            Freshness::UpstreamWillRun
        } else {
            self.check_files(node)
        }
    }

    pub fn is_stale(&self, node: &TaskNode, upstream_will_run: bool) -> bool {
        self.evaluate(node, false, upstream_will_run).is_stale()
    }

    /// Compares the node's output against its inputs and the config file.
    ///
    /// Inputs that do not exist are ignored here; the runner reports them
    /// when the node is dispatched.
    pub fn check_files(&self, node: &TaskNode) -> Freshness {
        let Some(output_time) = self.modified(&node.output) else {
            return Freshness::MissingOutput(node.output.clone());
        };

        let newest_input = node
            .all_inputs()
            .filter_map(|path| self.modified(path).map(|t| (t, path)))
            .max_by_key(|(t, _)| *t);

        if let Some((input_time, input)) = newest_input {
            if input_time > output_time {
                return Freshness::InputNewer {
                    input: input.clone(),
                    output: node.output.clone(),
                };
            }
        }

        match self.config_modified {
            Some(config_time) if config_time > output_time => Freshness::ConfigChanged {
                output: node.output.clone(),
            },
            _ => Freshness::UpToDate,
        }
    }

    /// Predicts the outcome of a run without executing anything.
    ///
    /// Nodes outside `selected` and originate nodes get no entry.
    pub fn plan(
        &self,
        graph: &TaskGraph,
        selected: &[bool],
        forced: impl Fn(&TaskNode) -> bool,
    ) -> StalenessPlan {
        let mut entries: Vec<Option<Freshness>> = Vec::with_capacity(graph.len());

        for node in graph.nodes() {
            if !selected.get(node.id.0).copied().unwrap_or(false) || node.is_originate() {
                entries.push(None);
                continue;
            }

            let upstream_will_run = graph
                .dependencies(node.id)
                .iter()
                .any(|dep| entries[dep.0].as_ref().is_some_and(Freshness::is_stale));

            let freshness = self.evaluate(node, forced(node), upstream_will_run);
            debug!("{}: {}", node.label(), freshness);
            entries.push(Some(freshness));
        }

        StalenessPlan { entries }
    }
}

/// Per-node result of [`StalenessChecker::plan`].
#[derive(Debug, Clone)]
pub struct StalenessPlan {
    entries: Vec<Option<Freshness>>,
}

impl StalenessPlan {
    pub fn get(&self, id: NodeId) -> Option<&Freshness> {
        self.entries.get(id.0).and_then(Option::as_ref)
    }

    pub fn will_run(&self, id: NodeId) -> bool {
        self.get(id).is_some_and(Freshness::is_stale)
    }

    pub fn stale_count(&self) -> usize {
        self.entries.iter().flatten().filter(|f| f.is_stale()).count()
    }

    pub fn up_to_date_count(&self) -> usize {
        self.entries.iter().flatten().filter(|f| !f.is_stale()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::graph::TaskGraphBuilder;
    use crate::pipeline::model::{PipelineDef, TaskSpec};
    use std::fs::File;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(path: &Path, secs: u64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 + secs))
            .unwrap();
    }

    /// original_files -> fastq2bam -> validate over one sample.
    fn build(dir: &TempDir) -> TaskGraph {
        let root = dir.path().display().to_string();
        let mut p = PipelineDef::new("test");
        p.add(TaskSpec::originate("original_files")).unwrap();
        p.add(
            TaskSpec::transform(
                "fastq2bam",
                "original_files",
                r"(?P<path>.+)/(?P<sample>[a-zA-Z0-9]+)_R1.fastq.gz",
                "{path}/out/{sample}.bam",
            )
            .unwrap()
            .with_companion("{path}/{sample}_R2.fastq.gz")
            .unwrap(),
        )
        .unwrap();
        p.add(
            TaskSpec::transform(
                "validate",
                "fastq2bam",
                r"(?P<path>.+)/out/(?P<sample>[a-zA-Z0-9]+).bam",
                "{path}/{sample}.validation",
            )
            .unwrap(),
        )
        .unwrap();

        let ctx = PipelineContext::new(vec![
            format!("{}/s1_R1.fastq.gz", root),
            format!("{}/s1_R2.fastq.gz", root),
        ]);
        TaskGraphBuilder::new(&p, &ctx).build().unwrap()
    }

    fn node<'a>(graph: &'a TaskGraph, task: &str) -> &'a TaskNode {
        graph.node(graph.nodes_of(task).unwrap()[0])
    }

    fn write_all(dir: &TempDir) {
        touch(&dir.path().join("s1_R1.fastq.gz"), 0);
        touch(&dir.path().join("s1_R2.fastq.gz"), 0);
        touch(&dir.path().join("out/s1.bam"), 10);
        touch(&dir.path().join("s1.validation"), 20);
    }

    #[test]
    fn test_missing_output_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let graph = build(&dir);
        touch(&dir.path().join("s1_R1.fastq.gz"), 0);

        let checker = StalenessChecker::new();
        assert!(matches!(
            checker.check_files(node(&graph, "fastq2bam")),
            Freshness::MissingOutput(_)
        ));
    }

    #[test]
    fn test_up_to_date_when_output_newer() {
        let dir = tempfile::tempdir().unwrap();
        let graph = build(&dir);
        write_all(&dir);

        let checker = StalenessChecker::new();
        assert_eq!(checker.check_files(node(&graph, "fastq2bam")), Freshness::UpToDate);
        assert!(!checker.is_stale(node(&graph, "validate"), false));
    }

    #[test]
    fn test_companion_newer_than_output() {
        let dir = tempfile::tempdir().unwrap();
        let graph = build(&dir);
        write_all(&dir);
        touch(&dir.path().join("s1_R2.fastq.gz"), 15);

        match StalenessChecker::new().check_files(node(&graph, "fastq2bam")) {
            Freshness::InputNewer { input, .. } => assert!(input.ends_with("s1_R2.fastq.gz")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_equal_timestamps_are_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let graph = build(&dir);
        write_all(&dir);
        touch(&dir.path().join("s1_R1.fastq.gz"), 10);

        assert!(!StalenessChecker::new().is_stale(node(&graph, "fastq2bam"), false));
    }

    #[test]
    fn test_config_newer_than_output() {
        let dir = tempfile::tempdir().unwrap();
        let graph = build(&dir);
        write_all(&dir);

        let config_time = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_015);
        let checker = StalenessChecker::new().with_config_modified(Some(config_time));

        assert!(matches!(
            checker.check_files(node(&graph, "fastq2bam")),
            Freshness::ConfigChanged { .. }
        ));
        assert_eq!(checker.check_files(node(&graph, "validate")), Freshness::UpToDate);
    }

    #[test]
    fn test_upstream_run_dominates_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let graph = build(&dir);
        write_all(&dir);

        let checker = StalenessChecker::new();
        assert_eq!(
            checker.evaluate(node(&graph, "validate"), false, true),
            Freshness::UpstreamWillRun
        );
        assert_eq!(
            checker.evaluate(node(&graph, "validate"), true, true),
            Freshness::Forced
        );
    }

    #[test]
    fn test_plan_propagates_from_touched_originate() {
        let dir = tempfile::tempdir().unwrap();
        let graph = build(&dir);
        write_all(&dir);
        let selected = vec![true; graph.len()];
        let checker = StalenessChecker::new();

        let plan = checker.plan(&graph, &selected, |_| false);
        assert_eq!(plan.stale_count(), 0);
        assert_eq!(plan.up_to_date_count(), 2);

        // validate's own output stays newer than its bam, yet it must rerun.
        touch(&dir.path().join("s1_R1.fastq.gz"), 12);
        let plan = checker.plan(&graph, &selected, |_| false);
        assert!(plan.will_run(node(&graph, "fastq2bam").id));
        assert_eq!(
            plan.get(node(&graph, "validate").id),
            Some(&Freshness::UpstreamWillRun)
        );
    }

    #[test]
    fn test_plan_skips_originate_and_unselected() {
        let dir = tempfile::tempdir().unwrap();
        let graph = build(&dir);
        let selected = graph.select(&["fastq2bam".to_string()]).unwrap();

        let plan = StalenessChecker::new().plan(&graph, &selected, |_| false);
        assert!(plan.get(node(&graph, "original_files").id).is_none());
        assert!(plan.get(node(&graph, "validate").id).is_none());
        assert!(plan.will_run(node(&graph, "fastq2bam").id));
    }

    #[test]
    fn test_plan_forced_task_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let graph = build(&dir);
        write_all(&dir);
        let selected = vec![true; graph.len()];

        let plan = StalenessChecker::new().plan(&graph, &selected, |n| n.task == "fastq2bam");
        assert_eq!(plan.get(node(&graph, "fastq2bam").id), Some(&Freshness::Forced));
        assert!(plan.will_run(node(&graph, "validate").id));
    }
}

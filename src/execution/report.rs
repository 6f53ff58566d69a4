//! Run Reports
//!
//! Per-node outcomes of one pipeline invocation plus the aggregate result.
//! Reports serialize to JSON and render a short text summary and an ASCII
//! timeline of the nodes that actually executed.

use std::fmt::{self, Write as _};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Local};
use log::info;
use serde::Serialize;

use crate::error::Result;
use crate::pipeline::{NodeId, TaskNode};

/// Lifecycle of one node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    /// Output already valid; success-equivalent.
    Skipped,
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Terminal and usable by dependents.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_become(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Pending, Ready | Skipped | Failed | Cancelled)
                | (Ready, Running | Cancelled)
                | (Running, Succeeded | Failed | Cancelled)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Outcome of one node.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub node: NodeId,
    pub task: String,
    pub label: String,
    pub output: String,
    pub state: NodeState,

    /// Why the node ran or was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Failure or cancellation detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Stdout/stderr logs, when a command was run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<(String, String)>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Local>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Local>>,
}

impl ExecutionRecord {
    pub fn new(node: &TaskNode, state: NodeState) -> Self {
        Self {
            node: node.id,
            task: node.task.clone(),
            label: node.label(),
            output: node.output.clone(),
            state,
            reason: None,
            message: None,
            exit_code: None,
            logs: None,
            started: None,
            finished: None,
        }
    }

    pub fn failed(node: &TaskNode, message: impl Into<String>) -> Self {
        Self::new(node, NodeState::Failed).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_logs(mut self, node: &TaskNode) -> Self {
        self.logs = Some((node.log_out_path(), node.log_err_path()));
        self
    }

    pub fn started_at(mut self, time: DateTime<Local>) -> Self {
        self.started = Some(time);
        self
    }

    pub fn finish(mut self, state: NodeState) -> Self {
        self.state = state;
        self.finished = Some(Local::now());
        self
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started, self.finished) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub pipeline: String,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    /// Set when the run was aborted, explicitly or by the fail-fast limit.
    pub cancelled: bool,
    /// One record per selected node, in node order.
    pub records: Vec<ExecutionRecord>,
}

impl RunReport {
    pub fn record(&self, id: NodeId) -> Option<&ExecutionRecord> {
        self.records.iter().find(|r| r.node == id)
    }

    pub fn state_of(&self, id: NodeId) -> Option<NodeState> {
        self.record(id).map(|r| r.state)
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.records.iter().filter(|r| r.state == state).count()
    }

    /// Records in a given state.
    pub fn with_state(&self, state: NodeState) -> impl Iterator<Item = &ExecutionRecord> {
        self.records.iter().filter(move |r| r.state == state)
    }

    /// True when no node failed or was cancelled.
    pub fn succeeded(&self) -> bool {
        self.records.iter().all(|r| r.state.is_success())
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{}: {} succeeded, {} skipped, {} failed, {} cancelled ({}; exit code {})",
            self.pipeline,
            self.count(NodeState::Succeeded),
            self.count(NodeState::Skipped),
            self.count(NodeState::Failed),
            self.count(NodeState::Cancelled),
            if self.succeeded() { "success" } else { "failure" },
            self.exit_code()
        )
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        info!("Saved run report to {}", path.display());
        Ok(())
    }

    /// ASCII Gantt chart of the nodes that ran, 50 columns wide.
    pub fn timeline_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total = (self.finished - self.started).num_milliseconds();
        if total <= 0 {
            return output;
        }
        let scale = 50.0 / total as f64;

        let mut spans: Vec<(&str, i64, i64)> = self
            .records
            .iter()
            .filter_map(|r| {
                let start = (r.started? - self.started).num_milliseconds().max(0);
                let end = (r.finished? - self.started).num_milliseconds().max(start);
                Some((r.label.as_str(), start, end))
            })
            .collect();
        spans.sort_by_key(|(_, start, _)| *start);

        for (label, start, end) in spans {
            let offset = (start as f64 * scale) as usize;
            let width = ((end - start) as f64 * scale).max(1.0) as usize;
            let _ = writeln!(
                output,
                "{:24} |{}{}| ({} ms)",
                truncate(label, 24),
                " ".repeat(offset),
                "#".repeat(width),
                end - start
            );
        }

        let _ = writeln!(output, "\nTotal: {} ms", total);
        output
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Binding, TaskKind};
    use chrono::Duration;

    fn node(id: usize, output: &str) -> TaskNode {
        TaskNode {
            id: NodeId(id),
            task: "fastq2bam".to_string(),
            kind: TaskKind::Transform,
            inputs: vec!["in".to_string()],
            companions: Vec::new(),
            extras: Vec::new(),
            output: output.to_string(),
            binding: Binding::new(),
        }
    }

    fn report(records: Vec<ExecutionRecord>) -> RunReport {
        let now = Local::now();
        RunReport {
            pipeline: "test".to_string(),
            started: now,
            finished: now + Duration::milliseconds(100),
            cancelled: false,
            records,
        }
    }

    #[test]
    fn test_state_transitions() {
        assert!(NodeState::Pending.can_become(NodeState::Ready));
        assert!(NodeState::Pending.can_become(NodeState::Skipped));
        assert!(NodeState::Running.can_become(NodeState::Cancelled));
        assert!(!NodeState::Skipped.can_become(NodeState::Running));
        assert!(!NodeState::Pending.can_become(NodeState::Running));
        assert!(!NodeState::Succeeded.can_become(NodeState::Failed));
    }

    #[test]
    fn test_success_states() {
        assert!(NodeState::Skipped.is_success());
        assert!(!NodeState::Cancelled.is_success());
        assert!(NodeState::Cancelled.is_terminal());
        assert!(!NodeState::Ready.is_terminal());
    }

    #[test]
    fn test_exit_code() {
        let ok = report(vec![
            ExecutionRecord::new(&node(1, "a.bam"), NodeState::Succeeded),
            ExecutionRecord::new(&node(2, "b.bam"), NodeState::Skipped),
        ]);
        assert!(ok.succeeded());
        assert_eq!(ok.exit_code(), 0);

        let bad = report(vec![
            ExecutionRecord::new(&node(1, "a.bam"), NodeState::Succeeded),
            ExecutionRecord::failed(&node(2, "b.bam"), "exit status 1"),
        ]);
        assert_eq!(bad.exit_code(), 1);
        assert!(bad.summary_line().contains("1 failed"));
    }

    #[test]
    fn test_cancelled_is_failure() {
        let r = report(vec![ExecutionRecord::new(&node(1, "a.bam"), NodeState::Cancelled)]);
        assert_eq!(r.exit_code(), 1);
    }

    #[test]
    fn test_json_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/run.json");

        let r = report(vec![ExecutionRecord::failed(&node(1, "/data/a.bam"), "boom")
            .with_logs(&node(1, "/data/a.bam"))]);
        r.save_json(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["records"][0]["state"], "failed");
        assert_eq!(value["records"][0]["message"], "boom");
        assert_eq!(value["records"][0]["logs"][0], "/data/a.bam.log.out");
    }

    #[test]
    fn test_timeline_chart() {
        let mut r = report(Vec::new());
        let mut rec = ExecutionRecord::new(&node(1, "/data/a.bam"), NodeState::Succeeded);
        rec.started = Some(r.started + Duration::milliseconds(20));
        rec.finished = Some(r.started + Duration::milliseconds(70));
        r.records.push(rec);
        r.records
            .push(ExecutionRecord::new(&node(2, "/data/b.bam"), NodeState::Skipped));

        let chart = r.timeline_chart();
        assert!(chart.contains("fastq2bam[a.bam]"));
        assert!(chart.contains("(50 ms)"));
        assert!(!chart.contains("b.bam"));
        assert!(chart.contains("Total: 100 ms"));
    }
}

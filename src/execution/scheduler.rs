//! Scheduler
//!
//! Walks the task graph in dependency order and drives every selected node
//! to a terminal state:
//!
//! - a node waits until each dependency has finished
//! - a failed dependency fails the node without running it
//! - otherwise the staleness check decides between Skipped and Ready
//! - Ready nodes are dispatched concurrently, up to `max_parallel`
//!
//! The scheduler is the only place node state changes. Workers report back
//! over a channel; a cancelled run stops dispatching, lets in-flight nodes
//! wind down and marks everything left over as Cancelled.

use std::sync::Arc;

use chrono::Local;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use super::report::{ExecutionRecord, NodeState, RunReport};
use super::runner::WorkUnitRunner;
use crate::error::ConfigError;
use crate::pipeline::{NodeId, StalenessChecker, StalenessPlan, TaskGraph, TaskNode};

/// Which nodes run regardless of timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ForceMode {
    #[default]
    None,
    All,
    Tasks(Vec<String>),
}

impl ForceMode {
    pub fn applies(&self, task: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Tasks(tasks) => tasks.iter().any(|t| t == task),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_parallel: usize,
    pub force: ForceMode,
    /// Tasks to bring up to date; empty means all.
    pub targets: Vec<String>,
    /// Cancel the run once this many nodes have failed.
    pub fail_fast: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_parallel: num_cpus::get(),
            force: ForceMode::None,
            targets: Vec::new(),
            fail_fast: None,
        }
    }
}

/// Requests cancellation of a run. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Clears a previous cancellation so the handle can stop a later run.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observes a [`CancelHandle`].
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

struct Slot {
    state: NodeState,
    /// Staleness reason for a node headed to Running.
    reason: Option<String>,
    record: Option<ExecutionRecord>,
}

pub struct Scheduler {
    graph: Arc<TaskGraph>,
    runner: Arc<WorkUnitRunner>,
    checker: StalenessChecker,
    options: RunOptions,
    cancel: CancelHandle,
}

impl Scheduler {
    pub fn new(graph: TaskGraph, runner: WorkUnitRunner) -> Self {
        let checker = StalenessChecker::for_context(runner.context())
            .with_base_dir(runner.working_dir().cloned());
        Self {
            graph: Arc::new(graph),
            runner: Arc::new(runner),
            checker,
            options: RunOptions::default(),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn runner(&self) -> &WorkUnitRunner {
        &self.runner
    }

    /// Handle that aborts a run in progress. It is re-armed when a run
    /// returns.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Staleness predictions for the selected nodes, without running them.
    pub fn plan(&self) -> Result<StalenessPlan, ConfigError> {
        let selected = self.graph.select(&self.options.targets)?;
        Ok(self
            .checker
            .plan(&self.graph, &selected, |node| self.options.force.applies(&node.task)))
    }

    /// Runs every selected node to a terminal state.
    ///
    /// Only an unknown target is an error; node failures are reported in
    /// the returned [`RunReport`].
    pub async fn run(&self) -> Result<RunReport, ConfigError> {
        let selected = self.graph.select(&self.options.targets)?;
        let max_parallel = self.options.max_parallel.max(1);
        let started = Local::now();

        let mut slots: Vec<Slot> = (0..self.graph.len())
            .map(|_| Slot {
                state: NodeState::Pending,
                reason: None,
                record: None,
            })
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel::<(NodeId, ExecutionRecord)>();
        let mut cancel = self.cancel.token();
        let mut cancelling = false;
        let mut running = 0usize;
        let mut failures = 0usize;

        info!(
            "Starting {} (max parallel: {}, {} of {} nodes selected)",
            self.graph.pipeline(),
            max_parallel,
            selected.iter().filter(|s| **s).count(),
            self.graph.len()
        );

        loop {
            if !cancelling {
                failures += self.advance(&mut slots, &selected);
                if self.fail_fast_reached(failures) {
                    cancelling = true;
                } else {
                    let capacity = max_parallel.saturating_sub(running);
                    running += self.dispatch(&mut slots, capacity, &tx);
                }
            }

            if running == 0 {
                break;
            }

            tokio::select! {
                Some((id, record)) = rx.recv() => {
                    running -= 1;
                    if record.state == NodeState::Failed {
                        failures += 1;
                    }
                    self.complete(&mut slots, id, record);
                    if !cancelling && self.fail_fast_reached(failures) {
                        cancelling = true;
                    }
                }
                _ = cancel.cancelled(), if !cancelling => {
                    warn!("Cancellation requested, waiting for {} running nodes", running);
                    cancelling = true;
                }
                else => break,
            }
        }

        if cancelling {
            self.cancel.cancel();
            self.cancel_remaining(&mut slots, &selected);
        }
        // Every worker has reported, so nothing still observes this run.
        self.cancel.reset();

        let report = RunReport {
            pipeline: self.graph.pipeline().to_string(),
            started,
            finished: Local::now(),
            cancelled: cancelling,
            records: slots.into_iter().filter_map(|s| s.record).collect(),
        };
        info!("{}", report.summary_line());
        Ok(report)
    }

    /// Settles nodes left over by a cancelled run. Lineages of a failed
    /// node still fail; everything else is Cancelled.
    fn cancel_remaining(&self, slots: &mut [Slot], selected: &[bool]) {
        for node in self.graph.nodes() {
            let id = node.id.0;
            if !selected[id] || slots[id].state.is_terminal() {
                continue;
            }

            let failed_dep = self
                .graph
                .dependencies(node.id)
                .iter()
                .find(|d| slots[d.0].state == NodeState::Failed);

            let record = match failed_dep {
                Some(dep) => ExecutionRecord::failed(
                    node,
                    format!("upstream {} failed", self.graph.node(*dep).label()),
                ),
                None => ExecutionRecord::new(node, NodeState::Cancelled)
                    .with_message("run cancelled before dispatch"),
            };
            Self::transition(&mut slots[id], node, record.state);
            slots[id].record = Some(record);
        }
    }

    fn fail_fast_reached(&self, failures: usize) -> bool {
        match self.options.fail_fast {
            Some(limit) if failures >= limit.max(1) => {
                error!("{} nodes failed, cancelling the run", failures);
                self.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn transition(slot: &mut Slot, node: &TaskNode, next: NodeState) {
        if !slot.state.can_become(next) {
            warn!("{}: unexpected transition {} -> {}", node.label(), slot.state, next);
        }
        debug!("{}: {} -> {}", node.label(), slot.state, next);
        slot.state = next;
    }

    /// Resolves every pending node whose dependencies have finished.
    ///
    /// Nodes are indexed in topological order, so one pass settles chains
    /// of skips and propagated failures. Returns the number of nodes that
    /// failed on their own (missing originate files).
    fn advance(&self, slots: &mut [Slot], selected: &[bool]) -> usize {
        let mut failures = 0;

        for node in self.graph.nodes() {
            let id = node.id.0;
            if !selected[id] || slots[id].state != NodeState::Pending {
                continue;
            }

            let deps = self.graph.dependencies(node.id);
            if let Some(dep) = deps.iter().find(|d| {
                matches!(slots[d.0].state, NodeState::Failed | NodeState::Cancelled)
            }) {
                let dep_state = slots[dep.0].state;
                let state = if dep_state == NodeState::Cancelled {
                    NodeState::Cancelled
                } else {
                    NodeState::Failed
                };
                let message = format!("upstream {} {}", self.graph.node(*dep).label(), dep_state);
                Self::transition(&mut slots[id], node, state);
                slots[id].record = Some(ExecutionRecord::new(node, state).with_message(message));
                continue;
            }

            if !deps.iter().all(|d| slots[d.0].state.is_success()) {
                continue;
            }

            if node.is_originate() {
                if self.runner.resolve(&node.output).exists() {
                    Self::transition(&mut slots[id], node, NodeState::Skipped);
                    slots[id].record = Some(
                        ExecutionRecord::new(node, NodeState::Skipped).with_reason("input file"),
                    );
                } else {
                    error!("Input file not found: {}", node.output);
                    Self::transition(&mut slots[id], node, NodeState::Failed);
                    slots[id].record = Some(ExecutionRecord::failed(
                        node,
                        format!("input file not found: {}", node.output),
                    ));
                    failures += 1;
                }
                continue;
            }

            let upstream_ran = deps
                .iter()
                .any(|d| slots[d.0].state == NodeState::Succeeded);
            let freshness = self.checker.evaluate(
                node,
                self.options.force.applies(&node.task),
                upstream_ran,
            );

            if freshness.is_stale() {
                info!("{}: will run ({})", node.label(), freshness);
                Self::transition(&mut slots[id], node, NodeState::Ready);
                slots[id].reason = Some(freshness.to_string());
            } else {
                debug!("{}: up to date, skipping", node.label());
                Self::transition(&mut slots[id], node, NodeState::Skipped);
                slots[id].record = Some(
                    ExecutionRecord::new(node, NodeState::Skipped).with_reason(freshness.to_string()),
                );
            }
        }

        failures
    }

    /// Starts up to `capacity` Ready nodes. Returns how many were started.
    fn dispatch(
        &self,
        slots: &mut [Slot],
        capacity: usize,
        tx: &mpsc::UnboundedSender<(NodeId, ExecutionRecord)>,
    ) -> usize {
        let mut started = 0;

        for node in self.graph.nodes() {
            if started >= capacity {
                break;
            }
            if slots[node.id.0].state != NodeState::Ready {
                continue;
            }

            info!("Starting node: {}", node.label());
            Self::transition(&mut slots[node.id.0], node, NodeState::Running);
            self.spawn_node(node.id, tx.clone());
            started += 1;
        }

        started
    }

    fn spawn_node(&self, id: NodeId, tx: mpsc::UnboundedSender<(NodeId, ExecutionRecord)>) {
        let graph = Arc::clone(&self.graph);
        let runner = Arc::clone(&self.runner);
        let token = self.cancel.token();

        tokio::spawn(async move {
            let worker = {
                let graph = Arc::clone(&graph);
                tokio::spawn(async move { runner.execute(graph.node(id), token).await })
            };

            // A panicking worker still has to report, or the run never ends.
            let record = match worker.await {
                Ok(record) => record,
                Err(e) => ExecutionRecord::failed(graph.node(id), format!("worker panicked: {}", e)),
            };

            if tx.send((id, record)).is_err() {
                error!("Failed to send completion for node {}", id);
            }
        });
    }

    fn complete(&self, slots: &mut [Slot], id: NodeId, mut record: ExecutionRecord) {
        let node = self.graph.node(id);
        let slot = &mut slots[id.0];

        match record.state {
            NodeState::Succeeded => info!("{} completed successfully", node.label()),
            NodeState::Failed => error!(
                "{} failed: {}",
                node.label(),
                record.message.as_deref().unwrap_or("unknown error")
            ),
            NodeState::Cancelled => warn!("{} cancelled", node.label()),
            other => warn!("{} reported non-terminal state {}", node.label(), other),
        }

        Self::transition(slot, node, record.state);
        record.reason = slot.reason.take();
        slot.record = Some(record);
    }
}

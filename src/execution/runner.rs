//! Work Unit Execution
//!
//! Runs one node: checks its inputs, asks the node's stage for a work unit,
//! creates the output directory and executes the unit. Shell commands go to
//! a [`JobBackend`]; stages with `local: false` use the configured remote
//! backend when there is one. Stdout and stderr are appended to
//! `<output>.log.out` and `<output>.log.err`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use log::{debug, error, info, warn};
use tokio::time::sleep;

use super::backend::{
    append_log, open_log, JobBackend, JobHandle, JobRequest, JobStatus, LocalBackend, Submission,
};
use super::report::{ExecutionRecord, NodeState};
use super::scheduler::CancelToken;
use crate::pipeline::stage::{InProcessFn, ShellCommand, WorkUnit};
use crate::pipeline::{PipelineContext, StageRegistry, TaskNode};

/// Default interval between status polls of queued jobs.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct WorkUnitRunner {
    context: Arc<PipelineContext>,
    registry: StageRegistry,
    local: Arc<dyn JobBackend>,
    remote: Option<Arc<dyn JobBackend>>,
    poll_interval: Duration,
    working_dir: Option<PathBuf>,
}

impl WorkUnitRunner {
    pub fn new(context: Arc<PipelineContext>, registry: StageRegistry) -> Self {
        Self {
            context,
            registry,
            local: Arc::new(LocalBackend::new()),
            remote: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            working_dir: None,
        }
    }

    /// Backend for stages not marked `local: true`.
    pub fn with_backend(mut self, backend: Arc<dyn JobBackend>) -> Self {
        self.remote = Some(backend);
        self
    }

    pub fn with_local_backend(mut self, backend: Arc<dyn JobBackend>) -> Self {
        self.local = backend;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Directory that relative paths and commands are resolved in.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    /// Resolves a per-command directory; absolute paths are kept as given.
    fn resolve_dir(&self, dir: PathBuf) -> PathBuf {
        match &self.working_dir {
            Some(base) => base.join(dir),
            None => dir,
        }
    }

    /// Resolves a node path against the working directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        match &self.working_dir {
            Some(dir) => dir.join(path),
            None => PathBuf::from(path),
        }
    }

    fn backend_for(&self, task: &str) -> &Arc<dyn JobBackend> {
        let local = self.context.stage_bool(task, "local").unwrap_or(false);
        match &self.remote {
            Some(remote) if !local => remote,
            _ => &self.local,
        }
    }

    /// One-line description of what running `node` would do.
    pub fn describe(&self, node: &TaskNode) -> String {
        let Some(stage) = self.registry.get(&node.task) else {
            return "no stage registered".to_string();
        };
        match stage.work_unit(node, &self.context) {
            Ok(WorkUnit::Noop) => "nothing to run".to_string(),
            Ok(WorkUnit::Shell(cmd)) => {
                format!("{} via {}", cmd.command, self.backend_for(&node.task).name())
            }
            Ok(WorkUnit::InProcess(_)) => "in-process function".to_string(),
            Err(e) => format!("cannot run: {}", e),
        }
    }

    /// Executes `node` and reports how it ended.
    ///
    /// The returned record is always terminal: Succeeded, Failed or
    /// Cancelled. Cancellation stops waiting immediately; local children
    /// are killed and queued jobs are cancelled on their backend. Every
    /// failure is also appended to the node's error log.
    pub async fn execute(&self, node: &TaskNode, cancel: CancelToken) -> ExecutionRecord {
        let record = ExecutionRecord::new(node, NodeState::Running)
            .started_at(Local::now())
            .with_logs(node);

        for input in node.all_inputs() {
            if !tokio::fs::try_exists(self.resolve(input)).await.unwrap_or(false) {
                return self
                    .fail(node, record, format!("missing input: {}", input))
                    .await;
            }
        }

        let Some(stage) = self.registry.get(&node.task) else {
            let message = format!("no stage registered for task '{}'", node.task);
            return self.fail(node, record, message).await;
        };

        let unit = match stage.work_unit(node, &self.context) {
            Ok(unit) => unit,
            Err(e) => return self.fail(node, record, e.to_string()).await,
        };

        let output = self.resolve(&node.output);
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                let message = format!("cannot create {}: {}", parent.display(), e);
                return self.fail(node, record, message).await;
            }
        }

        match unit {
            WorkUnit::Noop => match self.open_logs(node).await {
                Ok(()) => record.finish(NodeState::Succeeded),
                Err(e) => self.fail(node, record, format!("cannot open logs: {}", e)).await,
            },
            WorkUnit::InProcess(work) => {
                self.run_in_process(node, record, work, cancel).await
            }
            WorkUnit::Shell(cmd) => self.run_shell(node, record, cmd, cancel).await,
        }
    }

    /// Creates both log files so every executed node has them.
    async fn open_logs(&self, node: &TaskNode) -> std::io::Result<()> {
        open_log(&self.resolve(&node.log_out_path())).await?;
        open_log(&self.resolve(&node.log_err_path())).await?;
        Ok(())
    }

    async fn fail(
        &self,
        node: &TaskNode,
        record: ExecutionRecord,
        message: String,
    ) -> ExecutionRecord {
        error!("{}: {}", node.label(), message);
        let err_log = self.resolve(&node.log_err_path());
        if let Err(e) = append_log(&err_log, &message).await {
            warn!("{}: cannot write {}: {}", node.label(), err_log.display(), e);
        }
        record.with_message(message).finish(NodeState::Failed)
    }

    async fn run_in_process(
        &self,
        node: &TaskNode,
        record: ExecutionRecord,
        work: InProcessFn,
        mut cancel: CancelToken,
    ) -> ExecutionRecord {
        if let Err(e) = self.open_logs(node).await {
            return self
                .fail(node, record, format!("cannot open logs: {}", e))
                .await;
        }

        // A blocking closure cannot be interrupted; cancellation only stops
        // waiting for it.
        let handle = tokio::task::spawn_blocking(work);
        tokio::select! {
            result = handle => match result {
                Ok(Ok(())) => record.finish(NodeState::Succeeded),
                Ok(Err(message)) => self.fail(node, record, message).await,
                Err(e) => {
                    self.fail(node, record, format!("in-process work panicked: {}", e))
                        .await
                }
            },
            _ = cancel.cancelled() => record
                .with_message("cancelled")
                .finish(NodeState::Cancelled),
        }
    }

    async fn run_shell(
        &self,
        node: &TaskNode,
        record: ExecutionRecord,
        cmd: ShellCommand,
        mut cancel: CancelToken,
    ) -> ExecutionRecord {
        let backend = Arc::clone(self.backend_for(&node.task));
        let request = JobRequest {
            stage: node.task.clone(),
            label: node.label(),
            command: cmd.command,
            working_dir: match cmd.working_dir {
                Some(dir) => Some(self.resolve_dir(dir)),
                None => self.working_dir.clone(),
            },
            stdout: self.resolve(&node.log_out_path()),
            stderr: self.resolve(&node.log_err_path()),
            resources: self.context.stage_settings(&node.task),
        };

        info!("{}: submitting to {} backend", node.label(), backend.name());
        debug!("{}: {}", node.label(), request.command);

        let submission = tokio::select! {
            result = backend.submit(request) => result,
            _ = cancel.cancelled() => {
                // Dropping the submit future kills a local job's process group.
                return record.with_message("cancelled").finish(NodeState::Cancelled);
            }
        };

        let handle = match submission {
            Ok(Submission::Finished(code)) => return finish_with_code(node, record, code),
            Ok(Submission::Queued(handle)) => handle,
            Err(e) => return self.fail(node, record, e.to_string()).await,
        };

        debug!("{}: queued as {}", node.label(), handle);
        self.wait_for_job(node, record, backend.as_ref(), &handle, &mut cancel)
            .await
    }

    async fn wait_for_job(
        &self,
        node: &TaskNode,
        record: ExecutionRecord,
        backend: &dyn JobBackend,
        handle: &JobHandle,
        cancel: &mut CancelToken,
    ) -> ExecutionRecord {
        loop {
            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    if let Err(e) = backend.cancel(handle).await {
                        warn!("{}: failed to cancel job {}: {}", node.label(), handle, e);
                    }
                    return record.with_message("cancelled").finish(NodeState::Cancelled);
                }
            }

            match backend.poll(handle).await {
                Ok(JobStatus::Running) => continue,
                Ok(JobStatus::Exited(code)) => return finish_with_code(node, record, code),
                Err(e) => {
                    let message = format!("lost track of job {}: {}", handle, e);
                    return self.fail(node, record, message).await;
                }
            }
        }
    }
}

fn finish_with_code(node: &TaskNode, mut record: ExecutionRecord, code: i32) -> ExecutionRecord {
    record.exit_code = Some(code);
    if code == 0 {
        record.finish(NodeState::Succeeded)
    } else {
        error!(
            "{} failed with exit code {}. See {}",
            node.label(),
            code,
            node.log_err_path()
        );
        record
            .with_message(format!("exit code {}", code))
            .finish(NodeState::Failed)
    }
}

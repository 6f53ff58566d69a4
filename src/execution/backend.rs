//! Job Backends
//!
//! A [`JobBackend`] runs a rendered shell command on behalf of one node. A
//! backend either completes the job inside `submit` and reports the exit
//! code, or hands back a [`JobHandle`] that the runner polls until the job
//! exits. The second shape fits batch schedulers where a job can sit in a
//! queue for hours.
//!
//! [`LocalBackend`] runs commands as child processes with `sh -c`, each in
//! its own process group. Dropping its submit future kills the whole group,
//! so pipelines and subshells die with the node.

use std::fmt;
use std::fs::File;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use log::{debug, warn};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::BackendError;
use crate::pipeline::StageSettings;

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Everything a backend needs to run one command.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Task name, used as the job name by schedulers.
    pub stage: String,
    pub label: String,
    pub command: String,
    pub working_dir: Option<PathBuf>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub resources: StageSettings,
}

/// Backend-specific identifier of a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(pub String);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The job already ran to completion.
    Finished(i32),
    /// The job was accepted; poll the handle for its status.
    Queued(JobHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Exited(i32),
}

/// Something that can execute shell commands for nodes.
///
/// Implementations must be safe to share between concurrently running
/// nodes.
pub trait JobBackend: Send + Sync {
    fn name(&self) -> &str;

    fn submit(&self, request: JobRequest) -> BackendFuture<'_, Submission>;

    fn poll(&self, handle: &JobHandle) -> BackendFuture<'_, JobStatus>;

    /// Best-effort cancellation of a queued or running job.
    fn cancel(&self, handle: &JobHandle) -> BackendFuture<'_, ()>;
}

/// Opens a log file for appending, creating parent directories.
pub async fn open_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(file.into_std().await)
}

/// Appends one line to a log file, creating it if needed.
pub async fn append_log(path: &Path, line: &str) -> io::Result<()> {
    let mut file = tokio::fs::File::from_std(open_log(path).await?);
    file.write_all(format!("{}\n", line.trim_end()).as_bytes()).await?;
    file.flush().await
}

/// Kills a job's process group when dropped, unless the job already exited.
struct GroupGuard {
    pgid: Option<i32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.map(|pid| pid as i32),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!("Killing process group {}", pgid);
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let err = io::Error::last_os_error();
        // ESRCH: the group is already gone.
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!("Failed to kill process group {}: {}", pgid, err);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}

/// Runs commands as local child processes.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    shell: Option<String>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `shell` instead of `sh` to interpret commands.
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: Some(shell.into()),
        }
    }

    async fn command(&self, request: &JobRequest) -> Result<Command, BackendError> {
        let submit_err = |source| BackendError::Submit {
            stage: request.stage.clone(),
            source,
        };
        let stdout = open_log(&request.stdout).await.map_err(submit_err)?;
        let stderr = open_log(&request.stderr).await.map_err(submit_err)?;

        let mut cmd = Command::new(self.shell.as_deref().unwrap_or("sh"));
        cmd.arg("-c")
            .arg(&request.command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        // Own group, so cancellation reaches everything the shell forks.
        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
            debug!("Executing in directory: {}", dir.display());
        }
        Ok(cmd)
    }
}

impl JobBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn submit(&self, request: JobRequest) -> BackendFuture<'_, Submission> {
        Box::pin(async move {
            let mut child = self
                .command(&request)
                .await?
                .spawn()
                .map_err(|source| BackendError::Submit {
                    stage: request.stage.clone(),
                    source,
                })?;

            debug!("{}: spawned pid {:?}", request.label, child.id());
            let mut group = GroupGuard::new(child.id());
            let status = child.wait().await?;
            group.disarm();

            // Killed by a signal: no exit code.
            Ok(Submission::Finished(status.code().unwrap_or(-1)))
        })
    }

    fn poll(&self, handle: &JobHandle) -> BackendFuture<'_, JobStatus> {
        let handle = handle.clone();
        Box::pin(async move { Err(BackendError::UnknownJob(handle.0)) })
    }

    fn cancel(&self, _handle: &JobHandle) -> BackendFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn request(dir: &Path, command: &str) -> JobRequest {
        JobRequest {
            stage: "echo".to_string(),
            label: "echo[out.txt]".to_string(),
            command: command.to_string(),
            working_dir: Some(dir.to_path_buf()),
            stdout: dir.join("out.txt.log.out"),
            stderr: dir.join("out.txt.log.err"),
            resources: StageSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_local_backend_runs_command() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new();

        let result = backend
            .submit(request(dir.path(), "echo hello; echo oops >&2; touch out.txt"))
            .await
            .unwrap();

        assert_eq!(result, Submission::Finished(0));
        assert!(dir.path().join("out.txt").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("out.txt.log.out")).unwrap(),
            "hello\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("out.txt.log.err")).unwrap(),
            "oops\n"
        );
    }

    #[tokio::test]
    async fn test_local_backend_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let result = LocalBackend::new()
            .submit(request(dir.path(), "exit 3"))
            .await
            .unwrap();
        assert_eq!(result, Submission::Finished(3));
    }

    #[tokio::test]
    async fn test_logs_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new();
        backend.submit(request(dir.path(), "echo one")).await.unwrap();
        backend.submit(request(dir.path(), "echo two")).await.unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("out.txt.log.out")).unwrap(),
            "one\ntwo\n"
        );
    }

    #[tokio::test]
    async fn test_unknown_shell_is_submit_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalBackend::with_shell("/nonexistent/shell")
            .submit(request(dir.path(), "true"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Submit { .. }));
    }
}

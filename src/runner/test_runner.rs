//! Running a task's eval command inside a sandbox.
//!
//! The child runs in its own process group so a timeout, or dropping the
//! run future on cancellation, takes down everything it spawned. stdout
//! and stderr are drained concurrently and truncated after capture.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::sandbox::Sandbox;
use crate::catalog::EvalCommand;
use crate::utils::{resolve_within, truncate_with_marker};

/// Default cap on captured characters per stream.
pub const DEFAULT_MAX_LOG_CHARS: usize = 20_000;

/// How long to wait for pipes to drain after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Outcome of one eval run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// The eval command could not be run at all.
#[derive(Debug, Error)]
pub enum TestRunnerError {
    #[error("Eval command is empty")]
    EmptyCommand,

    #[error("Invalid working directory '{dir}': {reason}")]
    InvalidWorkingDir { dir: String, reason: String },

    #[error("Failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("Failed waiting for eval process: {0}")]
    Wait(String),
}

/// Executes eval commands with a hard timeout.
#[derive(Debug, Clone)]
pub struct TestRunner {
    max_log_chars: usize,
}

impl Default for TestRunner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LOG_CHARS)
    }
}

impl TestRunner {
    pub fn new(max_log_chars: usize) -> Self {
        Self { max_log_chars }
    }

    pub fn max_log_chars(&self) -> usize {
        self.max_log_chars
    }

    /// Run `command` in the sandbox.
    pub async fn run(
        &self,
        sandbox: &Sandbox,
        command: &EvalCommand,
        timeout: Duration,
    ) -> Result<TestResult, TestRunnerError> {
        self.run_in(sandbox.root(), command, timeout).await
    }

    /// Run `command` rooted at `root`.
    ///
    /// # Arguments
    ///
    /// * `root` - Sandbox directory; `command.working_dir` is resolved inside it
    /// * `command` - Argv and environment overrides
    /// * `timeout` - Wall-clock limit before the process group is killed
    pub async fn run_in(
        &self,
        root: &Path,
        command: &EvalCommand,
        timeout: Duration,
    ) -> Result<TestResult, TestRunnerError> {
        let program = command.program().ok_or(TestRunnerError::EmptyCommand)?;
        let cwd = working_dir(root, command)?;

        let mut cmd = Command::new(program);
        cmd.args(&command.argv[1..])
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !command.env.contains_key("PYTHONPATH") {
            let python_path = match std::env::var("PYTHONPATH") {
                Ok(existing) if !existing.is_empty() => format!(".:{}", existing),
                _ => ".".to_string(),
            };
            cmd.env("PYTHONPATH", python_path);
        }
        cmd.envs(&command.env);
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| TestRunnerError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
        })?;
        // Declared after `child` so it drops first, while the leader is unreaped.
        let mut group = GroupGuard::new(child.id());
        debug!(command = %command.display(), cwd = %cwd.display(), "Spawned eval command");

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                group.disarm();
                (status.code(), false)
            }
            Ok(Err(e)) => {
                group.kill();
                if let Err(kill_err) = child.kill().await {
                    debug!(error = %kill_err, "Child already exited");
                }
                return Err(TestRunnerError::Wait(e.to_string()));
            }
            Err(_) => {
                warn!(
                    command = %command.display(),
                    timeout_secs = timeout.as_secs_f64(),
                    "Eval command timed out, killing process group"
                );
                group.kill();
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Child already exited");
                }
                (None, true)
            }
        };

        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;

        Ok(TestResult {
            exit_code,
            stdout: truncate_with_marker(&stdout, self.max_log_chars),
            stderr: truncate_with_marker(&stderr, self.max_log_chars),
            timed_out,
            duration: started.elapsed(),
        })
    }
}

fn working_dir(root: &Path, command: &EvalCommand) -> Result<PathBuf, TestRunnerError> {
    let Some(dir) = command.working_dir.as_deref() else {
        return Ok(root.to_path_buf());
    };
    let resolved = resolve_within(root, dir).map_err(|e| TestRunnerError::InvalidWorkingDir {
        dir: dir.to_string(),
        reason: e.to_string(),
    })?;
    if !resolved.is_dir() {
        return Err(TestRunnerError::InvalidWorkingDir {
            dir: dir.to_string(),
            reason: "not a directory".to_string(),
        });
    }
    Ok(resolved)
}

fn spawn_reader<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                debug!(error = %e, "Eval output pipe closed with error");
            }
            buf
        })
    })
}

async fn drain(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(mut handle) = reader else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            debug!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            // A descendant escaped the group and still holds the pipe.
            handle.abort();
            String::new()
        }
    }
}

/// Kills the eval's process group on drop unless disarmed.
///
/// Dropping the run future (an aborted attempt) would otherwise only kill
/// the direct child and leave its descendants running.
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    /// The leader was reaped normally; the group id may be reused.
    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                debug!(pgid, error = %e, "killpg failed");
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> EvalCommand {
        EvalCommand::new(["sh", "-c", script])
    }

    /// Script that starts a background `sleep`, records its pid and blocks.
    pub(crate) fn background_sleep_script(pid_file: &Path) -> String {
        format!("sleep 300 & echo $! > '{}'; sleep 300", pid_file.display())
    }

    /// Wait for `pid_file` to appear and return the pid it holds.
    pub(crate) async fn read_pid(pid_file: &Path) -> i32 {
        for _ in 0..100 {
            if let Ok(raw) = std::fs::read_to_string(pid_file) {
                if let Ok(pid) = raw.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("pid file {} never written", pid_file.display());
    }

    /// Whether `pid` has exited (gone or a zombie awaiting its reaper).
    #[cfg(target_os = "linux")]
    pub(crate) async fn process_gone(pid: i32) -> bool {
        for _ in 0..100 {
            match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
                Err(_) => return true,
                Ok(stat) => {
                    let state = stat.rsplit(')').next().unwrap_or("").trim_start();
                    if state.starts_with('Z') {
                        return true;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_exit_codes() {
        let tmp = TempDir::new().unwrap();
        let runner = TestRunner::default();

        let ok = runner
            .run_in(tmp.path(), &sh("echo hello"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(ok.passed());
        assert_eq!(ok.stdout, "hello\n");

        let fail = runner
            .run_in(tmp.path(), &sh("echo oops >&2; exit 3"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!fail.passed());
        assert_eq!(fail.exit_code, Some(3));
        assert!(!fail.timed_out);
        assert_eq!(fail.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_group() {
        let tmp = TempDir::new().unwrap();
        let runner = TestRunner::default();
        let started = Instant::now();
        let result = runner
            .run_in(tmp.path(), &sh("sleep 30 & sleep 30"), Duration::from_millis(300))
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.passed());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_output_truncated_with_marker() {
        let tmp = TempDir::new().unwrap();
        let runner = TestRunner::new(10);
        let result = runner
            .run_in(tmp.path(), &sh("printf '%050d' 0"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(result.stdout.starts_with("0000000000\n"));
        assert!(result.stdout.ends_with("[truncated 40 characters]"));
    }

    #[tokio::test]
    async fn test_runs_in_working_dir_with_env() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        let command = sh("basename \"$PWD\"; echo $FOO; echo $PYTHONPATH")
            .with_working_dir("sub")
            .with_env("FOO", "bar")
            .with_env("PYTHONPATH", "custom");
        let result = TestRunner::default()
            .run_in(tmp.path(), &command, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.stdout, "sub\nbar\ncustom\n");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let tmp = TempDir::new().unwrap();
        let err = TestRunner::default()
            .run_in(
                tmp.path(),
                &EvalCommand::new(["definitely-not-a-real-binary-xyz"]),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TestRunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_working_dir_escape_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = TestRunner::default()
            .run_in(tmp.path(), &sh("true").with_working_dir("../.."), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TestRunnerError::InvalidWorkingDir { .. }));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_run_kills_background_children() {
        let tmp = TempDir::new().unwrap();
        let pid_file = tmp.path().join("bg.pid");
        let runner = TestRunner::default();
        let command = sh(&background_sleep_script(&pid_file));

        let run = runner.run_in(tmp.path(), &command, Duration::from_secs(600));
        let pid = tokio::select! {
            _ = run => panic!("eval finished before it was dropped"),
            pid = read_pid(&pid_file) => pid,
        };
        assert!(process_gone(pid).await, "background sleep {} survived", pid);
    }
}

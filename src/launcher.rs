//! Process launching for test jobs.
//!
//! This module defines the boundary between the stage engine and the
//! operating system: a [`Command`] describes one test invocation, a
//! [`ProcessLauncher`] runs it, and a [`ProcessResult`] records what
//! happened.
//!
//! # Timeouts
//!
//! [`LocalLauncher`] starts every job in its own process group and waits for
//! the direct child up to the given timeout. When the limit elapses the
//! whole group is killed and the child reaped before `run` returns, and the
//! result is marked as timed out. The group is also killed once the child
//! exits and when the job future is dropped, so no descendant outlives the
//! job and keeps using its shard.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Errors that prevent a test process from running at all.
///
/// A process that starts and exits non-zero is NOT a launch error; that is
/// recorded in its [`ProcessResult`].
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The program could not be spawned (not found, not executable, ...).
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        /// The program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error while waiting on or terminating the process.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A test command to execute.
///
/// # Example
///
/// ```
/// use shardrun::launcher::Command;
///
/// let cmd = Command::new("legate")
///     .args(["--cpus", "2"])
///     .arg("tests/test_io.py")
///     .env("LEGATE_TEST", "1");
///
/// assert_eq!(cmd.to_shell_string(), "legate --cpus 2 tests/test_io.py");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory. `None` inherits the current directory.
    pub working_dir: Option<PathBuf>,

    /// Environment overrides layered on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Adds a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds one environment override.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds several environment overrides. Later values win.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Renders the command as a shell-quoted string for logs and reports.
    pub fn to_shell_string(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|s| shell_words::quote(s).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_tokio(&self) -> tokio::process::Command {
        let mut process = tokio::process::Command::new(&self.program);
        process.args(&self.args);
        process.envs(&self.env);
        if let Some(dir) = &self.working_dir {
            process.current_dir(dir);
        }
        process
    }
}

/// Outcome of one test process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessResult {
    /// Display name of the test.
    pub test: String,

    /// The full command line, shell-quoted.
    pub invocation: String,

    /// Exit code. `-1` when the process was killed by a signal or never ran.
    pub exit_code: i32,

    /// Captured stdout followed by stderr.
    pub output: String,

    /// Wall-clock time from spawn to exit.
    pub time: Duration,

    /// The process exceeded its timeout and was killed.
    pub timed_out: bool,
}

impl ProcessResult {
    /// Returns `true` if the test passed: exit code 0 and no timeout.
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Builds the failed result for a test whose process could not start.
    pub fn launch_failure(test: &str, cmd: &Command, error: &LaunchError) -> Self {
        Self {
            test: test.to_string(),
            invocation: cmd.to_shell_string(),
            exit_code: -1,
            output: error.to_string(),
            time: Duration::ZERO,
            timed_out: false,
        }
    }
}

/// Runs test processes.
///
/// Implementations must terminate and reap a process whose timeout elapses
/// and must never leave orphaned children behind on any exit path.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Runs `cmd` to completion, capturing its output.
    ///
    /// # Arguments
    ///
    /// * `cmd` - The command, including environment overrides
    /// * `display` - Test display name recorded in the result
    /// * `timeout` - Kill the process after this long, if set
    async fn run(
        &self,
        cmd: &Command,
        display: &str,
        timeout: Option<Duration>,
    ) -> Result<ProcessResult, LaunchError>;

    /// Runs `cmd` attached to the current terminal and returns its exit code.
    async fn run_interactive(&self, cmd: &Command) -> Result<i32, LaunchError>;
}

/// Launcher that runs tests as local child processes.
#[derive(Debug, Clone, Default)]
pub struct LocalLauncher;

impl LocalLauncher {
    /// Creates a new local launcher.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for LocalLauncher {
    async fn run(
        &self,
        cmd: &Command,
        test: &str,
        timeout: Option<Duration>,
    ) -> Result<ProcessResult, LaunchError> {
        debug!("Launching {}: {}", test, cmd.to_shell_string());

        let mut process = cmd.to_tokio();
        process
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = process.spawn().map_err(|source| LaunchError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;
        let group = ProcessGroup::of(&child);

        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());

        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };

        let (exit_code, timed_out) = match waited {
            Some(status) => (status?.code().unwrap_or(-1), false),
            None => {
                warn!("{} timed out after {:?}, killing", test, timeout.unwrap_or_default());
                group.kill();
                // kill() also waits, so the child is reaped here
                child.kill().await?;
                (-1, true)
            }
        };

        // Anything the test left running in its group would outlive the
        // shard lease.
        group.kill();

        let mut output = String::from_utf8_lossy(&collect(stdout).await).into_owned();
        output.push_str(&String::from_utf8_lossy(&collect(stderr).await));

        Ok(ProcessResult {
            test: test.to_string(),
            invocation: cmd.to_shell_string(),
            exit_code,
            output,
            time: start.elapsed(),
            timed_out,
        })
    }

    async fn run_interactive(&self, cmd: &Command) -> Result<i32, LaunchError> {
        debug!("Launching interactively: {}", cmd.to_shell_string());

        // Stays in the terminal's foreground group so the debugger gets
        // keyboard signals.
        let mut process = cmd.to_tokio();
        process
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let status = process
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: cmd.program.clone(),
                source,
            })?
            .wait()
            .await?;

        Ok(status.code().unwrap_or(-1))
    }
}

/// How long to keep reading a job's pipes after its process group is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// The process group a job runs in. Killed when dropped, so a cancelled job
/// takes its descendants with it.
#[derive(Debug)]
struct ProcessGroup(Option<libc::pid_t>);

impl ProcessGroup {
    fn of(child: &tokio::process::Child) -> Self {
        Self(
            child
                .id()
                .and_then(|pid| libc::pid_t::try_from(pid).ok())
                .filter(|&pid| pid > 0),
        )
    }

    /// Sends SIGKILL to every process in the group. A group that is already
    /// empty is not an error.
    fn kill(&self) {
        if let Some(pgid) = self.0 {
            // SAFETY: killpg takes plain integers and touches no memory; pgid
            // is positive so it never targets our own group.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Reads a pipe to the end on a background task. Read errors truncate the
/// captured output.
fn capture<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        })
    })
}

/// Collects a captured pipe, giving up after [`DRAIN_GRACE`] if something
/// outside the job's group still holds it open.
async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(mut handle) = handle else {
        return Vec::new();
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(Ok(buf)) => buf,
        _ => {
            handle.abort();
            Vec::new()
        }
    }
}

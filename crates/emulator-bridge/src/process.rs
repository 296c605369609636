//! Process Driver
//!
//! Runs SDK tools as child processes and supervises long-running ones
//! (the emulator). Every process spawned here is killed and reaped on
//! timeout, cancellation, or drop.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default timeout for short tool invocations
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of output lines retained for a supervised process
pub const OUTPUT_TAIL_LINES: usize = 200;

/// How long to wait for output pipes to drain after a process exits
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Process errors
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("executable not found: {}", .program.display())]
    NotFound { program: PathBuf },
    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} timed out after {timeout:?}", .program.display())]
    Timeout { program: PathBuf, timeout: Duration },
    #[error("{} was cancelled", .program.display())]
    Cancelled { program: PathBuf },
    #[error("{} exited unexpectedly (code {code:?})", .program.display())]
    Exited {
        program: PathBuf,
        code: Option<i32>,
        output_tail: Vec<String>,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessError::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Timeout { .. })
    }

    fn from_spawn(program: &PathBuf, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ProcessError::NotFound {
                program: program.clone(),
            }
        } else {
            ProcessError::Spawn {
                program: program.clone(),
                source: err,
            }
        }
    }
}

/// A single tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Written to the child's stdin, which is then closed
    pub stdin: Option<String>,
}

impl CommandRequest {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// File name of the program, e.g. `adb`
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    /// Command line for logs and matching
    pub fn command_line(&self) -> String {
        let mut line = self.program_name();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Output of a completed process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim_end();
        let stderr = self.stderr.trim_end();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, _) => stderr.to_string(),
            (_, true) => stdout.to_string(),
            _ => format!("{stdout}\n{stderr}"),
        }
    }
}

/// Runs and spawns external processes.
///
/// Implementations must guarantee that a process started by `run` has been
/// reaped by the time the call returns, whatever the outcome.
#[async_trait]
pub trait ProcessDriver: Send + Sync + 'static {
    /// Run a command to completion and collect its output.
    ///
    /// A non-zero exit code is not an error at this level.
    async fn run(
        &self,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError>;

    /// Start a long-running process under supervision.
    fn spawn(&self, request: &CommandRequest) -> Result<ManagedProcess, ProcessError>;
}

/// Process driver backed by real OS processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessDriver;

#[async_trait]
impl ProcessDriver for SystemProcessDriver {
    async fn run(
        &self,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError> {
        debug!("exec: {}", request.command_line());

        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled {
                program: request.program.clone(),
            });
        }

        let mut child = Command::new(&request.program)
            .args(&request.args)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::from_spawn(&request.program, e))?;

        if let (Some(input), Some(mut stdin)) = (request.stdin.as_ref(), child.stdin.take()) {
            // The tool may exit without reading its input
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!("stdin for {} not consumed: {}", request.program_name(), e);
            }
        }

        let stdout = child.stdout.take().map(|s| tokio::spawn(read_lossy(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_lossy(s)));

        let outcome: Result<ExitStatus, ProcessError> = tokio::select! {
            status = child.wait() => status.map_err(ProcessError::Io),
            _ = tokio::time::sleep(request.timeout) => Err(ProcessError::Timeout {
                program: request.program.clone(),
                timeout: request.timeout,
            }),
            _ = cancel.cancelled() => Err(ProcessError::Cancelled {
                program: request.program.clone(),
            }),
        };

        match outcome {
            Ok(status) => {
                let output = ProcessOutput {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: drain(stdout).await,
                    stderr: drain(stderr).await,
                };
                trace!(
                    "{} exited with {}: {}",
                    request.program_name(),
                    output.exit_code,
                    output.combined()
                );
                Ok(output)
            }
            Err(err) => {
                reap(&mut child, &request.program_name()).await;
                for reader in [stdout, stderr].into_iter().flatten() {
                    reader.abort();
                }
                debug!("{}", err);
                Err(err)
            }
        }
    }

    fn spawn(&self, request: &CommandRequest) -> Result<ManagedProcess, ProcessError> {
        debug!("spawn: {}", request.command_line());

        let child = Command::new(&request.program)
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProcessError::from_spawn(&request.program, e))?;

        Ok(ManagedProcess::new(request.program.clone(), child))
    }
}

async fn read_lossy<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        trace!("pipe read ended: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn drain(reader: Option<JoinHandle<String>>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    // A grandchild holding the pipe open must not stall the caller
    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut reader).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            reader.abort();
            String::new()
        }
    }
}

/// Kill the child and wait for it so no zombie is left behind
async fn reap(child: &mut Child, name: &str) {
    if let Err(e) = child.kill().await {
        debug!("kill {} failed (already exited?): {}", name, e);
    }
}

type OutputTail = Arc<Mutex<VecDeque<String>>>;

/// A supervised long-running process.
///
/// Stdout and stderr are read line by line in the background; the last
/// [`OUTPUT_TAIL_LINES`] lines are retained. Dropping a `ManagedProcess`
/// kills the process unless it was detached.
pub struct ManagedProcess {
    program: PathBuf,
    child: Child,
    pid: Option<u32>,
    tail: OutputTail,
    exit_code: Option<Option<i32>>,
    detached: bool,
}

impl ManagedProcess {
    /// Wrap a spawned child, taking over its output pipes
    pub fn new(program: PathBuf, mut child: Child) -> Self {
        let pid = child.id();
        let tail: OutputTail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(collect_lines(stdout, Arc::clone(&tail), name.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(collect_lines(stderr, Arc::clone(&tail), name));
        }

        Self {
            program,
            child,
            pid,
            tail,
            exit_code: None,
            detached: false,
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// OS process id, if the process was still running when wrapped
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code if the process has exited, without blocking
    pub fn try_exit(&mut self) -> Option<Option<i32>> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(status.code());
                self.exit_code
            }
            Ok(None) => None,
            Err(e) => {
                warn!("failed to poll {}: {}", self.program.display(), e);
                None
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.try_exit().is_none()
    }

    /// Wait for the process to exit and return its exit code
    pub async fn wait(&mut self) -> Result<Option<i32>, ProcessError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let status = self.child.wait().await?;
        self.exit_code = Some(status.code());
        Ok(status.code())
    }

    /// Kill the process and reap it
    pub async fn kill(&mut self) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Ok(());
        }
        self.child.kill().await?;
        self.exit_code = Some(None);
        debug!("killed {} (pid {:?})", self.program.display(), self.pid);
        Ok(())
    }

    /// Captured output lines, oldest first
    pub fn output_tail(&self) -> Vec<String> {
        self.tail.lock().iter().cloned().collect()
    }

    /// Error describing an unexpected exit of this process
    pub fn exited_error(&self, code: Option<i32>) -> ProcessError {
        ProcessError::Exited {
            program: self.program.clone(),
            code,
            output_tail: self.output_tail(),
        }
    }

    /// Release supervision; the process keeps running after this value is gone
    pub fn detach(mut self) -> Option<u32> {
        self.detached = true;
        self.pid
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if self.detached || self.exit_code.is_some() {
            return;
        }
        // tokio reaps the killed child in the background
        if let Err(e) = self.child.start_kill() {
            trace!("start_kill on drop: {}", e);
        }
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code)
            .field("detached", &self.detached)
            .finish()
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: R, tail: OutputTail, name: String) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        trace!(target: "avd_pilot::process_output", "[{}] {}", name, line);
        let mut tail = tail.lock();
        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn sh(script: &str) -> CommandRequest {
        CommandRequest::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_run_collects_output() {
        let driver = SystemProcessDriver;
        let output = assert_ok!(
            driver
                .run(&sh("echo hello; echo oops >&2; exit 3"), &CancellationToken::new())
                .await
        );
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
        assert!(!output.success());
        assert_eq!(output.combined(), "hello\noops");
    }

    #[tokio::test]
    async fn test_run_feeds_stdin() {
        let driver = SystemProcessDriver;
        let request = CommandRequest::new("cat").stdin("no\n");
        let output = driver.run(&request, &CancellationToken::new()).await.unwrap();
        assert_eq!(output.stdout, "no\n");
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let driver = SystemProcessDriver;
        let request = CommandRequest::new("/nonexistent/avd-pilot-tool");
        let err = driver.run(&request, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProcessError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let driver = SystemProcessDriver;
        let request = CommandRequest::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = driver.run(&request, &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_stops_run() {
        let driver = SystemProcessDriver;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = driver
            .run(&CommandRequest::new("sleep").arg("30"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_managed_process_captures_and_exits() {
        let driver = SystemProcessDriver;
        let mut process = driver.spawn(&sh("echo booting; exit 7")).unwrap();
        assert_eq!(process.wait().await.unwrap(), Some(7));
        assert_eq!(process.try_exit(), Some(Some(7)));
        // Readers finish shortly after exit
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(process.output_tail(), vec!["booting".to_string()]);
    }

    #[tokio::test]
    async fn test_managed_process_kill() {
        let driver = SystemProcessDriver;
        let mut process = driver.spawn(&CommandRequest::new("sleep").arg("30")).unwrap();
        assert!(process.is_running());
        process.kill().await.unwrap();
        assert!(!process.is_running());
        #[cfg(target_os = "linux")]
        {
            let pid = process.pid().unwrap();
            assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
        }
    }
}

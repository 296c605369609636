//! Scripted process driver for tests
//!
//! [`ScriptedDriver`] answers `run` calls from canned replies matched by
//! substring against the command line, and records every request. `spawn`
//! starts a real, harmless placeholder process so that supervision, kill and
//! reaping are exercised for real.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::process::{CommandRequest, ManagedProcess, ProcessDriver, ProcessError, ProcessOutput};

/// Canned answer for a `run` call
#[derive(Debug, Clone)]
pub enum Reply {
    /// The process ran and produced this output
    Output(ProcessOutput),
    /// The request timed out
    Timeout,
    /// The executable does not exist
    Missing,
    /// The process never finishes; ends on cancellation or timeout
    Hang,
}

impl Reply {
    /// Exit 0 with the given stdout
    pub fn stdout(text: &str) -> Self {
        Reply::Output(ProcessOutput {
            exit_code: 0,
            stdout: text.to_string(),
            stderr: String::new(),
        })
    }

    /// Non-zero exit with the given stderr
    pub fn failure(code: i32, stderr: &str) -> Self {
        Reply::Output(ProcessOutput {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }
}

/// What `spawn` starts in place of the requested program
#[derive(Debug, Clone)]
pub enum SpawnBehavior {
    /// A process that keeps running until killed
    Idle,
    /// A process that prints `output` and exits with `code` after `after`
    Exit {
        code: i32,
        output: String,
        after: Duration,
    },
    /// The executable does not exist
    Missing,
}

struct Rule {
    pattern: String,
    replies: VecDeque<Reply>,
}

#[derive(Default)]
struct Script {
    rules: Vec<Rule>,
    calls: Vec<CommandRequest>,
    spawned_pids: Vec<u32>,
    spawn: Option<SpawnBehavior>,
}

/// Process driver that replays scripted replies
#[derive(Default)]
pub struct ScriptedDriver {
    script: Mutex<Script>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `reply`.
    ///
    /// Rules registered later take precedence. Unmatched commands succeed
    /// with empty output.
    pub fn on(&self, pattern: &str, reply: Reply) {
        self.on_sequence(pattern, vec![reply]);
    }

    /// Answer successive matching commands with `replies` in order; the last
    /// reply repeats once the others are used up
    pub fn on_sequence(&self, pattern: &str, replies: Vec<Reply>) {
        self.script.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            replies: replies.into(),
        });
    }

    pub fn set_spawn(&self, behavior: SpawnBehavior) {
        self.script.lock().spawn = Some(behavior);
    }

    /// Every request seen so far, `run` and `spawn` alike
    pub fn calls(&self) -> Vec<CommandRequest> {
        self.script.lock().calls.clone()
    }

    /// Number of requests whose command line contains `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|r| r.command_line().contains(pattern))
            .count()
    }

    pub fn last_request(&self, pattern: &str) -> Option<CommandRequest> {
        self.script
            .lock()
            .calls
            .iter()
            .rev()
            .find(|r| r.command_line().contains(pattern))
            .cloned()
    }

    /// Position of the first request containing `pattern`
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.script
            .lock()
            .calls
            .iter()
            .position(|r| r.command_line().contains(pattern))
    }

    /// OS pids of the placeholder processes started by `spawn`
    pub fn spawned_pids(&self) -> Vec<u32> {
        self.script.lock().spawned_pids.clone()
    }

    fn next_reply(&self, request: &CommandRequest) -> Reply {
        let line = request.command_line();
        let mut script = self.script.lock();
        script.calls.push(request.clone());

        let rule = script
            .rules
            .iter_mut()
            .rev()
            .find(|rule| line.contains(&rule.pattern));
        match rule {
            Some(rule) if rule.replies.len() > 1 => rule.replies.pop_front().unwrap_or(Reply::Hang),
            Some(rule) => rule.replies.front().cloned().unwrap_or(Reply::Hang),
            None => Reply::stdout(""),
        }
    }
}

#[async_trait]
impl ProcessDriver for ScriptedDriver {
    async fn run(
        &self,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError> {
        let reply = self.next_reply(request);
        let program = request.program.clone();

        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled { program });
        }

        match reply {
            Reply::Output(output) => Ok(output),
            Reply::Timeout => Err(ProcessError::Timeout {
                program,
                timeout: request.timeout,
            }),
            Reply::Missing => Err(ProcessError::NotFound { program }),
            Reply::Hang => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ProcessError::Cancelled { program }),
                    _ = tokio::time::sleep(request.timeout) => Err(ProcessError::Timeout {
                        program,
                        timeout: request.timeout,
                    }),
                }
            }
        }
    }

    fn spawn(&self, request: &CommandRequest) -> Result<ManagedProcess, ProcessError> {
        let behavior = {
            let mut script = self.script.lock();
            script.calls.push(request.clone());
            script.spawn.clone().unwrap_or(SpawnBehavior::Idle)
        };

        let placeholder = match behavior {
            SpawnBehavior::Idle => CommandRequest::new("sleep").arg("600"),
            SpawnBehavior::Exit { code, output, after } => CommandRequest::new("sh").args([
                "-c".to_string(),
                format!(
                    "printf '%s\\n' \"$1\"; sleep {}; exit {}",
                    after.as_secs_f64(),
                    code
                ),
                "emulator".to_string(),
                output,
            ]),
            SpawnBehavior::Missing => {
                return Err(ProcessError::NotFound {
                    program: request.program.clone(),
                })
            }
        };

        let child = Command::new(&placeholder.program)
            .args(&placeholder.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ProcessError::Io)?;
        let process = ManagedProcess::new(request.program.clone(), child);
        if let Some(pid) = process.pid() {
            self.script.lock().spawned_pids.push(pid);
        }
        Ok(process)
    }
}

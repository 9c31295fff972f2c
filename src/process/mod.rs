//! Child-process plumbing for every external command the pipeline runs.
//!
//! All subprocess invocations go through [`run`] so that timeouts, signal
//! propagation and tee-logging live in one place. Each call snapshots its
//! own environment and working directory; nothing here mutates global
//! state. Line-oriented output is delivered to sinks as soon as the child
//! flushes it.

mod interrupt;

pub use interrupt::{InterruptGuard, install_sigint_handler, interrupted};

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;

/// Grace period between SIGTERM and SIGKILL when a deadline elapses.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Errors from running a child process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The binary could not be spawned (usually: not on $PATH).
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The deadline elapsed; the child was terminated.
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The caller required exit code zero and got something else.
    #[error("{command} exited with {code}\nstderr: {stderr}")]
    NonZero {
        command: String,
        code: i32,
        stderr: String,
    },

    /// IO error on the child's pipes.
    #[error("IO error running {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Options for one child-process invocation.
#[derive(Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub stdin: Option<String>,
    /// Elapsing triggers SIGTERM, then SIGKILL after a 5 s grace.
    pub timeout: Option<Duration>,
    /// Tee stdout+stderr lines into this file, flushed per line.
    pub tee: Option<PathBuf>,
    /// Deliver stdout lines as they arrive.
    pub stdout_lines: Option<UnboundedSender<String>>,
    /// Treat a non-zero exit as an error.
    pub check: bool,
}

/// Result of a completed child process.
#[derive(Debug)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

fn display_command(cmd: &str, args: &[String]) -> String {
    std::iter::once(cmd.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs a child process to completion.
///
/// stdout and stderr are read concurrently line by line; each line is
/// appended to the returned buffers, optionally teed to `opts.tee` and
/// forwarded over `opts.stdout_lines`. The child is registered with the
/// SIGINT propagation handler for its lifetime.
pub async fn run(
    cmd: &str,
    args: &[String],
    opts: RunOptions,
) -> Result<RunOutput, ProcessError> {
    let command_line = display_command(cmd, args);
    tracing::debug!(command = %command_line, "running");

    let mut command = Command::new(cmd);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if opts.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &opts.env {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        command: command_line.clone(),
        source,
    })?;

    let _guard = child.id().map(|pid| InterruptGuard::register(pid as i32));

    if let Some(input) = &opts.stdin {
        let mut stdin = child.stdin.take().expect("stdin was requested piped");
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|source| ProcessError::Io {
                command: command_line.clone(),
                source,
            })?;
        drop(stdin);
    }

    let stdout_pipe = child.stdout.take().expect("stdout is piped");
    let stderr_pipe = child.stderr.take().expect("stderr is piped");

    let tee = match &opts.tee {
        Some(path) => Some(
            tokio::fs::File::create(path)
                .await
                .map_err(|source| ProcessError::Io {
                    command: command_line.clone(),
                    source,
                })?,
        ),
        None => None,
    };

    let collect = collect_output(stdout_pipe, stderr_pipe, tee, opts.stdout_lines);

    let (status, (stdout, stderr)) = match opts.timeout {
        Some(timeout) => {
            let waited = tokio::time::timeout(timeout, async {
                let io = collect.await;
                let status = child.wait().await;
                (status, io)
            })
            .await;
            match waited {
                Ok((status, io)) => (
                    status.map_err(|source| ProcessError::Io {
                        command: command_line.clone(),
                        source,
                    })?,
                    io?,
                ),
                Err(_) => {
                    terminate(&mut child).await;
                    return Err(ProcessError::Timeout {
                        command: command_line,
                        timeout,
                    });
                }
            }
        }
        None => {
            let io = collect.await?;
            let status = child.wait().await.map_err(|source| ProcessError::Io {
                command: command_line.clone(),
                source,
            })?;
            (status, io)
        }
    };

    let code = status.code().unwrap_or(-1);
    if opts.check && code != 0 {
        return Err(ProcessError::NonZero {
            command: command_line,
            code,
            stderr,
        });
    }

    Ok(RunOutput {
        code,
        stdout,
        stderr,
    })
}

/// Reads both pipes to EOF, teeing and forwarding lines as configured.
async fn collect_output(
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    mut tee: Option<tokio::fs::File>,
    lines_tx: Option<UnboundedSender<String>>,
) -> Result<(String, String), ProcessError> {
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut out = String::new();
    let mut err = String::new();
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            line = stdout_lines.next_line(), if out_open => match line {
                Ok(Some(line)) => {
                    out.push_str(&line);
                    out.push('\n');
                    if let Some(file) = tee.as_mut() {
                        let _ = file.write_all(line.as_bytes()).await;
                        let _ = file.write_all(b"\n").await;
                        let _ = file.flush().await;
                    }
                    if let Some(tx) = &lines_tx {
                        let _ = tx.send(line);
                    }
                }
                Ok(None) => out_open = false,
                Err(source) => {
                    return Err(ProcessError::Io { command: "<stdout>".into(), source });
                }
            },
            line = stderr_lines.next_line(), if err_open => match line {
                Ok(Some(line)) => {
                    err.push_str(&line);
                    err.push('\n');
                    if let Some(file) = tee.as_mut() {
                        let _ = file.write_all(line.as_bytes()).await;
                        let _ = file.write_all(b"\n").await;
                        let _ = file.flush().await;
                    }
                }
                Ok(None) => err_open = false,
                Err(source) => {
                    return Err(ProcessError::Io { command: "<stderr>".into(), source });
                }
            },
        }
    }

    Ok((out, err))
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we own.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};

use super::error::BackendError;
use crate::config::types::ProcessConfig;

/// Live handle to a spawned process backend.
///
/// Requests are newline-delimited JSON written to the child's stdin; replies
/// are JSON lines read from its stdout. The reply receiver sits behind a fair
/// mutex which acts as the per-backend FIFO queue: a caller holds it for its
/// whole write-then-await cycle, so only one request is ever in flight.
#[derive(Debug)]
pub struct StdioProcess {
    backend: String,
    pid: u32,
    stdin_tx: mpsc::Sender<String>,
    replies: Mutex<ReplyQueue>,
    timeout: Duration,
}

#[derive(Debug)]
struct ReplyQueue {
    rx: mpsc::Receiver<Value>,
    /// Requests that were written but timed out before their reply arrived.
    /// That many upcoming messages belong to callers that are gone.
    abandoned: usize,
}

impl ReplyQueue {
    fn new(rx: mpsc::Receiver<Value>) -> Self {
        Self { rx, abandoned: 0 }
    }

    /// Drops everything already buffered; each dropped message settles one
    /// abandoned request.
    fn flush_stale(&mut self) -> usize {
        let mut count = 0;
        while self.rx.try_recv().is_ok() {
            count += 1;
        }
        self.abandoned = self.abandoned.saturating_sub(count);
        count
    }

    /// Decides whether `message` answers the caller expecting `expected_id`.
    ///
    /// A matching JSON-RPC id is always accepted. Without an id, messages are
    /// discarded while abandoned requests are still owed a reply.
    fn accepts(&mut self, expected_id: Option<&Value>, message: &Value) -> bool {
        let accepted = match expected_id {
            Some(id) => message.get("id") == Some(id),
            None => self.abandoned == 0,
        };
        if !accepted {
            self.abandoned = self.abandoned.saturating_sub(1);
        }
        accepted
    }
}

impl StdioProcess {
    /// Spawns the configured command and wires its three pipes.
    ///
    /// The returned [`Child`] is handed to the exit observer; the process
    /// runs in its own process group so that [`StdioProcess::terminate`]
    /// reaches any grandchildren too.
    pub fn spawn(backend: &str, config: &ProcessConfig) -> Result<(Self, Child), BackendError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        // Inherited environment plus per-backend overrides.
        cmd.envs(&config.env);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .process_group(0)
            .kill_on_drop(false);

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Spawn(format!("'{}': {}", config.command, e)))?;

        let pid = child.id().unwrap_or(0);

        let child_stdin = child.stdin.take().ok_or(BackendError::StdinClosed)?;
        let child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Spawn("failed to capture stdout".to_string()))?;
        let child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Spawn("failed to capture stderr".to_string()))?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(64);
        let (reply_tx, reply_rx) = mpsc::channel::<Value>(64);

        tokio::spawn(stdin_writer(backend.to_string(), child_stdin, stdin_rx));
        tokio::spawn(stdout_reader(backend.to_string(), child_stdout, reply_tx));
        tokio::spawn(stderr_logger(backend.to_string(), child_stderr));

        let process = StdioProcess {
            backend: backend.to_string(),
            pid,
            stdin_tx,
            replies: Mutex::new(ReplyQueue::new(reply_rx)),
            timeout: config.timeout(),
        };

        Ok((process, child))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Sends one request and waits for its reply.
    ///
    /// Output left over from an earlier, timed-out call is flushed before the
    /// write, and late replies to such calls are skipped while waiting. When
    /// the request carries a JSON-RPC `id`, replies with a different id are
    /// discarded; otherwise the next fresh JSON message wins. On timeout the
    /// process is left running and the queue slot is released.
    ///
    /// The timeout bounds the write and the reply wait, not the time spent
    /// queued behind earlier callers: with N callers ahead on a silent
    /// backend the wait can reach N + 1 timeouts.
    pub async fn call(&self, request: &Value) -> Result<Value, BackendError> {
        let line = serde_json::to_string(request)
            .map_err(|e| BackendError::InvalidResponse(format!("unserializable request: {e}")))?;
        let expected_id = request
            .get("id")
            .filter(|id| !id.is_null())
            .cloned();

        let mut queue = self.replies.lock().await;

        let stale = queue.flush_stale();
        if stale > 0 {
            tracing::debug!(backend = %self.backend, count = stale, "discarded stale stdout messages");
        }

        let mut written = false;
        let exchange = async {
            self.stdin_tx
                .send(line)
                .await
                .map_err(|_| BackendError::StdinClosed)?;
            written = true;

            loop {
                let Some(message) = queue.rx.recv().await else {
                    return Err(BackendError::ProcessExited(
                        "stdout closed before reply".to_string(),
                    ));
                };
                if queue.accepts(expected_id.as_ref(), &message) {
                    return Ok(message);
                }
                tracing::debug!(backend = %self.backend, "skipping reply that belongs to another request");
            }
        };

        let outcome = tokio::time::timeout(self.timeout, exchange).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                if written {
                    queue.abandoned += 1;
                }
                tracing::warn!(
                    backend = %self.backend,
                    timeout_ms = self.timeout.as_millis() as u64,
                    written,
                    "stdio request timed out, backend left running"
                );
                Err(BackendError::Timeout(self.timeout))
            }
        }
    }

    /// Sends SIGTERM to the process group and returns without waiting.
    pub fn terminate(&self) {
        kill_process_group(&self.backend, self.pid);
    }
}

async fn stdin_writer(
    name: String,
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::Receiver<String>,
) {
    while let Some(msg) = rx.recv().await {
        let line = if msg.ends_with('\n') {
            msg
        } else {
            format!("{msg}\n")
        };
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::warn!(backend = %name, error = %e, "stdin write failed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::warn!(backend = %name, error = %e, "stdin flush failed");
            break;
        }
    }
    tracing::debug!(backend = %name, "stdin writer exiting");
}

async fn stdout_reader(
    name: String,
    stdout: tokio::process::ChildStdout,
    replies: mpsc::Sender<Value>,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                tracing::debug!(backend = %name, "stdout EOF");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let Some(message) = decode_message(trimmed) else {
                    tracing::debug!(backend = %name, line = %trimmed, "ignoring undecodable stdout line");
                    continue;
                };

                if replies.send(message).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(backend = %name, error = %e, "stdout read error");
                break;
            }
        }
    }
}

async fn stderr_logger(name: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => {
                tracing::info!(backend = %name, line = %line.trim_end(), "backend stderr");
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(backend = %name, error = %e, "stderr read error");
                break;
            }
        }
    }
}

/// A complete structured message is a JSON object or batch array.
pub fn decode_message(line: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(line) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        _ => None,
    }
}

pub fn kill_process_group(backend: &str, pid: u32) {
    // pid 0 would address our own process group.
    if pid == 0 {
        return;
    }
    let pgid = Pid::from_raw(pid as i32);
    match signal::killpg(pgid, Signal::SIGTERM) {
        Ok(()) => {
            tracing::debug!(backend = %backend, pid = pid, "sent SIGTERM to process group");
        }
        Err(nix::errno::Errno::ESRCH) => {
            tracing::debug!(backend = %backend, pid = pid, "process group already dead");
        }
        Err(e) => {
            tracing::warn!(backend = %backend, pid = pid, error = %e, "failed to signal process group");
        }
    }
}

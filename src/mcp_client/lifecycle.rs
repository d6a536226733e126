//! Server process lifecycle management.
//!
//! Spawning a stdio server, draining its stderr into the log tail, and
//! watching for its exit. Each server runs as a separate OS process
//! communicating via JSON-RPC over stdio.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::framing::strip_ansi;
use super::log_stream::LogBroadcaster;

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long `stop` waits for the process and its readers before giving up.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Command Line ────────────────────────────────────────────────────────────

/// Split a command line into program and arguments.
///
/// Whitespace separates words; single and double quotes group them, and a
/// backslash escapes the next character outside single quotes.
pub fn split_command_line(command: &str) -> Result<(String, Vec<String>), McpError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(McpError::ConfigError {
            reason: format!("unterminated quote in command: {command}"),
        });
    }
    if in_word {
        words.push(current);
    }

    let mut words = words.into_iter();
    let program = words.next().ok_or(McpError::ConfigError {
        reason: "command is empty".into(),
    })?;
    Ok((program, words.collect()))
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a server process with piped stdio.
///
/// The child is killed if its handle is dropped, so a half-built session
/// never leaks a process.
pub fn spawn_process(
    name: &str,
    program: &str,
    args: &[String],
    cwd: Option<&str>,
    env: &HashMap<String, String>,
) -> Result<Child, McpError> {
    let mut cmd = Command::new(program);
    cmd.args(args);

    for (key, value) in env {
        cmd.env(key, value);
    }

    if let Some(dir) = cwd.map(str::trim).filter(|d| !d.is_empty()) {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{program}: {e}"),
    })
}

/// Forward every stderr line into the log tail as `[stderr] …`.
///
/// Lines are decoded leniently; the pipe is drained until EOF so the server
/// never blocks or dies writing to a closed stderr.
pub fn drain_stderr(stderr: ChildStderr, logs: Arc<LogBroadcaster>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                    let text = String::from_utf8_lossy(&buf);
                    let line = strip_ansi(&text);
                    tracing::debug!(server = %logs.server(), "[stderr] {line}");
                    logs.publish(format!("[stderr] {line}"));
                }
                Err(e) => {
                    logs.publish(format!("!! stderr read failed: {e}"));
                    break;
                }
            }
        }
    })
}

// ─── Exit Watching ───────────────────────────────────────────────────────────

/// Exit code as a shell would report it: signals map to `128 + signal`.
fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Handle to a watched server process.
pub struct ProcessHandle {
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    stderr: Mutex<Option<JoinHandle<()>>>,
}

/// Take ownership of `child` and wait for it in the background.
///
/// When the process exits (on its own or after [`ProcessHandle::terminate`])
/// the exit code is published to `logs` and `on_exit` runs. Dropping the
/// handle kills the process.
pub fn watch_exit<F>(
    name: &str,
    mut child: Child,
    logs: Arc<LogBroadcaster>,
    stderr: Option<JoinHandle<()>>,
    on_exit: F,
) -> ProcessHandle
where
    F: FnOnce() + Send + 'static,
{
    let pid = child.id();
    let alive = Arc::new(AtomicBool::new(true));
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let server = name.to_string();

    let flag = Arc::clone(&alive);
    let watcher = tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => match child.kill().await {
                Ok(()) => child.wait().await,
                Err(e) => Err(e),
            },
        };
        flag.store(false, Ordering::Release);

        match status {
            Ok(status) => {
                let code = exit_code(&status);
                logs.publish(format!("process exited with code {code}"));
                tracing::info!(server = %server, code, "server process exited");
            }
            Err(e) => {
                logs.publish(format!("!! failed to wait for process: {e}"));
                tracing::warn!(server = %server, error = %e, "failed to wait for server process");
            }
        }
        on_exit();
    });

    ProcessHandle {
        pid,
        alive,
        kill: Mutex::new(Some(kill_tx)),
        watcher: Mutex::new(Some(watcher)),
        stderr: Mutex::new(stderr),
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Kill the process and wait (bounded by `grace`) for the exit watcher
    /// and the stderr drain to finish.
    pub async fn terminate(&self, grace: Duration) {
        if let Some(kill) = take(&self.kill) {
            let _ = kill.send(());
        }
        for mut handle in [take(&self.watcher), take(&self.stderr)].into_iter().flatten() {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!(pid = ?self.pid, "process task did not finish, aborting");
                handle.abort();
            }
        }
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

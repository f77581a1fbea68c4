//! External process execution, with a global registry so a signal handler can
//! terminate every in-flight ffmpeg/ffprobe child on shutdown, whether it was
//! spawned synchronously (probes) or as a long-running async encode.

use std::collections::HashMap;
use std::io;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("io error spawning {0}: {1}")]
    Spawn(String, io::Error),
    #[error("process timed out after {0:?}")]
    Timeout(Duration),
    #[error("process was cancelled")]
    Cancelled,
}

pub struct ProcessOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl From<io::Error> for ProcessError {
    fn from(e: io::Error) -> Self {
        ProcessError::Spawn(String::new(), e)
    }
}

/// A registry entry that can be killed regardless of whether the underlying
/// child is a `std::process::Child` (sync probes) or an async long-running
/// encode. Async children are tracked by OS pid rather than by handle, since
/// the handle itself stays owned by the task awaiting it.
enum Killable {
    Sync(Child),
    AsyncPid(u32),
}

impl Killable {
    fn kill(&mut self) {
        match self {
            Killable::Sync(c) => {
                let _ = c.kill();
            }
            Killable::AsyncPid(pid) => {
                let _ = Command::new("kill").args(["-9", &pid.to_string()]).status();
            }
        }
    }
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

type Registry = Mutex<HashMap<u64, Killable>>;

fn registry() -> &'static Registry {
    static REG: OnceLock<Registry> = OnceLock::new();
    REG.get_or_init(|| Mutex::new(HashMap::new()))
}

fn register(child: Killable) -> u64 {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::SeqCst);
    registry().lock().unwrap().insert(handle, child);
    handle
}

fn deregister(handle: u64) {
    registry().lock().unwrap().remove(&handle);
}

/// Terminates every process currently tracked in the registry. Called from the
/// signal handler on SIGINT/SIGTERM, and by the pipeline's forced-cancellation
/// path, so no ffmpeg child outlives the daemon.
pub fn terminate_all_processes() {
    let mut guard = registry().lock().unwrap();
    for (_, child) in guard.iter_mut() {
        child.kill();
    }
    guard.clear();
}

/// Runs a command to completion with a timeout, returning captured stdout/stderr.
/// Used for short-lived probe commands (ffprobe, backend capability probes).
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    timeout_dur: Duration,
) -> Result<ProcessOutput, ProcessError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ProcessError::Spawn(program.to_string(), e))?;

    let handle = register(Killable::Sync(child));
    let start = std::time::Instant::now();

    loop {
        let mut guard = registry().lock().unwrap();
        let Some(Killable::Sync(child)) = guard.get_mut(&handle) else {
            return Err(ProcessError::Cancelled);
        };
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {
                if start.elapsed() > timeout_dur {
                    child.kill().ok();
                    let _ = child.wait();
                    drop(guard);
                    deregister(handle);
                    return Err(ProcessError::Timeout(timeout_dur));
                }
                drop(guard);
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                drop(guard);
                deregister(handle);
                return Err(e.into());
            }
        }
    }

    let mut guard = registry().lock().unwrap();
    let Some(Killable::Sync(mut child)) = guard.remove(&handle) else {
        return Err(ProcessError::Cancelled);
    };
    drop(guard);

    let output = child
        .wait_with_output()
        .map_err(|e| ProcessError::Spawn(program.to_string(), e))?;

    Ok(ProcessOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Spawns a long-running child (ffmpeg encode), registers it so it can be
/// killed on shutdown, and streams its stderr lines to `line_tx` as they
/// arrive. Returns once the process exits.
pub async fn run_streaming(
    program: &str,
    args: &[String],
    line_tx: mpsc::UnboundedSender<String>,
) -> Result<ProcessOutput, ProcessError> {
    let mut child = TokioCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ProcessError::Spawn(program.to_string(), e))?;

    let stderr = child.stderr.take();
    let stdout_handle = child.stdout.take();

    let handle = child.id().map(|pid| {
        let handle = NEXT_HANDLE.fetch_add(1, Ordering::SeqCst);
        registry().lock().unwrap().insert(handle, Killable::AsyncPid(pid));
        handle
    });

    let stderr_task = stderr.map(|s| {
        let tx = line_tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(s).lines();
            let mut collected = String::new();
            while let Ok(Some(line)) = reader.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
                let _ = tx.send(line);
            }
            collected
        })
    });

    let stdout_task = stdout_handle.map(|s| {
        tokio::spawn(async move {
            let mut reader = BufReader::new(s).lines();
            let mut collected = String::new();
            while let Ok(Some(line)) = reader.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        })
    });

    let status = child
        .wait()
        .await
        .map_err(|e| ProcessError::Spawn(program.to_string(), e))?;

    if let Some(handle) = handle {
        deregister(handle);
    }

    let stderr_collected = match stderr_task {
        Some(t) => t.await.unwrap_or_default(),
        None => String::new(),
    };
    let stdout_collected = match stdout_task {
        Some(t) => t.await.unwrap_or_default(),
        None => String::new(),
    };

    Ok(ProcessOutput {
        success: status.success(),
        stdout: stdout_collected,
        stderr: stderr_collected,
    })
}

/// A cooperative cancellation flag threaded through pipeline workers so a
/// worker between ffmpeg invocations notices a shutdown request even when no
/// process is currently running to kill.
pub struct CancelToken {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn clone_handle(&self) -> Arc<std::sync::atomic::AtomicBool> {
        self.cancelled.clone()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits on a child with a timeout using async polling; used by backend probe
/// encodes that must not hang the daemon if a driver wedges.
pub async fn run_async_with_timeout(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
) -> Result<ProcessOutput, ProcessError> {
    let mut child = TokioCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ProcessError::Spawn(program.to_string(), e))?;

    match timeout(timeout_dur, child.wait()).await {
        Ok(Ok(status)) => {
            let output = child
                .wait_with_output()
                .await
                .unwrap_or_else(|_| std::process::Output {
                    status,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                });
            Ok(ProcessOutput {
                success: status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            let _ = child.start_kill();
            Err(ProcessError::Timeout(timeout_dur))
        }
    }
}

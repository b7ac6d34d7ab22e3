//! Supervision of a spawned plugin executable.
//!
//! [`ChildProcess::spawn`] launches `<executable> <port>` and hands the child
//! to a supervisor task that drains stderr and waits for exit. The outcome
//! comes back over a oneshot channel, so the runtime can observe a crash at
//! any point instead of racing a shared variable. Dropping the handle aborts
//! the supervisor, which kills the child.

use std::{io, path::Path, process::Stdio};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::{ChildStderr, Command},
    sync::oneshot,
    task::JoinHandle,
};

/// Stderr kept for the exit report; earlier output is only logged.
pub const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// How a plugin process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub status: String,
    pub success: bool,
    pub stderr: String,
}

impl ExitReport {
    /// Stderr wins over the exit status when the child wrote any.
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.status.clone()
        } else {
            stderr.to_string()
        }
    }
}

#[derive(Debug)]
pub struct ChildProcess {
    pid: Option<u32>,
    exit_rx: oneshot::Receiver<ExitReport>,
    exited: Option<ExitReport>,
    supervisor: JoinHandle<()>,
}

impl ChildProcess {
    /// Spawns the executable with `port` as its only argument. Returns once the
    /// OS has accepted the spawn; the child may not be listening yet.
    pub fn spawn(executable: &Path, port: u16) -> io::Result<Self> {
        let mut child = Command::new(executable)
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        let stderr = child.stderr.take();
        let (exit_tx, exit_rx) = oneshot::channel();

        let supervisor = tokio::spawn(async move {
            let (status, stderr) = tokio::join!(child.wait(), drain(pid, stderr));
            let report = match status {
                Ok(status) => ExitReport {
                    status: status.to_string(),
                    success: status.success(),
                    stderr,
                },
                Err(err) => ExitReport {
                    status: format!("failed to wait for plugin process: {err}"),
                    success: false,
                    stderr,
                },
            };
            exit_tx.send(report).ok();
        });

        Ok(Self {
            pid,
            exit_rx,
            exited: None,
            supervisor,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking check for an exit that has already happened.
    pub fn try_exit(&mut self) -> Option<&ExitReport> {
        if self.exited.is_none() {
            if let Ok(report) = self.exit_rx.try_recv() {
                self.exited = Some(report);
            }
        }
        self.exited.as_ref()
    }

    /// Resolves when the child exits. Cancel-safe.
    pub async fn wait_exit(&mut self) -> &ExitReport {
        let report = match self.exited.take() {
            Some(report) => report,
            None => (&mut self.exit_rx).await.unwrap_or_else(|_| ExitReport {
                status: "plugin supervisor stopped".into(),
                success: false,
                stderr: String::new(),
            }),
        };
        self.exited.insert(report)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

/// Reads stderr to EOF line by line, logging each line and keeping the last
/// [`STDERR_TAIL_BYTES`] of output.
async fn drain(pid: Option<u32>, stderr: Option<ChildStderr>) -> String {
    let Some(stderr) = stderr else {
        return String::new();
    };
    let mut reader = BufReader::new(stderr);
    let mut tail = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = (&mut reader)
            .take(STDERR_TAIL_BYTES as u64)
            .read_until(b'\n', &mut line)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                tracing::debug!(
                    target: "warden::plugin",
                    pid = ?pid,
                    stderr = %String::from_utf8_lossy(&line).trim_end(),
                    "plugin stderr output"
                );
                keep_tail(&mut tail, &line);
            }
            Err(err) => {
                tracing::debug!(pid = ?pid, error = %err, "failed to read plugin stderr");
                break;
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

fn keep_tail(tail: &mut Vec<u8>, chunk: &[u8]) {
    tail.extend_from_slice(chunk);
    if tail.len() > STDERR_TAIL_BYTES {
        let excess = tail.len() - STDERR_TAIL_BYTES;
        tail.drain(..excess);
    }
}

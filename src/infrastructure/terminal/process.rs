//! Plain child-process terminal backend.
//!
//! Spawns the worker shell with piped stdio, streams stdout and stderr
//! chunks to the event channel, and reports exit exactly once. Kill sends
//! SIGTERM and escalates to SIGKILL after a grace period. Resize is a
//! silent no-op for pipes.

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::domain::error::{OrchResult, OrchestratorError};
use crate::domain::models::TerminalKind;
use crate::domain::ports::{SpawnSpec, TerminalBackend, TerminalEvent};

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE_MS: u64 = 2000;

struct ProcessTerminal {
    stdin: ChildStdin,
    pid: Option<i32>,
    closed: bool,
}

/// Terminal backend over plain child processes.
#[derive(Default)]
pub struct ProcessBackend {
    terminals: Arc<Mutex<HashMap<Uuid, ProcessTerminal>>>,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn pump_stream<R>(
        mut reader: R,
        terminal_id: Uuid,
        stderr: bool,
        events: mpsc::Sender<TerminalEvent>,
    ) where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let event = TerminalEvent::Output {
                            terminal_id,
                            chunk: buf[..n].to_vec(),
                            stderr,
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl TerminalBackend for ProcessBackend {
    fn kind(&self) -> TerminalKind {
        TerminalKind::Process
    }

    async fn spawn(
        &self,
        spec: SpawnSpec,
        events: mpsc::Sender<TerminalEvent>,
    ) -> OrchResult<Uuid> {
        let mut cmd = Command::new(&spec.shell);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| OrchestratorError::Transport(format!("spawn {}: {e}", spec.shell)))?;

        let terminal_id = Uuid::new_v4();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OrchestratorError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OrchestratorError::Transport("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| OrchestratorError::Transport("child stderr unavailable".into()))?;

        let pid = child.id().map(|p| p as i32);
        {
            let mut terminals = self.terminals.lock().await;
            terminals.insert(
                terminal_id,
                ProcessTerminal {
                    stdin,
                    pid,
                    closed: false,
                },
            );
        }

        Self::pump_stream(stdout, terminal_id, false, events.clone());
        Self::pump_stream(stderr, terminal_id, true, events.clone());

        // Exit watcher: reports exit once and marks the terminal closed
        let terminals = Arc::clone(&self.terminals);
        tokio::spawn(async move {
            let exit_code = child.wait().await.ok().and_then(|status| status.code());
            {
                let mut terminals = terminals.lock().await;
                if let Some(terminal) = terminals.get_mut(&terminal_id) {
                    terminal.closed = true;
                }
            }
            let _ = events
                .send(TerminalEvent::Exit {
                    terminal_id,
                    exit_code,
                })
                .await;
        });

        tracing::debug!(%terminal_id, shell = %spec.shell, "spawned process terminal");
        Ok(terminal_id)
    }

    async fn write(&self, terminal_id: Uuid, data: &[u8]) -> OrchResult<()> {
        let mut terminals = self.terminals.lock().await;
        let terminal = terminals
            .get_mut(&terminal_id)
            .ok_or(OrchestratorError::TerminalClosed(terminal_id))?;
        if terminal.closed {
            return Err(OrchestratorError::TerminalClosed(terminal_id));
        }
        terminal
            .stdin
            .write_all(data)
            .await
            .map_err(|e| OrchestratorError::Transport(format!("write: {e}")))?;
        terminal
            .stdin
            .flush()
            .await
            .map_err(|e| OrchestratorError::Transport(format!("flush: {e}")))
    }

    async fn resize(&self, _terminal_id: Uuid, _cols: u16, _rows: u16) -> OrchResult<()> {
        // Pipes have no window size
        Ok(())
    }

    async fn kill(&self, terminal_id: Uuid) -> OrchResult<()> {
        let pid = {
            let mut terminals = self.terminals.lock().await;
            let terminal = terminals
                .remove(&terminal_id)
                .ok_or(OrchestratorError::TerminalClosed(terminal_id))?;
            terminal.pid
        };

        if let Some(pid) = pid {
            let pid = Pid::from_raw(pid);
            if signal::kill(pid, Signal::SIGTERM).is_ok() {
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(KILL_GRACE_MS)).await;
                    // Escalate if the process is still around
                    let _ = signal::kill(pid, Signal::SIGKILL);
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_echo_and_exit() {
        let backend = ProcessBackend::new();
        let (tx, mut rx) = mpsc::channel(64);
        let spec = SpawnSpec::new("/bin/sh");
        let id = backend.spawn(spec, tx).await.unwrap();

        backend.write(id, b"echo hello && exit 0\n").await.unwrap();

        let mut saw_hello = false;
        let mut exit_code = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv()).await
        {
            match event {
                TerminalEvent::Output { chunk, .. } => {
                    if String::from_utf8_lossy(&chunk).contains("hello") {
                        saw_hello = true;
                    }
                }
                TerminalEvent::Exit {
                    exit_code: code, ..
                } => {
                    exit_code = code;
                    break;
                }
            }
        }
        assert!(saw_hello);
        assert_eq!(exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_write_after_exit_fails() {
        let backend = ProcessBackend::new();
        let (tx, mut rx) = mpsc::channel(64);
        let id = backend.spawn(SpawnSpec::new("/bin/sh"), tx).await.unwrap();
        backend.write(id, b"exit 0\n").await.unwrap();

        // Wait for the exit event
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv()).await
        {
            if matches!(event, TerminalEvent::Exit { .. }) {
                break;
            }
        }

        let err = backend.write(id, b"echo too late\n").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TerminalClosed(_)));
    }

    #[tokio::test]
    async fn test_stderr_flagged() {
        let backend = ProcessBackend::new();
        let (tx, mut rx) = mpsc::channel(64);
        let id = backend.spawn(SpawnSpec::new("/bin/sh"), tx).await.unwrap();
        backend
            .write(id, b"echo oops 1>&2 && exit 1\n")
            .await
            .unwrap();

        let mut saw_stderr = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv()).await
        {
            match event {
                TerminalEvent::Output { chunk, stderr, .. } => {
                    if stderr && String::from_utf8_lossy(&chunk).contains("oops") {
                        saw_stderr = true;
                    }
                }
                TerminalEvent::Exit { .. } => break,
            }
        }
        assert!(saw_stderr);
    }

    #[tokio::test]
    async fn test_kill_unknown_terminal() {
        let backend = ProcessBackend::new();
        assert!(backend.kill(Uuid::new_v4()).await.is_err());
    }
}

//! tmux-pane terminal backend.
//!
//! Drives the tmux CLI: each terminal is a detached session whose pane
//! output is piped through a FIFO back into the event channel. Exit is
//! detected by polling `has-session`. Requires a tmux server on the host.

use async_trait::async_trait;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::domain::error::{OrchResult, OrchestratorError};
use crate::domain::models::TerminalKind;
use crate::domain::ports::{SpawnSpec, TerminalBackend, TerminalEvent};

/// Poll interval for session liveness, in ms.
const SESSION_POLL_MS: u64 = 1000;

struct TmuxTerminal {
    session: String,
    fifo_path: PathBuf,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

/// Terminal backend over tmux panes.
#[derive(Default)]
pub struct TmuxBackend {
    terminals: Arc<Mutex<HashMap<Uuid, TmuxTerminal>>>,
}

impl TmuxBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn tmux(args: &[&str]) -> OrchResult<()> {
        let status = Command::new("tmux")
            .args(args)
            .status()
            .await
            .map_err(|e| OrchestratorError::Transport(format!("tmux: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(OrchestratorError::Transport(format!(
                "tmux {} exited with {status}",
                args.first().unwrap_or(&"")
            )))
        }
    }

    async fn session_alive(session: &str) -> bool {
        Command::new("tmux")
            .args(["has-session", "-t", session])
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl TerminalBackend for TmuxBackend {
    fn kind(&self) -> TerminalKind {
        TerminalKind::TmuxPane
    }

    async fn spawn(
        &self,
        spec: SpawnSpec,
        events: mpsc::Sender<TerminalEvent>,
    ) -> OrchResult<Uuid> {
        let terminal_id = Uuid::new_v4();
        let session = format!("orchflow-{}", &terminal_id.simple().to_string()[..8]);

        let fifo_path = std::env::temp_dir().join(format!("{session}.pipe"));
        mkfifo(&fifo_path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| OrchestratorError::Transport(format!("mkfifo: {e}")))?;

        Self::tmux(&[
            "new-session",
            "-d",
            "-s",
            &session,
            "-x",
            &spec.cols.to_string(),
            "-y",
            &spec.rows.to_string(),
            &spec.shell,
        ])
        .await?;

        if let Some(ref cwd) = spec.cwd {
            let cd = format!("cd {}", cwd.display());
            Self::tmux(&["send-keys", "-t", &session, &cd, "Enter"]).await?;
        }
        for (key, value) in &spec.env {
            let export = format!("export {key}={value}");
            Self::tmux(&["send-keys", "-t", &session, &export, "Enter"]).await?;
        }

        let pipe_cmd = format!("cat >> {}", fifo_path.display());
        Self::tmux(&["pipe-pane", "-t", &session, "-o", &pipe_cmd]).await?;

        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let mut terminals = self.terminals.lock().await;
            terminals.insert(
                terminal_id,
                TmuxTerminal {
                    session: session.clone(),
                    fifo_path: fifo_path.clone(),
                    closed: Arc::clone(&closed),
                },
            );
        }

        // FIFO reader: tmux's cat holds the write end open for the pane's
        // lifetime, so reads block rather than hitting EOF early
        let reader_events = events.clone();
        tokio::spawn(async move {
            let Ok(mut file) = tokio::fs::File::open(&fifo_path).await else {
                return;
            };
            let mut buf = [0u8; 4096];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let event = TerminalEvent::Output {
                            terminal_id,
                            chunk: buf[..n].to_vec(),
                            stderr: false,
                        };
                        if reader_events.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Liveness watcher: the session vanishing is the exit signal
        let watch_session = session;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(SESSION_POLL_MS)).await;
                if !Self::session_alive(&watch_session).await {
                    closed.store(true, std::sync::atomic::Ordering::SeqCst);
                    let _ = events
                        .send(TerminalEvent::Exit {
                            terminal_id,
                            exit_code: None,
                        })
                        .await;
                    break;
                }
            }
        });

        tracing::debug!(%terminal_id, "spawned tmux terminal");
        Ok(terminal_id)
    }

    async fn write(&self, terminal_id: Uuid, data: &[u8]) -> OrchResult<()> {
        let (session, closed) = {
            let terminals = self.terminals.lock().await;
            let terminal = terminals
                .get(&terminal_id)
                .ok_or(OrchestratorError::TerminalClosed(terminal_id))?;
            (
                terminal.session.clone(),
                terminal.closed.load(std::sync::atomic::Ordering::SeqCst),
            )
        };
        if closed {
            return Err(OrchestratorError::TerminalClosed(terminal_id));
        }

        let text = String::from_utf8_lossy(data);
        let body = text.trim_end_matches('\n');
        if !body.is_empty() {
            Self::tmux(&["send-keys", "-t", &session, "-l", body]).await?;
        }
        if text.ends_with('\n') {
            Self::tmux(&["send-keys", "-t", &session, "Enter"]).await?;
        }
        Ok(())
    }

    async fn resize(&self, terminal_id: Uuid, cols: u16, rows: u16) -> OrchResult<()> {
        let session = {
            let terminals = self.terminals.lock().await;
            terminals.get(&terminal_id).map(|t| t.session.clone())
        };
        if let Some(session) = session {
            // Advisory
            let _ = Self::tmux(&[
                "resize-window",
                "-t",
                &session,
                "-x",
                &cols.to_string(),
                "-y",
                &rows.to_string(),
            ])
            .await;
        }
        Ok(())
    }

    async fn kill(&self, terminal_id: Uuid) -> OrchResult<()> {
        let terminal = {
            let mut terminals = self.terminals.lock().await;
            terminals
                .remove(&terminal_id)
                .ok_or(OrchestratorError::TerminalClosed(terminal_id))?
        };
        let _ = Self::tmux(&["kill-session", "-t", &terminal.session]).await;
        let _ = tokio::fs::remove_file(&terminal.fifo_path).await;
        Ok(())
    }
}

//! Pseudo-terminal backend.
//!
//! Backs a worker with a real pty pair so interactive programs behave as
//! they would in a terminal. The pty's blocking reader is bridged onto the
//! async event channel with a blocking task; stdout and stderr arrive
//! merged, as ptys do.

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::domain::error::{OrchResult, OrchestratorError};
use crate::domain::models::TerminalKind;
use crate::domain::ports::{SpawnSpec, TerminalBackend, TerminalEvent};

/// Poll interval for child exit, in ms.
const EXIT_POLL_MS: u64 = 100;

struct PtyTerminal {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Arc<StdMutex<Box<dyn Child + Send + Sync>>>,
    closed: Arc<StdMutex<bool>>,
}

/// Terminal backend over portable pty pairs.
#[derive(Default)]
pub struct PtyBackend {
    terminals: Arc<Mutex<HashMap<Uuid, PtyTerminal>>>,
}

impl PtyBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TerminalBackend for PtyBackend {
    fn kind(&self) -> TerminalKind {
        TerminalKind::Pty
    }

    async fn spawn(
        &self,
        spec: SpawnSpec,
        events: mpsc::Sender<TerminalEvent>,
    ) -> OrchResult<Uuid> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| OrchestratorError::Transport(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.shell);
        if let Some(ref cwd) = spec.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| OrchestratorError::Transport(format!("pty spawn {}: {e}", spec.shell)))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| OrchestratorError::Transport(format!("pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| OrchestratorError::Transport(format!("pty writer: {e}")))?;

        let terminal_id = Uuid::new_v4();
        let child = Arc::new(StdMutex::new(child));
        let closed = Arc::new(StdMutex::new(false));

        {
            let mut terminals = self.terminals.lock().await;
            terminals.insert(
                terminal_id,
                PtyTerminal {
                    master: pair.master,
                    writer,
                    child: Arc::clone(&child),
                    closed: Arc::clone(&closed),
                },
            );
        }

        // Blocking reader bridged onto the async channel
        let reader_events = events.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let event = TerminalEvent::Output {
                            terminal_id,
                            chunk: buf[..n].to_vec(),
                            stderr: false,
                        };
                        if reader_events.blocking_send(event).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Exit watcher polls the child; reports exit exactly once
        tokio::task::spawn_blocking(move || {
            let exit_code = loop {
                {
                    let mut child = match child.lock() {
                        Ok(child) => child,
                        Err(_) => break None,
                    };
                    match child.try_wait() {
                        Ok(Some(status)) => break Some(status.exit_code() as i32),
                        Ok(None) => {}
                        Err(_) => break None,
                    }
                }
                std::thread::sleep(std::time::Duration::from_millis(EXIT_POLL_MS));
            };
            if let Ok(mut closed) = closed.lock() {
                *closed = true;
            }
            let _ = events.blocking_send(TerminalEvent::Exit {
                terminal_id,
                exit_code,
            });
        });

        tracing::debug!(%terminal_id, shell = %spec.shell, "spawned pty terminal");
        Ok(terminal_id)
    }

    async fn write(&self, terminal_id: Uuid, data: &[u8]) -> OrchResult<()> {
        let mut terminals = self.terminals.lock().await;
        let terminal = terminals
            .get_mut(&terminal_id)
            .ok_or(OrchestratorError::TerminalClosed(terminal_id))?;
        if terminal.closed.lock().map(|c| *c).unwrap_or(true) {
            return Err(OrchestratorError::TerminalClosed(terminal_id));
        }
        terminal
            .writer
            .write_all(data)
            .map_err(|e| OrchestratorError::Transport(format!("pty write: {e}")))?;
        terminal
            .writer
            .flush()
            .map_err(|e| OrchestratorError::Transport(format!("pty flush: {e}")))
    }

    async fn resize(&self, terminal_id: Uuid, cols: u16, rows: u16) -> OrchResult<()> {
        let terminals = self.terminals.lock().await;
        if let Some(terminal) = terminals.get(&terminal_id) {
            // Advisory; a failed resize is not an error
            let _ = terminal.master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            });
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
        if let Ok(mut child) = terminal.child.lock() {
            let _ = child.kill();
        }
        Ok(())
    }
}

//! Terminal backend port.
//!
//! Workers are backed by a terminal: a pty, a tmux pane, or a plain child
//! process. Backends are polymorphic over spawn/write/resize/kill plus an
//! output event channel; resize is advisory and backends that cannot
//! resize ignore it silently.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::error::OrchResult;
use crate::domain::models::TerminalKind;

/// Parameters for spawning a terminal.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Shell or program to run
    pub shell: String,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Initial width in columns
    pub cols: u16,
    /// Initial height in rows
    pub rows: u16,
}

impl Default for SpawnSpec {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            cwd: None,
            env: HashMap::new(),
            cols: 120,
            rows: 40,
        }
    }
}

impl SpawnSpec {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            ..Self::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}

/// Events emitted by a terminal backend.
#[derive(Debug, Clone)]
pub enum TerminalEvent {
    /// A chunk of output from the terminal
    Output {
        terminal_id: Uuid,
        chunk: Vec<u8>,
        /// True when the chunk came from stderr (pty/tmux backends merge
        /// streams and always report false)
        stderr: bool,
    },
    /// The process exited; reported exactly once per terminal
    Exit {
        terminal_id: Uuid,
        exit_code: Option<i32>,
    },
}

impl TerminalEvent {
    pub fn terminal_id(&self) -> Uuid {
        match self {
            Self::Output { terminal_id, .. } | Self::Exit { terminal_id, .. } => *terminal_id,
        }
    }
}

/// Backend abstraction over pty, tmux pane, and plain child process.
///
/// After `Exit` has been emitted for a terminal, `write` fails with
/// `TerminalClosed`.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Which variant this backend is.
    fn kind(&self) -> TerminalKind;

    /// Spawn a terminal; output and exit events flow into `events`.
    async fn spawn(
        &self,
        spec: SpawnSpec,
        events: mpsc::Sender<TerminalEvent>,
    ) -> OrchResult<Uuid>;

    /// Write bytes to the terminal's input.
    async fn write(&self, terminal_id: Uuid, data: &[u8]) -> OrchResult<()>;

    /// Resize the terminal. Advisory; backends without resize ignore it.
    async fn resize(&self, terminal_id: Uuid, cols: u16, rows: u16) -> OrchResult<()>;

    /// Kill the terminal's process and release its resources.
    async fn kill(&self, terminal_id: Uuid) -> OrchResult<()>;
}

//! Terminal backends: pty, tmux pane, and plain child process.

pub mod output_parser;
pub mod process;
pub mod pty;
pub mod tmux;

use std::sync::Arc;

use crate::domain::models::TerminalKind;
use crate::domain::ports::TerminalBackend;

pub use output_parser::{OutputParser, ParsedLine, COMPLETION_MARKER};
pub use process::ProcessBackend;
pub use pty::PtyBackend;
pub use tmux::TmuxBackend;

/// Build the backend for the configured variant.
pub fn backend_for(kind: TerminalKind) -> Arc<dyn TerminalBackend> {
    match kind {
        TerminalKind::Pty => Arc::new(PtyBackend::new()),
        TerminalKind::TmuxPane => Arc::new(TmuxBackend::new()),
        TerminalKind::Process => Arc::new(ProcessBackend::new()),
    }
}

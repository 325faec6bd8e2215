//! Ports: trait seams between the domain and its adapters.

pub mod agent_handler;
pub mod memory_store;
pub mod terminal;

pub use agent_handler::{AgentHandler, NoopAgentHandler};
pub use memory_store::MemoryStore;
pub use terminal::{SpawnSpec, TerminalBackend, TerminalEvent};

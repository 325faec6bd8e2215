//! Infrastructure adapters: configuration, logging, terminal backends,
//! the memory store, and the tool-call server.

pub mod config;
pub mod logging;
pub mod server;
pub mod store;
pub mod terminal;

pub use config::{ConfigError, ConfigLoader};

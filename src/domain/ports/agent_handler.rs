//! Agent handler port.
//!
//! The registry calls these hooks around an agent's lifetime: `initialize`
//! before the agent becomes ready (failure keeps it out of the registry),
//! `shutdown` after its last task drains.

use async_trait::async_trait;

use crate::domain::error::OrchResult;

/// Lifecycle hooks supplied at registration time.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Prepare the agent. Called once before the agent is marked ready.
    async fn initialize(&self) -> OrchResult<()>;

    /// Tear the agent down. Called once after its current tasks drain.
    async fn shutdown(&self) -> OrchResult<()>;
}

/// Handler with no setup or teardown, for agents whose backend carries all
/// lifecycle state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAgentHandler;

#[async_trait]
impl AgentHandler for NoopAgentHandler {
    async fn initialize(&self) -> OrchResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> OrchResult<()> {
        Ok(())
    }
}

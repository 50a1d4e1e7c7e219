use crate::agents::AgentId;
use crate::config::ConfigError;
use thiserror::Error;

/// Contract violations inside the period coordinator. These stop the
/// coordinator instead of being folded into a period status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("agent {agent} ({name}) is in the stack but is not attached to this coordinator")]
    StackInconsistency { agent: AgentId, name: String },
    #[error("coordinator has finished")]
    Finished,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("led number {0} is invalid")]
    InvalidLed(u8),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session was already started")]
    AlreadyStarted,
    #[error("session has not been started")]
    NotStarted,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("thread spawn failed: {0}")]
    Io(#[from] std::io::Error),
}

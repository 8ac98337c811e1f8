use thiserror::Error;

use crate::config::CoreKind;

/// Failures surfaced to the controller by the agent service.
///
/// Hook and sink failures never reach a caller; `HookFailure` only
/// classifies them in the log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("invalid config: {0}")]
    ConfigInvalid(String),
    #[error("process conflict: {0}")]
    ProcessConflict(String),
    #[error("{0} core is not running")]
    NotRunning(CoreKind),
    #[error("session rejected: another controller is connected")]
    SessionRejected,
    #[error("{0} core is not enabled on this node")]
    CoreDisabled(CoreKind),
    #[error("hook failed: {0}")]
    HookFailure(String),
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::ConfigInvalid(_) => "config_invalid",
            AgentError::ProcessConflict(_) => "process_conflict",
            AgentError::NotRunning(_) => "not_running",
            AgentError::SessionRejected => "session_rejected",
            AgentError::CoreDisabled(_) => "core_disabled",
            AgentError::HookFailure(_) => "hook_failure",
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::ConfigInvalid(err.to_string())
    }
}

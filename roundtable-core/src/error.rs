//! Error types for the session runtime.

use std::time::Duration;

use thiserror::Error;

use crate::session::{SessionId, SessionStatus};

/// Failure of the external agent collaborator
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("execution error: {0}")]
    Execution(String),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("agent step timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to construct agent '{role}': {reason}")]
    Construction { role: String, reason: String },
}

impl AgentError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn construction(role: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Construction {
            role: role.into(),
            reason: reason.into(),
        }
    }
}

impl From<roundtable_llm::LlmError> for AgentError {
    fn from(err: roundtable_llm::LlmError) -> Self {
        Self::Llm(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Unknown session, agent or result. Caller error, not retried.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Operation incompatible with the session's current status
    #[error("session {session_id}: {reason}")]
    InvalidState { session_id: SessionId, reason: String },

    /// Internal invariant guard; surfacing one means a bug
    #[error("session {session_id}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("capacity exceeded: {limit} live sessions")]
    CapacityExceeded { limit: usize },

    #[error("no admission slot within {waited:?}")]
    AdmissionTimeout { waited: Duration },

    #[error("session {session_id}: {source}")]
    Agent {
        session_id: SessionId,
        #[source]
        source: AgentError,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("runtime is shutting down")]
    ShuttingDown,
}

impl RuntimeError {
    pub fn session_not_found(id: &SessionId) -> Self {
        Self::NotFound {
            entity: "session",
            id: id.to_string(),
        }
    }

    pub fn agent_not_found(name: &str) -> Self {
        Self::NotFound {
            entity: "agent",
            id: name.to_string(),
        }
    }

    pub fn invalid_state(session_id: SessionId, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            session_id,
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Capacity and admission failures clear up on their own; a caller may back off and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. } | Self::AdmissionTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Bad configuration value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name}: cannot parse '{value}'")]
    Parse { name: String, value: String },

    #[error("{0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(RuntimeError::CapacityExceeded { limit: 1 }.is_retryable());
        assert!(RuntimeError::AdmissionTimeout {
            waited: Duration::from_millis(10)
        }
        .is_retryable());
        assert!(!RuntimeError::ShuttingDown.is_retryable());
        assert!(!RuntimeError::session_not_found(&SessionId::new()).is_retryable());
    }

    #[test]
    fn agent_error_keeps_source() {
        let id = SessionId::new();
        let err = RuntimeError::Agent {
            session_id: id,
            source: AgentError::Timeout(Duration::from_secs(1)),
        };
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("timed out"));
        assert!(err.to_string().contains(&id.to_string()));
    }
}

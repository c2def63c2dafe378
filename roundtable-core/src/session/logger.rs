//! Per-session log streams.
//!
//! Every session gets a [`SessionLogger`] handle. The handle is bound to one
//! session id when it is created and stamps that id on each entry, so entries
//! from two sessions can never land in the same call to a sink.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use super::record::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionLogEntry {
    pub session_id: SessionId,
    pub level: LogLevel,
    /// Agent that produced the entry, if it came from inside a step
    pub agent: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Destination for one session's log entries
pub trait SessionLogSink: Send + Sync {
    fn write(&self, entry: SessionLogEntry);
}

/// Default sink: re-emits entries as `tracing` events tagged with the session id
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl SessionLogSink for TracingSink {
    fn write(&self, entry: SessionLogEntry) {
        let agent = entry.agent.as_deref().unwrap_or("-");
        match entry.level {
            LogLevel::Debug => {
                tracing::debug!(
                    target: "roundtable::session",
                    session_id = %entry.session_id,
                    agent,
                    "{}",
                    entry.message
                )
            }
            LogLevel::Info => {
                tracing::info!(
                    target: "roundtable::session",
                    session_id = %entry.session_id,
                    agent,
                    "{}",
                    entry.message
                )
            }
            LogLevel::Warn => {
                tracing::warn!(
                    target: "roundtable::session",
                    session_id = %entry.session_id,
                    agent,
                    "{}",
                    entry.message
                )
            }
            LogLevel::Error => {
                tracing::error!(
                    target: "roundtable::session",
                    session_id = %entry.session_id,
                    agent,
                    "{}",
                    entry.message
                )
            }
        }
    }
}

/// Forwards entries to a channel. If the receiver is gone entries are dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<SessionLogEntry>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<SessionLogEntry>) -> Self {
        Self { sender }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionLogEntry>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl SessionLogSink for ChannelSink {
    fn write(&self, entry: SessionLogEntry) {
        let _ = self.sender.send(entry);
    }
}

/// Handle bound to one session's sink
#[derive(Clone)]
pub struct SessionLogger {
    session_id: SessionId,
    agent: Option<String>,
    sink: Arc<dyn SessionLogSink>,
}

impl SessionLogger {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Same stream, with entries attributed to `agent`
    pub fn for_agent(&self, agent: impl Into<String>) -> Self {
        Self {
            session_id: self.session_id,
            agent: Some(agent.into()),
            sink: self.sink.clone(),
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.write(SessionLogEntry {
            session_id: self.session_id,
            level,
            agent: self.agent.clone(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

impl fmt::Debug for SessionLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLogger")
            .field("session_id", &self.session_id)
            .field("agent", &self.agent)
            .finish()
    }
}

/// Routing table from session id to sink
pub struct SessionLogRouter {
    sinks: RwLock<HashMap<SessionId, Arc<dyn SessionLogSink>>>,
    fallback: Arc<dyn SessionLogSink>,
}

impl Default for SessionLogRouter {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl SessionLogRouter {
    /// `fallback` receives entries of sessions without a dedicated sink
    pub fn new(fallback: Arc<dyn SessionLogSink>) -> Self {
        Self {
            sinks: RwLock::new(HashMap::new()),
            fallback,
        }
    }

    /// Route `session_id`'s entries to `sink`, replacing any previous one
    pub fn attach(&self, session_id: SessionId, sink: Arc<dyn SessionLogSink>) {
        self.sinks.write().insert(session_id, sink);
    }

    pub fn detach(&self, session_id: &SessionId) -> bool {
        self.sinks.write().remove(session_id).is_some()
    }

    pub fn handle(&self, session_id: SessionId) -> SessionLogger {
        let sink = self
            .sinks
            .read()
            .get(&session_id)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());
        SessionLogger {
            session_id,
            agent: None,
            sink,
        }
    }

    pub fn attached(&self) -> usize {
        self.sinks.read().len()
    }
}

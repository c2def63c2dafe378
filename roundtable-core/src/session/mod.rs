mod lifecycle;
mod logger;
mod record;
mod store;

pub use lifecycle::StepLifecycle;
pub use logger::{
    ChannelSink, LogLevel, SessionLogEntry, SessionLogRouter, SessionLogSink, SessionLogger,
    TracingSink,
};
pub use record::{AgentResult, ResultStatus, SessionId, SessionRecord, SessionStatus};
pub use store::{ExpirableSessions, SessionStore, StepTicket};

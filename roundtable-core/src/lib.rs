pub mod admission;
pub mod agent;
pub mod config;
pub mod error;
pub mod eviction;
pub mod logging;
pub mod monitor;
pub mod runtime;
pub mod session;

pub use admission::{AdmissionController, AdmissionSlot, AdmissionStats};
pub use agent::{
    round_table_registry, AgentFactory, AgentInstanceSet, AgentPool, AgentRegistry,
    DiscussionAgent, Persona, PersonaAgent, PersonaFactory, StepContext, ROUND_TABLE,
};
pub use config::RuntimeConfig;
pub use error::{AgentError, ConfigError, Result, RuntimeError};
pub use eviction::{EvictionReport, EvictionScheduler};
pub use logging::{init_tracing, LoggingConfig};
pub use monitor::{PerformanceMonitor, PerformanceSummary, SessionStats};
pub use runtime::{SessionRuntime, SessionSnapshot, StepOptions};
pub use session::{
    AgentResult, ChannelSink, LogLevel, ResultStatus, SessionId, SessionLogEntry,
    SessionLogRouter, SessionLogSink, SessionLogger, SessionRecord, SessionStatus, SessionStore,
    TracingSink,
};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    Completed,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    /// Statuses only move forward: Created -> Active -> Completed | Failed,
    /// and Created | Active -> Expired.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Created, Expired)
                | (Active, Expired)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Error,
}

/// What one agent produced for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_key: String,
    pub agent_name: String,
    pub content: String,
    pub status: ResultStatus,
    pub completed_at: DateTime<Utc>,
}

impl AgentResult {
    pub fn completed(
        agent_key: impl Into<String>,
        agent_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            agent_key: agent_key.into(),
            agent_name: agent_name.into(),
            content: content.into(),
            status: ResultStatus::Completed,
            completed_at: Utc::now(),
        }
    }

    pub fn error(
        agent_key: impl Into<String>,
        agent_name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            agent_key: agent_key.into(),
            agent_name: agent_name.into(),
            content: reason.into(),
            status: ResultStatus::Error,
            completed_at: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ResultStatus::Error
    }
}

/// State of one discussion session. Owned by the [`SessionStore`](super::SessionStore);
/// callers only ever see clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub topic: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub results: HashMap<String, AgentResult>,
    pub completed_agents: BTreeSet<String>,
    /// Agent whose step is currently running
    pub current_step: Option<String>,
    /// Why the session ended up Failed
    pub failure: Option<String>,
}

impl SessionRecord {
    pub(crate) fn new(topic: String) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            topic,
            status: SessionStatus::Created,
            created_at: now,
            last_accessed_at: now,
            results: HashMap::new(),
            completed_agents: BTreeSet::new(),
            current_step: None,
            failure: None,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.created_at, now)
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.last_accessed_at, now)
    }

    pub fn is_expirable(&self, now: DateTime<Utc>, ttl: Duration, idle_timeout: Duration) -> bool {
        self.age(now) > ttl || self.idle_for(now) > idle_timeout
    }
}

/// Clock skew can put `since` after `now`; that counts as no time at all.
fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

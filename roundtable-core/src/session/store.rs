use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::record::{AgentResult, SessionId, SessionRecord, SessionStatus};
use crate::error::{Result, RuntimeError};

/// Returned by [`SessionStore::begin_step`]
#[derive(Debug, Clone)]
pub struct StepTicket {
    pub topic: String,
    /// Status before the step started
    pub previous: SessionStatus,
}

/// Session ids due for eviction, snapshotted when the scan ran
pub struct ExpirableSessions {
    ids: std::vec::IntoIter<SessionId>,
}

impl Iterator for ExpirableSessions {
    type Item = SessionId;

    fn next(&mut self) -> Option<SessionId> {
        self.ids.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ids.size_hint()
    }
}

impl ExactSizeIterator for ExpirableSessions {}

/// Owns every [`SessionRecord`].
///
/// One mutex guards the map and every record's mutable fields. Records are
/// small and each operation is a handful of map lookups, so the lock is never
/// held for long and never across an `.await`.
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
    max_sessions: Option<usize>,
}

impl SessionStore {
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Insert a new session in status Created
    pub fn create(&self, topic: impl Into<String>) -> Result<SessionId> {
        let mut sessions = self.sessions.lock();

        // Check max sessions limit (terminal sessions awaiting eviction don't count)
        if let Some(max) = self.max_sessions {
            let live = sessions.values().filter(|r| !r.status.is_terminal()).count();
            if live >= max {
                return Err(RuntimeError::CapacityExceeded { limit: max });
            }
        }

        let record = SessionRecord::new(topic.into());
        let id = record.id;
        sessions.insert(id, record);
        info!("[{}] Session created", id);
        Ok(id)
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionRecord> {
        self.sessions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::session_not_found(id))
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Refresh `last_accessed_at` and return the refreshed snapshot
    pub fn touch(&self, id: &SessionId) -> Result<SessionRecord> {
        let mut sessions = self.sessions.lock();
        let record = sessions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::session_not_found(id))?;
        record.touch();
        Ok(record.clone())
    }

    pub fn update_status(&self, id: &SessionId, status: SessionStatus) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let record = sessions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::session_not_found(id))?;

        if !record.status.can_transition_to(status) {
            error!(
                "[{}] Rejected status transition {} -> {}",
                id, record.status, status
            );
            return Err(RuntimeError::InvalidTransition {
                session_id: *id,
                from: record.status,
                to: status,
            });
        }

        debug!("[{}] Status {} -> {}", id, record.status, status);
        record.status = status;
        record.touch();
        Ok(())
    }

    /// Check a step could start right now, without starting it
    pub fn ensure_runnable(&self, id: &SessionId, agent: &str) -> Result<()> {
        let sessions = self.sessions.lock();
        let record = sessions
            .get(id)
            .ok_or_else(|| RuntimeError::session_not_found(id))?;
        check_runnable(record, agent)
    }

    /// Mark a step for `agent` as in flight, moving Created -> Active.
    ///
    /// Fails with `InvalidState` if the session is terminal, already has a
    /// step running, or already holds a result for `agent`.
    pub fn begin_step(&self, id: &SessionId, agent: &str) -> Result<StepTicket> {
        let mut sessions = self.sessions.lock();
        let record = sessions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::session_not_found(id))?;
        check_runnable(record, agent)?;

        let previous = record.status;
        if previous == SessionStatus::Created {
            record.status = SessionStatus::Active;
        }
        record.current_step = Some(agent.to_string());
        record.touch();

        Ok(StepTicket {
            topic: record.topic.clone(),
            previous,
        })
    }

    pub fn record_result(&self, id: &SessionId, agent: &str, payload: AgentResult) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let record = sessions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::session_not_found(id))?;

        if record.status.is_terminal() {
            return Err(RuntimeError::invalid_state(
                *id,
                format!("cannot record a result in status {}", record.status),
            ));
        }
        if record.results.contains_key(agent) {
            return Err(RuntimeError::invalid_state(
                *id,
                format!("agent '{}' already has a result", agent),
            ));
        }

        record.results.insert(agent.to_string(), payload);
        record.completed_agents.insert(agent.to_string());
        if record.current_step.as_deref() == Some(agent) {
            record.current_step = None;
        }
        record.touch();
        Ok(())
    }

    /// Fail the session because the step for `agent` did not complete.
    ///
    /// The error result (if any) and the Failed status land in one critical
    /// section, so readers never see one without the other.
    pub fn fail_step(
        &self,
        id: &SessionId,
        agent: &str,
        reason: &str,
        result: Option<AgentResult>,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let record = sessions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::session_not_found(id))?;

        if record.current_step.as_deref() == Some(agent) {
            record.current_step = None;
        }
        if !record.status.can_transition_to(SessionStatus::Failed) {
            return Err(RuntimeError::InvalidTransition {
                session_id: *id,
                from: record.status,
                to: SessionStatus::Failed,
            });
        }

        if let Some(result) = result {
            if !record.results.contains_key(agent) {
                record.results.insert(agent.to_string(), result);
                record.completed_agents.insert(agent.to_string());
            }
        }
        record.status = SessionStatus::Failed;
        record.failure = Some(reason.to_string());
        record.touch();
        info!("[{}] Session failed: {}", id, reason);
        Ok(())
    }

    /// Delete a session; removing an unknown id is a no-op
    pub fn remove(&self, id: &SessionId) -> Option<SessionRecord> {
        let removed = self.sessions.lock().remove(id);
        if removed.is_some() {
            debug!("[{}] Session removed from store", id);
        }
        removed
    }

    /// Remove a session unless a step is running on it.
    ///
    /// `release` runs under the store lock after the check and before the
    /// record is dropped, so no step can begin in between. It must not call
    /// back into the store.
    pub fn remove_idle<F>(&self, id: &SessionId, release: F) -> Result<SessionRecord>
    where
        F: FnOnce(&SessionRecord),
    {
        let mut sessions = self.sessions.lock();
        let record = sessions
            .get(id)
            .ok_or_else(|| RuntimeError::session_not_found(id))?;
        if let Some(running) = &record.current_step {
            return Err(RuntimeError::invalid_state(
                *id,
                format!("step for agent '{}' is in flight", running),
            ));
        }
        release(record);
        let removed = sessions
            .remove(id)
            .ok_or_else(|| RuntimeError::session_not_found(id))?;
        debug!("[{}] Session removed from store", id);
        Ok(removed)
    }

    /// Sessions older than `ttl` or idle longer than `idle_timeout` at `now`
    pub fn list_expirable(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
        idle_timeout: Duration,
    ) -> ExpirableSessions {
        let ids: Vec<SessionId> = self
            .sessions
            .lock()
            .values()
            .filter(|r| r.is_expirable(now, ttl, idle_timeout))
            .map(|r| r.id)
            .collect();
        ExpirableSessions {
            ids: ids.into_iter(),
        }
    }

    /// Re-check expiry under the lock and mark the session Expired.
    ///
    /// Returns `true` when the caller should reclaim the session: it is still
    /// present, still due, and has no step in flight. Sessions that already
    /// reached Completed or Failed keep their status.
    pub fn expire(
        &self,
        id: &SessionId,
        now: DateTime<Utc>,
        ttl: Duration,
        idle_timeout: Duration,
    ) -> Result<bool> {
        let mut sessions = self.sessions.lock();
        let Some(record) = sessions.get_mut(id) else {
            return Ok(false);
        };

        if record.current_step.is_some() || !record.is_expirable(now, ttl, idle_timeout) {
            return Ok(false);
        }

        if !record.status.is_terminal() {
            if !record.status.can_transition_to(SessionStatus::Expired) {
                return Err(RuntimeError::InvalidTransition {
                    session_id: *id,
                    from: record.status,
                    to: SessionStatus::Expired,
                });
            }
            record.status = SessionStatus::Expired;
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Sessions not yet in a terminal status
    pub fn live_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|r| !r.status.is_terminal())
            .count()
    }
}

fn check_runnable(record: &SessionRecord, agent: &str) -> Result<()> {
    if record.status.is_terminal() {
        return Err(RuntimeError::invalid_state(
            record.id,
            format!("session is {}", record.status),
        ));
    }
    if let Some(running) = &record.current_step {
        return Err(RuntimeError::invalid_state(
            record.id,
            format!("step for agent '{}' already in flight", running),
        ));
    }
    if record.results.contains_key(agent) {
        return Err(RuntimeError::invalid_state(
            record.id,
            format!("agent '{}' already has a result", agent),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn create_then_get_round_trips() {
        let store = SessionStore::new(None);
        let id = store.create("X").unwrap();

        let record = store.get(&id).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.topic, "X");
        assert_eq!(record.status, SessionStatus::Created);
        assert!(record.results.is_empty());
        assert!(record.completed_agents.is_empty());
    }

    #[test]
    fn capacity_counts_only_live_sessions() {
        let store = SessionStore::new(Some(2));
        let a = store.create("a").unwrap();
        store.create("b").unwrap();

        let err = store.create("c").unwrap_err();
        assert!(matches!(err, RuntimeError::CapacityExceeded { limit: 2 }));

        store.update_status(&a, SessionStatus::Active).unwrap();
        store.update_status(&a, SessionStatus::Completed).unwrap();
        store.create("c").unwrap();
    }

    #[test]
    fn unknown_session_is_not_found() {
        let store = SessionStore::new(None);
        let id = SessionId::new();
        assert!(store.get(&id).unwrap_err().is_not_found());
        assert!(store
            .record_result(&id, "scientist", AgentResult::completed("scientist", "Scientist", "x"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let store = SessionStore::new(None);
        let id = store.create("t").unwrap();

        let err = store.update_status(&id, SessionStatus::Completed).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::InvalidTransition {
                from: SessionStatus::Created,
                to: SessionStatus::Completed,
                ..
            }
        ));

        store.update_status(&id, SessionStatus::Expired).unwrap();
        assert!(store.update_status(&id, SessionStatus::Active).is_err());
        assert_eq!(store.get(&id).unwrap().status, SessionStatus::Expired);
    }

    #[test]
    fn begin_step_activates_and_serializes() {
        let store = SessionStore::new(None);
        let id = store.create("t").unwrap();

        let ticket = store.begin_step(&id, "scientist").unwrap();
        assert_eq!(ticket.topic, "t");
        assert_eq!(ticket.previous, SessionStatus::Created);
        assert_eq!(store.get(&id).unwrap().status, SessionStatus::Active);

        let err = store.begin_step(&id, "critic").unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidState { .. }));

        store
            .record_result(
                &id,
                "scientist",
                AgentResult::completed("scientist", "Scientist", "done"),
            )
            .unwrap();
        let record = store.get(&id).unwrap();
        assert_eq!(record.current_step, None);
        assert!(record.completed_agents.contains("scientist"));

        let ticket = store.begin_step(&id, "critic").unwrap();
        assert_eq!(ticket.previous, SessionStatus::Active);
    }

    #[test]
    fn results_are_append_only() {
        let store = SessionStore::new(None);
        let id = store.create("t").unwrap();
        store.begin_step(&id, "artist").unwrap();
        store
            .record_result(&id, "artist", AgentResult::completed("artist", "Artist", "first"))
            .unwrap();

        let err = store
            .record_result(&id, "artist", AgentResult::completed("artist", "Artist", "second"))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidState { .. }));
        assert_eq!(store.get(&id).unwrap().results["artist"].content, "first");
        assert!(store.begin_step(&id, "artist").is_err());
    }

    #[test]
    fn terminal_sessions_reject_results() {
        let store = SessionStore::new(None);
        let id = store.create("t").unwrap();
        store.begin_step(&id, "leader").unwrap();
        store
            .fail_step(&id, "leader", "boom", Some(AgentResult::error("leader", "Leader", "boom")))
            .unwrap();

        let record = store.get(&id).unwrap();
        assert_eq!(record.status, SessionStatus::Failed);
        assert_eq!(record.failure.as_deref(), Some("boom"));
        assert!(record.results["leader"].is_error());
        assert_eq!(record.current_step, None);

        let err = store
            .record_result(&id, "artist", AgentResult::completed("artist", "Artist", "late"))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidState { .. }));
    }

    #[test]
    fn remove_is_idempotent() {
        let store = SessionStore::new(None);
        let id = store.create("t").unwrap();

        assert!(store.remove(&id).is_some());
        assert!(store.remove(&id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn remove_idle_refuses_running_sessions() {
        let store = SessionStore::new(None);
        let id = store.create("t").unwrap();
        store.begin_step(&id, "artist").unwrap();

        let mut released = Vec::new();
        let err = store.remove_idle(&id, |r| released.push(r.id)).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidState { .. }));
        assert!(released.is_empty());

        store
            .record_result(
                &id,
                "artist",
                AgentResult::completed("artist", "Artist", "sketch"),
            )
            .unwrap();
        let removed = store.remove_idle(&id, |r| released.push(r.id)).unwrap();
        assert_eq!(removed.topic, "t");
        assert_eq!(released, vec![id]);
        assert!(store.remove_idle(&id, |_| {}).unwrap_err().is_not_found());
    }

    #[test]
    fn list_expirable_uses_ttl_and_idle() {
        let store = SessionStore::new(None);
        let id = store.create("t").unwrap();
        let now = Utc::now();

        assert_eq!(store.list_expirable(now, HOUR, HOUR).count(), 0);

        let later = now + chrono::Duration::hours(3);
        let due: Vec<_> = store.list_expirable(later, 24 * HOUR, 2 * HOUR).collect();
        assert_eq!(due, vec![id]);

        let due: Vec<_> = store.list_expirable(later, 2 * HOUR, 24 * HOUR).collect();
        assert_eq!(due, vec![id]);
    }

    #[test]
    fn expire_skips_sessions_with_a_step_in_flight() {
        let store = SessionStore::new(None);
        let id = store.create("t").unwrap();
        store.begin_step(&id, "engineer").unwrap();
        let later = Utc::now() + chrono::Duration::hours(3);

        assert!(!store.expire(&id, later, HOUR, HOUR).unwrap());
        assert_eq!(store.get(&id).unwrap().status, SessionStatus::Active);

        store
            .record_result(&id, "engineer", AgentResult::completed("engineer", "Engineer", "ok"))
            .unwrap();
        assert!(store.expire(&id, later, HOUR, HOUR).unwrap());
        assert_eq!(store.get(&id).unwrap().status, SessionStatus::Expired);

        // gone entirely
        store.remove(&id);
        assert!(!store.expire(&id, later, HOUR, HOUR).unwrap());
    }

    #[test]
    fn expire_keeps_terminal_status() {
        let store = SessionStore::new(None);
        let id = store.create("t").unwrap();
        store.update_status(&id, SessionStatus::Active).unwrap();
        store.update_status(&id, SessionStatus::Completed).unwrap();

        let later = Utc::now() + chrono::Duration::hours(3);
        assert!(store.expire(&id, later, HOUR, HOUR).unwrap());
        assert_eq!(store.get(&id).unwrap().status, SessionStatus::Completed);
    }
}

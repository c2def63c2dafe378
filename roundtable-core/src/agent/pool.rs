use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{AgentInstanceSet, AgentRegistry};
use crate::error::AgentError;
use crate::session::SessionId;

type InstanceCell = Arc<OnceCell<Arc<AgentInstanceSet>>>;

/// Lazily built, per-session agent instances.
///
/// `get_or_create` inserts an empty cell for the session under the map lock
/// (create-if-absent), then initializes the cell outside the lock. Every
/// concurrent first touch of a session waits on the same cell, so the
/// factories run exactly once per session.
pub struct AgentPool {
    registry: Arc<AgentRegistry>,
    sets: Mutex<HashMap<SessionId, InstanceCell>>,
}

impl AgentPool {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            sets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(
        &self,
        session_id: &SessionId,
    ) -> Result<Arc<AgentInstanceSet>, AgentError> {
        let cell = {
            let mut sets = self.sets.lock();
            sets.entry(*session_id)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let set = cell
            .get_or_try_init(|| self.build(*session_id))
            .await?;
        Ok(set.clone())
    }

    async fn build(&self, session_id: SessionId) -> Result<Arc<AgentInstanceSet>, AgentError> {
        let mut agents = HashMap::with_capacity(self.registry.len());
        for factory in self.registry.factories() {
            let agent = factory.create(&session_id).await?;
            agents.insert(factory.key().to_string(), agent);
        }
        info!("[{}] Created {} agent instances", session_id, agents.len());
        Ok(Arc::new(AgentInstanceSet::new(session_id, agents)))
    }

    /// Drop the session's instances; unknown ids are a no-op
    pub fn evict(&self, session_id: &SessionId) -> bool {
        let removed = self.sets.lock().remove(session_id).is_some();
        if removed {
            debug!("[{}] Agent instances evicted", session_id);
        }
        removed
    }

    /// Whether the session has a fully built instance set
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sets
            .lock()
            .get(session_id)
            .is_some_and(|cell| cell.initialized())
    }

    /// Live instance sets; entries whose construction failed or is still running don't count
    pub fn count(&self) -> usize {
        self.sets
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_touch_builds_once() {
        let scientist = ScriptedFactory::new("scientist");
        let built = scientist.counter();
        let pool = Arc::new(AgentPool::new(Arc::new(registry(vec![
            scientist,
            ScriptedFactory::new("critic"),
        ]))));
        let id = SessionId::new();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.get_or_create(&id).await.unwrap() })
            })
            .collect();
        let sets: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(sets.iter().all(|s| Arc::ptr_eq(s, &sets[0])));
        assert_eq!(sets[0].len(), 2);
        assert_eq!(pool.count(), 1);
    }

    #[tokio::test]
    async fn sessions_get_distinct_instances() {
        let pool = AgentPool::new(Arc::new(registry(vec![ScriptedFactory::new("artist")])));
        let a = SessionId::new();
        let b = SessionId::new();

        let set_a = pool.get_or_create(&a).await.unwrap();
        let set_b = pool.get_or_create(&b).await.unwrap();

        assert_eq!(set_a.session_id(), a);
        assert_eq!(set_b.session_id(), b);
        assert!(!Arc::ptr_eq(
            &set_a.get("artist").unwrap(),
            &set_b.get("artist").unwrap()
        ));
        assert_eq!(pool.count(), 2);
    }

    #[tokio::test]
    async fn evict_is_idempotent_and_allows_rebuild() {
        let factory = ScriptedFactory::new("leader");
        let built = factory.counter();
        let pool = AgentPool::new(Arc::new(registry(vec![factory])));
        let id = SessionId::new();

        pool.get_or_create(&id).await.unwrap();
        assert!(pool.contains(&id));
        assert!(pool.evict(&id));
        assert!(!pool.evict(&id));
        assert_eq!(pool.count(), 0);

        pool.get_or_create(&id).await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_construction_is_retried() {
        let factory = ScriptedFactory::new("financier").unbuildable();
        let built = factory.counter();
        let pool = AgentPool::new(Arc::new(registry(vec![factory])));
        let id = SessionId::new();

        let err = pool.get_or_create(&id).await.err().unwrap();
        assert!(matches!(err, AgentError::Construction { .. }));
        assert_eq!(pool.count(), 0);
        assert!(!pool.contains(&id));

        assert!(pool.get_or_create(&id).await.is_err());
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }
}

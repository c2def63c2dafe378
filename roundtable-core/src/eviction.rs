use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::agent::AgentPool;
use crate::monitor::PerformanceMonitor;
use crate::session::{SessionId, SessionLogRouter, SessionStore};

/// Outcome of one eviction pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: Vec<SessionId>,
    /// Due, but busy when the pass reached them
    pub skipped: Vec<SessionId>,
}

/// Periodically reclaims sessions past their TTL or idle timeout.
///
/// A session is reclaimed in a fixed order: marked Expired in the store,
/// its agent instances dropped from the pool, its record removed, and its
/// log stream detached. Sessions holding an admission slot or with a step in
/// flight are left for a later pass.
pub struct EvictionScheduler {
    store: Arc<SessionStore>,
    pool: Arc<AgentPool>,
    admission: Arc<AdmissionController>,
    logs: Arc<SessionLogRouter>,
    monitor: Arc<PerformanceMonitor>,
    interval: Duration,
    ttl: Duration,
    idle_timeout: Duration,
}

impl EvictionScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SessionStore>,
        pool: Arc<AgentPool>,
        admission: Arc<AdmissionController>,
        logs: Arc<SessionLogRouter>,
        monitor: Arc<PerformanceMonitor>,
        interval: Duration,
        ttl: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            admission,
            logs,
            monitor,
            interval,
            ttl,
            idle_timeout,
        }
    }

    /// Run passes every `interval` until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        info!(
            "Starting eviction task (every {:?}, ttl {:?}, idle {:?})",
            self.interval, self.ttl, self.idle_timeout
        );

        tokio::spawn(async move {
            // pass time follows the monotonic clock from here on
            let (wall, started) = (Utc::now(), Instant::now());
            let first = started + self.interval;
            let mut ticker = tokio::time::interval_at(first, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let elapsed = chrono::Duration::from_std(started.elapsed())
                            .unwrap_or_else(|_| chrono::Duration::zero());
                        let report = self.run_once(wall + elapsed);
                        if !report.evicted.is_empty() {
                            info!("Evicted {} expired sessions", report.evicted.len());
                        }
                    }
                }
            }
            info!("Eviction task stopped");
        })
    }

    /// One pass over the sessions due at `now`
    pub fn run_once(&self, now: DateTime<Utc>) -> EvictionReport {
        let mut report = EvictionReport::default();

        for id in self.store.list_expirable(now, self.ttl, self.idle_timeout) {
            if self.admission.is_held(&id) {
                debug!("[{}] Due for eviction but holds an admission slot", id);
                report.skipped.push(id);
                continue;
            }

            match self.store.expire(&id, now, self.ttl, self.idle_timeout) {
                Ok(true) => {
                    self.pool.evict(&id);
                    self.store.remove(&id);
                    self.logs.detach(&id);
                    self.monitor.remove_session(&id);
                    info!("[{}] Session evicted", id);
                    report.evicted.push(id);
                }
                // touched, started a step, or removed since the scan
                Ok(false) => report.skipped.push(id),
                Err(e) => {
                    warn!("[{}] Eviction failed: {}", id, e);
                    report.skipped.push(id);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{registry, ScriptedFactory};
    use crate::session::{AgentResult, ChannelSink, SessionStatus};

    const HOUR: Duration = Duration::from_secs(3600);

    struct Fixture {
        store: Arc<SessionStore>,
        pool: Arc<AgentPool>,
        admission: Arc<AdmissionController>,
        logs: Arc<SessionLogRouter>,
        scheduler: EvictionScheduler,
    }

    fn fixture(interval: Duration) -> Fixture {
        let store = Arc::new(SessionStore::new(None));
        let factories = vec![ScriptedFactory::new("scientist")];
        let pool = Arc::new(AgentPool::new(Arc::new(registry(factories))));
        let admission = Arc::new(AdmissionController::new(4));
        let logs = Arc::new(SessionLogRouter::default());
        let scheduler = EvictionScheduler::new(
            store.clone(),
            pool.clone(),
            admission.clone(),
            logs.clone(),
            Arc::new(PerformanceMonitor::new()),
            interval,
            24 * HOUR,
            2 * HOUR,
        );
        Fixture {
            store,
            pool,
            admission,
            logs,
            scheduler,
        }
    }

    #[tokio::test]
    async fn idle_sessions_are_reclaimed_everywhere() {
        let f = fixture(HOUR);
        let idle = f.store.create("idle").unwrap();
        let other = f.store.create("other").unwrap();
        f.pool.get_or_create(&idle).await.unwrap();
        let (sink, _rx) = ChannelSink::channel();
        f.logs.attach(idle, Arc::new(sink));

        let later = Utc::now() + chrono::Duration::hours(3);
        let report = f.scheduler.run_once(later);

        // both were idle for three hours at `later`
        assert_eq!(report.evicted.len(), 2);
        assert!(!f.store.contains(&idle));
        assert!(!f.store.contains(&other));
        assert!(!f.pool.contains(&idle));
        assert_eq!(f.logs.attached(), 0);

        // a second pass has nothing left to do
        assert_eq!(f.scheduler.run_once(later), EvictionReport::default());
    }

    #[tokio::test]
    async fn recent_sessions_survive() {
        let f = fixture(HOUR);
        let id = f.store.create("t").unwrap();
        let report = f.scheduler.run_once(Utc::now() + chrono::Duration::minutes(30));
        assert!(report.evicted.is_empty());
        assert_eq!(f.store.get(&id).unwrap().status, SessionStatus::Created);
    }

    #[tokio::test]
    async fn busy_sessions_are_skipped() {
        let f = fixture(HOUR);
        let held = f.store.create("held").unwrap();
        let stepping = f.store.create("stepping").unwrap();
        let slot = f.admission.acquire(held).await.unwrap();
        f.store.begin_step(&stepping, "scientist").unwrap();

        let later = Utc::now() + chrono::Duration::hours(3);
        let report = f.scheduler.run_once(later);
        assert!(report.evicted.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(f.store.get(&stepping).unwrap().status, SessionStatus::Active);

        drop(slot);
        f.store
            .record_result(
                &stepping,
                "scientist",
                AgentResult::completed("scientist", "Scientist", "ok"),
            )
            .unwrap();
        let report = f.scheduler.run_once(later);
        assert_eq!(report.evicted.len(), 2);
        assert!(f.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_task_stops_on_cancel() {
        let f = fixture(Duration::from_secs(60));
        let token = CancellationToken::new();
        let handle = f.scheduler.spawn(token.clone());

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(!handle.is_finished());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_task_reclaims_idle_sessions() {
        let f = fixture(Duration::from_secs(60));
        let id = f.store.create("forgotten").unwrap();
        f.pool.get_or_create(&id).await.unwrap();
        let token = CancellationToken::new();
        let handle = f.scheduler.spawn(token.clone());

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        assert!(f.store.contains(&id));
        assert!(f.pool.contains(&id));

        // two and a half hours in, well past the idle timeout
        tokio::time::sleep(2 * HOUR).await;
        tokio::task::yield_now().await;
        assert!(!f.store.contains(&id));
        assert!(!f.pool.contains(&id));
        assert_eq!(f.pool.count(), 0);

        token.cancel();
        handle.await.unwrap();
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::admission::{AdmissionController, AdmissionStats};
use crate::agent::{AgentPool, AgentRegistry, StepContext};
use crate::config::RuntimeConfig;
use crate::error::{AgentError, ConfigError, Result, RuntimeError};
use crate::eviction::{EvictionReport, EvictionScheduler};
use crate::monitor::{PerformanceMonitor, PerformanceSummary};
use crate::session::{
    AgentResult, SessionId, SessionLogRouter, SessionLogSink, SessionLogger, SessionRecord,
    SessionStatus, SessionStore, StepLifecycle,
};

/// Per-call overrides for [`SessionRuntime::run_step_with`]
#[derive(Clone, Debug, Default)]
pub struct StepOptions {
    /// Wait for an admission slot at most this long (None = the configured default)
    pub admission_timeout: Option<Duration>,
    /// Abandons the admission wait or the running step when fired
    pub cancel: Option<CancellationToken>,
}

/// What [`SessionRuntime::get_status`] reports
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub record: SessionRecord,
    pub total_agents: usize,
    /// Share of registered agents with a result, 0.0 to 1.0
    pub progress: f64,
}

/// Entry point for callers: owns the store, the agent pool, admission control,
/// the per-session log routing and the eviction task.
pub struct SessionRuntime {
    config: RuntimeConfig,
    registry: Arc<AgentRegistry>,
    store: Arc<SessionStore>,
    pool: Arc<AgentPool>,
    admission: Arc<AdmissionController>,
    logs: Arc<SessionLogRouter>,
    monitor: Arc<PerformanceMonitor>,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRuntime {
    pub fn new(
        config: RuntimeConfig,
        registry: AgentRegistry,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        if registry.is_empty() {
            return Err(ConfigError::Invalid("no agents registered".to_string()));
        }

        let registry = Arc::new(registry);
        Ok(Self {
            store: Arc::new(SessionStore::new(config.max_sessions)),
            pool: Arc::new(AgentPool::new(registry.clone())),
            admission: Arc::new(AdmissionController::new(config.max_concurrent_active)),
            logs: Arc::new(SessionLogRouter::default()),
            monitor: Arc::new(PerformanceMonitor::new()),
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            scheduler: Mutex::new(None),
            registry,
            config,
        })
    }

    /// Build the runtime and start its eviction task. Must be called inside a tokio runtime.
    pub fn start(
        config: RuntimeConfig,
        registry: AgentRegistry,
    ) -> std::result::Result<Arc<Self>, ConfigError> {
        let runtime = Arc::new(Self::new(config, registry)?);
        runtime.start_eviction();
        Ok(runtime)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Spawn the eviction task; a second call is a no-op
    pub fn start_eviction(&self) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_some() {
            return;
        }
        *scheduler = Some(self.eviction().spawn(self.cancel.child_token()));
    }

    /// Run one eviction pass now, independent of the background task
    pub fn evict_expired(&self, now: DateTime<Utc>) -> EvictionReport {
        self.eviction().run_once(now)
    }

    fn eviction(&self) -> EvictionScheduler {
        EvictionScheduler::new(
            self.store.clone(),
            self.pool.clone(),
            self.admission.clone(),
            self.logs.clone(),
            self.monitor.clone(),
            self.config.eviction_interval,
            self.config.session_ttl,
            self.config.idle_timeout,
        )
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShuttingDown);
        }
        Ok(())
    }

    pub fn create_session(&self, topic: &str) -> Result<SessionId> {
        self.ensure_open()?;

        let topic = topic.trim();
        let chars = topic.chars().count();
        if chars == 0 {
            return Err(RuntimeError::InvalidTopic("topic is empty".to_string()));
        }
        if chars > self.config.max_topic_chars {
            return Err(RuntimeError::InvalidTopic(format!(
                "topic has {} characters, at most {} allowed",
                chars, self.config.max_topic_chars
            )));
        }

        self.store.create(topic)
    }

    /// Run one agent's step with the configured admission timeout
    pub async fn run_step(
        &self,
        session_id: SessionId,
        agent: &str,
        input: &str,
    ) -> Result<AgentResult> {
        self.run_step_with(session_id, agent, input, StepOptions::default())
            .await
    }

    /// Run one agent's step.
    ///
    /// Waits for an admission slot, builds the session's agents on first use,
    /// and runs `agent` under the step timeout. Any failure of the agent marks
    /// the session Failed. The slot is released on every path, including when
    /// the returned future is dropped.
    pub async fn run_step_with(
        &self,
        session_id: SessionId,
        agent: &str,
        input: &str,
        options: StepOptions,
    ) -> Result<AgentResult> {
        self.ensure_open()?;
        if !self.registry.contains(agent) {
            return Err(RuntimeError::agent_not_found(agent));
        }
        self.store.ensure_runnable(&session_id, agent)?;

        let admission_timeout = options.admission_timeout.or(self.config.admission_timeout);
        let slot = self
            .admission
            .acquire_with(session_id, admission_timeout, options.cancel.as_ref())
            .await?;

        let started = Instant::now();
        let lifecycle = StepLifecycle::begin(self.store.clone(), session_id, agent)?;
        let topic = lifecycle.ticket().topic.clone();

        let span = info_span!("run_step", session_id = %session_id, agent = %agent);
        let step = self.think(session_id, agent, topic, input).instrument(span);
        let finished = match options.cancel.as_ref() {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => None,
                done = step => Some(done),
            },
            None => Some(step.await),
        };
        let elapsed = started.elapsed();

        match finished {
            Some((name, Ok(content))) => {
                let result = AgentResult::completed(agent, name, content);
                lifecycle.finish(result.clone())?;
                self.monitor.record_step(session_id, elapsed, true);
                self.complete_if_done(&session_id);
                info!("[{}] Agent {} finished in {:?}", session_id, agent, elapsed);
                self.admission.release(slot);
                Ok(result)
            }
            Some((name, Err(e))) => {
                warn!("[{}] Agent {} failed: {}", session_id, agent, e);
                self.monitor.record_step(session_id, elapsed, false);
                let reason = e.to_string();
                let entry = AgentResult::error(agent, name, &reason);
                if let Err(store_err) = lifecycle.fail(&reason, entry) {
                    warn!("[{}] Could not record failure: {}", session_id, store_err);
                }
                Err(RuntimeError::Agent {
                    session_id,
                    source: e,
                })
            }
            None => {
                info!("[{}] Step for agent {} cancelled", session_id, agent);
                self.monitor.record_step(session_id, elapsed, false);
                let reason = "step cancelled";
                let entry = AgentResult::error(agent, agent, reason);
                if let Err(store_err) = lifecycle.fail(reason, entry) {
                    warn!("[{}] Could not record cancellation: {}", session_id, store_err);
                }
                Err(RuntimeError::Cancelled)
            }
        }
    }

    /// Resolve the session's instance of `agent` and let it think. Returns the
    /// agent's display name alongside the outcome.
    ///
    /// Building the session's agents and the agent's own work share one
    /// `step_timeout` deadline.
    async fn think(
        &self,
        session_id: SessionId,
        agent: &str,
        topic: String,
        input: &str,
    ) -> (String, std::result::Result<String, AgentError>) {
        let deadline = tokio::time::Instant::now() + self.config.step_timeout;
        let timed_out = || AgentError::Timeout(self.config.step_timeout);

        // a build cut short leaves the pool entry unset; the next step retries it
        let building = self.pool.get_or_create(&session_id);
        let set = match tokio::time::timeout_at(deadline, building).await {
            Ok(Ok(set)) => set,
            Ok(Err(e)) => return (agent.to_string(), Err(e)),
            Err(_) => return (agent.to_string(), Err(timed_out())),
        };
        let Some(instance) = set.get(agent) else {
            return (
                agent.to_string(),
                Err(AgentError::construction(agent, "missing from the session's agents")),
            );
        };

        let name = instance.name().to_string();
        let ctx = StepContext {
            session_id,
            topic,
            agent_key: agent.to_string(),
            input: input.to_string(),
            logger: self.logs.handle(session_id).for_agent(agent),
        };
        debug!("[{}] {} is thinking", session_id, name);

        let outcome = match tokio::time::timeout_at(deadline, instance.think(&ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(timed_out()),
        };
        if let Err(e) = &outcome {
            ctx.logger.error(format!("{} failed: {}", name, e));
        }
        (name, outcome)
    }

    /// Move the session to Completed once every registered agent has a result
    fn complete_if_done(&self, session_id: &SessionId) {
        let Ok(record) = self.store.get(session_id) else {
            return;
        };
        let done = self.registry.keys().all(|key| record.results.contains_key(key));
        if !done || record.status != SessionStatus::Active {
            return;
        }
        match self.store.update_status(session_id, SessionStatus::Completed) {
            Ok(()) => info!("[{}] Discussion completed", session_id),
            Err(e) => warn!("[{}] Could not complete discussion: {}", session_id, e),
        }
    }

    /// Run every agent that has no result yet, one after another, stopping at the first error
    pub async fn run_discussion(
        &self,
        session_id: SessionId,
        input: &str,
    ) -> Result<SessionSnapshot> {
        let keys: Vec<String> = self.registry.keys().map(str::to_string).collect();
        for key in keys {
            if self.store.get(&session_id)?.results.contains_key(&key) {
                continue;
            }
            self.run_step(session_id, &key, input).await?;
        }
        self.get_status(session_id)
    }

    pub fn get_status(&self, session_id: SessionId) -> Result<SessionSnapshot> {
        let record = self.store.touch(&session_id)?;
        let total_agents = self.registry.len();
        let progress = record.completed_agents.len() as f64 / total_agents as f64;
        Ok(SessionSnapshot {
            record,
            total_agents,
            progress,
        })
    }

    pub fn agent_result(&self, session_id: SessionId, agent: &str) -> Result<AgentResult> {
        let record = self.store.touch(&session_id)?;
        record
            .results
            .get(agent)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound {
                entity: "result",
                id: format!("{}/{}", session_id, agent),
            })
    }

    /// Remove a session and everything it owns. Refused while a step is running.
    ///
    /// Agent instances go before the record; lock order is store, then pool.
    pub fn delete_session(&self, session_id: SessionId) -> Result<()> {
        self.store.remove_idle(&session_id, |_| {
            self.pool.evict(&session_id);
        })?;
        self.logs.detach(&session_id);
        self.monitor.remove_session(&session_id);
        info!("[{}] Session deleted", session_id);
        Ok(())
    }

    /// Route the session's log entries to `sink`
    pub fn attach_log_sink(
        &self,
        session_id: SessionId,
        sink: Arc<dyn SessionLogSink>,
    ) -> Result<()> {
        if !self.store.contains(&session_id) {
            return Err(RuntimeError::session_not_found(&session_id));
        }
        self.logs.attach(session_id, sink);
        Ok(())
    }

    pub fn log_handle(&self, session_id: SessionId) -> SessionLogger {
        self.logs.handle(session_id)
    }

    pub fn admission_stats(&self) -> AdmissionStats {
        self.admission.stats()
    }

    pub fn performance(&self) -> PerformanceSummary {
        self.monitor.summary()
    }

    pub fn live_agent_sets(&self) -> usize {
        self.pool.count()
    }

    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    /// Stop the eviction task and refuse new work. Steps already running finish normally.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down session runtime");

        self.cancel.cancel();
        self.admission.close();

        let scheduler = self.scheduler.lock().take();
        if let Some(handle) = scheduler {
            if let Err(e) = handle.await {
                warn!("Eviction task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

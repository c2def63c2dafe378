use std::sync::Arc;

use tracing::{debug, warn};

use super::record::{AgentResult, SessionId};
use super::store::{SessionStore, StepTicket};
use crate::error::Result;

/// Tracks one in-flight step between `begin_step` and its outcome.
///
/// If the guard is dropped without `finish` or `fail` (the caller dropped the
/// `run_step` future mid-step, or an error escaped early) the session is
/// marked Failed so its status never shows a step that is no longer running.
pub struct StepLifecycle {
    store: Arc<SessionStore>,
    session_id: SessionId,
    agent: String,
    ticket: StepTicket,
    settled: bool,
}

impl StepLifecycle {
    pub fn begin(store: Arc<SessionStore>, session_id: SessionId, agent: &str) -> Result<Self> {
        let ticket = store.begin_step(&session_id, agent)?;
        debug!("[{}] Step started for agent {}", session_id, agent);
        Ok(Self {
            store,
            session_id,
            agent: agent.to_string(),
            ticket,
            settled: false,
        })
    }

    pub fn ticket(&self) -> &StepTicket {
        &self.ticket
    }

    /// Store the agent's result and close the step
    pub fn finish(mut self, result: AgentResult) -> Result<()> {
        self.settled = true;
        let recorded = self
            .store
            .record_result(&self.session_id, &self.agent, result);
        if let Err(e) = &recorded {
            let reason = format!("could not record result: {}", e);
            if let Err(fail_err) = self
                .store
                .fail_step(&self.session_id, &self.agent, &reason, None)
            {
                warn!(
                    "[{}] Could not mark step for agent {} as failed: {}",
                    self.session_id, self.agent, fail_err
                );
            }
        }
        recorded
    }

    /// Close the step as failed, keeping `result` as the agent's error entry
    pub fn fail(mut self, reason: &str, result: AgentResult) -> Result<()> {
        self.settled = true;
        self.store
            .fail_step(&self.session_id, &self.agent, reason, Some(result))
    }
}

impl Drop for StepLifecycle {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        debug!(
            "[{}] Step for agent {} dropped before completion",
            self.session_id, self.agent
        );
        if let Err(e) = self.store.fail_step(
            &self.session_id,
            &self.agent,
            "step abandoned before completion",
            None,
        ) {
            warn!(
                "[{}] Could not mark abandoned step as failed: {}",
                self.session_id, e
            );
        }
    }
}

mod persona;
mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AgentError;
use crate::session::{SessionId, SessionLogger};

pub use persona::{round_table_registry, Persona, PersonaAgent, PersonaFactory, ROUND_TABLE};
pub use pool::AgentPool;

/// Everything an agent gets to see for one step
#[derive(Debug, Clone)]
pub struct StepContext {
    pub session_id: SessionId,
    pub topic: String,
    pub agent_key: String,
    pub input: String,
    /// Routes to this session's log stream only
    pub logger: SessionLogger,
}

/// One stateful participant of a discussion, bound to a single session
#[async_trait]
pub trait DiscussionAgent: Send + Sync {
    /// Display name, e.g. "Scientist"
    fn name(&self) -> &str;

    async fn think(&self, step: &StepContext) -> Result<String, AgentError>;
}

/// Stateless producer of agents, shared by every session
#[async_trait]
pub trait AgentFactory: Send + Sync {
    /// Registry key, e.g. "scientist"
    fn key(&self) -> &str;

    async fn create(&self, session_id: &SessionId) -> Result<Arc<dyn DiscussionAgent>, AgentError>;
}

/// Ordered set of agent factories
#[derive(Default, Clone)]
pub struct AgentRegistry {
    factories: Vec<Arc<dyn AgentFactory>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory; keys must be unique
    pub fn register(&mut self, factory: Arc<dyn AgentFactory>) -> Result<&mut Self, AgentError> {
        if self.contains(factory.key()) {
            return Err(AgentError::construction(
                factory.key(),
                "an agent with this key is already registered",
            ));
        }
        self.factories.push(factory);
        Ok(self)
    }

    pub fn with(mut self, factory: Arc<dyn AgentFactory>) -> Result<Self, AgentError> {
        self.register(factory)?;
        Ok(self)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.iter().any(|f| f.key() == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|f| f.key())
    }

    pub fn factories(&self) -> &[Arc<dyn AgentFactory>] {
        &self.factories
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// The agents of one session, keyed by registry key. Never shared across sessions.
pub struct AgentInstanceSet {
    session_id: SessionId,
    agents: HashMap<String, Arc<dyn DiscussionAgent>>,
}

impl AgentInstanceSet {
    pub(crate) fn new(
        session_id: SessionId,
        agents: HashMap<String, Arc<dyn DiscussionAgent>>,
    ) -> Self {
        Self { session_id, agents }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn DiscussionAgent>> {
        self.agents.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted collaborators shared by the crate's tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub struct ScriptedAgent {
        pub key: String,
        pub delay: Duration,
        pub fail: bool,
    }

    #[async_trait]
    impl DiscussionAgent for ScriptedAgent {
        fn name(&self) -> &str {
            &self.key
        }

        async fn think(&self, step: &StepContext) -> Result<String, AgentError> {
            step.logger.info(format!("{} thinking about {}", self.key, step.topic));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(AgentError::execution(format!("{} gave up", self.key)));
            }
            Ok(format!("{}:{}:{}", step.session_id, self.key, step.input))
        }
    }

    /// Builds [`ScriptedAgent`]s and counts how often it was asked to
    pub struct ScriptedFactory {
        pub key: String,
        pub delay: Duration,
        pub fail: bool,
        pub fail_construction: bool,
        /// `create` never resolves
        pub hangs: bool,
        pub built: Arc<AtomicUsize>,
    }

    impl ScriptedFactory {
        pub fn new(key: &str) -> Self {
            Self {
                key: key.to_string(),
                delay: Duration::ZERO,
                fail: false,
                fail_construction: false,
                hangs: false,
                built: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        pub fn unbuildable(mut self) -> Self {
            self.fail_construction = true;
            self
        }

        pub fn hanging(mut self) -> Self {
            self.hangs = true;
            self
        }

        pub fn counter(&self) -> Arc<AtomicUsize> {
            self.built.clone()
        }
    }

    #[async_trait]
    impl AgentFactory for ScriptedFactory {
        fn key(&self) -> &str {
            &self.key
        }

        async fn create(
            &self,
            _session_id: &SessionId,
        ) -> Result<Arc<dyn DiscussionAgent>, AgentError> {
            self.built.fetch_add(1, Ordering::SeqCst);
            // widen the window for racing first touches
            tokio::task::yield_now().await;
            if self.hangs {
                std::future::pending::<()>().await;
            }
            if self.fail_construction {
                return Err(AgentError::construction(&self.key, "no model handle"));
            }
            Ok(Arc::new(ScriptedAgent {
                key: self.key.clone(),
                delay: self.delay,
                fail: self.fail,
            }))
        }
    }

    pub fn registry(factories: Vec<ScriptedFactory>) -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        for factory in factories {
            registry.register(Arc::new(factory)).unwrap();
        }
        registry
    }
}

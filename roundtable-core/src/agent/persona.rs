use std::sync::Arc;

use async_trait::async_trait;
use roundtable_llm::LlmClient;

use super::{AgentFactory, AgentRegistry, DiscussionAgent, StepContext};
use crate::error::AgentError;
use crate::session::SessionId;

/// A fixed point of view at the round table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Persona {
    pub key: &'static str,
    pub name: &'static str,
    pub system_prompt: &'static str,
}

pub const ROUND_TABLE: [Persona; 6] = [
    Persona {
        key: "scientist",
        name: "Scientist",
        system_prompt: "You are a research scientist. Examine the topic through evidence, \
            mechanisms and open questions. Separate what is known from what is conjecture.",
    },
    Persona {
        key: "financier",
        name: "Financier",
        system_prompt: "You are a financier. Assess the topic in terms of capital, cost, \
            return, risk and market dynamics.",
    },
    Persona {
        key: "engineer",
        name: "Software Architect",
        system_prompt: "You are a software architect. Discuss how the topic would be built: \
            system structure, trade-offs, scalability and failure modes.",
    },
    Persona {
        key: "leader",
        name: "Manager",
        system_prompt: "You are an experienced manager. Focus on people, organisation, \
            priorities and execution.",
    },
    Persona {
        key: "entrepreneur",
        name: "Entrepreneur",
        system_prompt: "You are an entrepreneur. Look for the opportunity in the topic: \
            customers, product, timing and how to get started.",
    },
    Persona {
        key: "artist",
        name: "Artist",
        system_prompt: "You are an artist. Respond to the topic with imagination, aesthetics \
            and its human and cultural meaning.",
    },
];

fn user_prompt(step: &StepContext) -> String {
    let mut prompt = format!("Topic of the round table: {}\n", step.topic);
    if !step.input.trim().is_empty() {
        prompt.push_str(&format!("\nModerator's note: {}\n", step.input.trim()));
    }
    prompt.push_str("\nGive your perspective in a few focused paragraphs.");
    prompt
}

pub struct PersonaAgent {
    persona: Persona,
    client: LlmClient,
}

impl PersonaAgent {
    pub fn new(persona: Persona, client: LlmClient) -> Self {
        Self { persona, client }
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }
}

#[async_trait]
impl DiscussionAgent for PersonaAgent {
    fn name(&self) -> &str {
        self.persona.name
    }

    async fn think(&self, step: &StepContext) -> Result<String, AgentError> {
        step.logger.info(format!(
            "{} is considering the topic via {}",
            self.persona.name,
            self.client.provider_name()
        ));

        let answer = self
            .client
            .complete(self.persona.system_prompt, &user_prompt(step))
            .await
            .map_err(AgentError::from)?;

        step.logger.debug(format!("{} answered ({} chars)", self.persona.name, answer.len()));
        Ok(answer)
    }
}

/// Builds one [`PersonaAgent`] per session, each with its own client handle
pub struct PersonaFactory {
    persona: Persona,
    client: LlmClient,
}

impl PersonaFactory {
    pub fn new(persona: Persona, client: LlmClient) -> Self {
        Self { persona, client }
    }
}

#[async_trait]
impl AgentFactory for PersonaFactory {
    fn key(&self) -> &str {
        self.persona.key
    }

    async fn create(
        &self,
        _session_id: &SessionId,
    ) -> Result<Arc<dyn DiscussionAgent>, AgentError> {
        Ok(Arc::new(PersonaAgent::new(self.persona, self.client.clone())))
    }
}

/// Registry with all six round-table personas sharing `client`'s provider
pub fn round_table_registry(client: LlmClient) -> Result<AgentRegistry, AgentError> {
    let mut registry = AgentRegistry::new();
    for persona in ROUND_TABLE {
        registry.register(Arc::new(PersonaFactory::new(persona, client.clone())))?;
    }
    Ok(registry)
}

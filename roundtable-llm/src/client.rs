use std::sync::Arc;

use openai_dive::v1::resources::chat::{
    ChatCompletionParametersBuilder, ChatCompletionResponse, ChatMessage, ChatMessageContent,
};
use tracing::debug;

use crate::logging::log_llm_error;
use crate::provider::{LlmError, LlmProvider};
use crate::providers::OllamaProvider;

const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Thin client over a provider: builds a system + user chat request and
/// returns the assistant's text.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
    model: Option<String>,
    temperature: f32,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            model: None,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    /// Client backed by the Ollama-compatible provider configured from env
    pub fn from_env() -> Self {
        Self::new(Arc::new(OllamaProvider::from_env()))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Run one completion and return the first assistant text
    pub async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let model = match &self.model {
            Some(model) => model.clone(),
            None => self.provider.default_model().await?,
        };

        let request = ChatCompletionParametersBuilder::default()
            .model(&model)
            .messages(vec![
                ChatMessage::System {
                    content: ChatMessageContent::Text(system.to_string()),
                    name: None,
                },
                ChatMessage::User {
                    content: ChatMessageContent::Text(user.to_string()),
                    name: None,
                },
            ])
            .temperature(self.temperature)
            .build()
            .map_err(|e| LlmError::from(e.to_string()))?;

        debug!("[{}] chat request to model {}", self.provider.name(), model);

        let response = match self.provider.chat(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                log_llm_error(&request, &e, self.provider.name());
                return Err(e);
            }
        };

        assistant_text(&response).ok_or_else(|| "response contained no assistant text".into())
    }
}

/// First non-empty assistant text in a chat completion
pub fn assistant_text(response: &ChatCompletionResponse) -> Option<String> {
    response.choices.iter().find_map(|choice| match &choice.message {
        ChatMessage::Assistant {
            content: Some(ChatMessageContent::Text(text)),
            ..
        } if !text.trim().is_empty() => Some(text.clone()),
        _ => None,
    })
}

use crate::provider::{EnvVar, LlmError, LlmProvider, ProviderInfo};
use async_trait::async_trait;
use openai_dive::v1::{
    api::Client,
    resources::chat::{ChatCompletionParameters, ChatCompletionResponse},
};

const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

/// Any OpenAI-compatible endpoint; defaults to a local Ollama server
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: Option<String>,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        let mut client = Client::new(api_key.unwrap_or("ollama".to_string()));
        let url = base_url.unwrap_or(DEFAULT_BASE_URL.to_string());
        client.set_base_url(&url);
        Self {
            client,
            base_url: url,
            model: None,
        }
    }

    /// Pin the model instead of asking the server for its first one
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Create Ollama provider from environment variables
    pub fn from_env() -> Self {
        let provider = Self::new(
            std::env::var("OLLAMA_BASE_URL").ok(),
            std::env::var("OLLAMA_API_KEY").ok(),
        );
        match std::env::var("ROUNDTABLE_LLM_MODEL") {
            Ok(model) if !model.trim().is_empty() => provider.with_model(model),
            _ => provider,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn default_model(&self) -> Result<String, LlmError> {
        if let Some(model) = &self.model {
            return Ok(model.clone());
        }

        let models = self
            .client
            .models()
            .list()
            .await
            .map_err(|e| Box::new(e) as LlmError)?;
        models
            .data
            .first()
            .map(|m| m.id.clone())
            .ok_or_else(|| "no model available".into())
    }

    async fn chat(
        &self,
        request: ChatCompletionParameters,
    ) -> Result<ChatCompletionResponse, LlmError> {
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| Box::new(e) as LlmError)?;
        Ok(response)
    }

    fn name(&self) -> &'static str {
        "ollama"
    }

    fn info() -> ProviderInfo {
        ProviderInfo {
            name: "ollama",
            display_name: "Ollama",
            env_vars: vec![
                EnvVar::optional(
                    "OLLAMA_BASE_URL",
                    "Ollama API Base URL (default: http://localhost:11434/v1)",
                ),
                EnvVar::optional("OLLAMA_API_KEY", "Ollama API Key (optional)"),
                EnvVar::optional("ROUNDTABLE_LLM_MODEL", "Model to use (default: first listed)"),
            ],
        }
    }
}

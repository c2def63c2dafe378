use async_trait::async_trait;
use openai_dive::v1::resources::chat::{ChatCompletionParameters, ChatCompletionResponse};

/// Errors coming out of a provider are heterogeneous (http client, api, parsing),
/// so the provider layer passes them around boxed.
pub type LlmError = Box<dyn std::error::Error + Send + Sync>;

/// An environment variable a provider reads its configuration from
#[derive(Debug, Clone)]
pub struct EnvVar {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
}

impl EnvVar {
    pub fn required(name: &'static str, description: &'static str) -> Self {
        Self { name, description, required: true }
    }

    pub fn optional(name: &'static str, description: &'static str) -> Self {
        Self { name, description, required: false }
    }
}

/// Static description of a provider
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: &'static str,
    pub display_name: &'static str,
    pub env_vars: Vec<EnvVar>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model used when the caller does not pick one
    async fn default_model(&self) -> Result<String, LlmError>;

    async fn chat(
        &self,
        request: ChatCompletionParameters,
    ) -> Result<ChatCompletionResponse, LlmError>;

    fn name(&self) -> &'static str;

    fn info() -> ProviderInfo
    where
        Self: Sized;
}

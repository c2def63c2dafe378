pub mod client;
pub mod logging;
pub mod provider;
pub mod providers;

pub use client::{assistant_text, LlmClient};
pub use provider::{EnvVar, LlmError, LlmProvider, ProviderInfo};
pub use providers::OllamaProvider;

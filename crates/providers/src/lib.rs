pub mod client;
pub mod factory;
pub mod openai;

use async_trait::async_trait;
use serde_json::Value;
use switchboard_core::types::{ChatMessage, LLMResponse};
use switchboard_core::Result;

/// A chat-completion backend. Model, temperature and token limits are fixed
/// when the provider is built; `tools` are OpenAI-style function descriptors.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], tools: &[Value]) -> Result<LLMResponse>;
}

pub use factory::{create_provider, infer_provider_from_model};
pub use openai::OpenAIProvider;

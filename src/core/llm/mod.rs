mod openai;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::config::ModelConfig;

pub use openai::OpenAiCompatModel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    // Answer the last user turn given the whole conversation
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// Offline model that repeats the last user turn.
pub struct EchoModel;

#[async_trait]
impl ChatModel for EchoModel {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(format!("You said: {}", last))
    }
}

/// Pick the chat model described by `config`; the API key is read from the
/// environment variable it names.
pub fn model_from_config(
    config: &ModelConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Arc<dyn ChatModel> {
    let model = config.model.clone();
    let Some(base_url) = config.base_url.clone() else {
        info!("No model endpoint configured, using the echo model");
        return Arc::new(EchoModel);
    };
    let api_key = lookup(&config.api_key_env);
    if api_key.is_none() {
        warn!(
            "{} is not set; calling {} without credentials",
            config.api_key_env, base_url
        );
    }
    info!("Using chat model {} at {}", model, base_url);
    Arc::new(OpenAiCompatModel::new(base_url, model, api_key))
}

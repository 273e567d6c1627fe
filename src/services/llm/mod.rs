//! LLM provider clients.
//!
//! Each vendor family implements [`LlmProvider`] and owns its own request and response
//! marshaling. The gateway only sees plain-text completions or a [`TextStream`] of deltas.

pub mod anthropic;
pub mod google;
pub mod openai_compatible;
pub mod sse;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use log::{error, info};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::settings::ProviderConfiguration;
use crate::services::error::GatewayError;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use openai_compatible::OpenAiCompatibleProvider;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Role of a message sent to a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// One entry of a transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: MessageRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: MessageRole::Assistant, content: content.into() }
    }
}

/// A transcript plus sampling parameters
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>, max_tokens: u32, temperature: f32) -> Self {
        Self { messages, max_tokens, temperature }
    }

    /// All system messages joined, for vendors that take the system prompt out of band
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    pub fn conversation(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != MessageRole::System)
    }
}

/// Finite, forward-only sequence of text deltas. Ends with `None` on normal completion; an
/// `Err` item means the stream was aborted.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider id from the settings, e.g. "openai" or "anthropic"
    fn provider_id(&self) -> &str;

    /// Name used in error messages
    fn display_name(&self) -> &str;

    fn model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, GatewayError>;

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<TextStream, GatewayError>;
}

/// Wire family a provider id belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAiCompatible,
    Anthropic,
    Google,
}

/// Static description of a supported provider id
#[derive(Debug, Clone, Copy)]
pub struct ProviderProfile {
    pub id: &'static str,
    pub display_name: &'static str,
    pub kind: ProviderKind,
    pub base_url: &'static str,
    pub default_model: &'static str,
}

pub const PROVIDERS: &[ProviderProfile] = &[
    ProviderProfile {
        id: "openai",
        display_name: "OpenAI",
        kind: ProviderKind::OpenAiCompatible,
        base_url: "https://api.openai.com/v1",
        default_model: "gpt-4o-mini",
    },
    ProviderProfile {
        id: "groq",
        display_name: "Groq",
        kind: ProviderKind::OpenAiCompatible,
        base_url: "https://api.groq.com/openai/v1",
        default_model: "llama-3.3-70b-versatile",
    },
    ProviderProfile {
        id: "mistral",
        display_name: "Mistral",
        kind: ProviderKind::OpenAiCompatible,
        base_url: "https://api.mistral.ai/v1",
        default_model: "mistral-small-latest",
    },
    ProviderProfile {
        id: "deepseek",
        display_name: "DeepSeek",
        kind: ProviderKind::OpenAiCompatible,
        base_url: "https://api.deepseek.com/v1",
        default_model: "deepseek-chat",
    },
    ProviderProfile {
        id: "openrouter",
        display_name: "OpenRouter",
        kind: ProviderKind::OpenAiCompatible,
        base_url: "https://openrouter.ai/api/v1",
        default_model: "openai/gpt-4o-mini",
    },
    ProviderProfile {
        id: "xai",
        display_name: "xAI",
        kind: ProviderKind::OpenAiCompatible,
        base_url: "https://api.x.ai/v1",
        default_model: "grok-2-latest",
    },
    ProviderProfile {
        id: "anthropic",
        display_name: "Anthropic",
        kind: ProviderKind::Anthropic,
        base_url: "https://api.anthropic.com",
        default_model: "claude-3-5-haiku-latest",
    },
    ProviderProfile {
        id: "google",
        display_name: "Google Gemini",
        kind: ProviderKind::Google,
        base_url: "https://generativelanguage.googleapis.com",
        default_model: "gemini-1.5-flash",
    },
];

pub fn lookup(provider_id: &str) -> Option<&'static ProviderProfile> {
    let id = match provider_id.trim().to_lowercase().as_str() {
        "gemini" => "google".to_string(),
        "claude" => "anthropic".to_string(),
        other => other.to_string(),
    };
    PROVIDERS.iter().find(|p| p.id == id)
}

/// Check a configuration before anything touches the network
pub fn resolve(config: &ProviderConfiguration) -> Result<&'static ProviderProfile, GatewayError> {
    if !config.enabled {
        return Err(GatewayError::AiDisabled);
    }
    let profile = lookup(&config.provider).ok_or_else(|| GatewayError::UnknownProvider(config.provider.clone()))?;
    if !config.has_api_key() {
        return Err(GatewayError::MissingApiKey(profile.display_name.to_string()));
    }
    Ok(profile)
}

/// Settings a provider client is built from, after defaults are applied
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub profile: &'static ProviderProfile,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub request_timeout: Duration,
}

impl ProviderEndpoint {
    fn new(profile: &'static ProviderProfile, config: &ProviderConfiguration, request_timeout: Duration) -> Self {
        let base_url = config
            .base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(profile.base_url)
            .trim_end_matches('/')
            .to_string();
        let model = if config.model.trim().is_empty() {
            profile.default_model.to_string()
        } else {
            config.model.trim().to_string()
        };
        Self {
            profile,
            base_url,
            model,
            api_key: config.api_key.trim().to_string(),
            request_timeout,
        }
    }
}

/// Builds the provider client for the active configuration
pub trait ProviderFactory: Send + Sync {
    fn build(&self, config: &ProviderConfiguration) -> Result<Box<dyn LlmProvider>, GatewayError>;
}

/// Factory for the real HTTP clients
#[derive(Clone, Debug)]
pub struct HttpProviderFactory {
    client: Client,
    request_timeout: Duration,
}

impl HttpProviderFactory {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self { client, request_timeout })
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn build(&self, config: &ProviderConfiguration) -> Result<Box<dyn LlmProvider>, GatewayError> {
        let profile = resolve(config)?;
        let endpoint = ProviderEndpoint::new(profile, config, self.request_timeout);
        info!(
            "Using {} provider with model {} (key {}...)",
            profile.display_name,
            endpoint.model,
            endpoint.api_key.chars().take(3).collect::<String>()
        );
        let client = self.client.clone();
        Ok(match profile.kind {
            ProviderKind::OpenAiCompatible => Box::new(OpenAiCompatibleProvider::new(client, endpoint)),
            ProviderKind::Anthropic => Box::new(AnthropicProvider::new(client, endpoint)),
            ProviderKind::Google => Box::new(GoogleProvider::new(client, endpoint)),
        })
    }
}

/// Send a request and hand back the response when the status is a success
pub(crate) async fn send_checked(provider: &str, request: RequestBuilder) -> Result<Response, GatewayError> {
    let response = request.send().await.map_err(|e| {
        let error = GatewayError::transport(provider, e);
        error!("Failed to send request to {}: {}", provider, error);
        error
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Could not read error response".to_string());
        error!("{} API error: Status {}, Details: {}", provider, status, body);
        return Err(GatewayError::provider_http(provider, status.as_u16(), &body));
    }
    Ok(response)
}

pub(crate) async fn send_for_json(provider: &str, request: RequestBuilder) -> Result<Value, GatewayError> {
    let response = send_checked(provider, request).await?;
    response.json::<Value>().await.map_err(|e| {
        let e = e.without_url();
        error!("Failed to parse {} response as JSON: {}", provider, e);
        GatewayError::response(provider, format!("invalid JSON body: {}", e))
    })
}

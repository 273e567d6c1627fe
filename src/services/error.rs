use thiserror::Error;

use crate::models::query::RejectionKind;

/// Longest slice of a provider error body kept in errors and logs
const BODY_EXCERPT_CHARS: usize = 500;

/// Failures of the chat gateway and the collaborators it drives
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("AI chat is disabled")]
    AiDisabled,
    #[error("no API key configured for {0}")]
    MissingApiKey(String),
    #[error("unknown AI provider '{0}'")]
    UnknownProvider(String),
    #[error("{provider} API error: status {status}: {body}")]
    ProviderHttp {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("{provider} request failed: {message}")]
    ProviderTransport { provider: String, message: String },
    #[error("{provider} returned an unexpected response: {message}")]
    ProviderResponse { provider: String, message: String },
    #[error("no SQL could be generated")]
    EmptyGeneration,
    #[error("query rejected ({kind}): {detail}")]
    QueryRejected { kind: RejectionKind, detail: String },
    #[error("query execution failed: {0}")]
    QueryExecution(String),
    #[error("thread {0} not found")]
    ThreadNotFound(uuid::Uuid),
    #[error("persistence failure: {0}")]
    Persistence(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn provider_http(provider: &str, status: u16, body: &str) -> Self {
        GatewayError::ProviderHttp {
            provider: provider.to_string(),
            status,
            body: excerpt(body),
        }
    }

    /// The URL is dropped from the message since some vendors carry the API key in the query
    pub fn transport(provider: &str, error: reqwest::Error) -> Self {
        let error = error.without_url();
        let message = if error.is_timeout() {
            format!("request timed out: {}", error)
        } else if error.is_connect() {
            format!("connection failed: {}", error)
        } else {
            error.to_string()
        };
        GatewayError::ProviderTransport {
            provider: provider.to_string(),
            message,
        }
    }

    pub fn response(provider: &str, message: impl Into<String>) -> Self {
        GatewayError::ProviderResponse {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Configuration problems are surfaced to the caller instead of becoming a turn
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            GatewayError::AiDisabled | GatewayError::MissingApiKey(_) | GatewayError::UnknownProvider(_)
        )
    }

    /// Short description kept in turn metadata; never includes provider bodies
    pub fn summary(&self) -> String {
        match self {
            GatewayError::ProviderHttp { provider, status, .. } => {
                format!("{} API error: status {}", provider, status)
            }
            GatewayError::ProviderTransport { provider, .. } => format!("{} request failed", provider),
            GatewayError::ProviderResponse { provider, .. } => {
                format!("{} returned an unexpected response", provider)
            }
            GatewayError::QueryExecution(_) => "query execution failed".to_string(),
            GatewayError::Persistence(_) => "persistence failure".to_string(),
            other => other.to_string(),
        }
    }

    /// Message safe to show an end user; never carries bodies or driver text
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::AiDisabled => "The AI assistant is currently disabled.".to_string(),
            GatewayError::MissingApiKey(provider) => {
                format!("The AI assistant is not configured: no API key is set for {}.", provider)
            }
            GatewayError::UnknownProvider(provider) => {
                format!("The AI assistant is not configured: '{}' is not a supported provider.", provider)
            }
            GatewayError::ThreadNotFound(_) => "Conversation not found.".to_string(),
            _ => "The assistant could not answer right now. Please try again.".to_string(),
        }
    }
}

pub(crate) fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= BODY_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(BODY_EXCERPT_CHARS).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_bodies_are_cut() {
        let body = "x".repeat(2_000);
        match GatewayError::provider_http("OpenAI", 500, &body) {
            GatewayError::ProviderHttp { body, status, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body.chars().count(), BODY_EXCERPT_CHARS + 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn user_message_hides_provider_body() {
        let err = GatewayError::provider_http("Anthropic", 401, "invalid x-api-key sk-ant-123");
        assert!(!err.user_message().contains("sk-ant"));
        assert!(GatewayError::MissingApiKey("Anthropic".into()).user_message().contains("Anthropic"));
        assert!(GatewayError::AiDisabled.is_configuration());
        assert!(!GatewayError::EmptyGeneration.is_configuration());
        assert_eq!(err.summary(), "Anthropic API error: status 401");
    }
}

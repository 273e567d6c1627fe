use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::Value;

use super::sse::{self, SseAction};
use super::{send_checked, send_for_json, CompletionRequest, LlmProvider, MessageRole, ProviderEndpoint, TextStream};
use crate::services::error::GatewayError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

pub struct AnthropicProvider {
    client: Client,
    endpoint: ProviderEndpoint,
}

impl AnthropicProvider {
    pub fn new(client: Client, endpoint: ProviderEndpoint) -> Self {
        Self { client, endpoint }
    }

    fn request(&self, request: &CompletionRequest, stream: bool) -> RequestBuilder {
        let body = MessagesRequest {
            model: &self.endpoint.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system_prompt(),
            messages: request
                .conversation()
                .map(|m| WireMessage {
                    role: match m.role {
                        MessageRole::Assistant => "assistant",
                        _ => "user",
                    },
                    content: &m.content,
                })
                .collect(),
            stream,
        };
        self.client
            .post(format!("{}/v1/messages", self.endpoint.base_url))
            .header("x-api-key", &self.endpoint.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
    }

    /// Concatenate every text block of the response
    pub fn parse_response(&self, json: &Value) -> Result<String, GatewayError> {
        let blocks = json
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| GatewayError::response(self.display_name(), "missing content array"))?;

        Ok(blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""))
    }
}

fn parse_stream_payload(payload: &str) -> SseAction {
    let json: Value = match serde_json::from_str(payload) {
        Ok(json) => json,
        Err(e) => {
            debug!("Skipping unparseable Anthropic event: {}", e);
            return SseAction::Skip;
        }
    };

    match json.get("type").and_then(|t| t.as_str()) {
        Some("content_block_delta") => match json.pointer("/delta/text").and_then(|t| t.as_str()) {
            Some(text) if json.pointer("/delta/type").and_then(|t| t.as_str()) == Some("text_delta") => {
                SseAction::Delta(text.to_string())
            }
            _ => SseAction::Skip,
        },
        Some("message_stop") => SseAction::Finish,
        Some("error") => {
            let message = json
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("stream error");
            SseAction::Fail(GatewayError::response("Anthropic", message))
        }
        _ => SseAction::Skip,
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_id(&self) -> &str {
        self.endpoint.profile.id
    }

    fn display_name(&self) -> &str {
        self.endpoint.profile.display_name
    }

    fn model(&self) -> &str {
        &self.endpoint.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, GatewayError> {
        info!("Sending request to Anthropic with model: {}", self.endpoint.model);
        let http = self.request(request, false).timeout(self.endpoint.request_timeout);
        let json = send_for_json(self.display_name(), http).await?;
        self.parse_response(&json)
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<TextStream, GatewayError> {
        info!("Opening Anthropic stream with model: {}", self.endpoint.model);
        let response = send_checked(self.display_name(), self.request(request, true)).await?;
        Ok(sse::text_stream(self.display_name().to_string(), response, parse_stream_payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::settings::ProviderConfiguration;
    use crate::services::llm::{ChatMessage, HttpProviderFactory, ProviderFactory};
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> Box<dyn LlmProvider> {
        let config = ProviderConfiguration::new("anthropic", "claude-test", "sk-ant-1").with_base_url(server.uri());
        HttpProviderFactory::new(Duration::from_secs(5)).unwrap().build(&config).unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(
            vec![
                ChatMessage::system("rules"),
                ChatMessage::system("schema"),
                ChatMessage::user("first"),
                ChatMessage::assistant("SELECT 1"),
                ChatMessage::user("second"),
            ],
            1000,
            0.5,
        )
    }

    #[tokio::test]
    async fn system_prompt_goes_top_level_and_text_blocks_are_joined() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-1"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_json(json!({
                "model": "claude-test",
                "max_tokens": 1000,
                "temperature": 0.5,
                "system": "rules\n\nschema",
                "messages": [
                    {"role": "user", "content": "first"},
                    {"role": "assistant", "content": "SELECT 1"},
                    {"role": "user", "content": "second"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [
                    {"type": "text", "text": "SELECT "},
                    {"type": "tool_use", "id": "x"},
                    {"type": "text", "text": "2"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(provider(&server).complete(&request()).await.unwrap(), "SELECT 2");
    }

    #[tokio::test]
    async fn unauthorized_is_reported_with_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("{\"error\":\"invalid x-api-key\"}"))
            .mount(&server)
            .await;

        let err = provider(&server).complete(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ProviderHttp { status: 401, .. }));
        assert!(err.to_string().contains("Anthropic"));
    }

    #[tokio::test]
    async fn stream_yields_text_deltas_and_stops_at_message_stop() {
        let server = MockServer::start().await;
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Two \"}}\n\n",
            "data: {\"type\":\"ping\"}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"rows.\"}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"late\"}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let stream = provider(&server).complete_stream(&request()).await.unwrap();
        let deltas: Vec<String> = stream.map(|d| d.unwrap()).collect().await;
        assert_eq!(deltas.concat(), "Two rows.");
    }

    #[tokio::test]
    async fn stream_without_message_stop_is_an_error() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"type\":\"message_start\",\"message\":{}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"There are \"}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let items: Vec<_> = provider(&server).complete_stream(&request()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "There are ");
        match &items[1] {
            Err(GatewayError::ProviderResponse { message, .. }) => assert!(message.contains("before completion")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stream_error_event_aborts() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
            "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let items: Vec<_> = provider(&server).complete_stream(&request()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Hi");
        assert!(items[1].is_err());
    }
}

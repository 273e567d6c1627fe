use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use super::sse::{self, SseAction};
use super::{send_checked, send_for_json, CompletionRequest, LlmProvider, ProviderEndpoint, TextStream};
use crate::services::error::GatewayError;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Any vendor speaking the OpenAI chat completions protocol
pub struct OpenAiCompatibleProvider {
    client: Client,
    endpoint: ProviderEndpoint,
}

impl OpenAiCompatibleProvider {
    pub fn new(client: Client, endpoint: ProviderEndpoint) -> Self {
        Self { client, endpoint }
    }

    pub fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.base_url)
    }

    fn body<'a>(&'a self, request: &'a CompletionRequest, stream: bool) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.endpoint.model,
            // system messages stay in the list for this family
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage { role: m.role.as_str(), content: &m.content })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
        }
    }

    pub fn parse_response(&self, json: &Value) -> Result<String, GatewayError> {
        json.pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| GatewayError::response(self.display_name(), "missing choices[0].message.content"))
    }
}

fn parse_stream_payload(payload: &str) -> SseAction {
    match serde_json::from_str::<Value>(payload) {
        Ok(json) => {
            if let Some(message) = json.pointer("/error/message").and_then(|v| v.as_str()) {
                return SseAction::Fail(GatewayError::response("OpenAI-compatible stream", message));
            }
            let text = json.pointer("/choices/0/delta/content").and_then(|v| v.as_str());
            let finished = json
                .pointer("/choices/0/finish_reason")
                .map_or(false, |reason| !reason.is_null());
            match (text, finished) {
                (text, true) => SseAction::Last(text.unwrap_or_default().to_string()),
                (Some(text), false) => SseAction::Delta(text.to_string()),
                (None, false) => SseAction::Skip,
            }
        }
        Err(e) => {
            debug!("Skipping unparseable stream chunk: {}", e);
            SseAction::Skip
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
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
        info!("Sending request to {} with model: {}", self.display_name(), self.endpoint.model);
        let http = self
            .client
            .post(self.url())
            .bearer_auth(&self.endpoint.api_key)
            .timeout(self.endpoint.request_timeout)
            .json(&self.body(request, false));
        let json = send_for_json(self.display_name(), http).await?;
        self.parse_response(&json)
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<TextStream, GatewayError> {
        info!("Opening stream to {} with model: {}", self.display_name(), self.endpoint.model);
        let http = self
            .client
            .post(self.url())
            .bearer_auth(&self.endpoint.api_key)
            .json(&self.body(request, true));
        let response = send_checked(self.display_name(), http).await?;
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
        let config = ProviderConfiguration::new("groq", "llama-test", "gsk-secret").with_base_url(server.uri());
        HttpProviderFactory::new(Duration::from_secs(5)).unwrap().build(&config).unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::system("rules"), ChatMessage::user("How many?")], 100, 0.5)
    }

    #[tokio::test]
    async fn sends_bearer_auth_and_system_role_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer gsk-secret"))
            .and(body_json(json!({
                "model": "llama-test",
                "messages": [
                    {"role": "system", "content": "rules"},
                    {"role": "user", "content": "How many?"}
                ],
                "max_tokens": 100,
                "temperature": 0.5
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "SELECT 1"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let text = provider(&server).complete(&request()).await.unwrap();
        assert_eq!(text, "SELECT 1");
    }

    #[tokio::test]
    async fn non_success_status_is_a_provider_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        match provider(&server).complete(&request()).await {
            Err(GatewayError::ProviderHttp { status, body, provider }) => {
                assert_eq!(status, 429);
                assert_eq!(body, "rate limited");
                assert_eq!(provider, "Groq");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn streams_deltas_until_done() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"There are \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"3 workflows.\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let stream = provider(&server).complete_stream(&request()).await.unwrap();
        let deltas: Vec<String> = stream.map(|d| d.unwrap()).collect().await;
        assert_eq!(deltas, vec!["There are ".to_string(), "3 workflows.".to_string()]);
    }

    #[tokio::test]
    async fn finish_reason_completes_the_stream_without_done() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Three\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" rows.\"},\"finish_reason\":\"stop\"}]}\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let stream = provider(&server).complete_stream(&request()).await.unwrap();
        let deltas: Vec<String> = stream.map(|d| d.unwrap()).collect().await;
        assert_eq!(deltas.concat(), "Three rows.");
    }

    #[tokio::test]
    async fn stream_closed_before_done_is_an_error() {
        let server = MockServer::start().await;
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"There are \"},\"finish_reason\":null}]}\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let items: Vec<_> = provider(&server).complete_stream(&request()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "There are ");
        assert!(matches!(items[1], Err(GatewayError::ProviderResponse { .. })));
    }

    #[test]
    fn missing_content_is_a_response_error() {
        let endpoint_provider = OpenAiCompatibleProvider::new(
            Client::new(),
            ProviderEndpoint {
                profile: crate::services::llm::lookup("openai").unwrap(),
                base_url: "http://localhost".into(),
                model: "m".into(),
                api_key: "k".into(),
                request_timeout: Duration::from_secs(1),
            },
        );
        assert!(matches!(
            endpoint_provider.parse_response(&json!({"choices": []})),
            Err(GatewayError::ProviderResponse { .. })
        ));
    }
}

use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

use super::sse::{self, SseAction};
use super::{send_checked, send_for_json, CompletionRequest, LlmProvider, MessageRole, ProviderEndpoint, TextStream};
use crate::services::error::GatewayError;

/// Gemini through the Generative Language API
pub struct GoogleProvider {
    client: Client,
    endpoint: ProviderEndpoint,
}

impl GoogleProvider {
    pub fn new(client: Client, endpoint: ProviderEndpoint) -> Self {
        Self { client, endpoint }
    }

    fn model_path(&self) -> &str {
        self.endpoint.model.strip_prefix("models/").unwrap_or(&self.endpoint.model)
    }

    fn body(request: &CompletionRequest) -> Value {
        let contents: Vec<Value> = request
            .conversation()
            .map(|m| {
                let role = match m.role {
                    MessageRole::Assistant => "model",
                    _ => "user",
                };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": request.max_tokens,
                "temperature": request.temperature,
            }
        });
        if let Some(system) = request.system_prompt() {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        body
    }

    fn request(&self, request: &CompletionRequest, stream: bool) -> RequestBuilder {
        let url = if stream {
            format!("{}/v1beta/models/{}:streamGenerateContent", self.endpoint.base_url, self.model_path())
        } else {
            format!("{}/v1beta/models/{}:generateContent", self.endpoint.base_url, self.model_path())
        };
        let mut http = self.client.post(url).query(&[("key", self.endpoint.api_key.as_str())]);
        if stream {
            http = http.query(&[("alt", "sse")]);
        }
        http.json(&Self::body(request))
    }

    pub fn parse_response(&self, json: &Value) -> Result<String, GatewayError> {
        if let Some(reason) = json.pointer("/promptFeedback/blockReason").and_then(|r| r.as_str()) {
            return Err(GatewayError::response(
                self.display_name(),
                format!("prompt blocked: {}", reason),
            ));
        }
        let parts = json
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
            .ok_or_else(|| GatewayError::response(self.display_name(), "missing candidates[0].content.parts"))?;
        Ok(candidate_text(parts))
    }
}

fn candidate_text(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("")
}

fn parse_stream_payload(payload: &str) -> SseAction {
    let json: Value = match serde_json::from_str(payload) {
        Ok(json) => json,
        Err(e) => {
            debug!("Skipping unparseable Gemini chunk: {}", e);
            return SseAction::Skip;
        }
    };
    if let Some(message) = json.pointer("/error/message").and_then(|m| m.as_str()) {
        return SseAction::Fail(GatewayError::response("Google Gemini", message));
    }
    if let Some(reason) = json.pointer("/promptFeedback/blockReason").and_then(|r| r.as_str()) {
        return SseAction::Fail(GatewayError::response(
            "Google Gemini",
            format!("prompt blocked: {}", reason),
        ));
    }
    let text = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .map(|parts| candidate_text(parts));
    // no terminator line; a finish reason on the candidate ends the answer
    let finished = json
        .pointer("/candidates/0/finishReason")
        .map_or(false, |reason| !reason.is_null());
    match (text, finished) {
        (text, true) => SseAction::Last(text.unwrap_or_default()),
        (Some(text), false) => SseAction::Delta(text),
        (None, false) => SseAction::Skip,
    }
}

#[async_trait]
impl LlmProvider for GoogleProvider {
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
        info!("Sending request to Gemini with model: {}", self.model_path());
        let http = self.request(request, false).timeout(self.endpoint.request_timeout);
        let json = send_for_json(self.display_name(), http).await?;
        self.parse_response(&json)
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<TextStream, GatewayError> {
        info!("Opening Gemini stream with model: {}", self.model_path());
        let response = send_checked(self.display_name(), self.request(request, true)).await?;
        Ok(sse::text_stream(self.display_name().to_string(), response, parse_stream_payload))
    }
}

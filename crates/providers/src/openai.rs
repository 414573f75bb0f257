use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use switchboard_core::types::{ChatMessage, LLMResponse, ToolCallRequest};
use switchboard_core::{Error, Result};
use tracing::{debug, error, info};

use crate::client::build_http_client;
use crate::Provider;

/// Find the largest byte index <= `max_bytes` that is a valid char boundary.
fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Client for any endpoint speaking the OpenAI chat-completions protocol
/// (OpenAI, OpenRouter, Ollama's `/v1`, vLLM, ...).
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAIProvider {
    pub fn new(
        api_key: &str,
        api_base: Option<&str>,
        model: &str,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Self {
        let resolved_base = api_base
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/')
            .to_string();
        Self {
            client: build_http_client(timeout),
            api_key: api_key.to_string(),
            api_base: resolved_base,
            model: model.to_string(),
            max_tokens,
            temperature,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send_request(&self, messages: &[ChatMessage], tools: &[Value]) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.api_base);

        let request = ChatRequest {
            model: &self.model,
            messages,
            tools,
            tool_choice: if tools.is_empty() { None } else { Some("auto") },
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        info!(url = %url, model = %self.model, tools_count = tools.len(), messages_count = messages.len(), "Calling LLM");

        let mut req = self.client.post(&url).json(&request);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("LLM request timed out: {}", e))
            } else {
                Error::Provider(format!("Request failed: {}", e))
            }
        })?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let end = truncate_at_char_boundary(&raw_body, 500);
            error!(status = %status, body = %&raw_body[..end], "LLM API error");
            return Err(Error::Provider(format!("API error {}: {}", status, &raw_body[..end])));
        }

        {
            let end = truncate_at_char_boundary(&raw_body, 500);
            debug!(body_len = raw_body.len(), preview = %&raw_body[..end], "LLM raw response");
        }

        serde_json::from_str(&raw_body).map_err(|e| {
            let end = truncate_at_char_boundary(&raw_body, 500);
            Error::Provider(format!("Failed to parse response: {}. Body: {}", e, &raw_body[..end]))
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [Value],
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
    max_tokens: u32,
    temperature: f32,
}

fn no_tools(tools: &&[Value]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    id: String,
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[async_trait]
impl Provider for OpenAIProvider {
    async fn chat(&self, messages: &[ChatMessage], tools: &[Value]) -> Result<LLMResponse> {
        let chat_response = self.send_request(messages, tools).await?;

        let choice = chat_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider("No choices in response".to_string()))?;

        let tool_calls: Vec<ToolCallRequest> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let arguments: Value = serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(Value::Object(serde_json::Map::new()));
                ToolCallRequest {
                    id: tc.id,
                    name: tc.function.name,
                    arguments,
                }
            })
            .collect();

        let content = choice.message.content.filter(|c| !c.is_empty());

        Ok(LLMResponse {
            content,
            reasoning_content: choice.message.reasoning_content,
            tool_calls,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: chat_response.usage.unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::json;

    async fn spawn_fake(reply: Value) -> String {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move |Json(body): Json<Value>| {
                let reply = reply.clone();
                async move {
                    assert!(body["model"].is_string());
                    Json(reply)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1", addr)
    }

    #[test]
    fn test_truncate_at_char_boundary() {
        let s = "héllo";
        assert_eq!(truncate_at_char_boundary(s, 2), 1);
        assert_eq!(truncate_at_char_boundary(s, 100), s.len());
    }

    #[tokio::test]
    async fn test_chat_parses_tool_calls() {
        let base = spawn_fake(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "add", "arguments": "{\"a\":2,\"b\":3}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"total_tokens": 10}
        }))
        .await;

        let provider = OpenAIProvider::new("k", Some(&base), "gpt-4o", 256, 0.0, Duration::from_secs(5));
        let resp = provider
            .chat(&[ChatMessage::user("what is 2+3")], &[json!({"type": "function"})])
            .await
            .unwrap();
        assert!(resp.content.is_none());
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "add");
        assert_eq!(resp.tool_calls[0].arguments, json!({"a": 2, "b": 3}));
        assert_eq!(resp.finish_reason, "tool_calls");
    }

    #[tokio::test]
    async fn test_chat_plain_text() {
        let base = spawn_fake(json!({
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}]
        }))
        .await;
        let provider = OpenAIProvider::new("", Some(&base), "m", 256, 0.0, Duration::from_secs(5));
        let resp = provider.chat(&[ChatMessage::user("hi")], &[]).await.unwrap();
        assert_eq!(resp.content.as_deref(), Some("hello"));
        assert!(resp.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_chat_empty_choices_is_provider_error() {
        let base = spawn_fake(json!({"choices": []})).await;
        let provider = OpenAIProvider::new("", Some(&base), "m", 256, 0.0, Duration::from_secs(5));
        let err = provider.chat(&[ChatMessage::user("hi")], &[]).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }
}

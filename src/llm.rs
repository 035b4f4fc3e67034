use std::time::Instant;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Duration;
use tracing::debug;

use crate::config::Settings;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no model API key configured")]
    MissingCredential,
    #[error("model request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("model returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model returned empty content")]
    EmptyContent,
    #[error("model response is not valid JSON: {0}")]
    Unparseable(String),
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub json_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LlmUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub model: String,
    pub latency_s: f32,
    pub usage: LlmUsage,
}

/// Chat-completion style generative model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct HttpChatModel {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpChatModel {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent("exam-explainer/0.1")
            .build()?;
        Ok(Self {
            client,
            base_url: settings.llm_base_url.clone(),
            model: settings.llm_model.clone(),
            api_key: settings.llm_api_key.clone(),
            timeout: Duration::from_secs(settings.llm_timeout_secs.max(1)),
        })
    }

    fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::MissingCredential)?;

        let mut payload = json!({
            "model": self.model_id(),
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
            "temperature": request.temperature,
        });
        if request.json_mode {
            payload["response_format"] = json!({"type": "json_object"});
        }

        let start = Instant::now();
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&payload)
            .timeout(self.timeout)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }
        let data: Value = resp.json().await?;
        let elapsed = start.elapsed().as_secs_f32();

        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if content.is_empty() {
            return Err(LlmError::EmptyContent);
        }
        let usage = data.get("usage").cloned().unwrap_or(Value::Null);
        let model = data["model"]
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.model_id().to_string());
        debug!(model = %model, latency_s = elapsed, "model call completed");
        Ok(ChatCompletion {
            content,
            model,
            latency_s: elapsed,
            usage: LlmUsage {
                prompt_tokens: usage["prompt_tokens"].as_u64(),
                completion_tokens: usage["completion_tokens"].as_u64(),
                total_tokens: usage["total_tokens"].as_u64(),
            },
        })
    }
}

/// Parses model output permissively: a fenced block, the whole body, or the
/// outermost `{...}` span.
pub fn json_from_response(body: &str) -> Result<Value, LlmError> {
    lazy_static! {
        static ref JSON_FENCE: Regex = Regex::new(r"(?s)```(?:json)?\s*(?P<body>.*?)```").unwrap();
    }
    if let Some(body) = JSON_FENCE
        .captures(body)
        .and_then(|caps| caps.name("body"))
        .map(|m| m.as_str().trim())
    {
        if let Ok(value) = serde_json::from_str(body) {
            return Ok(value);
        }
    }
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            return serde_json::from_str(&trimmed[start..=end])
                .map_err(|err| LlmError::Unparseable(err.to_string()));
        }
    }
    Err(LlmError::Unparseable("no JSON object found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<Value>>>);

    async fn mock_completion(
        State(captured): State<Captured>,
        Json(payload): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        captured.0.lock().unwrap().push(payload.clone());
        let user = payload["messages"][1]["content"].as_str().unwrap_or("");
        if user.contains("fail") {
            return (StatusCode::BAD_GATEWAY, Json(json!({"error": "upstream down"})));
        }
        let content = if user.contains("empty") { "" } else { "{\"ok\": true}" };
        let mut body = json!({
            "id": "mock",
            "object": "chat.completion",
            "model": "mock-model",
            "choices": [{
                "index": 0,
                "finish_reason": "stop",
                "message": {"role": "assistant", "content": content}
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        if user.contains("anonymous") {
            body.as_object_mut().unwrap().remove("model");
        }
        (StatusCode::OK, Json(body))
    }

    async fn spawn_mock() -> (String, Captured, tokio::task::JoinHandle<()>) {
        let captured = Captured::default();
        let router = Router::new()
            .route("/v1/chat/completions", post(mock_completion))
            .with_state(captured.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}/v1", addr), captured, server)
    }

    fn request(user: &str) -> ChatRequest {
        ChatRequest {
            system: "Return JSON.".to_string(),
            user: user.to_string(),
            temperature: 0.2,
            json_mode: true,
        }
    }

    fn model(base: String, api_key: Option<&str>) -> HttpChatModel {
        let settings = Settings {
            llm_base_url: base,
            llm_model: "mock".to_string(),
            llm_api_key: api_key.map(str::to_string),
            ..Settings::default()
        };
        HttpChatModel::from_settings(&settings).unwrap()
    }

    #[tokio::test]
    async fn completion_returns_content_and_usage() {
        let (base, captured, server) = spawn_mock().await;
        let completion = model(base, Some("k")).complete(&request("explain")).await.unwrap();
        assert_eq!(completion.content, "{\"ok\": true}");
        assert_eq!(completion.model, "mock-model");
        assert_eq!(completion.usage.total_tokens, Some(15));

        let sent = captured.0.lock().unwrap()[0].clone();
        assert_eq!(sent["response_format"]["type"], "json_object");
        assert_eq!(sent["messages"][0]["role"], "system");
        server.abort();
    }

    #[tokio::test]
    async fn configured_model_is_sent_and_used_when_reply_omits_it() {
        let (base, captured, server) = spawn_mock().await;
        let client = model(base, Some("k"));
        assert_eq!(client.model_id(), "mock");
        let completion = client.complete(&request("anonymous reply")).await.unwrap();
        assert_eq!(completion.model, "mock");
        assert_eq!(captured.0.lock().unwrap()[0]["model"], "mock");
        server.abort();
    }

    #[tokio::test]
    async fn http_failure_and_empty_content_are_distinct() {
        let (base, _, server) = spawn_mock().await;
        let client = model(base, Some("k"));
        let err = client.complete(&request("please fail")).await.unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 502, .. }));
        let err = client.complete(&request("empty please")).await.unwrap_err();
        assert!(matches!(err, LlmError::EmptyContent));
        server.abort();
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let err = model("http://127.0.0.1:9".to_string(), None)
            .complete(&request("explain"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MissingCredential));
    }

    #[test]
    fn json_from_fenced_block() {
        let value = json_from_response("Here:\n```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn json_from_prose_wrapped_object() {
        let value = json_from_response("Sure! {\"a\": {\"b\": 2}} hope that helps").unwrap();
        assert_eq!(value["a"]["b"], 2);
    }

    #[test]
    fn json_from_garbage_fails() {
        assert!(matches!(json_from_response("no json here"), Err(LlmError::Unparseable(_))));
        assert!(json_from_response("{broken").is_err());
    }
}

//! Typed wrapper over the generative-text API
//!
//! Retries transient provider errors (HTTP >= 500 or 429, plain network
//! failures) with exponential backoff; everything else terminates the call
//! immediately. The adapter decodes the first choice's text as JSON when it
//! can and hands the raw string through when it cannot — semantic
//! validation belongs to the result assembler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::config::AiConfig;
use crate::{Error, Result};

/// One chat message in provider wire order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

/// Parameters for one completion call
#[derive(Debug, Clone)]
pub struct ChatParams {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    /// Ask the provider for a strict JSON object response
    pub json_output: bool,
}

/// Token usage triple. Providers disagree on casing; both shapes decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(alias = "prompt_tokens")]
    pub prompt_tokens: u32,

    #[serde(alias = "completion_tokens")]
    pub completion_tokens: u32,

    #[serde(alias = "total_tokens")]
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Adapter output: decoded JSON (or the raw string when decoding failed)
/// plus the usage triple
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub data: serde_json::Value,
    pub usage: TokenUsage,
}

/// Seam for the generative-text provider
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn create_chat_completion(&self, params: ChatParams) -> Result<ChatOutcome>;
}

/// Exponential backoff between provider retries
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Backoff {
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Delay before retrying after the given 1-indexed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as f64;
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powf(exponent);
        let delay_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let jitter = if self.jitter > 0.0 {
            use rand::Rng;
            let range = delay_secs * self.jitter;
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_secs_f64((delay_secs + jitter).max(0.0))
    }
}

/// OpenAI-compatible chat-completions client
pub struct OpenAiClient {
    client: reqwest::Client,
    config: AiConfig,
    backoff: Backoff,
}

impl OpenAiClient {
    pub fn new(config: AiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let backoff = Backoff::new(config.backoff_base());

        Ok(Self { client, config, backoff })
    }

    async fn attempt(&self, params: &ChatParams) -> Result<ChatOutcome> {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": params.messages,
            "temperature": params.temperature,
        });

        if params.json_output {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::provider(None, e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::provider(Some(status), text));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::provider(None, format!("malformed completion body: {}", e)))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::provider(None, "completion had no choices"))?;

        Ok(ChatOutcome {
            data: decode_payload(&content),
            usage: completion.usage.unwrap_or_default(),
        })
    }
}

/// Decode the textual payload; fall back to the raw string
fn decode_payload(content: &str) -> serde_json::Value {
    serde_json::from_str(content)
        .unwrap_or_else(|_| serde_json::Value::String(content.to_string()))
}

#[async_trait]
impl ChatClient for OpenAiClient {
    async fn create_chat_completion(&self, params: ChatParams) -> Result<ChatOutcome> {
        let started = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            match self.attempt(&params).await {
                Ok(outcome) => {
                    tracing::info!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        attempt,
                        prompt_tokens = outcome.usage.prompt_tokens,
                        completion_tokens = outcome.usage.completion_tokens,
                        total_tokens = outcome.usage.total_tokens,
                        "Chat completion succeeded"
                    );
                    return Ok(outcome);
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.backoff.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        status = ?e.provider_status(),
                        "Transient provider error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        attempt,
                        status = ?e.provider_status(),
                        "Chat completion failed: {}",
                        e
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: String,
}

/// Scripted chat client for tests: serves queued responses in order
#[cfg(test)]
pub struct ScriptedChatClient {
    responses: tokio::sync::Mutex<std::collections::VecDeque<ScriptedResponse>>,
    pub calls: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Data(serde_json::Value),
    Status(u16),
}

#[cfg(test)]
impl ScriptedChatClient {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: tokio::sync::Mutex::new(responses.into_iter().collect()),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl ChatClient for ScriptedChatClient {
    async fn create_chat_completion(&self, _params: ChatParams) -> Result<ChatOutcome> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        match self.responses.lock().await.pop_front() {
            Some(ScriptedResponse::Data(data)) => Ok(ChatOutcome {
                data,
                usage: TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 200,
                    total_tokens: 300,
                },
            }),
            Some(ScriptedResponse::Status(code)) => {
                Err(Error::provider(Some(code), "scripted provider error"))
            }
            None => Err(Error::provider(None, "scripted client exhausted")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_without_jitter() {
        let backoff = Backoff {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
            jitter: 0.0,
        };

        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let backoff = Backoff {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: 0.0,
        };

        assert_eq!(backoff.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn test_usage_accepts_both_casings() {
        let snake: TokenUsage = serde_json::from_value(serde_json::json!({
            "prompt_tokens": 10,
            "completion_tokens": 20,
            "total_tokens": 30,
        }))
        .unwrap();

        let camel: TokenUsage = serde_json::from_value(serde_json::json!({
            "promptTokens": 10,
            "completionTokens": 20,
            "totalTokens": 30,
        }))
        .unwrap();

        assert_eq!(snake, camel);
        assert_eq!(snake.total_tokens, 30);
    }

    #[test]
    fn test_usage_serializes_camel_case() {
        let usage = TokenUsage { prompt_tokens: 1, completion_tokens: 2, total_tokens: 3 };
        let value = serde_json::to_value(usage).unwrap();
        assert_eq!(value["promptTokens"], 1);
        assert_eq!(value["totalTokens"], 3);
    }

    #[test]
    fn test_decode_payload_falls_back_to_raw() {
        let decoded = decode_payload("{\"ok\":true}");
        assert_eq!(decoded["ok"], true);

        let raw = decode_payload("not json at all");
        assert_eq!(raw, serde_json::Value::String("not json at all".to_string()));
    }

    fn test_config(base_url: String) -> AiConfig {
        AiConfig {
            api_key: "test-key".to_string(),
            base_url,
            model: "test-model".to_string(),
            max_retries: 3,
            backoff_base_ms: 1,
            request_timeout_secs: 5,
        }
    }

    fn params() -> ChatParams {
        ChatParams {
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("user")],
            temperature: 0.8,
            json_output: true,
        }
    }

    #[tokio::test]
    async fn test_transient_500s_retried_to_success() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"ok\":true}"}}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12},
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiClient::new(test_config(server.uri())).unwrap();
        let outcome = client.create_chat_completion(params()).await.unwrap();

        // Two failures plus one success: three calls total, verified by the
        // mock expectations on drop.
        assert_eq!(outcome.data["ok"], true);
        assert_eq!(outcome.usage.total_tokens, 12);
    }

    #[tokio::test]
    async fn test_permanent_4xx_aborts_immediately() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenAiClient::new(test_config(server.uri())).unwrap();
        let err = client.create_chat_completion(params()).await.unwrap_err();

        assert_eq!(err.provider_status(), Some(400));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "plain text"}}],
                "usage": {"promptTokens": 1, "completionTokens": 2, "totalTokens": 3},
            })))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(test_config(server.uri())).unwrap();
        let outcome = client.create_chat_completion(params()).await.unwrap();

        // Non-JSON content comes through as the raw string; camelCase usage
        // decodes via the aliases.
        assert_eq!(outcome.data, serde_json::Value::String("plain text".to_string()));
        assert_eq!(outcome.usage.total_tokens, 3);
    }
}

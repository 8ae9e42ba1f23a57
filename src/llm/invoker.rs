//! Model Invoker
//!
//! Exactly one semantic model call per `invoke`: transient provider errors
//! are retried with exponential backoff, the reply is unwrapped from any
//! markdown fence and parsed as a JSON object. Failures surface as an
//! `{"error": ...}` mapping, never as `Err`.

use crate::config::Settings;
use crate::llm::{ModelProvider, ModelRequest};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct ModelInvoker {
    provider: Arc<dyn ModelProvider>,
    max_retries: u32,
    base_delay: Duration,
}

impl ModelInvoker {
    pub fn new(provider: Arc<dyn ModelProvider>, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            provider,
            max_retries: max_retries.max(1),
            base_delay,
        }
    }

    pub fn from_settings(provider: Arc<dyn ModelProvider>, settings: &Settings) -> Self {
        Self::new(provider, settings.max_retries, settings.retry_base_delay)
    }

    /// Delay before the retry that follows `attempt` (0-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    pub async fn invoke(&self, request: &ModelRequest) -> Value {
        if let Err(reason) = request.check() {
            warn!(reason = %reason, "Rejecting model request");
            return error_payload(reason);
        }

        for attempt in 0..self.max_retries {
            info!(
                provider = self.provider.name(),
                attempt = attempt + 1,
                max_retries = self.max_retries,
                reasoning_effort = %request.params.reasoning_effort,
                "Invoking model"
            );

            match self.provider.generate(request).await {
                Ok(text) => {
                    debug!(reply_chars = text.len(), "Model invoked successfully");
                    return normalize_reply(&text);
                }
                Err(err) if err.is_transient() && attempt + 1 < self.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Transient model error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(attempt = attempt + 1, error = %err, "Model invocation failed");
                    return error_payload(err.to_string());
                }
            }
        }

        error_payload("Max retries exceeded")
    }
}

/// Strip an optional ```` ```json ```` / ```` ``` ```` wrapper from a reply
pub fn strip_code_fence(raw: &str) -> &str {
    let mut text = raw.trim();

    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }

    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }

    text.trim()
}

/// Parse a reply into a mapping, falling back to the raw-text marker
pub fn normalize_reply(raw: &str) -> Value {
    match serde_json::from_str::<Value>(strip_code_fence(raw)) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) | Err(_) => {
            warn!("Response is not a JSON object, returning as text");
            raw_text_payload(raw)
        }
    }
}

pub fn raw_text_payload(raw: &str) -> Value {
    json!({ "response": raw, "raw_text": true })
}

pub fn error_payload(message: impl Into<String>) -> Value {
    let mut map = Map::new();
    map.insert("error".to_string(), Value::String(message.into()));
    Value::Object(map)
}

pub fn is_raw_text(output: &Value) -> bool {
    output.get("raw_text").and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerationParams, MockProvider, ProviderError, ReasoningEffort};

    fn request() -> ModelRequest {
        ModelRequest::new(
            "Summarise the ledger",
            "You are a test agent",
            GenerationParams {
                temperature: 0.2,
                max_output_tokens: 500,
                reasoning_effort: ReasoningEffort::Low,
            },
        )
    }

    #[test]
    fn test_strip_code_fence_variants() {
        let body = r#"{"revenue": {"total": 100000}}"#;
        let fenced_json = format!("```json\n{}\n```", body);
        let fenced_plain = format!("```\n{}\n```", body);

        assert_eq!(strip_code_fence(body), body);
        assert_eq!(strip_code_fence(&fenced_json), body);
        assert_eq!(strip_code_fence(&fenced_plain), body);
        assert_eq!(strip_code_fence(&format!("  {}  ", fenced_json)), body);
    }

    #[test]
    fn test_fenced_and_bare_replies_parse_identically() {
        let body = r#"{"risk_score": 42, "risk_level": "medium"}"#;
        let fenced = format!("```json\n{}\n```", body);

        assert_eq!(normalize_reply(body), normalize_reply(&fenced));
        assert_eq!(normalize_reply(body)["risk_score"], 42);
    }

    #[test]
    fn test_non_json_reply_falls_back_to_raw_text() {
        let reply = "The cash position is improving.";
        let output = normalize_reply(reply);

        assert_eq!(
            output,
            json!({"response": "The cash position is improving.", "raw_text": true})
        );
        assert!(output.get("error").is_none());
        assert!(is_raw_text(&output));
    }

    #[test]
    fn test_non_object_json_is_raw_text() {
        let output = normalize_reply("[1, 2, 3]");
        assert!(is_raw_text(&output));
        assert_eq!(output["response"], "[1, 2, 3]");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_retries_with_backoff() {
        let provider = Arc::new(MockProvider::from_fn(|_, _| {
            Err(ProviderError::transient("ThrottlingException", "Rate exceeded"))
        }));
        let invoker = ModelInvoker::new(provider.clone(), 4, Duration::from_secs(1));

        let started = tokio::time::Instant::now();
        let output = invoker.invoke(&request()).await;

        assert_eq!(provider.call_count(), 4);
        // 1s + 2s + 4s between four attempts, no sleep after the last
        assert_eq!(started.elapsed(), Duration::from_secs(7));
        assert_eq!(output["error"], "ThrottlingException: Rate exceeded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_retry_count_is_three() {
        let provider = Arc::new(MockProvider::from_fn(|_, _| {
            Err(ProviderError::transient("UNAVAILABLE", "try later"))
        }));
        let invoker = ModelInvoker::from_settings(provider.clone(), &Settings::default());

        let started = tokio::time::Instant::now();
        let output = invoker.invoke(&request()).await;

        assert_eq!(provider.call_count(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert!(output.get("error").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_error() {
        let provider = Arc::new(MockProvider::scripted(vec![
            Err(ProviderError::transient("RESOURCE_EXHAUSTED", "quota")),
            Ok("```json\n{\"runway_months\": 7.5}\n```".to_string()),
        ]));
        let invoker = ModelInvoker::new(provider.clone(), 3, Duration::from_secs(1));

        let output = invoker.invoke(&request()).await;

        assert_eq!(provider.call_count(), 2);
        assert_eq!(output["runway_months"], 7.5);
    }

    #[tokio::test]
    async fn test_zero_retries_still_makes_one_attempt() {
        let provider = Arc::new(MockProvider::from_fn(|_, _| {
            Err(ProviderError::transient("UNAVAILABLE", "try later"))
        }));
        let invoker = ModelInvoker::new(provider.clone(), 0, Duration::from_millis(1));

        let output = invoker.invoke(&request()).await;

        assert_eq!(provider.call_count(), 1);
        assert_eq!(output["error"], "UNAVAILABLE: try later");
    }

    #[tokio::test]
    async fn test_permanent_error_fails_fast() {
        let provider = Arc::new(MockProvider::from_fn(|_, _| {
            Err(ProviderError::permanent("INVALID_ARGUMENT", "bad request"))
        }));
        let invoker = ModelInvoker::new(provider.clone(), 3, Duration::from_secs(1));

        let output = invoker.invoke(&request()).await;

        assert_eq!(provider.call_count(), 1);
        assert_eq!(output, json!({"error": "INVALID_ARGUMENT: bad request"}));
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_provider() {
        let provider = Arc::new(MockProvider::from_fn(|_, _| Ok("{}".to_string())));
        let invoker = ModelInvoker::new(provider.clone(), 3, Duration::from_secs(1));

        let mut bad = request();
        bad.prompt = String::new();
        let output = invoker.invoke(&bad).await;

        assert_eq!(provider.call_count(), 0);
        assert!(output.get("error").is_some());
    }

    #[test]
    fn test_backoff_schedule() {
        let provider = Arc::new(MockProvider::from_fn(|_, _| Ok("{}".to_string())));
        let invoker = ModelInvoker::new(provider, 3, Duration::from_secs(1));

        assert_eq!(invoker.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(invoker.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(invoker.backoff_delay(2), Duration::from_secs(4));
    }
}

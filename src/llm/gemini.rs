//! Gemini API provider
//!
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::config::Settings;
use crate::error::PipelineError;
use crate::llm::{ModelProvider, ModelRequest, ProviderError, ReasoningEffort};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// Reusable Gemini client (connection-pooled)
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model_id: String,
}

impl GeminiProvider {
    pub fn new(settings: &Settings) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| PipelineError::LlmError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: settings.gemini_api_key.clone(),
            base_url: settings.model_base_url.clone(),
            model_id: settings.model_id.clone(),
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model_id, self.api_key
        )
    }

    fn build_request(&self, request: &ModelRequest) -> GeminiRequest {
        let thinking_config = supports_thinking(&self.model_id).then(|| ThinkingConfig {
            thinking_budget: thinking_budget(request.params.reasoning_effort),
        });

        GeminiRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: request.prompt.clone(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: request.params.temperature,
                max_output_tokens: request.params.max_output_tokens,
                thinking_config,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: request.system_instructions.clone(),
                }],
            },
        }
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate(&self, request: &ModelRequest) -> Result<String, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::permanent(
                "MISSING_API_KEY",
                "GEMINI_API_KEY not configured",
            ));
        }

        let body = self.build_request(request);

        let response = self
            .client
            .post(self.endpoint())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                classify_transport_error(&e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "Gemini API error response: {}", error_text);
            return Err(classify_status(status, &error_text));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            ProviderError::permanent("INVALID_RESPONSE", format!("Gemini parse error: {}", e))
        })?;

        if let Some(usage) = &gemini_response.usage_metadata {
            debug!(
                prompt_tokens = usage.prompt_token_count,
                output_tokens = usage.candidates_token_count,
                "Gemini usage"
            );
        }

        extract_text(&gemini_response)
    }
}

/// Reasoning hints only exist on thinking-capable model families
fn supports_thinking(model_id: &str) -> bool {
    model_id.starts_with("gemini-2.5")
}

fn thinking_budget(effort: ReasoningEffort) -> u32 {
    match effort {
        ReasoningEffort::Low => 1024,
        ReasoningEffort::Medium => 4096,
        ReasoningEffort::High => 8192,
    }
}

/// 429 and 503 are worth retrying; everything else fails fast
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
}

fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let (code, message) = match serde_json::from_str::<GeminiErrorEnvelope>(body) {
        Ok(envelope) => (
            envelope
                .error
                .status
                .unwrap_or_else(|| status.as_u16().to_string()),
            envelope.error.message,
        ),
        Err(_) => (status.as_u16().to_string(), body.to_string()),
    };

    if is_transient_status(status) {
        ProviderError::transient(code, message)
    } else {
        ProviderError::permanent(code, message)
    }
}

fn classify_transport_error(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() {
        ProviderError::transient("NETWORK", err.to_string())
    } else {
        ProviderError::permanent("REQUEST_FAILED", err.to_string())
    }
}

fn extract_text(response: &GeminiResponse) -> Result<String, ProviderError> {
    let candidate = response.candidates.first().ok_or_else(|| {
        ProviderError::permanent("EMPTY_RESPONSE", "No response from Gemini API")
    })?;

    let text: String = candidate
        .content
        .parts
        .iter()
        .map(|part| part.text.as_str())
        .collect();

    if text.is_empty() {
        return Err(ProviderError::permanent(
            "EMPTY_RESPONSE",
            format!(
                "Empty response from Gemini (finish_reason: {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            ),
        ));
    }

    Ok(text)
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
struct ThinkingConfig {
    thinking_budget: u32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Content,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i32,
    #[serde(default)]
    candidates_token_count: i32,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorEnvelope {
    error: GeminiErrorBody,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    #[serde(default)]
    message: String,
    status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::GenerationParams;

    fn provider(model_id: &str) -> GeminiProvider {
        let settings = Settings {
            gemini_api_key: "test-key".to_string(),
            model_id: model_id.to_string(),
            ..Settings::default()
        };
        GeminiProvider::new(&settings).unwrap()
    }

    fn request(effort: ReasoningEffort) -> ModelRequest {
        ModelRequest::new(
            "Forecast cash flow",
            "You are a Cash Flow Forecasting Agent.",
            GenerationParams {
                temperature: 0.3,
                max_output_tokens: 800,
                reasoning_effort: effort,
            },
        )
    }

    #[test]
    fn test_request_serialization() {
        let body = provider("gemini-2.0-flash").build_request(&request(ReasoningEffort::Medium));
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["contents"][0]["parts"][0]["text"], "Forecast cash flow");
        assert_eq!(json["generation_config"]["max_output_tokens"], 800);
        assert!(json["generation_config"].get("thinking_config").is_none());
        assert_eq!(
            json["system_instruction"]["parts"][0]["text"],
            "You are a Cash Flow Forecasting Agent."
        );
    }

    #[test]
    fn test_reasoning_effort_maps_to_thinking_budget() {
        let body = provider("gemini-2.5-flash").build_request(&request(ReasoningEffort::High));
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["generation_config"]["thinking_config"]["thinking_budget"], 8192);
    }

    #[test]
    fn test_status_classification() {
        let body = r#"{"error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}}"#;
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, body);
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "RESOURCE_EXHAUSTED: Quota exceeded");

        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "busy").is_transient());

        let err = classify_status(StatusCode::BAD_REQUEST, "nope");
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "400: nope");
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates": [{"content": {"role": "model", "parts": [{"text": "{\"a\":"}, {"text": " 1}"}]}, "finishReason": "STOP"}]}"#,
        )
        .unwrap();

        assert_eq!(extract_text(&response).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_empty_candidates_is_permanent_error() {
        let response: GeminiResponse = serde_json::from_str(r#"{"candidates": []}"#).unwrap();
        assert!(!extract_text(&response).unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let settings = Settings::default();
        let provider = GeminiProvider::new(&settings).unwrap();

        let err = provider.generate(&request(ReasoningEffort::Low)).await.unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }
}

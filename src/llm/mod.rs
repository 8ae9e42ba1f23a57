//! Model provider seam and the invoker that wraps it
//!
//! A provider performs one raw request/response call. The invoker layers
//! retry, fence stripping and JSON normalisation on top and never fails.

use crate::config::Settings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub mod gemini;
pub mod invoker;
pub mod mock;

pub use gemini::GeminiProvider;
pub use invoker::{strip_code_fence, ModelInvoker};
pub use mock::MockProvider;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub reasoning_effort: ReasoningEffort,
}

/// One fully-specified model call
#[derive(Debug, Clone, Serialize)]
pub struct ModelRequest {
    pub prompt: String,
    pub system_instructions: String,
    pub params: GenerationParams,
}

impl ModelRequest {
    pub fn new(
        prompt: impl Into<String>,
        system_instructions: impl Into<String>,
        params: GenerationParams,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            system_instructions: system_instructions.into(),
            params,
        }
    }

    /// Reject requests the provider should never see
    pub fn check(&self) -> Result<(), String> {
        if self.prompt.trim().is_empty() {
            return Err("prompt must not be empty".to_string());
        }
        if !(0.0..=1.0).contains(&self.params.temperature) {
            return Err(format!(
                "temperature must be within [0, 1], got {}",
                self.params.temperature
            ));
        }
        if self.params.max_output_tokens == 0 {
            return Err("max_output_tokens must be positive".to_string());
        }
        Ok(())
    }
}

/// Provider-reported failure, split by whether a retry can help
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("{code}: {message}")]
    Transient { code: String, message: String },

    #[error("{code}: {message}")]
    Permanent { code: String, message: String },
}

impl ProviderError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Transient {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        ProviderError::Permanent {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }
}

/// Raw text-generation endpoint
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, request: &ModelRequest) -> Result<String, ProviderError>;
}

/// Gemini when credentials are configured, the offline mock otherwise
pub fn provider_from_settings(settings: &Settings) -> crate::Result<Arc<dyn ModelProvider>> {
    if settings.has_model_credentials() {
        info!(model_id = %settings.model_id, "Model provider: gemini");
        Ok(Arc::new(GeminiProvider::new(settings)?))
    } else {
        warn!("GEMINI_API_KEY not set, using offline mock provider");
        Ok(Arc::new(MockProvider::offline()))
    }
}

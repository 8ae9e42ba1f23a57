//! Process-wide settings
//!
//! Built once at startup and handed to the components that need it.

use crate::error::PipelineError;
use crate::Result;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MODEL_ID: &str = "gemini-2.0-flash";
pub const DEFAULT_MODEL_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
pub struct Settings {
    pub gemini_api_key: String,
    pub model_id: String,
    pub model_base_url: String,

    /// Total attempts per model call, including the first
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,

    pub database_url: Option<String>,

    pub api_host: String,
    pub api_port: u16,

    /// Character budget for the combined corpus handed to the first stage
    pub max_document_chars: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            model_base_url: DEFAULT_MODEL_BASE_URL.to_string(),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(60),
            database_url: None,
            api_host: "0.0.0.0".to_string(),
            api_port: 8080,
            max_document_chars: 15_000,
        }
    }
}

impl Settings {
    /// Load `.env` (if present) and read settings from the process environment
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let max_retries = parse_or(get("MAX_RETRIES"), "MAX_RETRIES", defaults.max_retries)?;
        if max_retries == 0 {
            return Err(PipelineError::ConfigError(
                "MAX_RETRIES must be at least 1".to_string(),
            ));
        }

        let retry_base_delay_ms: u64 = parse_or(
            get("RETRY_BASE_DELAY_MS"),
            "RETRY_BASE_DELAY_MS",
            defaults.retry_base_delay.as_millis() as u64,
        )?;

        let request_timeout_secs: u64 = parse_or(
            get("REQUEST_TIMEOUT_SECONDS"),
            "REQUEST_TIMEOUT_SECONDS",
            defaults.request_timeout.as_secs(),
        )?;

        let api_port = parse_or(
            get("PORT").or_else(|| get("API_PORT")),
            "PORT",
            defaults.api_port,
        )?;

        let max_document_chars = parse_or(
            get("MAX_DOCUMENT_CHARS"),
            "MAX_DOCUMENT_CHARS",
            defaults.max_document_chars,
        )?;

        Ok(Self {
            gemini_api_key: get("GEMINI_API_KEY").unwrap_or_default(),
            model_id: get("MODEL_ID").unwrap_or(defaults.model_id),
            model_base_url: get("MODEL_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.model_base_url),
            max_retries,
            retry_base_delay: Duration::from_millis(retry_base_delay_ms),
            request_timeout: Duration::from_secs(request_timeout_secs),
            database_url: get("DATABASE_URL").or_else(|| get("POSTGRES_URL")),
            api_host: get("API_HOST").unwrap_or(defaults.api_host),
            api_port,
            max_document_chars,
        })
    }

    pub fn has_model_credentials(&self) -> bool {
        !self.gemini_api_key.is_empty() && self.gemini_api_key != "your_gemini_api_key_here"
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T> {
    match raw {
        Some(value) => value.trim().parse::<T>().map_err(|_| {
            PipelineError::ConfigError(format!("{} has an invalid value: {}", key, value))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.retry_base_delay, Duration::from_secs(1));
        assert_eq!(settings.api_port, 8080);
        assert_eq!(settings.max_document_chars, 15_000);
        assert!(settings.database_url.is_none());
        assert!(!settings.has_model_credentials());
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "abc"),
            ("MAX_RETRIES", "5"),
            ("RETRY_BASE_DELAY_MS", "250"),
            ("API_PORT", "9000"),
            ("POSTGRES_URL", "postgres://localhost/reports"),
            ("MODEL_BASE_URL", "http://localhost:1234/v1beta/"),
        ]))
        .unwrap();

        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.retry_base_delay, Duration::from_millis(250));
        assert_eq!(settings.api_port, 9000);
        assert_eq!(
            settings.database_url.as_deref(),
            Some("postgres://localhost/reports")
        );
        assert_eq!(settings.model_base_url, "http://localhost:1234/v1beta");
        assert!(settings.has_model_credentials());
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let err = Settings::from_lookup(lookup(&[("MAX_RETRIES", "many")])).unwrap_err();
        assert!(matches!(err, PipelineError::ConfigError(_)));

        let err = Settings::from_lookup(lookup(&[("MAX_RETRIES", "0")])).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }
}

pub mod client;
pub mod flight;
pub mod gemini;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use client::*;
pub use flight::*;
pub use gemini::GeminiProvider;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError>;
    async fn health(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

// ============================================================
// Request / Response
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmMessage {
    pub role: String,
    pub text: String,
}

impl LlmMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            text: text.into(),
        }
    }
}

/// Constrains the reply to structured data of a given shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFormat {
    pub mime_type: String,
    pub schema: serde_json::Value,
}

impl ResponseFormat {
    pub fn json(schema: serde_json::Value) -> Self {
        Self {
            mime_type: "application/json".into(),
            schema,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<LlmMessage>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
}

fn default_max_tokens() -> u32 {
    2048
}

impl LlmRequest {
    pub fn simple(model: String, system: Option<String>, user: String) -> Self {
        Self {
            model,
            system,
            messages: vec![LlmMessage::user(user)],
            max_tokens: default_max_tokens(),
            response_format: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub stop_reason: Option<String>,
}

// ============================================================
// Errors
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,
    #[error("connect error: {0}")]
    Connect(String),
    #[error("api error ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("provider not configured: {0}")]
    Configuration(String),
}

impl ProviderError {
    /// Transient failures worth another attempt. Never true for configuration or decode errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Connect(_) => true,
            Self::Status { status, .. } => matches!(status, 429 | 500..=599),
            _ => false,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

// ============================================================
// Provider Configuration
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Gemini,
    /// Canned replies, for offline runs
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Custom base URL (optional, uses the provider default)
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn new(provider_type: ProviderType) -> Self {
        Self {
            provider_type,
            api_key: None,
            base_url: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

/// Create a provider from configuration.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    let provider: Arc<dyn LlmProvider> = match config.provider_type {
        ProviderType::Gemini => {
            let key = config
                .api_key
                .as_ref()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| ProviderError::Configuration("gemini requires api_key".into()))?;
            match config.base_url.as_deref() {
                Some(base) => Arc::new(GeminiProvider::with_base_url(key.clone(), base)),
                None => Arc::new(GeminiProvider::new(key.clone())),
            }
        }
        ProviderType::Stub => Arc::new(StubProvider::new(STUB_PLAN)),
    };
    Ok(provider)
}

/// Stand-in used when no usable provider is configured. Every call fails with
/// [`ProviderError::Configuration`] so callers can tell it apart from transport trouble.
pub struct UnconfiguredProvider {
    reason: String,
}

impl UnconfiguredProvider {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for UnconfiguredProvider {
    async fn chat(&self, _request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        Err(ProviderError::Configuration(self.reason.clone()))
    }

    async fn health(&self) -> Result<(), ProviderError> {
        Err(ProviderError::Configuration(self.reason.clone()))
    }
}

const STUB_PLAN: &str = r#"{
  "language": "pl",
  "summary": "Głód jest dziś umiarkowany.",
  "insight": "Wieczorem objawy zwykle rosną.",
  "plan": [
    {"step": "Wyjdź na 10-minutowy spacer", "duration": "10 min", "why": "Ruch obniża napięcie."}
  ],
  "if_trigger_then_strategy": [{"trigger": "Stres", "strategy": "Oddychanie 4-7-8"}],
  "motivation": "Każda godzina bez substancji się liczy.",
  "reflect_question": "Co dziś pomogło Ci najbardziej?",
  "followup_questions": [
    {"id": "fq_01", "type": "single", "question": "Czy spacer pomógł?", "options": ["Tak", "Trochę", "Nie"]}
  ],
  "trend_warning": {"is_flagged": false, "message": "", "suggested_adjustment": ""},
  "crisis": {"is_flagged": false, "message": "", "hotlines": []}
}"#;

/// Returns a fixed reply text for every request.
pub struct StubProvider {
    reply: String,
}

impl StubProvider {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        tracing::debug!(model = %request.model, "stub provider answering");
        Ok(LlmResponse {
            text: self.reply.clone(),
            input_tokens: None,
            output_tokens: None,
            stop_reason: Some("end_turn".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_without_key_is_a_configuration_error() {
        let err = create_provider(&ProviderConfig::new(ProviderType::Gemini))
            .err()
            .unwrap();
        assert!(err.is_configuration());
        assert!(!err.is_retryable());

        let blank = ProviderConfig::new(ProviderType::Gemini).with_api_key("  ");
        assert!(create_provider(&blank).err().unwrap().is_configuration());
    }

    #[test]
    fn gemini_with_key_is_created() {
        let config = ProviderConfig::new(ProviderType::Gemini)
            .with_api_key("k")
            .with_base_url("http://localhost:1");
        assert!(create_provider(&config).is_ok());
    }

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Connect("refused".into()).is_retryable());
        assert!(ProviderError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(ProviderError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!ProviderError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!ProviderError::Decode("bad".into()).is_retryable());
    }

    #[test]
    fn provider_config_deserializes_from_yaml_like_json() {
        let parsed: ProviderConfig =
            serde_json::from_str(r#"{"type":"gemini","api_key":"abc"}"#).unwrap();
        assert_eq!(parsed.provider_type, ProviderType::Gemini);
        assert_eq!(parsed.api_key.as_deref(), Some("abc"));
        assert!(parsed.base_url.is_none());
    }

    #[tokio::test]
    async fn unconfigured_provider_always_fails() {
        let provider = UnconfiguredProvider::new("no api key");
        let req = LlmRequest::simple("m".into(), None, "hi".into());
        let err = provider.chat(req).await.unwrap_err();
        assert_eq!(err, ProviderError::Configuration("no api key".into()));
        assert!(provider.health().await.is_err());
    }

    #[tokio::test]
    async fn stub_provider_returns_canned_plan() {
        let provider = create_provider(&ProviderConfig::new(ProviderType::Stub)).unwrap();
        let req = LlmRequest::simple("m".into(), None, "hi".into());
        let resp = provider.chat(req).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&resp.text).unwrap();
        assert_eq!(value["crisis"]["is_flagged"], false);
        assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
    }
}

//! Google Gemini API provider
//!
//! https://ai.google.dev/api/generate-content

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{LlmProvider, LlmRequest, LlmResponse, ProviderError};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, GEMINI_API_BASE)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            // Overall deadline is enforced by ModelClient; this only guards against hung sockets.
            client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn build_request(&self, request: &LlmRequest) -> GeminiRequest {
        let contents = request
            .messages
            .iter()
            .filter(|msg| !msg.text.is_empty())
            .map(|msg| GeminiContent {
                role: match msg.role.as_str() {
                    "assistant" => "model".to_string(),
                    _ => "user".to_string(),
                },
                parts: vec![GeminiPart { text: msg.text.clone() }],
            })
            .collect();

        let (response_mime_type, response_schema) = match &request.response_format {
            Some(format) => (Some(format.mime_type.clone()), Some(format.schema.clone())),
            None => (None, None),
        };

        GeminiRequest {
            contents,
            system_instruction: request.system.as_ref().map(|s| GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart { text: s.clone() }],
            }),
            generation_config: Some(GeminiGenerationConfig {
                max_output_tokens: Some(request.max_tokens),
                temperature: None,
                response_mime_type,
                response_schema,
            }),
        }
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, request.model, self.api_key
        );

        let payload = self.build_request(&request);

        let resp = match self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(ProviderError::Timeout),
            Err(e) if e.is_connect() => return Err(ProviderError::Connect(e.to_string())),
            Err(e) => return Err(ProviderError::Transport(e.to_string())),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp
                .text()
                .await
                .map_err(|e| ProviderError::Transport(e.to_string()))?;
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let body: GeminiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        to_llm_response(body)
    }
}

fn to_llm_response(body: GeminiResponse) -> Result<LlmResponse, ProviderError> {
    let candidate = body
        .candidates
        .first()
        .ok_or_else(|| ProviderError::Decode("empty candidates".into()))?;

    let text: String = candidate
        .content
        .as_ref()
        .map(|content| content.parts.iter().map(|p| p.text.as_str()).collect::<String>())
        .unwrap_or_default();

    let stop_reason = match candidate.finish_reason.as_deref() {
        Some("STOP") => Some("end_turn".to_string()),
        Some("MAX_TOKENS") => Some("max_tokens".to_string()),
        Some("SAFETY") => Some("safety".to_string()),
        Some(r) => Some(r.to_lowercase()),
        None => None,
    };

    Ok(LlmResponse {
        text,
        input_tokens: body.usage_metadata.as_ref().map(|u| u.prompt_token_count),
        output_tokens: body
            .usage_metadata
            .as_ref()
            .map(|u| u.candidates_token_count),
        stop_reason,
    })
}

// ============================================================
// Gemini API Types
// ============================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

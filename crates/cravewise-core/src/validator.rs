use cravewise_provider::InvocationError;
use cravewise_schema::{
    check_followup_rules, crisis_fallback, AiResponse, ResponseView, SchemaViolation, AI_RESPONSE,
};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("reply is not valid JSON: {0}")]
    Parse(String),
    #[error("reply violates the response schema: {0}")]
    Schema(#[from] SchemaViolation),
}

/// Parse and structurally check a raw model reply.
///
/// Only surrounding whitespace is tolerated; a reply wrapped in markdown
/// fences or prose is a parse error.
pub fn validate_response(raw: &str) -> Result<AiResponse, ValidationError> {
    let value: Value =
        serde_json::from_str(raw.trim()).map_err(|e| ValidationError::Parse(e.to_string()))?;
    AI_RESPONSE.check(&value)?;
    let response: AiResponse =
        serde_json::from_value(value).map_err(|e| ValidationError::Parse(e.to_string()))?;
    check_followup_rules(&response.followup_questions)?;
    Ok(response)
}

/// Why the fixed crisis response was served instead of a model plan.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    Configuration(String),
    Transport(InvocationError),
    Validation(ValidationError),
    Persistence(String),
    CrisisKeyword(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseSource {
    Model,
    Fallback(FallbackReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedResponse {
    pub response: AiResponse,
    pub source: ResponseSource,
}

impl RoutedResponse {
    pub fn from_model(response: AiResponse) -> Self {
        Self {
            response,
            source: ResponseSource::Model,
        }
    }

    /// The crisis constant, logged with a level matching the reason.
    pub fn fallback(reason: FallbackReason) -> Self {
        match &reason {
            FallbackReason::Configuration(detail) => {
                tracing::error!(reason = "configuration", %detail, "serving crisis fallback")
            }
            FallbackReason::Persistence(detail) => {
                tracing::error!(reason = "persistence", %detail, "serving crisis fallback")
            }
            FallbackReason::Transport(e) => {
                tracing::warn!(reason = "transport", error = %e, "serving crisis fallback")
            }
            FallbackReason::Validation(e) => {
                tracing::warn!(reason = "validation", error = %e, "serving crisis fallback")
            }
            FallbackReason::CrisisKeyword(keyword) => {
                tracing::info!(reason = "crisis_keyword", %keyword, "serving crisis fallback")
            }
        }
        Self {
            response: crisis_fallback(),
            source: ResponseSource::Fallback(reason),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.source, ResponseSource::Fallback(_))
    }

    pub fn view(&self) -> ResponseView<'_> {
        self.response.view()
    }
}

/// Decide what the user sees for one invocation outcome. Never fails.
pub fn route(result: Result<String, InvocationError>) -> RoutedResponse {
    match result {
        Ok(raw) => match validate_response(&raw) {
            Ok(response) => {
                if response.crisis.is_flagged {
                    tracing::info!("model flagged a crisis");
                }
                RoutedResponse::from_model(response)
            }
            Err(e) => RoutedResponse::fallback(FallbackReason::Validation(e)),
        },
        Err(InvocationError::Provider(e)) if e.is_configuration() => {
            RoutedResponse::fallback(FallbackReason::Configuration(e.to_string()))
        }
        Err(e) => RoutedResponse::fallback(FallbackReason::Transport(e)),
    }
}

//! Opt-in anonymous feedback export.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cravewise_memory::RecordStore;
use cravewise_schema::{
    AiResponse, AnonymousFeedback, CravingLog, FeedbackAnswers, FeedbackProblem,
    FollowupSubmission,
};

/// Store key of the persistent anonymous id. Not a valid user key.
pub const ANONYMOUS_ID_KEY: &str = "__anonymous_user_id";

/// Return the installation's anonymous id, creating and persisting it on first use.
pub async fn anonymous_id(store: &dyn RecordStore) -> Result<String> {
    if let Some(id) = store.get_raw(ANONYMOUS_ID_KEY).await? {
        return Ok(id);
    }
    let id = format!("anon_{}", uuid::Uuid::new_v4());
    store
        .put_raw(ANONYMOUS_ID_KEY, id.clone())
        .await
        .context("failed to persist anonymous id")?;
    Ok(id)
}

/// Package a problem, the reply it got and the user's answers. Never carries profile fields.
pub fn build_anonymous_feedback(
    anonymous_user_id: String,
    substance_id: &str,
    report: &CravingLog,
    solution: Option<&AiResponse>,
    submission: &FollowupSubmission,
    now: DateTime<Utc>,
) -> AnonymousFeedback {
    AnonymousFeedback {
        anonymous_user_id,
        timestamp: now,
        problem: FeedbackProblem {
            substance_id: substance_id.to_string(),
            craving_details: report.details().clone(),
            craving_triggers: report.triggers().to_vec(),
            craving_total_intensity: report.total_intensity(),
        },
        solution: solution.cloned(),
        feedback: FeedbackAnswers {
            followup_answers: submission.answers.clone(),
        },
    }
}

#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn send(&self, feedback: &AnonymousFeedback) -> Result<()>;
}

/// Writes the package to the log only.
pub struct LogSink;

#[async_trait]
impl FeedbackSink for LogSink {
    async fn send(&self, feedback: &AnonymousFeedback) -> Result<()> {
        let payload = serde_json::to_string(feedback)?;
        tracing::info!(
            anonymous_user_id = %feedback.anonymous_user_id,
            %payload,
            "anonymous feedback collected"
        );
        Ok(())
    }
}

/// POSTs the package as JSON to a collection endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl FeedbackSink for HttpSink {
    async fn send(&self, feedback: &AnonymousFeedback) -> Result<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(feedback)
            .send()
            .await
            .with_context(|| format!("failed to reach feedback endpoint {}", self.endpoint))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("feedback endpoint returned {status}"));
        }
        tracing::debug!(endpoint = %self.endpoint, "anonymous feedback delivered");
        Ok(())
    }
}

pub mod catalog;
pub mod contract;
pub mod fallback;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use catalog::*;
pub use contract::*;
pub use fallback::*;

/// Highest intensity a single symptom can be rated.
pub const MAX_INTENSITY: u8 = 10;

/// Symptom key -> intensity (0-10). Zero means "absent".
pub type CravingDetails = BTreeMap<String, u8>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    #[error("craving report has zero total intensity")]
    Empty,
    #[error("symptom {symptom} has intensity {value}, expected 0-10")]
    IntensityOutOfRange { symptom: String, value: u8 },
}

/// A user-submitted snapshot of symptom intensities and triggers, before it is logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CravingReport {
    pub details: CravingDetails,
    #[serde(default)]
    pub triggers: Vec<String>,
}

impl CravingReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_symptom(mut self, key: impl Into<String>, intensity: u8) -> Self {
        self.details.insert(key.into(), intensity);
        self
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.triggers.push(trigger.into());
        self
    }

    /// Details with zero-intensity entries removed.
    pub fn active_details(&self) -> CravingDetails {
        self.details
            .iter()
            .filter(|(_, value)| **value > 0)
            .map(|(key, value)| (key.clone(), *value))
            .collect()
    }

    pub fn total_intensity(&self) -> u32 {
        self.details.values().map(|v| u32::from(*v)).sum()
    }

    /// Trimmed, non-empty triggers, deduplicated in insertion order.
    pub fn normalized_triggers(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for raw in &self.triggers {
            let trigger = raw.trim().trim_end_matches(',').trim();
            if trigger.is_empty() {
                continue;
            }
            if seen.insert(trigger.to_string()) {
                out.push(trigger.to_string());
            }
        }
        out
    }

    pub fn validate(&self) -> Result<(), ReportError> {
        if let Some((symptom, value)) = self.details.iter().find(|(_, v)| **v > MAX_INTENSITY) {
            return Err(ReportError::IntensityOutOfRange {
                symptom: symptom.clone(),
                value: *value,
            });
        }
        if self.total_intensity() == 0 {
            return Err(ReportError::Empty);
        }
        Ok(())
    }
}

/// One confirmed craving episode. Immutable once created; `total_intensity`
/// always equals the sum of `details`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CravingLog {
    timestamp: DateTime<Utc>,
    details: CravingDetails,
    triggers: Vec<String>,
    total_intensity: u32,
}

impl CravingLog {
    pub fn from_report(report: &CravingReport, timestamp: DateTime<Utc>) -> Result<Self, ReportError> {
        report.validate()?;
        let details = report.active_details();
        let total_intensity = details.values().map(|v| u32::from(*v)).sum();
        Ok(Self {
            timestamp,
            details,
            triggers: report.normalized_triggers(),
            total_intensity,
        })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn details(&self) -> &CravingDetails {
        &self.details
    }

    pub fn triggers(&self) -> &[String] {
        &self.triggers
    }

    pub fn total_intensity(&self) -> u32 {
        self.total_intensity
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
    PreferNotToSay,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub age: u16,
    pub gender: Gender,
    pub abstinence_start: DateTime<Utc>,
    #[serde(default)]
    pub allow_anonymous_collection: bool,
    /// Triggers the user already knows about, entered at profile setup.
    #[serde(default)]
    pub triggers: Vec<String>,
}

// ============================================================
// Feedback memory
// ============================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StrategyTag {
    #[serde(rename = "not_effective")]
    NotEffective,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StrategyStats {
    pub uses: u32,
    /// Running mean of reported helpfulness, 0-3.
    pub avg_help: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<StrategyTag>,
}

impl StrategyStats {
    pub fn is_not_effective(&self) -> bool {
        self.tag == Some(StrategyTag::NotEffective)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerStats {
    pub count: u32,
    #[serde(default)]
    pub top_strategy: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct RollingAverages {
    pub craving_3d_avg: f64,
    pub craving_7d_avg: f64,
    /// Change in daily mean total intensity per day.
    pub slope_3d: f64,
    pub evening_peak_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackMemory {
    #[serde(default)]
    pub strategy_effectiveness: BTreeMap<String, StrategyStats>,
    #[serde(default)]
    pub trigger_map: BTreeMap<String, TriggerStats>,
    #[serde(default)]
    pub time_heatmap: BTreeMap<String, u32>,
    #[serde(default)]
    pub rolling: RollingAverages,
    pub last_updated: DateTime<Utc>,
    /// Idempotence keys of follow-up items already folded into this memory.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub processed_feedback: BTreeSet<String>,
}

impl FeedbackMemory {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            strategy_effectiveness: BTreeMap::new(),
            trigger_map: BTreeMap::new(),
            time_heatmap: BTreeMap::new(),
            rolling: RollingAverages::default(),
            last_updated: now,
            processed_feedback: BTreeSet::new(),
        }
    }

    pub fn not_effective_strategies(&self) -> Vec<&str> {
        self.strategy_effectiveness
            .iter()
            .filter(|(_, stats)| stats.is_not_effective())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

// ============================================================
// Model reply
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanStep {
    pub step: String,
    pub duration: String,
    pub why: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerStrategy {
    pub trigger: String,
    pub strategy: String,
}

/// Follow-up question, discriminated by its `type` tag. Unknown tags fail to parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FollowupQuestion {
    Single {
        id: String,
        question: String,
        #[serde(default)]
        options: Vec<String>,
    },
    Multi {
        id: String,
        question: String,
        #[serde(default)]
        options: Vec<String>,
    },
    Text {
        id: String,
        question: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
    },
}

impl FollowupQuestion {
    pub fn id(&self) -> &str {
        match self {
            Self::Single { id, .. } | Self::Multi { id, .. } | Self::Text { id, .. } => id,
        }
    }

    pub fn question(&self) -> &str {
        match self {
            Self::Single { question, .. }
            | Self::Multi { question, .. }
            | Self::Text { question, .. } => question,
        }
    }

    pub fn options(&self) -> &[String] {
        match self {
            Self::Single { options, .. }
            | Self::Multi { options, .. }
            | Self::Text { options, .. } => options,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Single { .. } => "single",
            Self::Multi { .. } => "multi",
            Self::Text { .. } => "text",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrendWarning {
    pub is_flagged: bool,
    pub message: String,
    pub suggested_adjustment: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrisisInfo {
    pub is_flagged: bool,
    pub message: String,
    pub hotlines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AiResponse {
    pub language: String,
    pub summary: String,
    pub insight: String,
    pub plan: Vec<PlanStep>,
    pub if_trigger_then_strategy: Vec<TriggerStrategy>,
    pub motivation: String,
    pub reflect_question: String,
    pub followup_questions: Vec<FollowupQuestion>,
    pub trend_warning: TrendWarning,
    pub crisis: CrisisInfo,
}

/// What the rendering layer may show for a reply. Crisis content, when
/// flagged, fully replaces the plan branch.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseView<'a> {
    Crisis {
        message: &'a str,
        hotlines: &'a [String],
    },
    Plan {
        summary: &'a str,
        insight: &'a str,
        plan: &'a [PlanStep],
        if_trigger_then_strategy: &'a [TriggerStrategy],
        motivation: &'a str,
        reflect_question: &'a str,
        followup_questions: &'a [FollowupQuestion],
        trend_warning: Option<&'a TrendWarning>,
    },
}

impl AiResponse {
    pub fn view(&self) -> ResponseView<'_> {
        if self.crisis.is_flagged {
            return ResponseView::Crisis {
                message: &self.crisis.message,
                hotlines: &self.crisis.hotlines,
            };
        }
        ResponseView::Plan {
            summary: &self.summary,
            insight: &self.insight,
            plan: &self.plan,
            if_trigger_then_strategy: &self.if_trigger_then_strategy,
            motivation: &self.motivation,
            reflect_question: &self.reflect_question,
            followup_questions: &self.followup_questions,
            trend_warning: self.trend_warning.is_flagged.then_some(&self.trend_warning),
        }
    }

    pub fn question(&self, id: &str) -> Option<&FollowupQuestion> {
        self.followup_questions.iter().find(|q| q.id() == id)
    }
}

// ============================================================
// Follow-up feedback
// ============================================================

/// Answer to a follow-up question: one value for `single`/`text`, several for `multi`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum FollowupAnswer {
    One(String),
    Many(Vec<String>),
}

/// How much a strategy helped, as rated by the user (0-3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategyOutcome {
    pub strategy: String,
    pub help: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FollowupSubmission {
    #[serde(default)]
    pub answers: BTreeMap<String, FollowupAnswer>,
    #[serde(default)]
    pub outcomes: Vec<StrategyOutcome>,
}

/// Plan awaiting follow-up answers, keyed by the report that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingFollowup {
    pub report_timestamp: DateTime<Utc>,
    pub response: AiResponse,
}

/// Anonymous problem/solution/feedback package. Carries no profile fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousFeedback {
    pub anonymous_user_id: String,
    pub timestamp: DateTime<Utc>,
    pub problem: FeedbackProblem,
    pub solution: Option<AiResponse>,
    pub feedback: FeedbackAnswers,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackProblem {
    pub substance_id: String,
    pub craving_details: CravingDetails,
    pub craving_triggers: Vec<String>,
    pub craving_total_intensity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackAnswers {
    pub followup_answers: BTreeMap<String, FollowupAnswer>,
}

// ============================================================
// Persisted per-user record
// ============================================================

/// Everything persisted for one user under their key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(default)]
    pub selected_substance: Option<Substance>,
    #[serde(default)]
    pub user_info: Option<UserInfo>,
    /// Newest first.
    #[serde(default)]
    pub craving_logs: Vec<CravingLog>,
    #[serde(default)]
    pub feedback_memory: Option<FeedbackMemory>,
    #[serde(default)]
    pub pending_followup: Option<PendingFollowup>,
}

impl UserRecord {
    /// Switching to a different substance starts over; re-selecting the current one is a no-op.
    pub fn with_substance(&self, substance: Substance) -> Self {
        if self.selected_substance.as_ref().map(|s| s.id.as_str()) == Some(substance.id.as_str()) {
            return self.clone();
        }
        Self {
            selected_substance: Some(substance),
            ..Self::default()
        }
    }

    /// Sets the profile and starts a fresh feedback memory.
    pub fn with_profile(&self, info: UserInfo, now: DateTime<Utc>) -> Self {
        Self {
            user_info: Some(info),
            feedback_memory: Some(FeedbackMemory::new(now)),
            ..self.clone()
        }
    }

    /// Inserts a log, keeping the newest-first order.
    pub fn with_log(&self, log: CravingLog) -> Self {
        let mut logs = self.craving_logs.clone();
        let pos = logs
            .iter()
            .position(|existing| existing.timestamp() <= log.timestamp())
            .unwrap_or(logs.len());
        logs.insert(pos, log);
        Self {
            craving_logs: logs,
            ..self.clone()
        }
    }

    pub fn with_memory(&self, memory: FeedbackMemory) -> Self {
        Self {
            feedback_memory: Some(memory),
            ..self.clone()
        }
    }

    pub fn with_pending_followup(&self, pending: Option<PendingFollowup>) -> Self {
        Self {
            pending_followup: pending,
            ..self.clone()
        }
    }

    pub fn log_at(&self, timestamp: DateTime<Utc>) -> Option<&CravingLog> {
        self.craving_logs.iter().find(|log| log.timestamp() == timestamp)
    }
}

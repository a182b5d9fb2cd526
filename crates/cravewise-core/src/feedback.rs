//! Folding follow-up answers and strategy ratings into the feedback memory.

use chrono::{DateTime, Utc};
use cravewise_schema::{
    CravingLog, FeedbackMemory, FollowupSubmission, StrategyStats, StrategyTag,
};

use crate::config::{NotEffectivePolicy, PolicyConfig};
use crate::stats::{compute_rolling, time_slot};

/// Highest helpfulness rating a strategy can receive.
pub const MAX_HELP: u8 = 3;

/// Lowest rating at which a strategy can become a trigger's top strategy.
const TOP_STRATEGY_MIN_HELP: u8 = 2;

fn feedback_key(report: &CravingLog, item: &str) -> String {
    format!("{}#{item}", report.timestamp().to_rfc3339())
}

/// Recompute `rolling` after the log changed.
pub fn refresh_rolling(
    memory: &FeedbackMemory,
    logs: &[CravingLog],
    now: DateTime<Utc>,
    policy: &PolicyConfig,
) -> FeedbackMemory {
    FeedbackMemory {
        rolling: compute_rolling(logs, now, policy),
        last_updated: now,
        ..memory.clone()
    }
}

fn rate(stats: &mut StrategyStats, help: u8, now: DateTime<Utc>, policy: &NotEffectivePolicy) {
    let help = f64::from(help.min(MAX_HELP));
    stats.uses += 1;
    stats.avg_help += (help - stats.avg_help) / f64::from(stats.uses);
    stats.avg_help = stats.avg_help.clamp(0.0, f64::from(MAX_HELP));
    stats.last_used = Some(now);
    stats.tag = (stats.uses >= policy.min_uses && stats.avg_help <= policy.max_avg_help)
        .then_some(StrategyTag::NotEffective);
}

/// Fold one follow-up submission for `report` into `memory`.
///
/// Every answer, rating and the report itself is counted at most once; a
/// replayed submission only refreshes `rolling` and `last_updated`.
pub fn apply_followup(
    memory: &FeedbackMemory,
    submission: &FollowupSubmission,
    report: &CravingLog,
    logs: &[CravingLog],
    now: DateTime<Utc>,
    policy: &PolicyConfig,
) -> FeedbackMemory {
    let mut next = refresh_rolling(memory, logs, now, policy);

    for question_id in submission.answers.keys() {
        next.processed_feedback
            .insert(feedback_key(report, question_id));
    }

    let mut best: Option<(&str, u8)> = None;
    for outcome in &submission.outcomes {
        let name = outcome.strategy.trim();
        if name.is_empty() {
            continue;
        }
        let key = feedback_key(report, &format!("strategy:{name}"));
        if !next.processed_feedback.insert(key) {
            tracing::debug!(strategy = %name, "strategy rating already applied");
            continue;
        }
        let stats = next
            .strategy_effectiveness
            .entry(name.to_string())
            .or_default();
        rate(stats, outcome.help, now, &policy.not_effective);

        let help = outcome.help.min(MAX_HELP);
        if help >= TOP_STRATEGY_MIN_HELP && best.map_or(true, |(_, h)| help > h) {
            best = Some((name, help));
        }
    }

    if next.processed_feedback.insert(feedback_key(report, "report")) {
        for trigger in report.triggers() {
            next.trigger_map.entry(trigger.clone()).or_default().count += 1;
        }
        *next
            .time_heatmap
            .entry(time_slot(report.timestamp(), policy.offset()).to_string())
            .or_default() += 1;
    }

    if let Some((candidate, _)) = best {
        let candidate_avg = next
            .strategy_effectiveness
            .get(candidate)
            .map_or(0.0, |s| s.avg_help);
        for trigger in report.triggers() {
            let current_avg = next
                .trigger_map
                .get(trigger)
                .filter(|t| !t.top_strategy.is_empty())
                .and_then(|t| next.strategy_effectiveness.get(&t.top_strategy))
                .map(|s| s.avg_help);
            if current_avg.map_or(true, |avg| candidate_avg >= avg) {
                next.trigger_map
                    .entry(trigger.clone())
                    .or_default()
                    .top_strategy = candidate.to_string();
            }
        }
    }

    next
}

/// One row of the strategy effectiveness report.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyReportRow {
    pub strategy: String,
    pub uses: u32,
    /// Rounded to two decimals.
    pub avg_help: f64,
    pub not_effective: bool,
    pub last_used: Option<DateTime<Utc>>,
}

/// Strategies ordered by number of uses, most used first.
pub fn strategy_report(memory: &FeedbackMemory) -> Vec<StrategyReportRow> {
    let mut rows: Vec<StrategyReportRow> = memory
        .strategy_effectiveness
        .iter()
        .map(|(name, stats)| StrategyReportRow {
            strategy: name.clone(),
            uses: stats.uses,
            avg_help: (stats.avg_help * 100.0).round() / 100.0,
            not_effective: stats.is_not_effective(),
            last_used: stats.last_used,
        })
        .collect();
    rows.sort_by(|a, b| b.uses.cmp(&a.uses).then_with(|| a.strategy.cmp(&b.strategy)));
    rows
}

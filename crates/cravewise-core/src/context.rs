use chrono::{DateTime, Utc};
use cravewise_schema::{
    CravingDetails, CravingLog, CravingReport, FeedbackMemory, Gender, ReportError,
    RollingAverages, Substance, UserInfo,
};
use serde::Serialize;

use crate::config::PolicyConfig;
use crate::stats::{assess_trend, compute_rolling, logs_within, TrendAssessment};

/// Time since abstinence started, split into whole units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AbstinenceDuration {
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
}

/// Negative spans (start in the future) clamp to zero.
pub fn abstinence_duration(start: DateTime<Utc>, now: DateTime<Utc>) -> AbstinenceDuration {
    let total = (now - start).num_seconds().max(0);
    AbstinenceDuration {
        days: total / 86_400,
        hours: total % 86_400 / 3_600,
        minutes: total % 3_600 / 60,
        seconds: total % 60,
    }
}

/// Zero-padded `DDd HHh MMm`.
pub fn abstinence_clock(start: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let d = abstinence_duration(start, now);
    format!("{:02}d {:02}h {:02}m", d.days, d.hours, d.minutes)
}

/// Profile fields that may leave the device in a model request.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSnapshot {
    pub age: u16,
    pub gender: Gender,
    pub abstinence_start: DateTime<Utc>,
    pub known_triggers: Vec<String>,
}

impl From<&UserInfo> for ProfileSnapshot {
    fn from(info: &UserInfo) -> Self {
        Self {
            age: info.age,
            gender: info.gender,
            abstinence_start: info.abstinence_start,
            known_triggers: info.triggers.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextInputs<'a> {
    pub substance: &'a Substance,
    pub profile: &'a UserInfo,
    /// Full log, newest first. Includes the current episode once it has been appended.
    pub history: &'a [CravingLog],
    pub current: &'a CravingReport,
    pub memory: &'a FeedbackMemory,
}

/// Snapshot of everything a single model request is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub substance: Substance,
    pub profile: ProfileSnapshot,
    pub abstinence_clock: String,
    pub current_details: CravingDetails,
    pub current_triggers: Vec<String>,
    /// Logs from the last `history_window_days`, newest first.
    pub history: Vec<CravingLog>,
    pub memory: FeedbackMemory,
    pub rolling: RollingAverages,
    pub trend: TrendAssessment,
    pub locale: String,
    pub max_followup_questions: usize,
}

pub fn build_context(
    inputs: ContextInputs<'_>,
    now: DateTime<Utc>,
    policy: &PolicyConfig,
) -> Result<RequestContext, ReportError> {
    inputs.current.validate()?;

    let history: Vec<CravingLog> = logs_within(inputs.history, now, policy.history_window_days)
        .into_iter()
        .cloned()
        .collect();
    let rolling = compute_rolling(&history, now, policy);
    let trend = assess_trend(&rolling, &history, now, policy);

    Ok(RequestContext {
        substance: inputs.substance.clone(),
        profile: ProfileSnapshot::from(inputs.profile),
        abstinence_clock: abstinence_clock(inputs.profile.abstinence_start, now),
        current_details: inputs.current.active_details(),
        current_triggers: inputs.current.normalized_triggers(),
        history,
        memory: inputs.memory.clone(),
        rolling,
        trend,
        locale: policy.locale.clone(),
        max_followup_questions: policy.max_followup_questions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use cravewise_schema::find_substance;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    fn profile() -> UserInfo {
        UserInfo {
            age: 34,
            gender: Gender::Female,
            abstinence_start: now() - Duration::days(3) - Duration::hours(4) - Duration::minutes(5),
            allow_anonymous_collection: false,
            triggers: vec!["Stres".into()],
        }
    }

    fn log(days_ago: i64, total: u8) -> CravingLog {
        CravingLog::from_report(
            &CravingReport::new().with_symptom("tension", total),
            now() - Duration::days(days_ago),
        )
        .unwrap()
    }

    #[test]
    fn clock_is_zero_padded() {
        assert_eq!(abstinence_clock(profile().abstinence_start, now()), "03d 04h 05m");
    }

    #[test]
    fn clock_clamps_future_start() {
        assert_eq!(abstinence_clock(now() + Duration::days(1), now()), "00d 00h 00m");
        assert_eq!(
            abstinence_duration(now() + Duration::hours(1), now()),
            AbstinenceDuration::default()
        );
    }

    #[test]
    fn duration_breakdown() {
        let start = now() - Duration::seconds(90_061);
        assert_eq!(
            abstinence_duration(start, now()),
            AbstinenceDuration {
                days: 1,
                hours: 1,
                minutes: 1,
                seconds: 1
            }
        );
    }

    #[test]
    fn history_is_limited_to_window() {
        let substance = find_substance("nikotyna").unwrap();
        let info = profile();
        let history = vec![log(0, 5), log(13, 4), log(15, 9), log(30, 9)];
        let current = CravingReport::new()
            .with_symptom("tension", 5)
            .with_symptom("apathy", 0)
            .with_trigger("Kawa");
        let memory = FeedbackMemory::new(now());

        let ctx = build_context(
            ContextInputs {
                substance: &substance,
                profile: &info,
                history: &history,
                current: &current,
                memory: &memory,
            },
            now(),
            &PolicyConfig::default(),
        )
        .unwrap();

        assert_eq!(ctx.history.len(), 2);
        assert_eq!(ctx.current_details.len(), 1);
        assert_eq!(ctx.current_triggers, vec!["Kawa"]);
        assert_eq!(ctx.locale, "pl-PL");
        assert_eq!(ctx.profile.age, 34);
        assert_eq!(ctx.rolling.craving_3d_avg, 5.0);
    }

    #[test]
    fn empty_report_is_refused() {
        let substance = find_substance("nikotyna").unwrap();
        let info = profile();
        let memory = FeedbackMemory::new(now());
        let current = CravingReport::new().with_symptom("tension", 0);

        let err = build_context(
            ContextInputs {
                substance: &substance,
                profile: &info,
                history: &[],
                current: &current,
                memory: &memory,
            },
            now(),
            &PolicyConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, ReportError::Empty);
    }
}

//! Rolling statistics over the craving log.
//!
//! All functions here are pure: they take the log slice and "now" explicitly
//! and never touch the clock or the store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Timelike, Utc};
use cravewise_schema::{CravingLog, RollingAverages};

use crate::config::PolicyConfig;

/// Days between the recent day and its baseline in `slope_3d`.
const SLOPE_SPAN_DAYS: i64 = 3;

/// Logs with `now - days < timestamp <= now`. A window reaching past the
/// representable range covers the whole log.
pub fn logs_within(logs: &[CravingLog], now: DateTime<Utc>, days: i64) -> Vec<&CravingLog> {
    let start = Duration::try_days(days)
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    logs.iter()
        .filter(|log| log.timestamp() > start && log.timestamp() <= now)
        .collect()
}

fn mean_total(logs: &[&CravingLog]) -> f64 {
    if logs.is_empty() {
        return 0.0;
    }
    let sum: u64 = logs.iter().map(|log| u64::from(log.total_intensity())).sum();
    sum as f64 / logs.len() as f64
}

fn local_date(ts: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    ts.with_timezone(&offset).date_naive()
}

fn local_hour(ts: DateTime<Utc>, offset: FixedOffset) -> u32 {
    ts.with_timezone(&offset).hour()
}

pub fn compute_rolling(
    logs: &[CravingLog],
    now: DateTime<Utc>,
    policy: &PolicyConfig,
) -> RollingAverages {
    let offset = policy.offset();
    let last_3d = logs_within(logs, now, 3);
    let last_7d = logs_within(logs, now, 7);

    let evening_peak_ratio = if last_7d.is_empty() {
        0.0
    } else {
        let evening = last_7d
            .iter()
            .filter(|log| local_hour(log.timestamp(), offset) >= policy.evening_start_hour)
            .count();
        evening as f64 / last_7d.len() as f64
    };

    RollingAverages {
        craving_3d_avg: mean_total(&last_3d),
        craving_7d_avg: mean_total(&last_7d),
        slope_3d: slope_3d(logs, &last_7d, now, offset),
        evening_peak_ratio,
    }
}

/// Per-day change between the newest logged day in the last week and the
/// day three days before it. Zero when either day has no logs.
fn slope_3d(
    logs: &[CravingLog],
    last_7d: &[&CravingLog],
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> f64 {
    let Some(newest) = last_7d.iter().map(|log| log.timestamp()).max() else {
        return 0.0;
    };

    let mut by_day: BTreeMap<NaiveDate, Vec<&CravingLog>> = BTreeMap::new();
    for log in logs.iter().filter(|log| log.timestamp() <= now) {
        by_day
            .entry(local_date(log.timestamp(), offset))
            .or_default()
            .push(log);
    }

    let recent_day = local_date(newest, offset);
    let baseline_day = recent_day - Duration::days(SLOPE_SPAN_DAYS);
    match (by_day.get(&recent_day), by_day.get(&baseline_day)) {
        (Some(recent), Some(baseline)) => {
            (mean_total(recent) - mean_total(baseline)) / SLOPE_SPAN_DAYS as f64
        }
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrendReason {
    RisingSlope { slope: f64, threshold: f64 },
    EveningPeak { ratio: f64, logs: usize },
}

impl fmt::Display for TrendReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RisingSlope { slope, threshold } => write!(
                f,
                "total intensity rising by {slope:.1}/day over 3 days (threshold {threshold:.1})"
            ),
            Self::EveningPeak { ratio, logs } => write!(
                f,
                "{:.0}% of the last {logs} cravings happened in the evening",
                ratio * 100.0
            ),
        }
    }
}

/// Request-side verdict on whether the recent history looks like a worsening trend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendAssessment {
    pub reasons: Vec<TrendReason>,
}

impl TrendAssessment {
    pub fn is_flagged(&self) -> bool {
        !self.reasons.is_empty()
    }
}

pub fn assess_trend(
    rolling: &RollingAverages,
    logs: &[CravingLog],
    now: DateTime<Utc>,
    policy: &PolicyConfig,
) -> TrendAssessment {
    let mut reasons = Vec::new();

    if rolling.slope_3d >= policy.trend_slope_threshold {
        reasons.push(TrendReason::RisingSlope {
            slope: rolling.slope_3d,
            threshold: policy.trend_slope_threshold,
        });
    }

    let week = logs_within(logs, now, 7).len();
    if week >= policy.evening_min_logs
        && rolling.evening_peak_ratio >= policy.evening_ratio_threshold
    {
        reasons.push(TrendReason::EveningPeak {
            ratio: rolling.evening_peak_ratio,
            logs: week,
        });
    }

    TrendAssessment { reasons }
}

/// Heatmap bucket for a timestamp's local hour.
pub fn time_slot(ts: DateTime<Utc>, offset: FixedOffset) -> &'static str {
    match local_hour(ts, offset) {
        0..=5 => "night",
        6..=11 => "morning",
        12..=17 => "afternoon",
        _ => "evening",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cravewise_schema::CravingReport;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    fn log_at(ts: DateTime<Utc>, total: u8) -> CravingLog {
        CravingLog::from_report(&CravingReport::new().with_symptom("tension", total), ts).unwrap()
    }

    fn days_ago(days: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15 - days, hour, 0, 0).unwrap()
    }

    #[test]
    fn empty_log_gives_all_zero_stats() {
        let rolling = compute_rolling(&[], now(), &PolicyConfig::default());
        assert_eq!(rolling, RollingAverages::default());
        assert!(!assess_trend(&rolling, &[], now(), &PolicyConfig::default()).is_flagged());
    }

    #[test]
    fn logs_on_a_single_day_have_zero_slope() {
        let logs = vec![log_at(days_ago(0, 9), 6), log_at(days_ago(0, 8), 2)];
        let rolling = compute_rolling(&logs, now(), &PolicyConfig::default());
        assert_eq!(rolling.slope_3d, 0.0);
        assert_eq!(rolling.craving_3d_avg, 4.0);
        assert_eq!(rolling.craving_7d_avg, 4.0);
    }

    #[test]
    fn averages_respect_trailing_windows() {
        let logs = vec![
            log_at(days_ago(1, 10), 9),
            log_at(days_ago(5, 10), 3),
            log_at(days_ago(10, 10), 10),
        ];
        let rolling = compute_rolling(&logs, now(), &PolicyConfig::default());
        assert_eq!(rolling.craving_3d_avg, 9.0);
        assert_eq!(rolling.craving_7d_avg, 6.0);
    }

    #[test]
    fn future_logs_are_ignored() {
        let logs = vec![log_at(now() + Duration::hours(2), 10), log_at(days_ago(0, 8), 4)];
        let rolling = compute_rolling(&logs, now(), &PolicyConfig::default());
        assert_eq!(rolling.craving_3d_avg, 4.0);
    }

    #[test]
    fn slope_compares_recent_day_with_three_days_earlier() {
        let logs = vec![
            log_at(days_ago(0, 9), 10),
            log_at(days_ago(0, 10), 8),
            log_at(days_ago(3, 9), 3),
        ];
        let rolling = compute_rolling(&logs, now(), &PolicyConfig::default());
        assert_eq!(rolling.slope_3d, 2.0);
    }

    #[test]
    fn evening_ratio_uses_local_hour() {
        let logs = vec![
            log_at(days_ago(1, 17), 2),
            log_at(days_ago(2, 19), 2),
            log_at(days_ago(3, 8), 2),
            log_at(days_ago(4, 20), 2),
        ];
        let utc = compute_rolling(&logs, now(), &PolicyConfig::default());
        assert_eq!(utc.evening_peak_ratio, 0.5);

        // 17:00 UTC is 19:00 at +02:00
        let policy = PolicyConfig {
            utc_offset_minutes: 120,
            ..PolicyConfig::default()
        };
        let shifted = compute_rolling(&logs, now(), &policy);
        assert_eq!(shifted.evening_peak_ratio, 0.75);
        assert!(assess_trend(&shifted, &logs, now(), &policy).is_flagged());
    }

    #[test]
    fn rising_totals_are_flagged() {
        let mut logs: Vec<CravingLog> = (4..14).map(|d| log_at(days_ago(d, 9), 10)).collect();
        logs.push(log_at(days_ago(3, 9), 10));
        logs.push(log_at(days_ago(2, 9), 30));
        logs.push(log_at(days_ago(1, 9), 55));
        logs.push(log_at(days_ago(0, 9), 80));

        let policy = PolicyConfig::default();
        let rolling = compute_rolling(&logs, now(), &policy);
        assert!((rolling.slope_3d - 70.0 / 3.0).abs() < 1e-9);

        let trend = assess_trend(&rolling, &logs, now(), &policy);
        assert!(trend.is_flagged());
        assert!(matches!(trend.reasons[0], TrendReason::RisingSlope { .. }));
    }

    #[test]
    fn evening_peak_needs_minimum_sample() {
        let logs = vec![log_at(days_ago(1, 21), 2), log_at(days_ago(2, 22), 2)];
        let policy = PolicyConfig::default();
        let rolling = compute_rolling(&logs, now(), &policy);
        assert_eq!(rolling.evening_peak_ratio, 1.0);
        assert!(!assess_trend(&rolling, &logs, now(), &policy).is_flagged());
    }

    #[test]
    fn time_slots_cover_the_day() {
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(time_slot(days_ago(0, 3), utc), "night");
        assert_eq!(time_slot(days_ago(0, 6), utc), "morning");
        assert_eq!(time_slot(days_ago(0, 12), utc), "afternoon");
        assert_eq!(time_slot(days_ago(0, 23), utc), "evening");
    }

    #[test]
    fn oversized_window_covers_everything() {
        let logs = vec![log_at(days_ago(1, 9), 5), log_at(days_ago(10, 9), 3)];
        assert_eq!(logs_within(&logs, now(), i64::MAX).len(), 2);
        assert_eq!(logs_within(&logs, now(), 2).len(), 1);
    }
}

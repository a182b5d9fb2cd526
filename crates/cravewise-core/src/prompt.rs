use cravewise_provider::{LlmRequest, ResponseFormat};
use cravewise_schema::AI_RESPONSE;
use serde::Serialize;

use crate::context::RequestContext;

pub const SYSTEM_INSTRUCTIONS: &str = "\
You are a craving-support assistant. Your role is motivation, psychoeducation, short \
actionable micro-plans and pattern analysis of the user's own history and feedback.
You do not diagnose and you do not give medical advice. If anything in the context \
suggests risk to life or health, set crisis.is_flagged=true, give a short calm message \
and list emergency hotlines (116 123, 112) instead of a plan.

Personalise using the supplied profile, history window and feedback memory: what helped, \
what did not, typical triggers, times of day and symptom trajectory. Prefer strategies \
with a high avg_help. Never recommend a strategy tagged not_effective.

After the plan you may ask 1-2 short follow-up questions that help tailor future advice. \
Questions must be simple and closed (type single or multi, at most 4 options) or a short \
text input (type text).

Watch for worrying trends (total intensity rising for 3+ days, evening peaks, a strategy \
that stopped working). When the supplied trend verdict is flagged, fill trend_warning with \
an empathetic, concrete message and one suggested adjustment.

Reply with JSON only, exactly matching the response schema. No markdown, no prose.";

fn json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Render the request context as the developer message.
pub fn render_context(ctx: &RequestContext) -> String {
    let mut memory = ctx.memory.clone();
    memory.processed_feedback.clear();

    let mut out = String::from("APP_CONTEXT:\n");
    out.push_str(&format!("- Substance: {}\n", json(&ctx.substance.name)));
    out.push_str(&format!("- AbstinenceClock: {}\n", json(&ctx.abstinence_clock)));
    out.push_str(&format!("- TodayDiary: {}\n", json(&ctx.current_details)));
    out.push_str(&format!("- TodayTriggers: {}\n", json(&ctx.current_triggers)));
    out.push_str(&format!("- HistoryWindow14d: {}\n", json(&ctx.history)));
    out.push_str(&format!("- FeedbackMemory: {}\n", json(&memory)));
    out.push_str(&format!("- UserProfile: {}\n", json(&ctx.profile)));
    out.push_str(&format!("- Locale: {}\n", json(&ctx.locale)));

    let r = &ctx.rolling;
    let arrow = if r.slope_3d > 0.0 {
        "↑"
    } else if r.slope_3d < 0.0 {
        "↓"
    } else {
        "→"
    };
    out.push_str("\nROLLING_STATS:\n");
    out.push_str(&format!("- craving_3d_avg: {:.2}\n", r.craving_3d_avg));
    out.push_str(&format!("- craving_7d_avg: {:.2}\n", r.craving_7d_avg));
    out.push_str(&format!("- slope_3d: {:+.2} per day ({arrow})\n", r.slope_3d));
    out.push_str(&format!("- evening_peak_ratio: {:.2}\n", r.evening_peak_ratio));

    out.push_str("\nTREND_VERDICT:\n");
    if ctx.trend.is_flagged() {
        out.push_str("- flagged: true\n");
        for reason in &ctx.trend.reasons {
            out.push_str(&format!("- reason: {reason}\n"));
        }
    } else {
        out.push_str("- flagged: false\n");
    }

    let avoid = memory.not_effective_strategies();
    if !avoid.is_empty() {
        out.push_str(&format!("\nAVOID_STRATEGIES: {}\n", json(&avoid)));
    }

    out.push_str("\nTASK:\n");
    out.push_str("1) Compare today's state with the rolling averages (↑/↓).\n");
    out.push_str("2) Give 1-2 plan steps matched to what worked in FeedbackMemory.\n");
    out.push_str("3) Map 2+ triggers to strategies, skipping AVOID_STRATEGIES.\n");
    out.push_str("4) Add one reflection question and one motivating sentence.\n");
    out.push_str(&format!(
        "5) Ask at most {} follow-up question(s).\n",
        ctx.max_followup_questions
    ));
    out.push_str(
        "6) If TREND_VERDICT is flagged, fill trend_warning; otherwise set is_flagged=false.\n",
    );
    out.push_str("7) On crisis signals set crisis.is_flagged=true with a message and hotlines.\n");
    out.push_str(&format!(
        "Write every user-facing string in the language of locale {}.\n",
        ctx.locale
    ));
    out
}

/// Assemble the model request: fixed instructions, rendered context and the response schema.
pub fn build_request(ctx: &RequestContext, model: &str, max_tokens: u32) -> LlmRequest {
    let mut request = LlmRequest::simple(
        model.to_string(),
        Some(SYSTEM_INSTRUCTIONS.to_string()),
        render_context(ctx),
    );
    request.max_tokens = max_tokens;
    request.response_format = Some(ResponseFormat::json(AI_RESPONSE.to_json_schema()));
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::context::{build_context, ContextInputs};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use cravewise_schema::{
        find_substance, CravingLog, CravingReport, FeedbackMemory, Gender, StrategyStats,
        StrategyTag, UserInfo,
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    fn context(history: &[CravingLog], memory: &FeedbackMemory) -> RequestContext {
        let substance = find_substance("alkohol").unwrap();
        let info = UserInfo {
            age: 41,
            gender: Gender::Male,
            abstinence_start: now() - Duration::days(20),
            allow_anonymous_collection: true,
            triggers: vec![],
        };
        let current = CravingReport::new().with_symptom("tension", 7).with_trigger("Stres");
        build_context(
            ContextInputs {
                substance: &substance,
                profile: &info,
                history,
                current: &current,
                memory,
            },
            now(),
            &PolicyConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn request_carries_schema_and_instructions() {
        let ctx = context(&[], &FeedbackMemory::new(now()));
        let request = build_request(&ctx, "gemini-2.5-flash", 1024);

        assert_eq!(request.model, "gemini-2.5-flash");
        assert_eq!(request.max_tokens, 1024);
        assert_eq!(request.system.as_deref(), Some(SYSTEM_INSTRUCTIONS));
        let format = request.response_format.unwrap();
        assert_eq!(format.mime_type, "application/json");
        assert_eq!(format.schema, AI_RESPONSE.to_json_schema());
        assert_eq!(request.messages.len(), 1);
        assert!(request.messages[0].text.contains("\"Alkohol\""));
        assert!(request.messages[0].text.contains("20d 00h 00m"));
    }

    #[test]
    fn context_lists_not_effective_strategies_and_hides_bookkeeping() {
        let mut memory = FeedbackMemory::new(now());
        memory.strategy_effectiveness.insert(
            "Spacer".into(),
            StrategyStats {
                uses: 4,
                avg_help: 0.5,
                last_used: None,
                tag: Some(StrategyTag::NotEffective),
            },
        );
        memory.processed_feedback.insert("2026-03-14T10:00:00+00:00#fq_01".into());

        let text = render_context(&context(&[], &memory));
        assert!(text.contains("AVOID_STRATEGIES: [\"Spacer\"]"));
        assert!(!text.contains("processed_feedback"));
        assert!(text.contains("- flagged: false"));
    }

    #[test]
    fn rising_trend_is_surfaced_with_figures() {
        let mk = |days: i64, total: u8| {
            CravingLog::from_report(
                &CravingReport::new()
                    .with_symptom("tension", total.min(10))
                    .with_symptom("apathy", total.saturating_sub(10)),
                now() - Duration::days(days) - Duration::hours(1),
            )
            .unwrap()
        };
        let history = vec![mk(0, 16), mk(1, 10), mk(2, 8), mk(3, 1)];
        let ctx = context(&history, &FeedbackMemory::new(now()));
        assert!(ctx.trend.is_flagged());

        let text = render_context(&ctx);
        assert!(text.contains("- slope_3d: +5.00 per day (↑)"));
        assert!(text.contains("- flagged: true"));
        assert!(text.contains("rising by 5.0/day"));
    }

    #[test]
    fn sections_appear_in_order_one_item_per_line() {
        let text = render_context(&context(&[], &FeedbackMemory::new(now())));
        let sections: Vec<&str> = text
            .lines()
            .filter(|line| line.ends_with(':') && !line.starts_with('-'))
            .collect();
        assert_eq!(
            sections,
            vec!["APP_CONTEXT:", "ROLLING_STATS:", "TREND_VERDICT:", "TASK:"]
        );
        assert!(text.ends_with("locale pl-PL.\n"));
        assert!(!text.contains("AVOID_STRATEGIES"));
    }
}

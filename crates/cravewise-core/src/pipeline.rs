use std::sync::Arc;

use chrono::{DateTime, Utc};
use cravewise_provider::ModelClient;
use cravewise_schema::{
    CravingLog, CravingReport, FeedbackMemory, FollowupSubmission, PendingFollowup, ReportError,
    UserRecord,
};

use crate::analytics::{anonymous_id, build_anonymous_feedback, FeedbackSink, LogSink};
use crate::config::{CravewiseConfig, PolicyConfig};
use crate::context::{build_context, ContextInputs};
use crate::feedback::{apply_followup, refresh_rolling};
use crate::prompt::build_request;
use crate::session::SessionStore;
use crate::stats::logs_within;
use crate::validator::{route, FallbackReason, RoutedResponse};

#[derive(Debug, thiserror::Error)]
pub enum CopingError {
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("a coping plan is already being generated for {0}")]
    InFlight(String),
    #[error("no substance and profile set up for {0}")]
    MissingProfile(String),
    #[error("no plan is awaiting follow-up for {0}")]
    NoPendingFollowup(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Result of one craving report.
#[derive(Debug, Clone)]
pub struct CopingOutcome {
    /// The log entry created for the report.
    pub log: CravingLog,
    pub routed: RoutedResponse,
}

#[derive(Debug, Clone)]
pub struct FollowupOutcome {
    pub memory: FeedbackMemory,
    /// Whether an anonymous package was handed to the sink.
    pub exported: bool,
}

pub struct CopingPipeline {
    client: ModelClient,
    sessions: SessionStore,
    policy: PolicyConfig,
    model: String,
    max_tokens: u32,
    sink: Arc<dyn FeedbackSink>,
}

impl CopingPipeline {
    pub fn new(client: ModelClient, sessions: SessionStore, config: &CravewiseConfig) -> Self {
        Self {
            client,
            sessions,
            policy: config.policy.clone(),
            model: config.model.model.clone(),
            max_tokens: config.model.max_tokens,
            sink: Arc::new(LogSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn FeedbackSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Log a craving and produce the reply to show for it.
    ///
    /// The log entry is on durable storage before the model is invoked. Every
    /// failure after that point resolves to the crisis fallback; only an empty
    /// report, a missing profile or a report already in flight are returned as
    /// errors, and in those cases nothing is logged.
    pub async fn handle_report(
        &self,
        user_key: &str,
        report: &CravingReport,
        now: DateTime<Utc>,
    ) -> Result<CopingOutcome, CopingError> {
        report.validate()?;

        let permit = self
            .client
            .reserve(user_key)
            .await
            .map_err(|_| CopingError::InFlight(user_key.to_string()))?;

        let guard = self.sessions.lock(user_key).await;
        let record = self.sessions.load(user_key).await?;
        let (Some(substance), Some(profile)) =
            (record.selected_substance.clone(), record.user_info.clone())
        else {
            return Err(CopingError::MissingProfile(user_key.to_string()));
        };

        let log = CravingLog::from_report(report, now)?;
        let record = record.with_log(log.clone());
        let memory = record
            .feedback_memory
            .clone()
            .unwrap_or_else(|| FeedbackMemory::new(now));
        let record = record.with_memory(refresh_rolling(
            &memory,
            &record.craving_logs,
            now,
            &self.policy,
        ));

        if let Err(e) = self.sessions.save_durable(user_key, &record).await {
            tracing::error!(user_key, error = %e, "failed to persist craving log");
            let routed = RoutedResponse::fallback(FallbackReason::Persistence(format!("{e:#}")));
            return Ok(CopingOutcome { log, routed });
        }
        drop(guard);
        tracing::info!(user_key, total = log.total_intensity(), "craving logged");

        let routed = match self.crisis_keyword(&record, &log, now) {
            Some(keyword) => {
                drop(permit);
                RoutedResponse::fallback(FallbackReason::CrisisKeyword(keyword))
            }
            None => {
                let memory = record
                    .feedback_memory
                    .clone()
                    .unwrap_or_else(|| FeedbackMemory::new(now));
                let ctx = build_context(
                    ContextInputs {
                        substance: &substance,
                        profile: &profile,
                        history: &record.craving_logs,
                        current: report,
                        memory: &memory,
                    },
                    now,
                    &self.policy,
                )?;
                if ctx.trend.is_flagged() {
                    tracing::info!(user_key, reasons = ?ctx.trend.reasons, "trend heuristic flagged");
                }
                let request = build_request(&ctx, &self.model, self.max_tokens);
                route(self.client.generate(permit, request).await)
            }
        };

        self.attach_pending(user_key, &log, &routed).await;
        Ok(CopingOutcome { log, routed })
    }

    /// Crisis keyword in the current report or in any trigger logged within
    /// the history window.
    fn crisis_keyword(
        &self,
        record: &UserRecord,
        current: &CravingLog,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let recent = logs_within(&record.craving_logs, now, self.policy.history_window_days);
        let screened = recent
            .iter()
            .flat_map(|log| log.triggers().iter().map(String::as_str))
            .chain(current.triggers().iter().map(String::as_str))
            .chain(current.details().keys().map(String::as_str));
        self.policy.crisis_keyword_in(screened).map(str::to_string)
    }

    /// Point the pending follow-up at `log`. The record is re-read so updates
    /// made while the model was running are kept.
    async fn attach_pending(&self, user_key: &str, log: &CravingLog, routed: &RoutedResponse) {
        let _guard = self.sessions.lock(user_key).await;
        let record = match self.sessions.load(user_key).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(user_key, error = %e, "failed to reload record for follow-up");
                return;
            }
        };
        if record.log_at(log.timestamp()).is_none() {
            tracing::warn!(user_key, "craving log gone before follow-up could be attached");
            return;
        }
        let record = record.with_pending_followup(Some(PendingFollowup {
            report_timestamp: log.timestamp(),
            response: routed.response.clone(),
        }));
        if let Err(e) = self.sessions.save(user_key, &record).await {
            tracing::error!(user_key, error = %e, "failed to persist pending follow-up");
        }
    }

    /// Fold follow-up answers and strategy ratings into the user's memory.
    ///
    /// The updated memory is persisted before anything is exported. Replaying
    /// a submission is harmless: already-applied items are skipped and nothing
    /// is exported again.
    pub async fn submit_followup(
        &self,
        user_key: &str,
        submission: &FollowupSubmission,
        now: DateTime<Utc>,
    ) -> Result<FollowupOutcome, CopingError> {
        let guard = self.sessions.lock(user_key).await;
        let record = self.sessions.load(user_key).await?;
        let (Some(substance), Some(profile)) = (&record.selected_substance, &record.user_info)
        else {
            return Err(CopingError::MissingProfile(user_key.to_string()));
        };
        let pending = record
            .pending_followup
            .as_ref()
            .ok_or_else(|| CopingError::NoPendingFollowup(user_key.to_string()))?;
        let report = record
            .log_at(pending.report_timestamp)
            .ok_or_else(|| CopingError::NoPendingFollowup(user_key.to_string()))?;

        for question_id in submission.answers.keys() {
            if pending.response.question(question_id).is_none() {
                tracing::warn!(user_key, %question_id, "answer to unknown follow-up question");
            }
        }

        let memory = record
            .feedback_memory
            .clone()
            .unwrap_or_else(|| FeedbackMemory::new(now));
        let next = apply_followup(
            &memory,
            submission,
            report,
            &record.craving_logs,
            now,
            &self.policy,
        );
        let changed = next.processed_feedback != memory.processed_feedback;

        let updated = record.with_memory(next.clone());
        self.sessions.save_durable(user_key, &updated).await?;
        drop(guard);

        let mut exported = false;
        if changed && profile.allow_anonymous_collection {
            exported = self
                .export(&substance.id, report, &pending.response, submission, now)
                .await;
        }
        tracing::info!(user_key, changed, exported, "follow-up applied");

        Ok(FollowupOutcome {
            memory: next,
            exported,
        })
    }

    async fn export(
        &self,
        substance_id: &str,
        report: &CravingLog,
        response: &cravewise_schema::AiResponse,
        submission: &FollowupSubmission,
        now: DateTime<Utc>,
    ) -> bool {
        let id = match anonymous_id(self.sessions.backend()).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "no anonymous id, skipping feedback export");
                return false;
            }
        };
        let package =
            build_anonymous_feedback(id, substance_id, report, Some(response), submission, now);
        match self.sink.send(&package).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "anonymous feedback export failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration as StdDuration;

    use chrono::{Duration, TimeZone};
    use cravewise_memory::{CoalescingStore, InMemoryRecordStore, RecordStore};
    use cravewise_provider::{
        create_provider, LlmProvider, LlmRequest, LlmResponse, ProviderConfig, ProviderError,
        ProviderType, UnconfiguredProvider,
    };
    use cravewise_schema::{
        crisis_fallback, find_substance, AnonymousFeedback, FollowupAnswer, Gender,
        StrategyOutcome, UserInfo,
    };
    use tokio::sync::Mutex;

    use crate::validator::ResponseSource;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    #[derive(Default)]
    struct CapturingSink {
        sent: Mutex<Vec<AnonymousFeedback>>,
    }

    #[async_trait::async_trait]
    impl FeedbackSink for CapturingSink {
        async fn send(&self, feedback: &AnonymousFeedback) -> anyhow::Result<()> {
            self.sent.lock().await.push(feedback.clone());
            Ok(())
        }
    }

    /// Stub replies, each delayed by the next scripted duration.
    struct DelayedProvider {
        inner: Arc<dyn LlmProvider>,
        delays: std::sync::Mutex<Vec<StdDuration>>,
    }

    impl DelayedProvider {
        fn new(mut delays: Vec<StdDuration>) -> Self {
            delays.reverse();
            Self {
                inner: create_provider(&ProviderConfig::new(ProviderType::Stub)).unwrap(),
                delays: std::sync::Mutex::new(delays),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for DelayedProvider {
        async fn chat(&self, request: LlmRequest) -> Result<LlmResponse, ProviderError> {
            let delay = self.delays.lock().unwrap().pop().unwrap_or_default();
            tokio::time::sleep(delay).await;
            self.inner.chat(request).await
        }
    }

    /// Rejects writes while `failing` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryRecordStore,
        failing: AtomicBool,
    }

    #[async_trait::async_trait]
    impl RecordStore for FlakyStore {
        async fn get_raw(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get_raw(key).await
        }

        async fn put_raw(&self, key: &str, value: String) -> anyhow::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.put_raw(key, value).await
        }
    }

    async fn pipeline_with(client: ModelClient, consent: bool) -> CopingPipeline {
        pipeline_on(client, Arc::new(InMemoryRecordStore::new()), consent).await
    }

    async fn pipeline_on(
        client: ModelClient,
        store: Arc<dyn RecordStore>,
        consent: bool,
    ) -> CopingPipeline {
        let sessions = SessionStore::new(store);
        sessions
            .select_substance("u", find_substance("nikotyna").unwrap())
            .await
            .unwrap();
        sessions
            .set_profile(
                "u",
                UserInfo {
                    age: 30,
                    gender: Gender::Female,
                    abstinence_start: now() - Duration::days(3),
                    allow_anonymous_collection: consent,
                    triggers: vec!["Stres".into()],
                },
                now(),
            )
            .await
            .unwrap();
        CopingPipeline::new(client, sessions, &CravewiseConfig::default())
    }

    fn stub_client() -> ModelClient {
        let provider = create_provider(&ProviderConfig::new(ProviderType::Stub)).unwrap();
        ModelClient::new(provider, std::time::Duration::from_secs(5))
    }

    #[tokio::test]
    async fn report_is_logged_and_answered() {
        let pipeline = pipeline_with(stub_client(), false).await;
        let report = CravingReport::new()
            .with_symptom("tension", 8)
            .with_symptom("apathy", 0)
            .with_trigger("Stres");

        let outcome = pipeline.handle_report("u", &report, now()).await.unwrap();
        assert_eq!(outcome.routed.source, ResponseSource::Model);
        assert_eq!(outcome.log.total_intensity(), 8);

        let record = pipeline.sessions().load("u").await.unwrap();
        assert_eq!(record.craving_logs.len(), 1);
        assert_eq!(record.craving_logs[0].details().len(), 1);
        let pending = record.pending_followup.unwrap();
        assert_eq!(pending.report_timestamp, now());
        assert_eq!(pending.response, outcome.routed.response);
        assert_eq!(record.feedback_memory.unwrap().rolling.craving_7d_avg, 8.0);
    }

    #[tokio::test]
    async fn empty_report_is_rejected_without_logging() {
        let pipeline = pipeline_with(stub_client(), false).await;
        let err = pipeline
            .handle_report("u", &CravingReport::new().with_symptom("tension", 0), now())
            .await
            .unwrap_err();
        assert!(matches!(err, CopingError::Report(ReportError::Empty)));
        assert!(pipeline.sessions().load("u").await.unwrap().craving_logs.is_empty());
    }

    #[tokio::test]
    async fn report_without_profile_is_rejected() {
        let sessions = SessionStore::new(Arc::new(InMemoryRecordStore::new()));
        let pipeline = CopingPipeline::new(stub_client(), sessions, &CravewiseConfig::default());
        let err = pipeline
            .handle_report("u", &CravingReport::new().with_symptom("tension", 3), now())
            .await
            .unwrap_err();
        assert!(matches!(err, CopingError::MissingProfile(_)));
    }

    #[tokio::test]
    async fn crisis_keyword_skips_the_model() {
        let client = ModelClient::new(
            Arc::new(UnconfiguredProvider::new("must not be called")),
            std::time::Duration::from_secs(5),
        );
        let pipeline = pipeline_with(client, false).await;
        let report = CravingReport::new()
            .with_symptom("anxiety", 9)
            .with_trigger("Myśli samobójcze");

        let outcome = pipeline.handle_report("u", &report, now()).await.unwrap();
        assert!(matches!(
            outcome.routed.source,
            ResponseSource::Fallback(FallbackReason::CrisisKeyword(_))
        ));
        assert_eq!(outcome.routed.response, crisis_fallback());
        assert_eq!(pipeline.sessions().load("u").await.unwrap().craving_logs.len(), 1);
    }

    #[tokio::test]
    async fn missing_configuration_serves_fallback_but_keeps_the_log() {
        let client = ModelClient::new(
            Arc::new(UnconfiguredProvider::new("no api key")),
            std::time::Duration::from_secs(5),
        );
        let pipeline = pipeline_with(client, false).await;
        let outcome = pipeline
            .handle_report("u", &CravingReport::new().with_symptom("tension", 5), now())
            .await
            .unwrap();
        assert!(matches!(
            outcome.routed.source,
            ResponseSource::Fallback(FallbackReason::Configuration(_))
        ));
        assert_eq!(pipeline.sessions().load("u").await.unwrap().craving_logs.len(), 1);
    }

    #[tokio::test]
    async fn followup_needs_a_pending_plan() {
        let pipeline = pipeline_with(stub_client(), false).await;
        let err = pipeline
            .submit_followup("u", &FollowupSubmission::default(), now())
            .await
            .unwrap_err();
        assert!(matches!(err, CopingError::NoPendingFollowup(_)));
    }

    #[tokio::test]
    async fn followup_is_exported_once_with_consent() {
        let sink = Arc::new(CapturingSink::default());
        let pipeline = pipeline_with(stub_client(), true)
            .await
            .with_sink(sink.clone());
        let report = CravingReport::new()
            .with_symptom("tension", 6)
            .with_trigger("Stres");
        pipeline.handle_report("u", &report, now()).await.unwrap();

        let mut submission = FollowupSubmission::default();
        submission
            .answers
            .insert("fq_01".into(), FollowupAnswer::One("Tak".into()));
        submission.outcomes.push(StrategyOutcome {
            strategy: "Spacer".into(),
            help: 3,
        });

        let later = now() + Duration::minutes(30);
        let first = pipeline.submit_followup("u", &submission, later).await.unwrap();
        let second = pipeline.submit_followup("u", &submission, later).await.unwrap();

        assert!(first.exported);
        assert!(!second.exported);
        assert_eq!(second.memory.strategy_effectiveness["Spacer"].uses, 1);
        assert_eq!(second.memory.trigger_map["Stres"].top_strategy, "Spacer");

        let sent = sink.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].problem.substance_id, "nikotyna");
        assert!(sent[0].anonymous_user_id.starts_with("anon_"));
        assert_eq!(
            pipeline
                .sessions()
                .backend()
                .get_raw(crate::analytics::ANONYMOUS_ID_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some(sent[0].anonymous_user_id.as_str())
        );
    }

    #[tokio::test]
    async fn followup_without_consent_is_not_exported() {
        let sink = Arc::new(CapturingSink::default());
        let pipeline = pipeline_with(stub_client(), false)
            .await
            .with_sink(sink.clone());
        pipeline
            .handle_report("u", &CravingReport::new().with_symptom("tension", 4), now())
            .await
            .unwrap();
        let mut submission = FollowupSubmission::default();
        submission
            .answers
            .insert("fq_01".into(), FollowupAnswer::One("Nie".into()));

        let outcome = pipeline.submit_followup("u", &submission, now()).await.unwrap();
        assert!(!outcome.exported);
        assert!(sink.sent.lock().await.is_empty());
    }

    fn rated_walk() -> FollowupSubmission {
        let mut submission = FollowupSubmission::default();
        submission
            .answers
            .insert("fq_01".into(), FollowupAnswer::One("Tak".into()));
        submission.outcomes.push(StrategyOutcome {
            strategy: "Spacer".into(),
            help: 3,
        });
        submission
    }

    #[tokio::test(start_paused = true)]
    async fn log_reaches_storage_before_the_model_answers() {
        let buffered = Arc::new(CoalescingStore::new(
            InMemoryRecordStore::new(),
            StdDuration::from_secs(3600),
        ));
        let client = ModelClient::new(
            Arc::new(DelayedProvider::new(vec![StdDuration::from_secs(30)])),
            StdDuration::from_secs(60),
        );
        let pipeline = Arc::new(pipeline_on(client, buffered.clone(), false).await);

        let running = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let report = CravingReport::new().with_symptom("tension", 7);
                pipeline.handle_report("u", &report, now()).await
            })
        };
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        assert!(!running.is_finished());

        let stored = buffered.inner().get("u").await.unwrap().unwrap();
        assert_eq!(stored.craving_logs.len(), 1);
        assert_eq!(stored.craving_logs[0].total_intensity(), 7);

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome.routed.source, ResponseSource::Model);
    }

    #[tokio::test]
    async fn unwritable_log_serves_the_persistence_fallback() {
        let store = Arc::new(FlakyStore::default());
        let pipeline = pipeline_on(stub_client(), store.clone(), false).await;
        store.failing.store(true, Ordering::SeqCst);

        let outcome = pipeline
            .handle_report("u", &CravingReport::new().with_symptom("tension", 5), now())
            .await
            .unwrap();
        assert!(matches!(
            outcome.routed.source,
            ResponseSource::Fallback(FallbackReason::Persistence(_))
        ));
        assert!(pipeline.sessions().load("u").await.unwrap().craving_logs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn followup_sent_during_generation_is_kept() {
        let client = ModelClient::new(
            Arc::new(DelayedProvider::new(vec![
                StdDuration::ZERO,
                StdDuration::from_secs(10),
            ])),
            StdDuration::from_secs(60),
        );
        let pipeline = Arc::new(pipeline_with(client, false).await);
        let first = CravingReport::new()
            .with_symptom("tension", 6)
            .with_trigger("Stres");
        pipeline.handle_report("u", &first, now()).await.unwrap();

        let later = now() + Duration::hours(1);
        let running = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                let report = CravingReport::new().with_symptom("tension", 4);
                pipeline.handle_report("u", &report, later).await
            })
        };
        tokio::time::sleep(StdDuration::from_secs(1)).await;
        assert!(!running.is_finished());

        pipeline
            .submit_followup("u", &rated_walk(), now() + Duration::minutes(30))
            .await
            .unwrap();
        running.await.unwrap().unwrap();

        let record = pipeline.sessions().load("u").await.unwrap();
        assert_eq!(record.craving_logs.len(), 2);
        assert_eq!(record.pending_followup.unwrap().report_timestamp, later);
        let memory = record.feedback_memory.unwrap();
        assert_eq!(memory.strategy_effectiveness["Spacer"].uses, 1);
    }

    #[tokio::test]
    async fn followup_is_exported_only_after_it_is_saved() {
        let store = Arc::new(FlakyStore::default());
        let sink = Arc::new(CapturingSink::default());
        let pipeline = pipeline_on(stub_client(), store.clone(), true)
            .await
            .with_sink(sink.clone());
        let report = CravingReport::new()
            .with_symptom("tension", 6)
            .with_trigger("Stres");
        pipeline.handle_report("u", &report, now()).await.unwrap();
        let later = now() + Duration::minutes(30);

        store.failing.store(true, Ordering::SeqCst);
        let err = pipeline
            .submit_followup("u", &rated_walk(), later)
            .await
            .unwrap_err();
        assert!(matches!(err, CopingError::Store(_)));
        assert!(sink.sent.lock().await.is_empty());

        store.failing.store(false, Ordering::SeqCst);
        let outcome = pipeline
            .submit_followup("u", &rated_walk(), later)
            .await
            .unwrap();
        assert!(outcome.exported);
        assert_eq!(sink.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn recent_crisis_trigger_is_screened_on_later_reports() {
        let client = ModelClient::new(
            Arc::new(UnconfiguredProvider::new("no api key")),
            StdDuration::from_secs(5),
        );
        let pipeline = pipeline_with(client, false).await;
        let crisis = CravingReport::new()
            .with_symptom("anxiety", 9)
            .with_trigger("Myśli samobójcze");
        pipeline.handle_report("u", &crisis, now()).await.unwrap();

        let benign = CravingReport::new().with_symptom("tension", 3);
        let next_day = pipeline
            .handle_report("u", &benign, now() + Duration::days(1))
            .await
            .unwrap();
        assert!(matches!(
            next_day.routed.source,
            ResponseSource::Fallback(FallbackReason::CrisisKeyword(_))
        ));

        let weeks_later = pipeline
            .handle_report("u", &benign, now() + Duration::days(20))
            .await
            .unwrap();
        assert!(matches!(
            weeks_later.routed.source,
            ResponseSource::Fallback(FallbackReason::Configuration(_))
        ));
    }
}

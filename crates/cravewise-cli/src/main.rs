use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cravewise_core::*;
use cravewise_memory::{CoalescingStore, RecordStore, SqliteRecordStore};
use cravewise_provider::{create_provider, LlmProvider, ModelClient, UnconfiguredProvider};
use cravewise_schema::{
    find_substance, symptom_label, CravingReport, FollowupAnswer, FollowupSubmission, Gender,
    ResponseView, StrategyOutcome, UserInfo, SUBSTANCE_PRESETS,
};

#[derive(Parser)]
#[command(name = "cravewise", version, about = "Craving support with personalised coping plans")]
struct Cli {
    #[arg(long, default_value = "cravewise.yaml", help = "Path to the YAML config file")]
    config: PathBuf,

    #[arg(long, default_value = "default", help = "User key the record is stored under")]
    user: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List supported substances")]
    Substances,
    #[command(about = "Select a substance and set up the profile")]
    Init {
        #[arg(help = "Substance id, see `cravewise substances`")]
        substance: String,
        #[arg(long)]
        age: u16,
        #[arg(long, value_parser = parse_gender, default_value = "prefer_not_to_say")]
        gender: Gender,
        #[arg(long, value_parser = parse_instant, help = "RFC 3339 timestamp or YYYY-MM-DD; defaults to now")]
        abstinence_start: Option<DateTime<Utc>>,
        #[arg(long, help = "Allow anonymous feedback collection")]
        consent: bool,
        #[arg(long = "trigger", help = "Known trigger, repeatable")]
        triggers: Vec<String>,
    },
    #[command(about = "Log a craving and get a coping plan")]
    Report {
        #[arg(long = "symptom", value_parser = parse_rating, help = "key=intensity (0-10), repeatable")]
        symptoms: Vec<(String, u8)>,
        #[arg(long = "trigger", help = "Trigger, repeatable")]
        triggers: Vec<String>,
    },
    #[command(about = "Answer the follow-up questions of the last plan")]
    Followup {
        #[arg(long = "answer", value_parser = parse_answer, help = "question_id=value, repeat for multi-choice")]
        answers: Vec<(String, String)>,
        #[arg(long = "rate", value_parser = parse_rating, help = "strategy=help (0-3), repeatable")]
        ratings: Vec<(String, u8)>,
    },
    #[command(about = "Show logged cravings")]
    History {
        #[arg(
            long,
            default_value = "14",
            value_parser = clap::value_parser!(i64).range(1..=36_500),
            help = "How many days back to show"
        )]
        days: i64,
    },
    #[command(about = "Show abstinence clock, rolling stats and strategy report")]
    Status,
    #[command(about = "Validate the config file")]
    CheckConfig,
}

fn parse_gender(raw: &str) -> Result<Gender, String> {
    match raw.trim().to_lowercase().as_str() {
        "male" | "m" => Ok(Gender::Male),
        "female" | "f" => Ok(Gender::Female),
        "other" => Ok(Gender::Other),
        "prefer_not_to_say" | "none" => Ok(Gender::PreferNotToSay),
        other => Err(format!(
            "unknown gender '{other}', expected male, female, other or prefer_not_to_say"
        )),
    }
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("'{raw}' is neither RFC 3339 nor YYYY-MM-DD"))
}

fn split_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn parse_rating(raw: &str) -> Result<(String, u8), String> {
    let (key, value) = split_pair(raw)?;
    let value = value
        .parse::<u8>()
        .map_err(|_| format!("'{value}' is not a number in '{raw}'"))?;
    Ok((key, value))
}

fn parse_answer(raw: &str) -> Result<(String, String), String> {
    split_pair(raw)
}

/// Repeated answers to the same question become a multi-choice answer.
fn collect_answers(pairs: Vec<(String, String)>) -> BTreeMap<String, FollowupAnswer> {
    let mut answers: BTreeMap<String, FollowupAnswer> = BTreeMap::new();
    for (id, value) in pairs {
        let next = match answers.remove(&id) {
            None => FollowupAnswer::One(value),
            Some(FollowupAnswer::One(first)) => FollowupAnswer::Many(vec![first, value]),
            Some(FollowupAnswer::Many(mut all)) => {
                all.push(value);
                FollowupAnswer::Many(all)
            }
        };
        answers.insert(id, next);
    }
    answers
}

fn log_dir(config: &CravewiseConfig) -> PathBuf {
    match config.storage.path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join("logs"),
        _ => PathBuf::from("logs"),
    }
}

fn build_provider(config: &CravewiseConfig) -> Arc<dyn LlmProvider> {
    match create_provider(&config.model.provider_config()) {
        Ok(provider) => provider,
        Err(e) => {
            tracing::warn!(error = %e, "model provider unavailable, plans will fall back");
            Arc::new(UnconfiguredProvider::new(e.to_string()))
        }
    }
}

fn build_sink(config: &CravewiseConfig) -> Arc<dyn FeedbackSink> {
    match &config.analytics.endpoint {
        Some(endpoint) => Arc::new(HttpSink::new(endpoint.clone())),
        None => Arc::new(LogSink),
    }
}

fn open_store(path: &Path, config: &CravewiseConfig) -> Result<CoalescingStore<SqliteRecordStore>> {
    let sqlite = SqliteRecordStore::open(path)
        .with_context(|| format!("failed to open record store at {}", path.display()))?;
    Ok(CoalescingStore::new(sqlite, config.storage.write_quiescence()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let log_dir = log_dir(&config);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "cravewise.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    match command {
        Commands::Substances => {
            println!("{:<14} {:<16} DESCRIPTION", "ID", "NAME");
            println!("{}", "-".repeat(80));
            for preset in SUBSTANCE_PRESETS {
                println!("{:<14} {:<16} {}", preset.id, preset.name, preset.description);
            }
            Ok(())
        }
        Commands::CheckConfig => {
            let key_state = match config.model.provider_config().api_key {
                Some(_) => "set",
                None => "missing",
            };
            println!("Config valid.");
            println!(
                "Model: {:?} {} (api key {key_state}, timeout {}s, {} attempt(s))",
                config.model.provider_type,
                config.model.model,
                config.model.timeout_secs,
                config.model.retry.max_attempts
            );
            println!("Storage: {}", config.storage.path.display());
            println!(
                "Analytics: {}",
                config.analytics.endpoint.as_deref().unwrap_or("log only")
            );
            Ok(())
        }
        command => {
            let store = Arc::new(open_store(&config.storage.path, &config)?);
            let backend: Arc<dyn RecordStore> = store.clone();
            let client = ModelClient::new(build_provider(&config), config.model.timeout())
                .with_retry(config.model.retry_policy());
            let pipeline = CopingPipeline::new(client, SessionStore::new(backend), &config)
                .with_sink(build_sink(&config));

            let result = run(command, &cli.user, &pipeline).await;
            store
                .shutdown()
                .await
                .context("failed to flush pending writes")?;
            result
        }
    }
}

async fn run(command: Commands, user: &str, pipeline: &CopingPipeline) -> Result<()> {
    let now = Utc::now();
    let sessions = pipeline.sessions();
    match command {
        Commands::Init {
            substance,
            age,
            gender,
            abstinence_start,
            consent,
            triggers,
        } => {
            let substance = find_substance(&substance).ok_or_else(|| {
                anyhow!("unknown substance '{substance}', see `cravewise substances`")
            })?;
            let name = substance.name.clone();
            sessions.select_substance(user, substance).await?;
            let info = UserInfo {
                age,
                gender,
                abstinence_start: abstinence_start.unwrap_or(now),
                allow_anonymous_collection: consent,
                triggers,
            };
            let record = sessions.set_profile(user, info, now).await?;
            println!("Tracking {name} for '{user}'.");
            if let Some(info) = &record.user_info {
                println!(
                    "Abstinence clock: {}",
                    abstinence_clock(info.abstinence_start, now)
                );
            }
        }
        Commands::Report { symptoms, triggers } => {
            let mut report = CravingReport::new();
            for (key, intensity) in symptoms {
                report = report.with_symptom(key, intensity);
            }
            for trigger in triggers {
                report = report.with_trigger(trigger);
            }
            let outcome = match pipeline.handle_report(user, &report, now).await {
                Ok(outcome) => outcome,
                Err(CopingError::Report(e)) => return Err(anyhow!("nothing logged: {e}")),
                Err(e) => return Err(e.into()),
            };
            println!(
                "Logged craving at {} (total intensity {}).\n",
                outcome
                    .log
                    .timestamp()
                    .with_timezone(&pipeline.policy().offset())
                    .format("%Y-%m-%d %H:%M"),
                outcome.log.total_intensity()
            );
            print_response(&outcome.routed);
        }
        Commands::Followup { answers, ratings } => {
            let submission = FollowupSubmission {
                answers: collect_answers(answers),
                outcomes: ratings
                    .into_iter()
                    .map(|(strategy, help)| StrategyOutcome { strategy, help })
                    .collect(),
            };
            let outcome = pipeline.submit_followup(user, &submission, now).await?;
            println!("Thanks, feedback saved.");
            if outcome.exported {
                println!("Anonymous feedback shared.");
            }
            print_strategy_report(&outcome.memory);
        }
        Commands::History { days } => {
            let record = sessions.load(user).await?;
            let substance_id = record
                .selected_substance
                .as_ref()
                .map(|s| s.id.clone())
                .unwrap_or_default();
            let offset = pipeline.policy().offset();
            let logs = logs_within(&record.craving_logs, now, days);
            if logs.is_empty() {
                println!("No cravings logged in the last {days} days.");
                return Ok(());
            }
            for log in logs {
                let details: Vec<String> = log
                    .details()
                    .iter()
                    .map(|(key, value)| format!("{}: {value}", symptom_label(key, &substance_id)))
                    .collect();
                println!(
                    "{}  total {:>3}  {}",
                    log.timestamp().with_timezone(&offset).format("%Y-%m-%d %H:%M"),
                    log.total_intensity(),
                    details.join(", ")
                );
                if !log.triggers().is_empty() {
                    println!("{:>18}  triggers: {}", "", log.triggers().join(", "));
                }
            }
        }
        Commands::Status => {
            let record = sessions.load(user).await?;
            let (Some(substance), Some(info)) = (&record.selected_substance, &record.user_info)
            else {
                println!("No profile for '{user}'. Run `cravewise init` first.");
                return Ok(());
            };
            let d = abstinence_duration(info.abstinence_start, now);
            println!("Substance: {}", substance.name);
            println!(
                "Abstinence: {} days {} hours {} minutes {} seconds",
                d.days, d.hours, d.minutes, d.seconds
            );
            println!("Logged cravings: {}", record.craving_logs.len());
            if let Some(memory) = &record.feedback_memory {
                let r = &memory.rolling;
                println!(
                    "Rolling: 3d avg {:.2}, 7d avg {:.2}, slope {:+.2}/day, evening ratio {:.2}",
                    r.craving_3d_avg, r.craving_7d_avg, r.slope_3d, r.evening_peak_ratio
                );
                print_strategy_report(memory);
            }
            if let Some(pending) = &record.pending_followup {
                if !pending.response.followup_questions.is_empty() {
                    println!("\nFollow-up questions are waiting, see `cravewise followup`.");
                }
            }
        }
        Commands::Substances | Commands::CheckConfig => {}
    }
    Ok(())
}

fn print_response(routed: &RoutedResponse) {
    match routed.view() {
        ResponseView::Crisis { message, hotlines } => {
            println!("!! {message}");
            for hotline in hotlines {
                println!("   - {hotline}");
            }
        }
        ResponseView::Plan {
            summary,
            insight,
            plan,
            if_trigger_then_strategy,
            motivation,
            reflect_question,
            followup_questions,
            trend_warning,
        } => {
            println!("{summary}\n{insight}\n");
            for (i, step) in plan.iter().enumerate() {
                println!("{}. {} ({})", i + 1, step.step, step.duration);
                println!("   {}", step.why);
            }
            if !if_trigger_then_strategy.is_empty() {
                println!();
                for pair in if_trigger_then_strategy {
                    println!("If {} -> {}", pair.trigger, pair.strategy);
                }
            }
            if let Some(warning) = trend_warning {
                println!("\nTrend: {}", warning.message);
                if !warning.suggested_adjustment.is_empty() {
                    println!("Try: {}", warning.suggested_adjustment);
                }
            }
            println!("\n{motivation}\n{reflect_question}");
            if !followup_questions.is_empty() {
                println!();
                for q in followup_questions {
                    let options = q.options();
                    if options.is_empty() {
                        println!("[{}] {} ({})", q.id(), q.question(), q.kind());
                    } else {
                        println!(
                            "[{}] {} ({}: {})",
                            q.id(),
                            q.question(),
                            q.kind(),
                            options.join(" / ")
                        );
                    }
                }
            }
        }
    }
}

fn print_strategy_report(memory: &cravewise_schema::FeedbackMemory) {
    let rows = strategy_report(memory);
    if rows.is_empty() {
        return;
    }
    println!("\n{:<30} {:>5} {:>8}  NOTE", "STRATEGY", "USES", "AVG");
    println!("{}", "-".repeat(60));
    for row in rows {
        println!(
            "{:<30} {:>5} {:>8.2}  {}",
            row.strategy,
            row.uses,
            row.avg_help,
            if row.not_effective { "not effective" } else { "" }
        );
    }
}

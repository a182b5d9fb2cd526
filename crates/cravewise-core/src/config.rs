use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use cravewise_provider::{ProviderConfig, ProviderType, RetryPolicy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CravewiseConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(rename = "type", default = "default_provider_type")]
    pub provider_type: ProviderType,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_key")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider_type: default_provider_type(),
            model: default_model(),
            api_key: default_api_key(),
            base_url: None,
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
            retry: RetryConfig::default(),
        }
    }
}

impl ModelConfig {
    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            provider_type: self.provider_type.clone(),
            api_key: self.api_key.clone().filter(|k| !k.trim().is_empty()),
            base_url: self.base_url.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            backoff: Duration::from_millis(self.retry.backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Thresholds and windows for statistics, trend detection and memory tagging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_history_window_days")]
    pub history_window_days: i64,
    /// Fixed offset used to place logs on local days and hours.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_evening_start_hour")]
    pub evening_start_hour: u32,
    #[serde(default = "default_trend_slope_threshold")]
    pub trend_slope_threshold: f64,
    #[serde(default = "default_evening_ratio_threshold")]
    pub evening_ratio_threshold: f64,
    #[serde(default = "default_evening_min_logs")]
    pub evening_min_logs: usize,
    #[serde(default)]
    pub not_effective: NotEffectivePolicy,
    #[serde(default = "default_max_followup_questions")]
    pub max_followup_questions: usize,
    #[serde(default = "default_crisis_keywords")]
    pub crisis_keywords: Vec<String>,
    #[serde(default = "default_locale")]
    pub locale: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            history_window_days: default_history_window_days(),
            utc_offset_minutes: 0,
            evening_start_hour: default_evening_start_hour(),
            trend_slope_threshold: default_trend_slope_threshold(),
            evening_ratio_threshold: default_evening_ratio_threshold(),
            evening_min_logs: default_evening_min_logs(),
            not_effective: NotEffectivePolicy::default(),
            max_followup_questions: default_max_followup_questions(),
            crisis_keywords: default_crisis_keywords(),
            locale: default_locale(),
        }
    }
}

impl PolicyConfig {
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix())
    }

    /// First crisis keyword found in the given free-text items, case-insensitively.
    pub fn crisis_keyword_in<'a, I>(&self, items: I) -> Option<&str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let haystack: Vec<String> = items.into_iter().map(str::to_lowercase).collect();
        self.crisis_keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .find(|k| {
                let needle = k.to_lowercase();
                haystack.iter().any(|item| item.contains(&needle))
            })
            .map(String::as_str)
    }
}

/// A strategy is tagged not effective once it has at least `min_uses`
/// ratings and a mean at or below `max_avg_help`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotEffectivePolicy {
    #[serde(default = "default_min_uses")]
    pub min_uses: u32,
    #[serde(default = "default_max_avg_help")]
    pub max_avg_help: f64,
}

impl Default for NotEffectivePolicy {
    fn default() -> Self {
        Self {
            min_uses: default_min_uses(),
            max_avg_help: default_max_avg_help(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_write_quiescence_ms")]
    pub write_quiescence_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            write_quiescence_ms: default_write_quiescence_ms(),
        }
    }
}

impl StorageConfig {
    pub fn write_quiescence(&self) -> Duration {
        Duration::from_millis(self.write_quiescence_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Where consented anonymous feedback is POSTed. Logged only when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_provider_type() -> ProviderType {
    ProviderType::Gemini
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_api_key() -> Option<String> {
    Some("${GEMINI_API_KEY}".to_string())
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_history_window_days() -> i64 {
    14
}

fn default_evening_start_hour() -> u32 {
    18
}

fn default_trend_slope_threshold() -> f64 {
    5.0
}

fn default_evening_ratio_threshold() -> f64 {
    0.6
}

fn default_evening_min_logs() -> usize {
    3
}

fn default_max_followup_questions() -> usize {
    2
}

fn default_crisis_keywords() -> Vec<String> {
    [
        "samobój",
        "zabić się",
        "nie chcę żyć",
        "skończyć ze sobą",
        "przedawkow",
        "suicid",
        "kill myself",
        "overdose",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
}

fn default_locale() -> String {
    "pl-PL".to_string()
}

fn default_min_uses() -> u32 {
    3
}

fn default_max_avg_help() -> f64 {
    1.0
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/cravewise.db")
}

fn default_write_quiescence_ms() -> u64 {
    1000
}

/// Replace every `${NAME}` with the value of the environment variable `NAME`
/// (empty when unset). An unclosed placeholder is kept verbatim.
pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

fn resolve_opt(value: &mut Option<String>) {
    if let Some(raw) = value.as_mut() {
        *raw = resolve_env_var(raw);
    }
}

fn resolve_config_env(config: &mut CravewiseConfig) {
    resolve_opt(&mut config.model.api_key);
    resolve_opt(&mut config.model.base_url);
    resolve_opt(&mut config.analytics.endpoint);
    config.model.model = resolve_env_var(&config.model.model);
}

/// Load `path`, falling back to defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<CravewiseConfig> {
    let mut config = if path.exists() {
        read_yaml_file(path)?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        CravewiseConfig::default()
    };
    resolve_config_env(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Upper bound for `policy.history_window_days`, ten years.
pub const MAX_HISTORY_WINDOW_DAYS: i64 = 3650;

pub fn validate_config(config: &CravewiseConfig) -> Result<()> {
    let model = &config.model;
    if model.model.trim().is_empty() {
        return Err(anyhow!("model.model must not be empty"));
    }
    if model.timeout_secs == 0 {
        return Err(anyhow!("model.timeout_secs must be greater than 0"));
    }
    if model.retry.max_attempts == 0 {
        return Err(anyhow!("model.retry.max_attempts must be at least 1"));
    }

    let policy = &config.policy;
    if !(7..=MAX_HISTORY_WINDOW_DAYS).contains(&policy.history_window_days) {
        return Err(anyhow!(
            "policy.history_window_days must be between 7 and {MAX_HISTORY_WINDOW_DAYS}, got {}",
            policy.history_window_days
        ));
    }
    if FixedOffset::east_opt(policy.utc_offset_minutes.saturating_mul(60)).is_none() {
        return Err(anyhow!(
            "policy.utc_offset_minutes out of range: {}",
            policy.utc_offset_minutes
        ));
    }
    if policy.evening_start_hour > 23 {
        return Err(anyhow!(
            "policy.evening_start_hour must be 0-23, got {}",
            policy.evening_start_hour
        ));
    }
    if !(0.0..=1.0).contains(&policy.evening_ratio_threshold) {
        return Err(anyhow!("policy.evening_ratio_threshold must be within 0-1"));
    }
    if !(0.0..=3.0).contains(&policy.not_effective.max_avg_help) {
        return Err(anyhow!("policy.not_effective.max_avg_help must be within 0-3"));
    }
    if policy.not_effective.min_uses == 0 {
        return Err(anyhow!("policy.not_effective.min_uses must be at least 1"));
    }

    if let Some(endpoint) = config.analytics.endpoint.as_deref() {
        if !endpoint.is_empty()
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(anyhow!("analytics.endpoint must be an http(s) URL: {endpoint}"));
        }
    }

    Ok(())
}

fn read_yaml_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse yaml file: {}", path.display()))
}

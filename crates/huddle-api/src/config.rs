//! Control-plane configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use huddle_batch::BatchConfig;
use huddle_core::LogFormat;
use huddle_core::error::{Error, Result};
use huddle_ledger::{IdempotencyConfig, RateLimitRule};
use huddle_resilience::{BreakerConfig, BulkheadConfig, RetryPolicy};

/// Flush thresholds for each processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSettings {
    /// Transcript fragments.
    #[serde(default = "default_transcript_batch")]
    pub transcripts: BatchConfig,
    /// Note operations.
    #[serde(default = "default_note_batch")]
    pub note_ops: BatchConfig,
    /// Presence changes.
    #[serde(default = "default_presence_batch")]
    pub presence: BatchConfig,
}

const fn default_transcript_batch() -> BatchConfig {
    BatchConfig::new(25, 500)
}

const fn default_note_batch() -> BatchConfig {
    BatchConfig::new(20, 100)
}

const fn default_presence_batch() -> BatchConfig {
    BatchConfig::new(50, 1_000)
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            transcripts: default_transcript_batch(),
            note_ops: default_note_batch(),
            presence: default_presence_batch(),
        }
    }
}

/// Per-user limits on the high-volume actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSettings {
    /// Whether limits are enforced at all.
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    /// Limit on queued transcript fragments.
    #[serde(default = "default_transcript_rule")]
    pub transcripts: RateLimitRule,
    /// Limit on queued note operations.
    #[serde(default = "default_note_rule")]
    pub note_ops: RateLimitRule,
    /// Limit on presence changes.
    #[serde(default = "default_presence_rule")]
    pub presence: RateLimitRule,
}

const fn default_rate_limit_enabled() -> bool {
    true
}

const fn default_transcript_rule() -> RateLimitRule {
    RateLimitRule::new(60_000, 600)
}

const fn default_note_rule() -> RateLimitRule {
    RateLimitRule::new(60_000, 300)
}

const fn default_presence_rule() -> RateLimitRule {
    RateLimitRule::new(60_000, 60)
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            transcripts: default_transcript_rule(),
            note_ops: default_note_rule(),
            presence: default_presence_rule(),
        }
    }
}

/// Resilience stack applied to external providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResilienceSettings {
    /// Retry policy for provider calls.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Breaker thresholds, shared by every dependency.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Concurrency cap per dependency.
    #[serde(default)]
    pub bulkhead: BulkheadConfig,
    /// Per-attempt deadline for provider calls, in milliseconds.
    #[serde(default = "default_external_timeout_ms")]
    pub external_timeout_ms: u64,
}

const fn default_external_timeout_ms() -> u64 {
    10_000
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            bulkhead: BulkheadConfig::default(),
            external_timeout_ms: default_external_timeout_ms(),
        }
    }
}

impl ResilienceSettings {
    /// Returns the per-attempt deadline.
    #[must_use]
    pub const fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external_timeout_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HuddleConfig {
    /// Processor thresholds.
    #[serde(default)]
    pub batch: BatchSettings,
    /// Rate limits.
    #[serde(default)]
    pub rate_limits: RateLimitSettings,
    /// Idempotency ledger tuning.
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    /// External-call resilience.
    #[serde(default)]
    pub resilience: ResilienceSettings,
    /// Log output format.
    #[serde(skip)]
    pub log_format: LogFormat,
}

impl HuddleConfig {
    /// Loads configuration from `HUDDLE_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a validation error when a variable does not parse or a value
    /// is out of range.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup` instead of the process environment.
    ///
    /// # Errors
    ///
    /// Same as [`HuddleConfig::from_env`].
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };
        let mut config = Self::default();

        apply_batch(&env, "TRANSCRIPT", &mut config.batch.transcripts)?;
        apply_batch(&env, "NOTE", &mut config.batch.note_ops)?;
        apply_batch(&env, "PRESENCE", &mut config.batch.presence)?;

        if let Some(enabled) = env.bool("HUDDLE_RATE_LIMIT_ENABLED")? {
            config.rate_limits.enabled = enabled;
        }
        if let Some(window_ms) = env.u64("HUDDLE_RATE_LIMIT_WINDOW_MS")? {
            config.rate_limits.transcripts.window_ms = window_ms;
            config.rate_limits.note_ops.window_ms = window_ms;
            config.rate_limits.presence.window_ms = window_ms;
        }
        if let Some(max) = env.u32("HUDDLE_TRANSCRIPT_RATE_LIMIT")? {
            config.rate_limits.transcripts.max_count = max;
        }
        if let Some(max) = env.u32("HUDDLE_NOTE_RATE_LIMIT")? {
            config.rate_limits.note_ops.max_count = max;
        }
        if let Some(max) = env.u32("HUDDLE_PRESENCE_RATE_LIMIT")? {
            config.rate_limits.presence.max_count = max;
        }

        if let Some(limit) = env.usize("HUDDLE_IDEMPOTENCY_INLINE_LIMIT_BYTES")? {
            config.idempotency.inline_limit_bytes = limit;
        }
        if let Some(secs) = env.u64("HUDDLE_IDEMPOTENCY_STALE_SECS")? {
            config.idempotency.stale_timeout_secs = secs;
        }

        let resilience = &mut config.resilience;
        if let Some(attempts) = env.u32("HUDDLE_RETRY_MAX_ATTEMPTS")? {
            resilience.retry.max_attempts = attempts;
        }
        if let Some(ms) = env.u64("HUDDLE_RETRY_BASE_DELAY_MS")? {
            resilience.retry.base_delay_ms = ms;
        }
        if let Some(ms) = env.u64("HUDDLE_RETRY_MAX_DELAY_MS")? {
            resilience.retry.max_delay_ms = ms;
        }
        if let Some(threshold) = env.u32("HUDDLE_BREAKER_FAILURE_THRESHOLD")? {
            resilience.breaker.failure_threshold = threshold;
        }
        if let Some(ms) = env.u64("HUDDLE_BREAKER_COOLDOWN_MS")? {
            resilience.breaker.cooldown_ms = ms;
        }
        if let Some(max) = env.usize("HUDDLE_BULKHEAD_MAX_CONCURRENT")? {
            resilience.bulkhead.max_concurrent = max;
        }
        if let Some(ms) = env.u64("HUDDLE_EXTERNAL_TIMEOUT_MS")? {
            resilience.external_timeout_ms = ms;
        }

        if let Some(format) = env.string("HUDDLE_LOG_FORMAT") {
            config.log_format = parse_log_format("HUDDLE_LOG_FORMAT", &format)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that every threshold is usable.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        for (name, batch) in [
            ("transcripts", &self.batch.transcripts),
            ("note_ops", &self.batch.note_ops),
            ("presence", &self.batch.presence),
        ] {
            require_positive(&format!("batch.{name}.max_batch_size"), batch.max_batch_size as u64)?;
            require_positive(&format!("batch.{name}.max_wait_ms"), batch.max_wait_ms)?;
        }
        for rule in [
            &self.rate_limits.transcripts,
            &self.rate_limits.note_ops,
            &self.rate_limits.presence,
        ] {
            rule.validate()?;
        }
        let resilience = &self.resilience;
        require_positive("retry.max_attempts", u64::from(resilience.retry.max_attempts))?;
        if resilience.retry.max_delay_ms < resilience.retry.base_delay_ms {
            return Err(Error::validation(
                "retry.max_delay_ms must not be below retry.base_delay_ms",
            ));
        }
        require_positive(
            "breaker.failure_threshold",
            u64::from(resilience.breaker.failure_threshold),
        )?;
        require_positive("breaker.cooldown_ms", resilience.breaker.cooldown_ms)?;
        require_positive(
            "bulkhead.max_concurrent",
            resilience.bulkhead.max_concurrent as u64,
        )?;
        require_positive("resilience.external_timeout_ms", resilience.external_timeout_ms)?;
        require_positive(
            "idempotency.stale_timeout_secs",
            self.idempotency.stale_timeout_secs,
        )?;
        Ok(())
    }
}

fn apply_batch(env: &Env<'_>, kind: &str, config: &mut BatchConfig) -> Result<()> {
    if let Some(size) = env.usize(&format!("HUDDLE_{kind}_BATCH_SIZE"))? {
        config.max_batch_size = size;
    }
    if let Some(ms) = env.u64(&format!("HUDDLE_{kind}_MAX_WAIT_MS"))? {
        config.max_wait_ms = ms;
    }
    Ok(())
}

fn require_positive(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(Error::validation(format!("{name} must be positive")));
    }
    Ok(())
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::validation(format!("{name} must be a u64: {e}")))
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::validation(format!("{name} must be a u32: {e}")))
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::validation(format!("{name} must be a usize: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::validation(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn parse_log_format(name: &str, value: &str) -> Result<LogFormat> {
    match value.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(LogFormat::Json),
        "pretty" => Ok(LogFormat::Pretty),
        _ => Err(Error::validation(format!(
            "{name} must be one of: json, pretty (got {value})"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::ErrorCode;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<HuddleConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        HuddleConfig::from_env_with(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_match_processor_thresholds() -> Result<()> {
        let config = load(&[])?;
        assert_eq!(config.batch.transcripts, BatchConfig::new(25, 500));
        assert_eq!(config.batch.note_ops, BatchConfig::new(20, 100));
        assert_eq!(config.batch.presence, BatchConfig::new(50, 1_000));
        assert!(config.rate_limits.enabled);
        assert_eq!(config.log_format, LogFormat::Pretty);
        Ok(())
    }

    #[test]
    fn env_overrides_defaults() -> Result<()> {
        let config = load(&[
            ("HUDDLE_TRANSCRIPT_BATCH_SIZE", "10"),
            ("HUDDLE_NOTE_MAX_WAIT_MS", " 250 "),
            ("HUDDLE_RATE_LIMIT_ENABLED", "no"),
            ("HUDDLE_RATE_LIMIT_WINDOW_MS", "1000"),
            ("HUDDLE_PRESENCE_RATE_LIMIT", "5"),
            ("HUDDLE_RETRY_MAX_ATTEMPTS", "5"),
            ("HUDDLE_BULKHEAD_MAX_CONCURRENT", "4"),
            ("HUDDLE_LOG_FORMAT", "JSON"),
        ])?;
        assert_eq!(config.batch.transcripts.max_batch_size, 10);
        assert_eq!(config.batch.note_ops.max_wait_ms, 250);
        assert!(!config.rate_limits.enabled);
        assert_eq!(config.rate_limits.presence, RateLimitRule::new(1_000, 5));
        assert_eq!(config.rate_limits.transcripts.window_ms, 1_000);
        assert_eq!(config.resilience.retry.max_attempts, 5);
        assert_eq!(config.resilience.bulkhead.max_concurrent, 4);
        assert_eq!(config.log_format, LogFormat::Json);
        Ok(())
    }

    #[test]
    fn blank_values_are_ignored() -> Result<()> {
        let config = load(&[("HUDDLE_TRANSCRIPT_BATCH_SIZE", "  ")])?;
        assert_eq!(config.batch.transcripts.max_batch_size, 25);
        Ok(())
    }

    #[test]
    fn rejects_non_numeric_values() {
        let err = load(&[("HUDDLE_PRESENCE_MAX_WAIT_MS", "soon")]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
        assert!(err.to_string().contains("HUDDLE_PRESENCE_MAX_WAIT_MS must be a u64"));
    }

    #[test]
    fn rejects_zero_thresholds() {
        for var in [
            "HUDDLE_NOTE_BATCH_SIZE",
            "HUDDLE_TRANSCRIPT_RATE_LIMIT",
            "HUDDLE_RETRY_MAX_ATTEMPTS",
            "HUDDLE_BULKHEAD_MAX_CONCURRENT",
            "HUDDLE_EXTERNAL_TIMEOUT_MS",
        ] {
            let err = load(&[(var, "0")]).unwrap_err();
            assert_eq!(err.code(), ErrorCode::Validation, "{var}");
        }
    }

    #[test]
    fn rejects_negative_numbers() {
        assert!(load(&[("HUDDLE_BREAKER_COOLDOWN_MS", "-5")]).is_err());
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!(load(&[("HUDDLE_LOG_FORMAT", "xml")]).is_err());
    }

    #[test]
    fn parse_bool_accepts_true_values() {
        assert!(parse_bool("TEST", "true").unwrap());
        assert!(parse_bool("TEST", "1").unwrap());
        assert!(parse_bool("TEST", "yes").unwrap());
        assert!(parse_bool("TEST", "TRUE").unwrap());
    }

    #[test]
    fn parse_bool_accepts_false_values() {
        assert!(!parse_bool("TEST", "false").unwrap());
        assert!(!parse_bool("TEST", "0").unwrap());
        assert!(!parse_bool("TEST", "n").unwrap());
    }

    #[test]
    fn parse_bool_rejects_invalid_values() {
        assert!(parse_bool("TEST", "maybe").is_err());
        assert!(parse_bool("TEST", "").is_err());
    }

    #[test]
    fn deserializes_partial_json() -> Result<()> {
        let config: HuddleConfig = serde_json::from_value(serde_json::json!({
            "batch": { "presence": { "max_batch_size": 5 } },
            "rateLimits": { "enabled": false }
        }))?;
        assert_eq!(config.batch.presence, BatchConfig::new(5, 1_000));
        assert_eq!(config.batch.transcripts, BatchConfig::new(25, 500));
        assert!(!config.rate_limits.enabled);
        Ok(())
    }
}

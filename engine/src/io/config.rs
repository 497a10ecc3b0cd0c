//! Engine configuration stored at `<data_dir>/config.toml`, with environment
//! overrides applied on top.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::backoff::RetryPolicy;

/// File name of the config inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Engine configuration (TOML).
///
/// Missing fields default to the values below, so an absent file is a valid
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Jobs allowed in `Running` at once.
    pub job_concurrency: usize,

    /// Ceiling for each job log in bytes. `0` disables the ceiling.
    pub job_log_max_bytes: u64,

    /// Terminal jobs older than this are purged. `0` keeps them forever.
    pub job_retention_secs: u64,

    pub retention_sweep_interval_secs: u64,

    /// Wall-clock limit for a single transfer attempt.
    pub attempt_timeout_secs: u64,

    /// Save stderr that classifies as `unknown` under `logs/unknown-errors/`.
    pub capture_unknown_errors: bool,

    pub retry: RetryConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Negative values are accepted and read as `0` (immediate retry).
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: 800,
            max_delay_ms: 8_000,
            jitter_ratio: policy.jitter_ratio,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransferConfig {
    /// Program and leading arguments for the transfer tool (e.g. `["rclone"]`).
    pub command: Vec<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            command: vec!["rclone".to_string()],
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            job_concurrency: 2,
            job_log_max_bytes: 1024 * 1024,
            job_retention_secs: 7 * 24 * 60 * 60,
            retention_sweep_interval_secs: 30 * 60,
            attempt_timeout_secs: 6 * 60 * 60,
            capture_unknown_errors: false,
            retry: RetryConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.job_concurrency == 0 {
            return Err(anyhow!("job_concurrency must be > 0"));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(anyhow!("attempt_timeout_secs must be > 0"));
        }
        if self.retention_sweep_interval_secs == 0 {
            return Err(anyhow!("retention_sweep_interval_secs must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(anyhow!("retry.jitter_ratio must be within [0, 1]"));
        }
        if self.transfer.command.is_empty() || self.transfer.command[0].trim().is_empty() {
            return Err(anyhow!("transfer.command must be a non-empty array"));
        }
        Ok(())
    }

    /// Fix up values that have a sensible reading instead of rejecting them.
    pub fn normalize(&mut self) {
        self.retry.base_delay_ms = self.retry.base_delay_ms.max(0);
        self.retry.max_delay_ms = self.retry.max_delay_ms.max(0);
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            self.retry.max_delay_ms = self.retry.base_delay_ms;
        }
    }

    /// Apply `ENGINE_*` overrides using `lookup` to read variables.
    ///
    /// Unset or blank variables are ignored. Values that fail to parse are
    /// errors naming the variable.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(raw) = get("ENGINE_JOB_CONCURRENCY") {
            self.job_concurrency = parse_env("ENGINE_JOB_CONCURRENCY", &raw)?;
        }
        if let Some(raw) = get("ENGINE_JOB_LOG_MAX_BYTES") {
            self.job_log_max_bytes = parse_env("ENGINE_JOB_LOG_MAX_BYTES", &raw)?;
        }
        if let Some(raw) = get("ENGINE_JOB_RETENTION_SECS") {
            self.job_retention_secs = parse_env("ENGINE_JOB_RETENTION_SECS", &raw)?;
        }
        if let Some(raw) = get("ENGINE_RETENTION_SWEEP_INTERVAL_SECS") {
            self.retention_sweep_interval_secs =
                parse_env("ENGINE_RETENTION_SWEEP_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = get("ENGINE_ATTEMPT_TIMEOUT_SECS") {
            self.attempt_timeout_secs = parse_env("ENGINE_ATTEMPT_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = get("ENGINE_RETRY_ATTEMPTS") {
            self.retry.max_attempts = parse_env("ENGINE_RETRY_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = get("ENGINE_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_env("ENGINE_RETRY_BASE_DELAY_MS", &raw)?;
        }
        if let Some(raw) = get("ENGINE_RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = parse_env("ENGINE_RETRY_MAX_DELAY_MS", &raw)?;
        }
        if let Some(raw) = get("ENGINE_RETRY_JITTER_RATIO") {
            self.retry.jitter_ratio = parse_env("ENGINE_RETRY_JITTER_RATIO", &raw)?;
        }
        if let Some(raw) = get("ENGINE_TRANSFER_COMMAND") {
            self.transfer.command = raw.split_whitespace().map(str::to_string).collect();
        }
        if let Some(raw) = get("ENGINE_CAPTURE_UNKNOWN_ERRORS") {
            self.capture_unknown_errors = parse_bool("ENGINE_CAPTURE_UNKNOWN_ERRORS", &raw)?;
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: millis(self.retry.base_delay_ms),
            max_delay: millis(self.retry.max_delay_ms),
            jitter_ratio: self.retry.jitter_ratio,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// `None` when retention is disabled.
    pub fn job_retention(&self) -> Option<Duration> {
        (self.job_retention_secs > 0).then(|| Duration::from_secs(self.job_retention_secs))
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_interval_secs)
    }
}

/// Negative millisecond values read as zero.
fn millis(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("invalid {key}={raw:?}"))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(anyhow!("invalid {key}={raw:?}: expected a boolean")),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.normalize();
    cfg.validate()?;
    Ok(cfg)
}

/// Config file plus overrides from the process environment.
pub fn load_effective_config(data_dir: &Path) -> Result<EngineConfig> {
    load_effective_config_with(data_dir, |key| std::env::var(key).ok())
}

pub fn load_effective_config_with(
    data_dir: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<EngineConfig> {
    let path = data_dir.join(CONFIG_FILE_NAME);
    let mut cfg = load_config(&path)?;
    cfg.apply_env(lookup)?;
    cfg.normalize();
    cfg.validate()
        .with_context(|| format!("validate config for {}", data_dir.display()))?;
    debug!(
        job_concurrency = cfg.job_concurrency,
        max_attempts = cfg.retry.max_attempts,
        "config loaded"
    );
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            "job_concurrency = 4\n[retry]\nmax_attempts = 5\n[transfer]\ncommand = [\"rclone\", \"--config\", \"/etc/rclone.conf\"]\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.job_concurrency, 4);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_delay_ms, 800);
        assert_eq!(cfg.transfer.command.len(), 3);
    }

    #[test]
    fn env_overrides_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join(CONFIG_FILE_NAME), "job_concurrency = 4\n").expect("write");

        let cfg = load_effective_config_with(
            temp.path(),
            env(&[
                ("ENGINE_JOB_CONCURRENCY", "8"),
                ("ENGINE_RETRY_BASE_DELAY_MS", "50"),
                ("ENGINE_TRANSFER_COMMAND", "/opt/rclone  --fast-list"),
                ("ENGINE_CAPTURE_UNKNOWN_ERRORS", "yes"),
                ("ENGINE_JOB_RETENTION_SECS", "  "),
            ]),
        )
        .expect("load");

        assert_eq!(cfg.job_concurrency, 8);
        assert_eq!(cfg.retry.base_delay_ms, 50);
        assert_eq!(cfg.transfer.command, vec!["/opt/rclone", "--fast-list"]);
        assert!(cfg.capture_unknown_errors);
        assert_eq!(cfg.job_retention_secs, 7 * 24 * 60 * 60);
    }

    #[test]
    fn invalid_env_value_names_the_variable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_effective_config_with(temp.path(), env(&[("ENGINE_RETRY_ATTEMPTS", "lots")]))
            .expect_err("must fail");
        assert!(format!("{err:#}").contains("ENGINE_RETRY_ATTEMPTS"));
    }

    #[test]
    fn max_delay_below_base_is_lifted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_effective_config_with(
            temp.path(),
            env(&[
                ("ENGINE_RETRY_BASE_DELAY_MS", "2000"),
                ("ENGINE_RETRY_MAX_DELAY_MS", "100"),
            ]),
        )
        .expect("load");
        assert_eq!(cfg.retry.max_delay_ms, 2000);
        assert_eq!(cfg.retry_policy().max_delay, Duration::from_secs(2));
    }

    #[test]
    fn negative_env_delays_degrade_to_immediate_retry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_effective_config_with(
            temp.path(),
            env(&[
                ("ENGINE_RETRY_BASE_DELAY_MS", "-100"),
                ("ENGINE_RETRY_MAX_DELAY_MS", "-1"),
            ]),
        )
        .expect("load");
        assert_eq!(cfg.retry.base_delay_ms, 0);
        assert_eq!(cfg.retry.max_delay_ms, 0);
        assert_eq!(cfg.retry_policy().base_delay, Duration::ZERO);
        assert_eq!(cfg.retry_policy().max_delay, Duration::ZERO);
    }

    #[test]
    fn negative_file_delay_degrades_to_immediate_retry() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join(CONFIG_FILE_NAME),
            "[retry]\nbase_delay_ms = -5\n",
        )
        .expect("write");

        let cfg = load_effective_config_with(temp.path(), env(&[])).expect("load");
        assert_eq!(cfg.retry.base_delay_ms, 0);
        assert_eq!(cfg.retry.max_delay_ms, 8_000);
        assert_eq!(cfg.retry_policy().base_delay, Duration::ZERO);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let cfg = EngineConfig {
            job_concurrency: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            retry: RetryConfig {
                jitter_ratio: 1.5,
                ..RetryConfig::default()
            },
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            transfer: TransferConfig {
                command: vec![" ".to_string()],
            },
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_retention_disables_purge() {
        let cfg = EngineConfig {
            job_retention_secs: 0,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.job_retention(), None);
    }
}

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::Language;

/// Retry and timeout policy for provider calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub provider_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` failed: base * 2^(attempt-1), capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(8000),
            provider_timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub retry: RetryPolicy,
    /// Concurrent provider calls allowed across all sends.
    pub workers: usize,
    pub default_language: Language,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            workers: 8,
            default_language: Language::English,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub dispatch: DispatchConfig,
    pub detection_concurrency: usize,
    pub template_catalog: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            detection_concurrency: 16,
            template_catalog: None,
        }
    }
}

/// Parsed value of `key`, `None` when unset or blank.
fn lookup_value<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Malformed { key, value }),
        _ => Ok(None),
    }
}

fn invalid(key: &'static str, message: &'static str) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid { key, message })
}

impl AppConfig {
    /// Read settings from the environment. Unset keys keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env`] over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AppConfig::default();
        let millis = |key| -> Result<Option<Duration>, ConfigError> {
            Ok(lookup_value(&lookup, key)?.map(Duration::from_millis))
        };

        let retry = RetryPolicy {
            max_attempts: lookup_value(&lookup, "DISPATCH_MAX_ATTEMPTS")?
                .unwrap_or(defaults.dispatch.retry.max_attempts),
            base_backoff: millis("DISPATCH_BASE_BACKOFF_MS")?
                .unwrap_or(defaults.dispatch.retry.base_backoff),
            max_backoff: millis("DISPATCH_MAX_BACKOFF_MS")?
                .unwrap_or(defaults.dispatch.retry.max_backoff),
            provider_timeout: millis("PROVIDER_TIMEOUT_MS")?
                .unwrap_or(defaults.dispatch.retry.provider_timeout),
        };

        let config = Self {
            dispatch: DispatchConfig {
                retry,
                workers: lookup_value(&lookup, "DISPATCH_WORKERS")?
                    .unwrap_or(defaults.dispatch.workers),
                default_language: lookup_value(&lookup, "DEFAULT_LANGUAGE")?
                    .unwrap_or(defaults.dispatch.default_language),
            },
            detection_concurrency: lookup_value(&lookup, "DETECTION_CONCURRENCY")?
                .unwrap_or(defaults.detection_concurrency),
            template_catalog: lookup("TEMPLATE_CATALOG")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.retry.max_attempts == 0 {
            return invalid("DISPATCH_MAX_ATTEMPTS", "must be at least 1");
        }
        if self.dispatch.retry.provider_timeout.is_zero() {
            return invalid("PROVIDER_TIMEOUT_MS", "must be greater than 0");
        }
        if self.dispatch.retry.max_backoff < self.dispatch.retry.base_backoff {
            return invalid(
                "DISPATCH_MAX_BACKOFF_MS",
                "must not be below DISPATCH_BASE_BACKOFF_MS",
            );
        }
        if self.dispatch.workers == 0 {
            return invalid("DISPATCH_WORKERS", "must be at least 1");
        }
        if self.detection_concurrency == 0 {
            return invalid("DETECTION_CONCURRENCY", "must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff_for(10), Duration::from_millis(8000));
    }

    #[test]
    fn defaults_are_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = AppConfig::default();
        config.dispatch.workers = 0;
        assert!(config.validate().is_err());
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| {
            vars.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        }
    }

    #[test]
    fn unset_keys_keep_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn set_keys_override_defaults() {
        let config = AppConfig::from_lookup(lookup(&[
            ("DISPATCH_WORKERS", "4"),
            ("PROVIDER_TIMEOUT_MS", "2500"),
            ("DEFAULT_LANGUAGE", "fr"),
        ]))
        .unwrap();
        assert_eq!(config.dispatch.workers, 4);
        assert_eq!(config.dispatch.retry.provider_timeout, Duration::from_millis(2500));
        assert_eq!(config.dispatch.default_language, Language::French);
    }

    #[test]
    fn malformed_value_names_its_key() {
        let err = AppConfig::from_lookup(lookup(&[("DISPATCH_WORKERS", "eight")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Malformed { key: "DISPATCH_WORKERS", ref value } if value == "eight"
        ));

        let err =
            AppConfig::from_lookup(lookup(&[("DISPATCH_MAX_ATTEMPTS", "3x")])).unwrap_err();
        assert!(err.to_string().contains("DISPATCH_MAX_ATTEMPTS"));
    }

    #[test]
    fn parsed_values_are_still_validated() {
        let err = AppConfig::from_lookup(lookup(&[("DETECTION_CONCURRENCY", "0")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "DETECTION_CONCURRENCY",
                ..
            }
        ));
    }
}

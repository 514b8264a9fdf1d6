//! Configuration types.
//!
//! Every value has a default except the scorer and CRM endpoints, which the
//! binary requires. The return-token and credit-cache TTLs are constants in
//! `model`, not configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::stages::retry::MAX_SUBMIT_ATTEMPTS;

const DEFAULT_METADATA_KEYS: &[&str] = &[
    "loan_amount",
    "vehicle_type",
    "credit_band",
    "utm_source",
    "utm_campaign",
    "form_section",
    "time_on_step",
];

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Port the HTTP API listens on.
    pub http_port: u16,
    /// libSQL database file. `None` runs on the in-memory store.
    pub db_path: Option<PathBuf>,
    /// Secret the contact vault key is derived from. Required with `db_path`.
    pub contact_key: Option<SecretString>,
    /// Base URL embedded in re-engagement messages; the token is appended
    /// as `?token=`.
    pub return_base_url: String,
    /// Upper bound on any single outbound call.
    pub external_timeout: Duration,
    /// Delay before the second submission attempt; doubles afterwards.
    pub submit_initial_delay: Duration,
    /// Submission attempts per `submit` call. Never more than 3.
    pub submit_max_attempts: u32,
    /// Idle time after which a visitor is treated as abandoned.
    pub inactivity_threshold: Duration,
    pub inactivity_sweep_interval: Duration,
    /// Cron expression for dead-letter reprocessing. `None` means manual only.
    pub dead_letter_schedule: Option<String>,
    /// Metadata keys accepted from intake; everything else is dropped.
    pub metadata_whitelist: Vec<String>,
    pub email: Option<EmailConfig>,
    pub scorer: Option<HttpEndpointConfig>,
    pub crm: Option<HttpEndpointConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: None,
            contact_key: None,
            return_base_url: "http://localhost:8080/return".to_string(),
            external_timeout: Duration::from_secs(10),
            submit_initial_delay: Duration::from_millis(500),
            submit_max_attempts: MAX_SUBMIT_ATTEMPTS,
            inactivity_threshold: Duration::from_secs(30 * 60),
            inactivity_sweep_interval: Duration::from_secs(60),
            dead_letter_schedule: None,
            metadata_whitelist: DEFAULT_METADATA_KEYS.iter().map(|k| k.to_string()).collect(),
            email: None,
            scorer: None,
            crm: None,
        }
    }
}

impl PipelineConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            http_port: parse_or(&get, "LEAD_PIPELINE_PORT", defaults.http_port)?,
            db_path: get("LEAD_PIPELINE_DB_PATH").map(PathBuf::from),
            contact_key: get("LEAD_PIPELINE_CONTACT_KEY").map(SecretString::from),
            return_base_url: get("LEAD_PIPELINE_RETURN_URL").unwrap_or(defaults.return_base_url),
            external_timeout: parse_or(&get, "LEAD_PIPELINE_EXTERNAL_TIMEOUT_SECS", 10u64)
                .map(Duration::from_secs)?,
            submit_initial_delay: parse_or(&get, "LEAD_PIPELINE_SUBMIT_BACKOFF_MS", 500u64)
                .map(Duration::from_millis)?,
            submit_max_attempts: parse_or(
                &get,
                "LEAD_PIPELINE_SUBMIT_ATTEMPTS",
                defaults.submit_max_attempts,
            )?,
            inactivity_threshold: parse_minutes(&get, "LEAD_PIPELINE_INACTIVITY_MINS", 30)?,
            inactivity_sweep_interval: parse_or(&get, "LEAD_PIPELINE_SWEEP_SECS", 60u64)
                .map(Duration::from_secs)?,
            dead_letter_schedule: get("LEAD_PIPELINE_DEAD_LETTER_CRON"),
            metadata_whitelist: get("LEAD_PIPELINE_METADATA_KEYS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.metadata_whitelist),
            email: EmailConfig::from_lookup(&get)?,
            scorer: HttpEndpointConfig::from_lookup(&get, "CREDIT_SCORER_URL", "CREDIT_SCORER_API_KEY"),
            crm: HttpEndpointConfig::from_lookup(&get, "CRM_URL", "CRM_API_KEY"),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break hard pipeline bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.submit_max_attempts == 0 || self.submit_max_attempts > MAX_SUBMIT_ATTEMPTS {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_PIPELINE_SUBMIT_ATTEMPTS".into(),
                message: format!("must be between 1 and {MAX_SUBMIT_ATTEMPTS}"),
            });
        }
        if self.external_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_PIPELINE_EXTERNAL_TIMEOUT_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.inactivity_threshold.is_zero()
            || chrono::Duration::from_std(self.inactivity_threshold).is_err()
        {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_PIPELINE_INACTIVITY_MINS".into(),
                message: "must be greater than zero and within range".into(),
            });
        }
        if self.inactivity_sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_PIPELINE_SWEEP_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.db_path.is_some() && self.contact_key.is_none() {
            return Err(ConfigError::MissingEnvVar("LEAD_PIPELINE_CONTACT_KEY".into()));
        }
        if let Some(schedule) = &self.dead_letter_schedule {
            cron::Schedule::from_str(schedule).map_err(|e| ConfigError::InvalidValue {
                key: "LEAD_PIPELINE_DEAD_LETTER_CRON".into(),
                message: format!("invalid cron: {e}"),
            })?;
        }
        Ok(())
    }
}

/// SMTP settings for the re-engagement sender.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl EmailConfig {
    /// Returns `None` if `SMTP_HOST` is not set (sender disabled).
    fn from_lookup(get: &impl Fn(&str) -> Option<String>) -> Result<Option<Self>, ConfigError> {
        let Some(smtp_host) = get("SMTP_HOST") else {
            return Ok(None);
        };
        let username = get("SMTP_USERNAME").unwrap_or_default();
        Ok(Some(Self {
            smtp_host,
            smtp_port: parse_or(get, "SMTP_PORT", 587u16)?,
            password: SecretString::from(get("SMTP_PASSWORD").unwrap_or_default()),
            from_address: get("SMTP_FROM").unwrap_or_else(|| username.clone()),
            username,
        }))
    }
}

/// An authenticated JSON endpoint (credit scorer, CRM).
#[derive(Debug, Clone)]
pub struct HttpEndpointConfig {
    pub url: String,
    pub api_key: SecretString,
}

impl HttpEndpointConfig {
    fn from_lookup(
        get: &impl Fn(&str) -> Option<String>,
        url_key: &str,
        api_key_key: &str,
    ) -> Option<Self> {
        Some(Self {
            url: get(url_key)?,
            api_key: SecretString::from(get(api_key_key).unwrap_or_default()),
        })
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_minutes(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse_or(get, key, default)?
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: "too large".into(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_env_empty() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.submit_max_attempts, 3);
        assert_eq!(config.external_timeout, Duration::from_secs(10));
        assert_eq!(config.inactivity_threshold, Duration::from_secs(1800));
        assert!(config.metadata_whitelist.contains(&"loan_amount".to_string()));
        assert!(config.db_path.is_none());
        assert!(config.email.is_none());
        assert!(config.crm.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("LEAD_PIPELINE_PORT", "9090"),
            ("LEAD_PIPELINE_SUBMIT_BACKOFF_MS", "50"),
            ("LEAD_PIPELINE_METADATA_KEYS", "a, b,,c"),
            ("CRM_URL", "https://crm.example/leads"),
            ("CRM_API_KEY", "k-123"),
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_USERNAME", "bot@example.com"),
        ]))
        .unwrap();
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.submit_initial_delay, Duration::from_millis(50));
        assert_eq!(config.metadata_whitelist, vec!["a", "b", "c"]);

        let crm = config.crm.unwrap();
        assert_eq!(crm.url, "https://crm.example/leads");
        assert_eq!(crm.api_key.expose_secret(), "k-123");

        let email = config.email.unwrap();
        assert_eq!(email.smtp_port, 587);
        assert_eq!(email.from_address, "bot@example.com");
    }

    #[test]
    fn rejects_more_than_three_attempts() {
        let err = PipelineConfig::from_lookup(lookup(&[("LEAD_PIPELINE_SUBMIT_ATTEMPTS", "4")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "LEAD_PIPELINE_SUBMIT_ATTEMPTS"));
    }

    #[test]
    fn rejects_unparseable_numbers_and_cron() {
        assert!(PipelineConfig::from_lookup(lookup(&[("LEAD_PIPELINE_PORT", "eighty")])).is_err());
        assert!(
            PipelineConfig::from_lookup(lookup(&[("LEAD_PIPELINE_DEAD_LETTER_CRON", "not a cron")]))
                .is_err()
        );
        assert!(
            PipelineConfig::from_lookup(lookup(&[(
                "LEAD_PIPELINE_DEAD_LETTER_CRON",
                "0 */15 * * * *"
            )]))
            .is_ok()
        );
    }

    #[test]
    fn rejects_out_of_range_inactivity_threshold() {
        for raw in ["0", "18446744073709551615", "1000000000000000"] {
            let err = PipelineConfig::from_lookup(lookup(&[("LEAD_PIPELINE_INACTIVITY_MINS", raw)]))
                .unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "LEAD_PIPELINE_INACTIVITY_MINS"),
                "{raw} accepted"
            );
        }
        let config =
            PipelineConfig::from_lookup(lookup(&[("LEAD_PIPELINE_INACTIVITY_MINS", "45")])).unwrap();
        assert_eq!(config.inactivity_threshold, Duration::from_secs(45 * 60));
    }

    #[test]
    fn durable_store_requires_contact_key() {
        let err = PipelineConfig::from_lookup(lookup(&[("LEAD_PIPELINE_DB_PATH", "leads.db")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "LEAD_PIPELINE_CONTACT_KEY"));

        let config = PipelineConfig::from_lookup(lookup(&[
            ("LEAD_PIPELINE_DB_PATH", "leads.db"),
            ("LEAD_PIPELINE_CONTACT_KEY", "vault-secret"),
        ]))
        .unwrap();
        assert_eq!(config.contact_key.unwrap().expose_secret(), "vault-secret");
    }

    #[test]
    fn debug_output_hides_secrets() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("CREDIT_SCORER_URL", "https://scorer.example"),
            ("CREDIT_SCORER_API_KEY", "super-secret"),
            ("LEAD_PIPELINE_CONTACT_KEY", "vault-secret"),
        ]))
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("vault-secret"));
    }
}

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::generation::gemini::{DEFAULT_BASE_URL, DEFAULT_MODEL, SUPPORTED_MODELS};

/// S3 / MinIO settings for the candidate image store.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub daily_limit: u32,
    pub rate_limit_per_minute: u32,
    pub queue_capacity: usize,
    pub queue_max_residency: Duration,
    pub grid_retention: Duration,
    pub generation_timeout: Duration,
    /// Minutes east of UTC at which the quota day rolls over.
    pub quota_reset_offset_minutes: i32,
    pub eviction_interval: Duration,
    pub google_api_key: String,
    pub gemini_model: String,
    pub gemini_base_url: String,
    /// Absent ⇒ in-memory persistence.
    pub database_url: Option<String>,
    /// Absent ⇒ in-memory image store.
    pub s3: Option<S3Config>,
    pub presentation_webhook_url: Option<String>,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let config = Config {
            daily_limit: parse_env("DAILY_LIMIT", 15)?,
            rate_limit_per_minute: parse_env("RATE_LIMIT_RPM", 10)?,
            queue_capacity: parse_env("QUEUE_CAPACITY", 64)?,
            queue_max_residency: Duration::from_secs(parse_env("QUEUE_MAX_RESIDENCY_SECS", 840)?),
            grid_retention: Duration::from_secs(parse_env("GRID_RETENTION_SECS", 86_400)?),
            generation_timeout: Duration::from_secs(parse_env("GENERATION_TIMEOUT_SECS", 120)?),
            quota_reset_offset_minutes: parse_env("QUOTA_RESET_UTC_OFFSET_MINUTES", 0)?,
            eviction_interval: Duration::from_secs(parse_env("EVICTION_INTERVAL_SECS", 300)?),
            google_api_key: require_env("GOOGLE_API_KEY")?,
            gemini_model: std::env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            gemini_base_url: std::env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            database_url: optional_env("DATABASE_URL"),
            s3: s3_from_env()?,
            presentation_webhook_url: optional_env("PRESENTATION_WEBHOOK_URL"),
            port: parse_env("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.daily_limit == 0 {
            bail!("DAILY_LIMIT must be at least 1");
        }
        if self.rate_limit_per_minute == 0 {
            bail!("RATE_LIMIT_RPM must be at least 1");
        }
        if self.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be at least 1");
        }
        if !(-14 * 60..=14 * 60).contains(&self.quota_reset_offset_minutes) {
            bail!("QUOTA_RESET_UTC_OFFSET_MINUTES must be within ±840");
        }
        if !SUPPORTED_MODELS.contains(&self.gemini_model.as_str()) {
            bail!(
                "GEMINI_MODEL '{}' is not supported (expected one of {})",
                self.gemini_model,
                SUPPORTED_MODELS.join(", ")
            );
        }
        Ok(())
    }
}

/// S3 is all-or-nothing: a bucket without credentials is a configuration error.
fn s3_from_env() -> Result<Option<S3Config>> {
    let Some(bucket) = optional_env("S3_BUCKET") else {
        return Ok(None);
    };
    Ok(Some(S3Config {
        bucket,
        endpoint: require_env("S3_ENDPOINT")?,
        access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
        secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
    }))
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("{key} must be a valid number, got '{raw}'"))
}

#[cfg(test)]
impl Config {
    /// Defaults with a dummy API key and in-memory backends.
    pub fn for_tests() -> Self {
        Config {
            daily_limit: 15,
            rate_limit_per_minute: 10,
            queue_capacity: 64,
            queue_max_residency: Duration::from_secs(840),
            grid_retention: Duration::from_secs(86_400),
            generation_timeout: Duration::from_secs(120),
            quota_reset_offset_minutes: 0,
            eviction_interval: Duration::from_secs(300),
            google_api_key: "test".to_string(),
            gemini_model: DEFAULT_MODEL.to_string(),
            gemini_base_url: DEFAULT_BASE_URL.to_string(),
            database_url: None,
            s3: None,
            presentation_webhook_url: None,
            port: 8080,
            rust_log: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::for_tests()
    }

    #[test]
    fn test_parse_value_accepts_padded_numbers() {
        let value: u32 = parse_value("DAILY_LIMIT", " 20 ").unwrap();
        assert_eq!(value, 20);
    }

    #[test]
    fn test_parse_value_rejects_garbage() {
        let err = parse_value::<u32>("RATE_LIMIT_RPM", "ten").unwrap_err();
        assert!(err.to_string().contains("RATE_LIMIT_RPM"));
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = base_config();
        config.daily_limit = 0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_model() {
        let mut config = base_config();
        config.gemini_model = "imagen-2".to_string();
        assert!(config.validate().is_err());
    }
}

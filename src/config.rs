use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::IntelError;

const WEIGHT_SUM_EPSILON: f64 = 1e-6;

/// Service configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Read-only connection string for the local threat table.
    pub database_url: String,
    pub redis_url: String,
    pub listen_addr: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: String,
    pub abuseipdb_api_key: String,
    pub reputation_daily_limit: u64,
    pub reputation_min_confidence: u8,
    pub local_confidence_weight: f64,
    pub external_confidence_weight: f64,
    pub local_confidence_boost: u8,
    pub minimum_final_confidence: u8,
    pub preprocess_interval: Duration,
    pub preprocessing_ttl: Duration,
    pub batch_size: usize,
    pub geo_request_delay: Duration,
    pub auto_start_processing: bool,
    /// Admin trigger is disabled when unset.
    pub admin_token: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, IntelError> {
        let config = Self {
            database_url: required("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_or("PORT", 8080)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "plain".to_string()),
            abuseipdb_api_key: required("ABUSEIPDB_API_KEY")?,
            reputation_daily_limit: parse_or("REPUTATION_DAILY_LIMIT", 1000)?,
            reputation_min_confidence: parse_or("REPUTATION_MIN_CONFIDENCE", 50)?,
            // The weights are deliberately defaultless: deployments must pick
            // a split, and startup fails when they disagree with each other.
            local_confidence_weight: parse_required("LOCAL_CONFIDENCE_WEIGHT")?,
            external_confidence_weight: parse_required("EXTERNAL_CONFIDENCE_WEIGHT")?,
            local_confidence_boost: parse_or("LOCAL_CONFIDENCE_BOOST", 10)?,
            minimum_final_confidence: parse_or("MINIMUM_FINAL_CONFIDENCE", 85)?,
            preprocess_interval: Duration::from_secs(parse_or("PREPROCESS_INTERVAL", 300u64)?),
            preprocessing_ttl: Duration::from_secs(parse_or("PREPROCESSING_TTL", 900u64)?),
            batch_size: parse_or("BATCH_SIZE", 100)?,
            geo_request_delay: Duration::from_millis(parse_or("GEO_REQUEST_DELAY", 1000u64)?),
            auto_start_processing: parse_or("AUTO_START_PROCESSING", true)?,
            admin_token: env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IntelError> {
        let weight_sum = self.local_confidence_weight + self.external_confidence_weight;
        if (weight_sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(IntelError::Config(format!(
                "LOCAL_CONFIDENCE_WEIGHT + EXTERNAL_CONFIDENCE_WEIGHT must equal 1.0, got {weight_sum}"
            )));
        }
        if !(0.0..=1.0).contains(&self.local_confidence_weight) {
            return Err(IntelError::Config(
                "LOCAL_CONFIDENCE_WEIGHT must be within [0.0, 1.0]".to_string(),
            ));
        }
        if self.minimum_final_confidence > 100 {
            return Err(IntelError::Config(
                "MINIMUM_FINAL_CONFIDENCE must be within [0, 100]".to_string(),
            ));
        }
        if self.reputation_min_confidence > 100 {
            return Err(IntelError::Config(
                "REPUTATION_MIN_CONFIDENCE must be within [0, 100]".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(IntelError::Config("BATCH_SIZE must be positive".to_string()));
        }
        if self.preprocess_interval.is_zero() {
            return Err(IntelError::Config(
                "PREPROCESS_INTERVAL must be positive".to_string(),
            ));
        }
        // The served snapshot must outlive at least one rebuild interval,
        // otherwise consumers would observe gaps between cycles.
        if self.preprocessing_ttl < self.preprocess_interval {
            return Err(IntelError::Config(format!(
                "PREPROCESSING_TTL ({}s) must be >= PREPROCESS_INTERVAL ({}s)",
                self.preprocessing_ttl.as_secs(),
                self.preprocess_interval.as_secs()
            )));
        }
        Ok(())
    }
}

fn required(name: &str) -> Result<String, IntelError> {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| IntelError::Config(format!("{name} is not set")))
}

fn parse_required<T: FromStr>(name: &str) -> Result<T, IntelError> {
    required(name)?
        .parse()
        .map_err(|_| IntelError::Config(format!("{name} is not a valid value")))
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, IntelError> {
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| IntelError::Config(format!("{name} is not a valid value"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            database_url: "postgres://reader@localhost/threats".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            listen_addr: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            log_format: "plain".to_string(),
            abuseipdb_api_key: "test-key".to_string(),
            reputation_daily_limit: 1000,
            reputation_min_confidence: 50,
            local_confidence_weight: 0.8,
            external_confidence_weight: 0.2,
            local_confidence_boost: 10,
            minimum_final_confidence: 85,
            preprocess_interval: Duration::from_secs(300),
            preprocessing_ttl: Duration::from_secs(900),
            batch_size: 100,
            geo_request_delay: Duration::from_millis(1000),
            auto_start_processing: true,
            admin_token: None,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = base_config();
        config.local_confidence_weight = 0.8;
        config.external_confidence_weight = 0.3;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "config_invalid");
    }

    #[test]
    fn test_weight_sum_tolerates_float_noise() {
        let mut config = base_config();
        config.local_confidence_weight = 0.7;
        config.external_confidence_weight = 0.30000000001;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_snapshot_ttl_must_cover_interval() {
        let mut config = base_config();
        config.preprocessing_ttl = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = base_config();
        config.batch_size = 0;
        assert!(config.validate().is_err());
    }
}

//! Environment-driven configuration.

use anyhow::{bail, Result};

use crate::rest::MarketFilter;

const DEFAULT_HEARTBEAT_MS: u64 = 5000;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub app_key: String,
    pub session_token: String,
    pub username: String,
    pub password: String,
    /// Static market selection; writers for these are created eagerly.
    pub market_ids: Vec<String>,
    pub event_type_id: String,
    pub country_code: String,
    pub market_type: String,
    pub output_path: String,
    pub s3_bucket: String,
    pub s3_base_path: String,
    pub heartbeat_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self {
            app_key: env_trimmed("BETFAIR_APP_KEY"),
            session_token: env_trimmed("BETFAIR_SESSION_TOKEN"),
            username: env_trimmed("BETFAIR_USERNAME"),
            password: env_trimmed("BETFAIR_PASSWORD"),
            market_ids: split_and_clean(&env_trimmed("MARKET_IDS")),
            event_type_id: env_trimmed("EVENT_TYPE_ID"),
            country_code: env_trimmed("COUNTRY_CODE"),
            market_type: env_trimmed("MARKET_TYPE"),
            output_path: env_trimmed("OUTPUT_PATH"),
            s3_bucket: env_trimmed("S3_BUCKET"),
            s3_base_path: env_trimmed("S3_BASE_PATH"),
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
        };

        if let Ok(raw) = std::env::var("HEARTBEAT_MS") {
            if let Ok(parsed) = raw.trim().parse::<u64>() {
                if parsed > 0 {
                    config.heartbeat_ms = parsed;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.app_key.is_empty() {
            bail!("BETFAIR_APP_KEY environment variable is required");
        }
        if self.session_token.is_empty() && (self.username.is_empty() || self.password.is_empty()) {
            bail!("BETFAIR_USERNAME and BETFAIR_PASSWORD must be set or provide BETFAIR_SESSION_TOKEN");
        }
        if self.market_ids.is_empty() && self.event_type_id.is_empty() {
            bail!("either MARKET_IDS or EVENT_TYPE_ID environment variable must be provided");
        }
        Ok(())
    }

    /// Market selection predicates for both the stream subscription and the
    /// catalogue lookups.
    pub fn market_filter(&self) -> MarketFilter {
        let mut filter = MarketFilter {
            market_ids: self.market_ids.clone(),
            ..Default::default()
        };
        if !self.event_type_id.is_empty() {
            filter.event_type_ids = vec![self.event_type_id.clone()];
        }
        if !self.country_code.is_empty() {
            filter.market_countries = vec![self.country_code.clone()];
        }
        if !self.market_type.is_empty() {
            filter.market_type_codes = vec![self.market_type.clone()];
        }
        filter
    }
}

fn env_trimmed(key: &str) -> String {
    std::env::var(key).unwrap_or_default().trim().to_string()
}

fn split_and_clean(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_clean() {
        assert_eq!(
            split_and_clean("1.234, 1.567 ,,1.890"),
            vec!["1.234".to_string(), "1.567".to_string(), "1.890".to_string()]
        );
        assert!(split_and_clean("").is_empty());
        assert!(split_and_clean(" , ,").is_empty());
    }

    #[test]
    fn test_validation_rules() {
        let mut config = Config {
            app_key: "key".to_string(),
            session_token: "token".to_string(),
            market_ids: vec!["1.234".to_string()],
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.app_key.clear();
        assert!(config.validate().is_err());
        config.app_key = "key".to_string();

        config.market_ids.clear();
        assert!(config.validate().is_err());
        config.event_type_id = "4339".to_string();
        assert!(config.validate().is_ok());

        config.session_token.clear();
        assert!(config.validate().is_err());
        config.username = "user".to_string();
        config.password = "pass".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_market_filter_from_config() {
        let config = Config {
            app_key: "key".to_string(),
            session_token: "token".to_string(),
            market_ids: vec!["1.234".to_string()],
            event_type_id: "4339".to_string(),
            country_code: "AU".to_string(),
            market_type: "WIN".to_string(),
            ..Default::default()
        };

        let filter = config.market_filter();
        assert_eq!(filter.market_ids, vec!["1.234".to_string()]);
        assert_eq!(filter.event_type_ids, vec!["4339".to_string()]);
        assert_eq!(filter.market_countries, vec!["AU".to_string()]);
        assert_eq!(filter.market_type_codes, vec!["WIN".to_string()]);
    }
}

use crate::template;
use crate::types::{EngineError, FetchConfig, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const ENV_PATH: &str = "FEED_ENGINE_CONFIG";
const DEFAULT_PATH: &str = "config/feed_engine.toml";

pub const DEFAULT_OUTPUT_FORMAT: &str = "{emoji} {body|truncate:100} - {date}\n{link|truncate:50}";

/// Global settings for the engine. Every field has a default, so a partial
/// TOML file (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_check_interval_seconds: u64,
    pub max_items_per_check: usize,
    pub feed_request_timeout: u64,
    pub feed_rate_limit_seconds: f64,
    pub max_message_length: usize,
    pub default_output_format: String,
    pub default_send_interval_seconds: f64,
    pub user_agent: String,
    /// Delivered ids remembered per subscription.
    pub seen_capacity: usize,
    pub max_fetch_retries: u32,
    /// Consecutive failures after which each failure is logged as an error.
    pub error_alert_threshold: u32,
    /// How often the scheduler reconciles its timers with the store.
    pub sync_interval_seconds: u64,
    pub database_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_check_interval_seconds: 300,
            max_items_per_check: 10,
            feed_request_timeout: 30,
            feed_rate_limit_seconds: 5.0,
            max_message_length: 130,
            default_output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            default_send_interval_seconds: 2.0,
            user_agent: "MeshCoreBot/1.0 FeedManager".to_string(),
            seen_capacity: 100,
            max_fetch_retries: 1,
            error_alert_threshold: 5,
            sync_interval_seconds: 30,
            database_url: "sqlite://feeds.db".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config(format!("invalid config: {}", e)))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("reading config from {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        info!("loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Resolution order: explicit path, `$FEED_ENGINE_CONFIG`,
    /// `config/feed_engine.toml`, built-in defaults. `DATABASE_URL` (also
    /// read from `.env`) overrides the database setting. The result is
    /// validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match explicit {
            Some(path) => Self::load_from(path)?,
            None => match std::env::var(ENV_PATH) {
                Ok(p) => {
                    let path = PathBuf::from(p);
                    if !path.exists() {
                        return Err(EngineError::Config(format!(
                            "{} points to non-existent path {}",
                            ENV_PATH,
                            path.display()
                        )));
                    }
                    Self::load_from(&path)?
                }
                Err(_) if Path::new(DEFAULT_PATH).exists() => {
                    Self::load_from(Path::new(DEFAULT_PATH))?
                }
                Err(_) => {
                    debug!("no config file found, using defaults");
                    Self::default()
                }
            },
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                config.database_url = url;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_check_interval_seconds == 0 {
            return Err(EngineError::Config(
                "default_check_interval_seconds must be positive".into(),
            ));
        }
        if self.max_items_per_check == 0 {
            return Err(EngineError::Config("max_items_per_check must be positive".into()));
        }
        if self.feed_request_timeout == 0 {
            return Err(EngineError::Config("feed_request_timeout must be positive".into()));
        }
        if !self.feed_rate_limit_seconds.is_finite() || self.feed_rate_limit_seconds < 0.0 {
            return Err(EngineError::Config(
                "feed_rate_limit_seconds must be a non-negative number".into(),
            ));
        }
        if !self.default_send_interval_seconds.is_finite()
            || self.default_send_interval_seconds < 0.0
        {
            return Err(EngineError::Config(
                "default_send_interval_seconds must be a non-negative number".into(),
            ));
        }
        if self.seen_capacity <= self.max_items_per_check {
            return Err(EngineError::Config(format!(
                "seen_capacity ({}) must exceed max_items_per_check ({})",
                self.seen_capacity, self.max_items_per_check
            )));
        }
        if self.sync_interval_seconds == 0 {
            return Err(EngineError::Config("sync_interval_seconds must be positive".into()));
        }
        template::validate(&self.default_output_format)?;
        Ok(())
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            user_agent: self.user_agent.clone(),
            timeout_seconds: self.feed_request_timeout,
            max_retries: self.max_fetch_retries,
            rate_limit: Duration::from_secs_f64(self.feed_rate_limit_seconds),
            ..FetchConfig::default()
        }
    }

    pub fn default_send_interval(&self) -> Duration {
        Duration::from_secs_f64(self.default_send_interval_seconds)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_message_length, 130);
        assert_eq!(config.fetch_config().rate_limit, Duration::from_secs(5));
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            max_items_per_check = 5
            feed_rate_limit_seconds = 1.5
            "#,
        )
        .unwrap();
        assert_eq!(config.max_items_per_check, 5);
        assert_eq!(config.fetch_config().rate_limit, Duration::from_millis(1500));
        assert_eq!(config.default_check_interval_seconds, 300);
    }

    #[test]
    fn seen_capacity_must_exceed_items_per_check() {
        let config = EngineConfig {
            seen_capacity: 10,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn bad_default_template_is_rejected() {
        let config = EngineConfig {
            default_output_format: "{title|explode:3}".into(),
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Template(_))));
    }

    #[test]
    fn loads_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_message_length = 200\nuser_agent = \"Test/1.0\"").unwrap();
        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.max_message_length, 200);
        assert_eq!(config.user_agent, "Test/1.0");
    }
}

//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub aggregation: AggregationConfig,
    pub cleaner: CleanerConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Aggregate store (sqlite file)
    pub url: String,
    /// Event store written by the SSO proxy. Empty means the aggregate store holds `log_logins` too.
    #[serde(default)]
    pub events_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub batch_size: u32,
    /// Events younger than this are left for the next run
    pub safety_delay_secs: u64,
    pub interval_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl AggregationConfig {
    pub fn safety_delay(&self) -> Duration {
        Duration::from_secs(self.safety_delay_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub retention_months: u32,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Largest span a time-series request may cover
    #[serde(default = "default_max_range_days")]
    pub max_range_days: i64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { max_range_days: default_max_range_days() }
    }
}

fn default_max_range_days() -> i64 {
    3660 // ~10 years
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryConfig {
    /// JSON list of {entityId, institutionId}
    #[serde(default)]
    pub idp_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CRUNCHER_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name(&config_path))
            .add_source(config::Environment::with_prefix("CRUNCHER").separator("__"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.http_port == 0 {
            anyhow::bail!("Invalid http_port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }

        if self.aggregation.batch_size == 0 {
            anyhow::bail!("aggregation.batch_size must be at least 1");
        }
        if self.aggregation.interval_secs == 0 {
            anyhow::bail!("aggregation.interval_secs must be at least 1");
        }

        if self.cleaner.enabled && self.cleaner.retention_months == 0 {
            anyhow::bail!("cleaner.retention_months must be at least 1 when the cleaner is enabled");
        }
        if self.cleaner.interval_secs == 0 {
            anyhow::bail!("cleaner.interval_secs must be at least 1");
        }

        if self.query.max_range_days < 1 {
            anyhow::bail!("query.max_range_days must be at least 1");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }

        Ok(())
    }

    /// Whether raw login events live in a database of their own
    pub fn separate_event_store(&self) -> bool {
        !self.database.events_url.is_empty() && self.database.events_url != self.database.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            server: ServerConfig { host: "127.0.0.1".into(), http_port: 8080 },
            database: DatabaseConfig { url: "cruncher.db".into(), events_url: String::new(), max_connections: 4 },
            aggregation: AggregationConfig {
                enabled: true,
                batch_size: 1000,
                safety_delay_secs: 60,
                interval_secs: 30,
                shutdown_timeout_secs: 5,
            },
            cleaner: CleanerConfig { enabled: true, retention_months: 24, interval_secs: 86_400 },
            query: QueryConfig::default(),
            directory: DirectoryConfig::default(),
            logging: LoggingConfig { level: "info".into() },
        }
    }

    #[test]
    fn sample_is_valid() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn rejects_zero_batch() {
        let mut config = sample();
        config.aggregation.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retention_only_matters_when_cleaner_enabled() {
        let mut config = sample();
        config.cleaner.retention_months = 0;
        assert!(config.validate().is_err());
        config.cleaner.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = sample();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml() {
        let raw = r#"
            [server]
            host = "0.0.0.0"
            http_port = 9090

            [database]
            url = "agg.db"
            events_url = "events.db"

            [aggregation]
            batch_size = 500
            safety_delay_secs = 120
            interval_secs = 15

            [cleaner]
            retention_months = 12
            interval_secs = 3600

            [logging]
            level = "debug"
        "#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        config.validate().unwrap();
        assert!(config.aggregation.enabled);
        assert_eq!(config.aggregation.shutdown_timeout_secs, 60);
        assert_eq!(config.database.max_connections, 8);
        assert_eq!(config.query.max_range_days, 3660);
        assert!(config.separate_event_store());
    }
}

//! Configuration for the pgebus event bus.
//!
//! Configuration is loaded in priority order:
//! 1. Environment variables prefixed `PGEBUS_`, nested keys separated by
//!    `__` (e.g. `PGEBUS_DATABASE__HOST`), highest priority
//! 2. Configuration file (`pgebus.toml`)
//! 3. Built-in defaults (lowest priority)
//!
//! The bus works out-of-the-box against a local PostgreSQL with the
//! defaults below; deployments override per environment.

use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;

use crate::error::{CoreError, Result};

const CONFIG_FILE: &str = "pgebus.toml";

/// Complete bus configuration with defaults, file, and environment
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connection and schema placement.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Dispatcher behavior.
    #[serde(default)]
    pub event_system: EventSystemConfig,
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Database port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database user.
    #[serde(default = "default_user")]
    pub user: String,

    /// Database password.
    #[serde(default)]
    pub password: String,

    /// Database name.
    #[serde(default = "default_database")]
    pub database: String,

    /// `application_name` reported to PostgreSQL.
    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Schema the events table lives in.
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Maximum connections in the shared pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSystemConfig {
    /// Push notification channel name.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Worker pool size.
    #[serde(default = "default_n_workers")]
    pub n_workers: usize,

    /// Fallback poll cadence in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: f64,

    /// Age after which a running row is considered abandoned.
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: u64,

    /// Cadence of the stale-lock sweep.
    #[serde(default = "default_stale_sweep_interval")]
    pub stale_sweep_interval_seconds: u64,

    /// Base delay for exponential retry backoff.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: f64,

    /// Ceiling on the retry backoff delay.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_seconds: f64,

    /// Jitter fraction (0.0 to 1.0) applied to backoff delays.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Default retry budget for newly published events.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Whether to hold a LISTEN connection. The poller alone is sufficient
    /// for correctness; disabling trades latency for one connection.
    #[serde(default = "default_true")]
    pub listen_enabled: bool,

    /// Whether the stale-lock sweep runs. Disable only when an operator
    /// process performs recovery instead.
    #[serde(default = "default_true")]
    pub stale_recovery_enabled: bool,
}

impl Config {
    /// Load configuration from defaults, `pgebus.toml`, and `PGEBUS_*`
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when extraction or validation fails.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed("PGEBUS_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| CoreError::InvalidInput(format!("failed to load configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.database.schema.is_empty() {
            return Err(CoreError::InvalidInput("database.schema must not be empty".into()));
        }
        if self.database.max_connections == 0 {
            return Err(CoreError::InvalidInput(
                "database.max_connections must be greater than 0".into(),
            ));
        }
        if self.event_system.channel.is_empty() {
            return Err(CoreError::InvalidInput("event_system.channel must not be empty".into()));
        }
        if self.event_system.n_workers == 0 {
            return Err(CoreError::InvalidInput(
                "event_system.n_workers must be greater than 0".into(),
            ));
        }
        if self.event_system.poll_interval_seconds <= 0.0 {
            return Err(CoreError::InvalidInput(
                "event_system.poll_interval_seconds must be positive".into(),
            ));
        }
        if self.event_system.max_attempts <= 0 {
            return Err(CoreError::InvalidInput(
                "event_system.max_attempts must be greater than 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.event_system.jitter_factor) {
            return Err(CoreError::InvalidInput(
                "event_system.jitter_factor must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { database: DatabaseConfig::default(), event_system: EventSystemConfig::default() }
    }
}

impl DatabaseConfig {
    /// Connection options for the shared pool.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .application_name(&self.application_name)
    }

    /// Connection description with the password masked for logging.
    pub fn display_masked(&self) -> String {
        format!(
            "postgres://{}:***@{}:{}/{}?schema={}",
            self.user, self.host, self.port, self.database, self.schema
        )
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            database: default_database(),
            application_name: default_application_name(),
            schema: default_schema(),
            max_connections: default_max_connections(),
        }
    }
}

impl EventSystemConfig {
    /// Poll cadence as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds)
    }

    /// Stale-lock threshold as a [`Duration`].
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }

    /// Sweep cadence as a [`Duration`].
    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_interval_seconds)
    }

    /// Backoff base delay as a [`Duration`].
    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_base_seconds)
    }

    /// Backoff ceiling as a [`Duration`].
    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_cap_seconds)
    }
}

impl Default for EventSystemConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            n_workers: default_n_workers(),
            poll_interval_seconds: default_poll_interval(),
            stale_after_seconds: default_stale_after(),
            stale_sweep_interval_seconds: default_stale_sweep_interval(),
            backoff_base_seconds: default_backoff_base(),
            backoff_cap_seconds: default_backoff_cap(),
            jitter_factor: default_jitter_factor(),
            max_attempts: default_max_attempts(),
            listen_enabled: true,
            stale_recovery_enabled: true,
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_application_name() -> String {
    "pgebus".to_string()
}

fn default_schema() -> String {
    "pgebus".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_channel() -> String {
    "events".to_string()
}

fn default_n_workers() -> usize {
    5
}

fn default_poll_interval() -> f64 {
    1.0
}

fn default_stale_after() -> u64 {
    300
}

fn default_stale_sweep_interval() -> u64 {
    60
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_backoff_cap() -> f64 {
    300.0
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_max_attempts() -> i32 {
    5
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();

        assert_eq!(config.database.schema, "pgebus");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.event_system.channel, "events");
        assert_eq!(config.event_system.n_workers, 5);
        assert_eq!(config.event_system.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.event_system.stale_after(), Duration::from_secs(300));
        assert_eq!(config.event_system.backoff_base(), Duration::from_secs(2));
        assert_eq!(config.event_system.backoff_cap(), Duration::from_secs(300));
        assert_eq!(config.event_system.max_attempts, 5);
        assert!(config.event_system.listen_enabled);
        assert!(config.event_system.stale_recovery_enabled);
    }

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = Config::default();
        config.event_system.n_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn jitter_out_of_range_rejected() {
        let mut config = Config::default();
        config.event_system.jitter_factor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_schema_rejected() {
        let mut config = Config::default();
        config.database.schema = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn masked_display_hides_password() {
        let mut config = DatabaseConfig::default();
        config.password = "hunter2".to_string();
        let masked = config.display_masked();
        assert!(!masked.contains("hunter2"));
        assert!(masked.contains("***"));
    }
}

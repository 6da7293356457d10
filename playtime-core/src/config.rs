use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct PlaytimeConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub steam: SteamConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct SteamConfig {
    pub api_key: String,
    #[serde(default = "default_steam_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_steam_base_url() -> String {
    "https://api.steampowered.com".to_string()
}

fn default_request_timeout() -> u64 {
    13
}

fn default_max_retries() -> usize {
    2
}

fn default_retry_delay() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollerConfig {
    pub interval_seconds: u64,
    /// Allowed gap between wall-clock and platform-counter durations before
    /// the platform counter wins the end boundary.
    pub drift_threshold_minutes: i64,
    pub control_capacity: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            drift_threshold_minutes: 3,
            control_capacity: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8767,
        }
    }
}

impl PlaytimeConfig {
    /// Load from a TOML file (optional) layered with `PLAYTIME__SECTION__KEY`
    /// environment variables.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("PLAYTIME").separator("__"))
            .build()?;
        let config: Self = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.steam.api_key.trim().is_empty() {
            return Err(ConfigError::Message("steam.api_key is not set".to_string()));
        }
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Message("database.url is not set".to_string()));
        }
        if self.poller.interval_seconds == 0 {
            return Err(ConfigError::Message(
                "poller.interval_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(name: &str, body: &str) -> String {
        let path = std::env::temp_dir().join(format!("{}-{}.toml", name, std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_load_applies_defaults() {
        let path = write_config(
            "playtime-defaults",
            r#"
            [database]
            url = "postgresql://tracker@localhost/playtime"

            [steam]
            api_key = "abc"
            "#,
        );

        let config = PlaytimeConfig::load(&path).unwrap();
        assert_eq!(config.poller.interval_seconds, 60);
        assert_eq!(config.poller.drift_threshold_minutes, 3);
        assert_eq!(config.steam.request_timeout_seconds, 13);
        assert_eq!(config.steam.base_url, "https://api.steampowered.com");
        assert_eq!(config.database.max_connections, 5);
        assert!(config.http.enabled);
        assert_eq!(config.service.log_level, "info");
    }

    #[test]
    fn test_load_rejects_blank_api_key() {
        let path = write_config(
            "playtime-blank-key",
            r#"
            [database]
            url = "postgresql://tracker@localhost/playtime"

            [steam]
            api_key = "  "
            "#,
        );

        let err = PlaytimeConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn test_load_rejects_zero_interval() {
        let path = write_config(
            "playtime-zero-interval",
            r#"
            [database]
            url = "postgresql://tracker@localhost/playtime"

            [steam]
            api_key = "abc"

            [poller]
            interval_seconds = 0
            drift_threshold_minutes = 3
            control_capacity = 4
            "#,
        );

        assert!(PlaytimeConfig::load(&path).is_err());
    }
}

//! Layered configuration: compiled defaults, then an optional JSON file,
//! then environment variables. CLI flags are applied last by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("{0}")]
    Invalid(String),
}

fn secret<'de, D: Deserializer<'de>>(d: D) -> Result<SecretString, D::Error> {
    String::deserialize(d).map(SecretString::from)
}

fn optional_secret<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(d)?
        .filter(|s| !s.is_empty())
        .map(SecretString::from))
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_secs: u64,
    pub client_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8000,
            max_send_queue: 256,
            heartbeat_secs: 30,
            client_timeout_secs: 90,
            cleanup_interval_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    #[serde(deserialize_with = "optional_secret")]
    pub password: Option<SecretString>,
    /// Full `redis://` URL; wins over host/port/password.
    pub url: Option<String>,
    /// Run single-process with the in-memory broker and subscription store.
    pub memory: bool,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 6379,
            password: None,
            url: None,
            memory: false,
        }
    }
}

impl RedisSettings {
    /// `url` if set, otherwise built from host, port and password. The
    /// password is percent-encoded into the userinfo.
    pub fn connection_url(&self) -> Result<String, ConfigError> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        let invalid = |key: &str, value: String| ConfigError::InvalidValue {
            key: key.into(),
            value,
        };
        let mut url = Url::parse("redis://localhost/").map_err(|e| ConfigError::Invalid(e.to_string()))?;
        url.set_host(Some(&self.host))
            .map_err(|_| invalid("redis.host", self.host.clone()))?;
        url.set_port(Some(self.port))
            .map_err(|_| invalid("redis.port", self.port.to_string()))?;
        if let Some(password) = &self.password {
            url.set_password(Some(password.expose_secret()))
                .map_err(|_| invalid("redis.password", "<redacted>".into()))?;
        }
        Ok(url.into())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    pub reconnect_delay_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    #[serde(deserialize_with = "secret")]
    pub jwt_secret: SecretString,
    pub algorithm: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: SecretString::from(""),
            algorithm: "HS256".into(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// SQLite file; in-memory when unset.
    pub db_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub log_level: String,
    /// `json` or `pretty`.
    pub format: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            format: "json".into(),
        }
    }
}

/// Process configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerSettings,
    pub redis: RedisSettings,
    pub listener: ListenerSettings,
    pub auth: AuthSettings,
    pub store: StoreSettings,
    pub telemetry: TelemetrySettings,
}

impl RelayConfig {
    /// Defaults, overlaid with `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Overlay environment variables. `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(host) = lookup("REDIS_HOST") {
            self.redis.host = host;
        }
        if let Some(port) = lookup("REDIS_PORT") {
            self.redis.port = parse_port("REDIS_PORT", &port)?;
        }
        if let Some(password) = lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()) {
            self.redis.password = Some(SecretString::from(password));
        }
        if let Some(url) = lookup("REDIS_URL").filter(|u| !u.is_empty()) {
            self.redis.url = Some(url);
        }
        if let Some(port) = lookup("RELAY_PORT") {
            self.server.port = parse_port("RELAY_PORT", &port)?;
        }
        if let Some(secret) = lookup("RELAY_JWT_SECRET") {
            self.auth.jwt_secret = SecretString::from(secret);
        }
        if let Some(path) = lookup("RELAY_DB_PATH").filter(|p| !p.is_empty()) {
            self.store.db_path = Some(PathBuf::from(path));
        }
        if let Some(level) = lookup("RELAY_LOG_LEVEL") {
            self.telemetry.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.expose_secret().is_empty() {
            return Err(ConfigError::Invalid(
                "a JWT secret is required (RELAY_JWT_SECRET or auth.jwt_secret)".into(),
            ));
        }
        if self.server.max_send_queue == 0 {
            return Err(ConfigError::InvalidValue {
                key: "server.max_send_queue".into(),
                value: "0".into(),
            });
        }
        for (key, value) in [
            ("server.heartbeat_secs", self.server.heartbeat_secs),
            ("server.cleanup_interval_secs", self.server.cleanup_interval_secs),
            ("listener.reconnect_delay_ms", self.listener.reconnect_delay_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    value: "0".into(),
                });
            }
        }
        if self.server.heartbeat_secs >= self.server.client_timeout_secs {
            return Err(ConfigError::Invalid(
                "server.heartbeat_secs must be shorter than server.client_timeout_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.server.heartbeat_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.server.client_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.server.cleanup_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.listener.reconnect_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.listener.shutdown_timeout_ms)
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.into(),
        value: value.into(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.redis.connection_url().unwrap(), "redis://localhost:6379/");
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.client_timeout(), Duration::from_secs(90));
        assert!(!config.redis.memory);
    }

    #[test]
    fn env_overrides_redis_and_server() {
        let mut config = RelayConfig::default();
        config
            .apply_env(env(&[
                ("REDIS_HOST", "cache.internal"),
                ("REDIS_PORT", "6380"),
                ("REDIS_PASSWORD", "hunter2"),
                ("RELAY_PORT", "9000"),
                ("RELAY_JWT_SECRET", "s3cret"),
                ("RELAY_DB_PATH", "/var/lib/relay/messages.db"),
                ("RELAY_LOG_LEVEL", "debug"),
            ]))
            .unwrap();

        assert_eq!(
            config.redis.connection_url().unwrap(),
            "redis://:hunter2@cache.internal:6380/"
        );
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.auth.jwt_secret.expose_secret(), "s3cret");
        assert_eq!(
            config.store.db_path.as_deref(),
            Some(Path::new("/var/lib/relay/messages.db"))
        );
        assert_eq!(config.telemetry.log_level, "debug");
    }

    #[test]
    fn redis_url_wins() {
        let mut config = RelayConfig::default();
        config
            .apply_env(env(&[("REDIS_HOST", "ignored"), ("REDIS_URL", "redis://cluster:7000/2")]))
            .unwrap();
        assert_eq!(config.redis.connection_url().unwrap(), "redis://cluster:7000/2");
    }

    #[test]
    fn redis_password_is_percent_encoded() {
        let mut config = RelayConfig::default();
        config
            .apply_env(env(&[("REDIS_HOST", "cache"), ("REDIS_PASSWORD", "p@ss:w/rd")]))
            .unwrap();
        let url = config.redis.connection_url().unwrap();
        assert_eq!(url, "redis://:p%40ss%3Aw%2Frd@cache:6379/");
        let parsed = Url::parse(&url).unwrap();
        assert_eq!(parsed.host_str(), Some("cache"));
        assert_eq!(parsed.port(), Some(6379));
    }

    #[test]
    fn bad_port_is_rejected() {
        let mut config = RelayConfig::default();
        let err = config.apply_env(env(&[("REDIS_PORT", "sixty")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "REDIS_PORT"));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: RelayConfig = serde_json::from_str(
            r#"{ "server": { "port": 7000 }, "auth": { "jwt_secret": "abc" }, "redis": { "password": "" } }"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.max_send_queue, 256);
        assert_eq!(config.auth.algorithm, "HS256");
        assert!(config.redis.password.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn file_layer_then_env_layer() {
        let dir = std::env::temp_dir().join(format!("relay-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relay.json");
        std::fs::write(&path, r#"{ "server": { "port": 7000 }, "redis": { "host": "from-file" } }"#).unwrap();

        let mut config = RelayConfig::from_file(&path).unwrap();
        config.apply_env(env(&[("REDIS_HOST", "from-env")])).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.redis.host, "from-env");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = RelayConfig::from_file(Path::new("/nonexistent/relay.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn validate_requires_secret() {
        assert!(RelayConfig::default().validate().is_err());
        let mut config = RelayConfig::default();
        config.auth.jwt_secret = SecretString::from("x");
        config.validate().unwrap();
    }

    fn valid() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.auth.jwt_secret = SecretString::from("x");
        config
    }

    fn rejected_key(config: &RelayConfig) -> String {
        match config.validate() {
            Err(ConfigError::InvalidValue { key, .. }) => key,
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        let mut config = valid();
        config.server.heartbeat_secs = 0;
        assert_eq!(rejected_key(&config), "server.heartbeat_secs");
    }

    #[test]
    fn zero_cleanup_interval_is_rejected() {
        let mut config = valid();
        config.server.cleanup_interval_secs = 0;
        assert_eq!(rejected_key(&config), "server.cleanup_interval_secs");
    }

    #[test]
    fn zero_reconnect_delay_is_rejected() {
        let mut config = valid();
        config.listener.reconnect_delay_ms = 0;
        assert_eq!(rejected_key(&config), "listener.reconnect_delay_ms");
    }

    #[test]
    fn heartbeat_must_be_shorter_than_timeout() {
        let mut config = valid();
        config.server.heartbeat_secs = 90;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut config = RelayConfig::default();
        config.auth.jwt_secret = SecretString::from("top-secret-value");
        config.redis.password = Some(SecretString::from("redis-pass"));
        let debug = format!("{config:?}");
        assert!(!debug.contains("top-secret-value"));
        assert!(!debug.contains("redis-pass"));
    }
}

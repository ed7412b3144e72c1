use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use dotenvy::dotenv;

use crate::error::BrokerError;
use crate::storage::DEFAULT_COLLECTION;

/// One hundred years
const MAX_RESET_PERIOD_HOURS: u64 = 100 * 365 * 24;

/// CORS configuration mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsMode {
    /// Only allow localhost origins (default, for local development)
    LocalhostOnly,
    /// Allow all origins
    AllowAll,
    /// Allow specific origins (comma-separated list)
    AllowList(Vec<String>),
}

/// Where usage records are persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    MongoDb {
        url: String,
        database: String,
        collection: String,
    },
    Turso {
        path: PathBuf,
        table: String,
    },
    /// Process memory only; usage is lost on restart
    Memory,
}

/// Upstream realtime voice API settings
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub voice: String,
}

pub struct Config {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub cors_mode: CorsMode,
    pub token_limit: u64,
    pub reset_period_hours: u64,
    pub storage: StorageConfig,
    pub storage_timeout: Duration,
    pub realtime: RealtimeConfig,
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, BrokerError> {
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| BrokerError::Config(format!("{name} has an invalid value: {raw}"))),
        _ => Ok(default),
    }
}

fn positive_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
) -> Result<u64, BrokerError> {
    match parse_var(lookup, name, default)? {
        0 => Err(BrokerError::Config(format!("{name} must be greater than 0"))),
        value => Ok(value),
    }
}

fn string_var(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn optional_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, BrokerError> {
        dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BrokerError> {
        let host = string_var(&lookup, "BROKER_HOST", "127.0.0.1");
        let port = parse_var(&lookup, "BROKER_PORT", 3000u16)?;
        let api_key = optional_var(&lookup, "BROKER_API_KEY");

        // CORS configuration: "localhost" (default), "*" (allow all), or comma-separated origins
        let cors_mode = match lookup("BROKER_CORS_ORIGINS").as_deref().map(str::trim) {
            Some("*") => CorsMode::AllowAll,
            Some(origins) if !origins.is_empty() && origins != "localhost" => CorsMode::AllowList(
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            _ => CorsMode::LocalhostOnly,
        };

        let token_limit = positive_var(&lookup, "TOKEN_LIMIT_PER_IP", 100_000)?;
        let reset_period_hours = positive_var(&lookup, "TOKEN_RESET_PERIOD_HOURS", 24)?;
        if reset_period_hours > MAX_RESET_PERIOD_HOURS {
            return Err(BrokerError::Config(format!(
                "TOKEN_RESET_PERIOD_HOURS is too large: {reset_period_hours}"
            )));
        }

        let storage = match string_var(&lookup, "STORAGE_BACKEND", "mongodb")
            .to_lowercase()
            .as_str()
        {
            "mongodb" | "mongo" => StorageConfig::MongoDb {
                url: string_var(&lookup, "MONGODB_URL", "mongodb://localhost:27017"),
                database: string_var(&lookup, "MONGODB_DATABASE", "realtime_broker"),
                collection: string_var(&lookup, "MONGODB_COLLECTION", DEFAULT_COLLECTION),
            },
            "turso" | "sqlite" => StorageConfig::Turso {
                path: optional_var(&lookup, "TURSO_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(default_db_path),
                table: DEFAULT_COLLECTION.to_string(),
            },
            "memory" => StorageConfig::Memory,
            other => {
                return Err(BrokerError::Config(format!(
                    "STORAGE_BACKEND must be one of mongodb, turso, memory (got {other})"
                )));
            }
        };

        let storage_timeout =
            Duration::from_secs(positive_var(&lookup, "STORAGE_TIMEOUT_SECS", 5)?);

        let realtime = RealtimeConfig {
            api_key: optional_var(&lookup, "OPENAI_API_KEY"),
            api_base: string_var(&lookup, "OPENAI_API_BASE", "https://api.openai.com")
                .trim_end_matches('/')
                .to_string(),
            model: string_var(&lookup, "OPENAI_MODEL", "gpt-realtime"),
            voice: string_var(&lookup, "OPENAI_VOICE", "marin"),
        };

        Ok(Self {
            host,
            port,
            api_key,
            cors_mode,
            token_limit,
            reset_period_hours,
            storage,
            storage_timeout,
            realtime,
        })
    }

    pub fn reset_period(&self) -> TimeDelta {
        // Range checked in from_lookup
        TimeDelta::hours(self.reset_period_hours as i64)
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("realtime-broker")
        .join("usage.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, BrokerError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.api_key, None);
        assert_eq!(config.cors_mode, CorsMode::LocalhostOnly);
        assert_eq!(config.token_limit, 100_000);
        assert_eq!(config.reset_period(), TimeDelta::hours(24));
        assert_eq!(config.storage_timeout, Duration::from_secs(5));
        assert_eq!(
            config.storage,
            StorageConfig::MongoDb {
                url: "mongodb://localhost:27017".into(),
                database: "realtime_broker".into(),
                collection: "usage_tracking".into(),
            }
        );
        assert_eq!(config.realtime.api_base, "https://api.openai.com");
        assert_eq!(config.realtime.model, "gpt-realtime");
        assert_eq!(config.realtime.voice, "marin");
        assert!(config.realtime.api_key.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("BROKER_PORT", "8080"),
            ("BROKER_API_KEY", " secret "),
            ("BROKER_CORS_ORIGINS", "https://a.example, https://b.example"),
            ("TOKEN_LIMIT_PER_IP", "500"),
            ("TOKEN_RESET_PERIOD_HOURS", "1"),
            ("STORAGE_BACKEND", "turso"),
            ("TURSO_PATH", "/tmp/usage.db"),
            ("OPENAI_API_BASE", "http://localhost:9000/"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(
            config.cors_mode,
            CorsMode::AllowList(vec![
                "https://a.example".into(),
                "https://b.example".into()
            ])
        );
        assert_eq!(config.token_limit, 500);
        assert_eq!(config.reset_period(), TimeDelta::hours(1));
        assert_eq!(
            config.storage,
            StorageConfig::Turso {
                path: PathBuf::from("/tmp/usage.db"),
                table: "usage_tracking".into(),
            }
        );
        assert_eq!(config.realtime.api_base, "http://localhost:9000");
    }

    #[test]
    fn test_cors_allow_all() {
        let config = config_from(&[("BROKER_CORS_ORIGINS", "*")]).unwrap();
        assert_eq!(config.cors_mode, CorsMode::AllowAll);
    }

    #[test]
    fn test_rejects_non_positive_limits() {
        assert!(matches!(
            config_from(&[("TOKEN_LIMIT_PER_IP", "0")]),
            Err(BrokerError::Config(_))
        ));
        assert!(matches!(
            config_from(&[("TOKEN_RESET_PERIOD_HOURS", "-3")]),
            Err(BrokerError::Config(_))
        ));
        assert!(matches!(
            config_from(&[("TOKEN_RESET_PERIOD_HOURS", "99999999999999999")]),
            Err(BrokerError::Config(_))
        ));
        assert!(matches!(
            config_from(&[("BROKER_PORT", "http")]),
            Err(BrokerError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_backend() {
        assert!(matches!(
            config_from(&[("STORAGE_BACKEND", "redis")]),
            Err(BrokerError::Config(_))
        ));
        let config = config_from(&[("STORAGE_BACKEND", "memory")]).unwrap();
        assert_eq!(config.storage, StorageConfig::Memory);
    }
}

use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

/// Idle gap after which a session's conversation is superseded.
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 15 * 60;

/// Lifetime of a memoized reply; also the sweep interval.
const DEFAULT_RESPONSE_CACHE_TTL_SECS: u64 = 60 * 60;

const DEFAULT_DEDUP_MAX_ENTRIES: usize = 1000;
const DEFAULT_DEDUP_PREFIX_CHARS: usize = 40;
const DEFAULT_BACKGROUND_QUEUE_SIZE: usize = 256;
const DEFAULT_SESSION_RECORD_TTL_DAYS: u64 = 30;
const DEFAULT_ANALYTICS_TIMEOUT_SECS: u64 = 10;
const DEFAULT_ANALYTICS_RETRY_MAX_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub storage: StorageConfig,
    pub provider: ProviderConfig,
    pub analytics: AnalyticsConfig,
    pub correlation: CorrelationConfig,
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub mongodb: Option<MongoConfig>,
    /// Durable session records expire after this long without activity.
    pub session_record_ttl_days: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Mongodb,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    Mock,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// Upper bound on time spent retrying a failed forward.
    pub retry_max_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    /// Tag stamped on every conversation this deployment produces.
    pub client_tag: String,
    pub default_language: String,
    pub session_timeout_secs: u64,
    pub response_cache_ttl_secs: u64,
    pub dedup_max_entries: usize,
    pub dedup_prefix_chars: usize,
    pub background_queue_size: usize,
}

impl ChatConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let backend: StorageBackend = get_env("STORAGE_BACKEND", Some("mongodb"), false)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let mongodb = match backend {
            StorageBackend::Mongodb => Some(MongoConfig {
                uri: get_env("MONGODB_URI", None, is_prod)?,
                database: get_env("MONGODB_DATABASE", Some("chat_db"), is_prod)?,
            }),
            StorageBackend::Memory => None,
        };

        let provider_kind: ProviderKind = get_env("CHAT_PROVIDER", Some("gemini"), false)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let api_key = match provider_kind {
            ProviderKind::Gemini => get_env("GOOGLE_API_KEY", None, is_prod)?,
            ProviderKind::Mock => env::var("GOOGLE_API_KEY").unwrap_or_default(),
        };

        let analytics_enabled = parse_bool(&get_env("ANALYTICS_ENABLED", Some("false"), false)?);
        let analytics_base_url = if analytics_enabled {
            get_env("ANALYTICS_BASE_URL", None, is_prod)?
        } else {
            env::var("ANALYTICS_BASE_URL").unwrap_or_default()
        };

        Ok(ChatConfig {
            common: common_config,
            storage: StorageConfig {
                backend,
                mongodb,
                session_record_ttl_days: parse_or(
                    "SESSION_RECORD_TTL_DAYS",
                    DEFAULT_SESSION_RECORD_TTL_DAYS,
                ),
            },
            provider: ProviderConfig {
                kind: provider_kind,
                api_key,
                model: get_env("CHAT_MODEL", Some("gemini-2.0-flash"), false)?,
            },
            analytics: AnalyticsConfig {
                enabled: analytics_enabled,
                base_url: analytics_base_url,
                api_key: env::var("ANALYTICS_API_KEY").ok().filter(|k| !k.is_empty()),
                timeout_secs: parse_or("ANALYTICS_TIMEOUT_SECS", DEFAULT_ANALYTICS_TIMEOUT_SECS),
                retry_max_secs: parse_or(
                    "ANALYTICS_RETRY_MAX_SECS",
                    DEFAULT_ANALYTICS_RETRY_MAX_SECS,
                ),
            },
            correlation: CorrelationConfig {
                client_tag: get_env("CLIENT_TAG", Some("web"), false)?,
                default_language: get_env("DEFAULT_LANGUAGE", Some("en"), false)?,
                session_timeout_secs: parse_or(
                    "SESSION_TIMEOUT_SECS",
                    DEFAULT_SESSION_TIMEOUT_SECS,
                ),
                response_cache_ttl_secs: parse_or(
                    "RESPONSE_CACHE_TTL_SECS",
                    DEFAULT_RESPONSE_CACHE_TTL_SECS,
                ),
                dedup_max_entries: parse_or("DEDUP_MAX_ENTRIES", DEFAULT_DEDUP_MAX_ENTRIES),
                dedup_prefix_chars: parse_or("DEDUP_PREFIX_CHARS", DEFAULT_DEDUP_PREFIX_CHARS),
                background_queue_size: parse_or(
                    "BACKGROUND_QUEUE_SIZE",
                    DEFAULT_BACKGROUND_QUEUE_SIZE,
                ),
            },
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|e| !e.is_empty()),
        })
    }
}

impl CorrelationConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn response_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.response_cache_ttl_secs)
    }
}

impl AnalyticsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_max_elapsed(&self) -> Duration {
        Duration::from_secs(self.retry_max_secs)
    }
}

impl StorageConfig {
    pub fn session_record_ttl(&self) -> Duration {
        Duration::from_secs(self.session_record_ttl_days * 24 * 60 * 60)
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mongodb" | "mongo" => Ok(StorageBackend::Mongodb),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(format!("Invalid storage backend: {}", s)),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gemini" => Ok(ProviderKind::Gemini),
            "mock" => Ok(ProviderKind::Mock),
            _ => Err(format!("Invalid chat provider: {}", s)),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_backend_parsing() {
        assert_eq!("memory".parse::<StorageBackend>(), Ok(StorageBackend::Memory));
        assert_eq!("MongoDB".parse::<StorageBackend>(), Ok(StorageBackend::Mongodb));
        assert!("postgres".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("mock".parse::<ProviderKind>(), Ok(ProviderKind::Mock));
        assert!("openai".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }
}

//! Process configuration from environment variables.
//!
//! Every key has a development default except `DATABASE_URL`, which is
//! required once persistent stores are enabled. Missing outbound credentials
//! switch the corresponding collaborator to its in-process stand-in.
//! `LOG_FORMAT` and `RUST_LOG` are read by `artforge-observability`.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use artforge_auth::WebhookSecret;
use artforge_predictions::ModelCatalog;

use crate::tasks::RetryPolicy;

const DEV_JWT_SECRET: &str = "dev-secret";
const DEV_WEBHOOK_SECRET: &str = "dev-webhook-secret";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} is required: {reason}")]
    Missing { key: &'static str, reason: &'static str },

    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub base_url: String,
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub webhook_secret: WebhookSecret,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub public_base_url: String,
    /// `None`: jobs go to the in-process stub provider.
    pub provider: Option<ProviderConfig>,
    /// `None`: outputs are kept in memory.
    pub storage: Option<StorageConfig>,
    /// `None`: titles always use the fallback.
    pub titles: Option<TitleConfig>,
    pub worker_poll_interval: Duration,
    pub worker_max_attempts: u32,
    pub catalog: ModelCatalog,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_addr = match get("BIND_ADDR") {
            Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
                key: "BIND_ADDR",
                message: format!("{e}"),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let jwt_secret = get("JWT_SECRET").unwrap_or_else(|| {
            warn!("JWT_SECRET not set; using insecure dev default");
            DEV_JWT_SECRET.to_string()
        });

        let raw_webhook_secret = get("WEBHOOK_SECRET").unwrap_or_else(|| {
            warn!("WEBHOOK_SECRET not set; using insecure dev default");
            DEV_WEBHOOK_SECRET.to_string()
        });
        let webhook_secret =
            WebhookSecret::parse(&raw_webhook_secret).map_err(|e| ConfigError::Invalid {
                key: "WEBHOOK_SECRET",
                message: e.to_string(),
            })?;

        let use_persistent_stores = match get("USE_PERSISTENT_STORES") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "USE_PERSISTENT_STORES",
                message: format!("expected true or false, got {raw:?}"),
            })?,
            None => false,
        };
        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing {
                key: "DATABASE_URL",
                reason: "USE_PERSISTENT_STORES is enabled",
            });
        }

        let public_base_url = get("PUBLIC_BASE_URL")
            .unwrap_or_else(|| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let provider = match get("PROVIDER_API_TOKEN") {
            Some(api_token) => Some(ProviderConfig {
                base_url: get("PROVIDER_BASE_URL")
                    .unwrap_or_else(|| "https://api.replicate.com".to_string()),
                api_token,
            }),
            None => {
                warn!("PROVIDER_API_TOKEN not set; jobs go to the stub provider");
                None
            }
        };

        let storage = get("STORAGE_BASE_URL").map(|base_url| StorageConfig {
            base_url,
            api_token: get("STORAGE_API_TOKEN"),
        });

        let titles = get("TITLE_API_KEY").map(|api_key| TitleConfig {
            api_url: get("TITLE_API_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            model: get("TITLE_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
        });

        let worker_poll_interval =
            Duration::from_millis(parse_number("WORKER_POLL_MS", get("WORKER_POLL_MS"), 500)?);
        let worker_max_attempts =
            parse_number("WORKER_MAX_ATTEMPTS", get("WORKER_MAX_ATTEMPTS"), 8u32)?;
        if worker_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_MAX_ATTEMPTS",
                message: "must be at least 1".to_string(),
            });
        }

        let catalog = ModelCatalog::with_overrides(|key| get(key)).map_err(|e| {
            ConfigError::Invalid {
                key: "MODEL_*/COST_*",
                message: e.to_string(),
            }
        })?;

        Ok(Self {
            bind_addr,
            jwt_secret,
            webhook_secret,
            use_persistent_stores,
            database_url,
            public_base_url,
            provider,
            storage,
            titles,
            worker_poll_interval,
            worker_max_attempts,
            catalog,
        })
    }

    /// Retry policy for transition tasks.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.worker_max_attempts,
            ..RetryPolicy::default()
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_number<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artforge_predictions::OperationKind;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_dev_defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.bind_addr.port(), 8080);
        assert_eq!(c.jwt_secret, DEV_JWT_SECRET);
        assert!(!c.use_persistent_stores);
        assert!(c.provider.is_none());
        assert!(c.storage.is_none());
        assert!(c.titles.is_none());
        assert_eq!(c.worker_poll_interval, Duration::from_millis(500));
        assert_eq!(c.retry_policy().max_attempts, 8);
    }

    #[test]
    fn reads_collaborators_and_overrides() {
        let c = config(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("PUBLIC_BASE_URL", "https://art.example/"),
            ("PROVIDER_API_TOKEN", "r8_token"),
            ("STORAGE_BASE_URL", "https://bucket.example"),
            ("TITLE_API_KEY", "sk-test"),
            ("WORKER_MAX_ATTEMPTS", "3"),
            ("COST_EDIT", "7"),
        ])
        .unwrap();
        assert_eq!(c.bind_addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(c.public_base_url, "https://art.example");
        assert_eq!(c.provider.unwrap().base_url, "https://api.replicate.com");
        assert_eq!(c.storage.unwrap().api_token, None);
        assert_eq!(c.titles.unwrap().model, "gpt-4o-mini");
        assert_eq!(c.worker_max_attempts, 3);
        assert_eq!(c.catalog.spec(OperationKind::Edit).unwrap().cost, 7);
    }

    #[test]
    fn persistent_stores_need_a_database() {
        assert_eq!(
            config(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err(),
            ConfigError::Missing {
                key: "DATABASE_URL",
                reason: "USE_PERSISTENT_STORES is enabled"
            }
        );
        let c = config(&[
            ("USE_PERSISTENT_STORES", "1"),
            ("DATABASE_URL", "postgres://localhost/artforge"),
        ])
        .unwrap();
        assert!(c.use_persistent_stores);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            config(&[("WORKER_POLL_MS", "soon")]),
            Err(ConfigError::Invalid { key: "WORKER_POLL_MS", .. })
        ));
        assert!(config(&[("WORKER_MAX_ATTEMPTS", "0")]).is_err());
        assert!(config(&[("USE_PERSISTENT_STORES", "maybe")]).is_err());
        assert!(config(&[("WEBHOOK_SECRET", "whsec_!!!")]).is_err());
        assert!(config(&[("COST_AVATAR", "lots")]).is_err());
    }
}

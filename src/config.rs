use crate::domains::core::retry::RetryPolicy;
use crate::errors::{ServiceError, ServiceResult};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which blob store backs the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Local {
        base_path: String,
        public_base_url: String,
    },
    Api {
        base_url: String,
    },
}

/// Where blob deletion runs after the document record is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobDeletionMode {
    /// Retry loop runs inside `remove_document`.
    Inline,
    /// Retry loop runs in a spawned task bounded by `timeout`.
    Background { timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub storage: StorageConfig,
    /// Age after which an unreferenced upload is swept.
    pub temp_retention: chrono::Duration,
    pub sweep_interval: Duration,
    pub queue_interval: Duration,
    pub blob_retry: RetryPolicy,
    pub blob_deletion: BlobDeletionMode,
    /// Clear host references and delete the record in one transaction.
    pub transactional_delete: bool,
    pub max_upload_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:documents.sqlite?mode=rwc".to_string(),
            storage: StorageConfig::Local {
                base_path: "./storage".to_string(),
                public_base_url: "/files".to_string(),
            },
            temp_retention: chrono::Duration::hours(24),
            sweep_interval: Duration::from_secs(60 * 60),
            queue_interval: Duration::from_secs(5 * 60),
            blob_retry: RetryPolicy::default(),
            blob_deletion: BlobDeletionMode::Inline,
            transactional_delete: false,
            max_upload_bytes: 100 * 1024 * 1024,
        }
    }
}

fn read_var(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> ServiceResult<T> {
    match read_var(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ServiceError::Configuration(format!("{} has an invalid value: '{}'", key, raw))),
    }
}

fn parse_bool(key: &str, default: bool) -> ServiceResult<bool> {
    match read_var(key).map(|v| v.to_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ServiceError::Configuration(format!("{} must be a boolean, got '{}'", key, v))),
    }
}

impl EngineConfig {
    /// Load configuration from the process environment, reading `.env` first if present.
    pub fn from_env() -> ServiceResult<Self> {
        // A missing .env file is fine
        let _ = dotenv::dotenv();
        Self::from_current_env()
    }

    /// Load configuration from variables already in the environment.
    pub fn from_current_env() -> ServiceResult<Self> {
        let defaults = Self::default();

        let storage = match read_var("DOCUMENT_STORAGE_PROVIDER").as_deref().unwrap_or("local") {
            "local" => StorageConfig::Local {
                base_path: read_var("DOCUMENT_STORAGE_PATH").unwrap_or_else(|| "./storage".to_string()),
                public_base_url: read_var("DOCUMENT_PUBLIC_BASE_URL").unwrap_or_else(|| "/files".to_string()),
            },
            "api" => StorageConfig::Api {
                base_url: read_var("DOCUMENT_STORAGE_API_URL").ok_or_else(|| {
                    ServiceError::Configuration("DOCUMENT_STORAGE_API_URL is required for the api provider".to_string())
                })?,
            },
            other => {
                return Err(ServiceError::Configuration(format!(
                    "Unknown DOCUMENT_STORAGE_PROVIDER '{}', expected 'local' or 'api'",
                    other
                )))
            }
        };

        let retention_hours: i64 = parse_var("DOCUMENT_TEMP_RETENTION_HOURS", 24)?;
        if retention_hours < 0 {
            return Err(ServiceError::Configuration("DOCUMENT_TEMP_RETENTION_HOURS cannot be negative".to_string()));
        }

        let blob_retry = RetryPolicy {
            max_attempts: parse_var("DOCUMENT_BLOB_DELETE_MAX_ATTEMPTS", defaults.blob_retry.max_attempts)?,
            initial_backoff: Duration::from_millis(parse_var("DOCUMENT_BLOB_DELETE_BACKOFF_MS", 200u64)?),
            max_backoff: Duration::from_millis(parse_var("DOCUMENT_BLOB_DELETE_MAX_BACKOFF_MS", 5_000u64)?),
            multiplier: defaults.blob_retry.multiplier,
        };

        let blob_deletion = match read_var("DOCUMENT_BLOB_DELETE_BACKGROUND_TIMEOUT_SECS") {
            None => BlobDeletionMode::Inline,
            Some(_) => BlobDeletionMode::Background {
                timeout: Duration::from_secs(parse_var("DOCUMENT_BLOB_DELETE_BACKGROUND_TIMEOUT_SECS", 30u64)?),
            },
        };

        Ok(Self {
            database_url: read_var("DOCUMENT_DATABASE_URL").unwrap_or(defaults.database_url),
            storage,
            temp_retention: chrono::Duration::hours(retention_hours),
            sweep_interval: Duration::from_secs(parse_var("DOCUMENT_SWEEP_INTERVAL_SECS", 3_600u64)?),
            queue_interval: Duration::from_secs(parse_var("DOCUMENT_QUEUE_INTERVAL_SECS", 300u64)?),
            blob_retry,
            blob_deletion,
            transactional_delete: parse_bool("DOCUMENT_TRANSACTIONAL_DELETE", false)?,
            max_upload_bytes: parse_var("DOCUMENT_MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment variables are process-wide; keep every env mutation in this one test.
    #[test]
    fn test_from_current_env_reads_overrides_and_rejects_bad_values() {
        env::set_var("DOCUMENT_STORAGE_PROVIDER", "api");
        env::set_var("DOCUMENT_STORAGE_API_URL", "https://blobs.internal");
        env::set_var("DOCUMENT_TEMP_RETENTION_HOURS", "6");
        env::set_var("DOCUMENT_BLOB_DELETE_MAX_ATTEMPTS", "5");
        env::set_var("DOCUMENT_BLOB_DELETE_BACKGROUND_TIMEOUT_SECS", "12");
        env::set_var("DOCUMENT_TRANSACTIONAL_DELETE", "yes");

        let config = EngineConfig::from_current_env().unwrap();
        assert_eq!(config.storage, StorageConfig::Api { base_url: "https://blobs.internal".to_string() });
        assert_eq!(config.temp_retention, chrono::Duration::hours(6));
        assert_eq!(config.blob_retry.max_attempts, 5);
        assert_eq!(config.blob_deletion, BlobDeletionMode::Background { timeout: Duration::from_secs(12) });
        assert!(config.transactional_delete);

        env::set_var("DOCUMENT_TRANSACTIONAL_DELETE", "maybe");
        assert!(matches!(EngineConfig::from_current_env(), Err(ServiceError::Configuration(_))));

        env::set_var("DOCUMENT_TRANSACTIONAL_DELETE", "false");
        env::set_var("DOCUMENT_STORAGE_PROVIDER", "ftp");
        assert!(matches!(EngineConfig::from_current_env(), Err(ServiceError::Configuration(_))));

        for key in [
            "DOCUMENT_STORAGE_PROVIDER",
            "DOCUMENT_STORAGE_API_URL",
            "DOCUMENT_TEMP_RETENTION_HOURS",
            "DOCUMENT_BLOB_DELETE_MAX_ATTEMPTS",
            "DOCUMENT_BLOB_DELETE_BACKGROUND_TIMEOUT_SECS",
            "DOCUMENT_TRANSACTIONAL_DELETE",
        ] {
            env::remove_var(key);
        }

        let config = EngineConfig::from_current_env().unwrap();
        assert_eq!(config.blob_deletion, BlobDeletionMode::Inline);
        assert!(matches!(config.storage, StorageConfig::Local { .. }));
    }
}

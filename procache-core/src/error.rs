//! Error types for procache operations

use thiserror::Error;

/// Persistent store errors.
///
/// These surface from backends; the cache layer swallows them (log +
/// benign value) so a broken store degrades to memory-only operation
/// instead of failing reads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed to open store environment: {reason}")]
    EnvOpen { reason: String },

    #[error("Failed to open database {name}: {reason}")]
    DbOpen { name: String, reason: String },

    #[error("Transaction failed: {reason}")]
    Transaction { reason: String },

    #[error("Serialization failed for bucket {bucket}: {reason}")]
    Serialization { bucket: String, reason: String },

    #[error("I/O error: {reason}")]
    Io { reason: String },
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io {
            reason: e.to_string(),
        }
    }
}

/// Cache manager errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Refusing to cache null data for {bucket} / {key}")]
    NullData { bucket: String, key: String },

    #[error("Invalid TTL {ttl_seconds}s for {bucket} / {key}: must be positive")]
    InvalidTtl {
        bucket: String,
        key: String,
        ttl_seconds: u32,
    },
}

/// Configuration errors. These are misconfigurations, not runtime
/// conditions: construction fails fast instead of limping along.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: &'static str },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Master error type for procache operations.
#[derive(Debug, Error)]
pub enum ProcacheError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for procache operations.
pub type ProcacheResult<T> = Result<T, ProcacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Transaction {
            reason: "map full".into(),
        };
        assert!(err.to_string().contains("map full"));
    }

    #[test]
    fn test_master_error_conversion() {
        let err: ProcacheError = CacheError::NullData {
            bucket: "/b".into(),
            key: "/k".into(),
        }
        .into();
        assert!(matches!(err, ProcacheError::Cache(_)));
    }
}

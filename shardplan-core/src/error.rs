//! Error types for shardplan
//!
//! Provides the error type shared by the data model and the storage layer.

use thiserror::Error;

/// Result type alias for shardplan operations
pub type Result<T> = std::result::Result<T, ShardplanError>;

/// Unified error type for the shardplan data model
#[derive(Error, Debug)]
pub enum ShardplanError {
    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    // ===== Cluster Errors =====
    #[error("Store {0} not found")]
    StoreNotFound(u64),

    #[error("Store {0} is already blocked")]
    StoreBlocked(u64),

    #[error("ID allocation failed: {0}")]
    IdAllocation(String),

    // ===== Codec Errors =====
    #[error("Invalid hex key: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Invalid encoded key: {0}")]
    Codec(String),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ShardplanError {
    /// Check if this error is a missing key
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShardplanError::NotFound(_))
    }
}

//! Rule engine errors

use shardplan_core::ShardplanError;
use thiserror::Error;

/// Rule engine errors
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Invalid rule content: {0}")]
    InvalidRule(String),

    #[error("Invalid hex key: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Failed to build rule list: {0}")]
    BuildRuleList(String),

    #[error("Rule manager is not initialized")]
    NotInitialized,

    #[error("Rule storage error: {0}")]
    Storage(#[from] ShardplanError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RuleError>;

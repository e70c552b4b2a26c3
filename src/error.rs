//! Error types for the state-update engine.

use crate::types::BatchId;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dimension mismatch for {key}: expected {expected}, got {got}")]
    DimensionMismatch {
        key: String,
        expected: usize,
        got: usize,
    },

    #[error("Key {key} already split into {existing} shards (requested {requested})")]
    AlreadySplit {
        key: String,
        existing: usize,
        requested: usize,
    },

    #[error(
        "Incomplete shard set for {key}: expected {expected} shards, missing {missing:?}, duplicates {duplicates:?}"
    )]
    IncompleteShardSet {
        key: String,
        expected: usize,
        missing: Vec<usize>,
        duplicates: Vec<usize>,
    },

    #[error("Key {key} has m = {m} <= tau_local = {tau_local}, refusing to split")]
    BelowThreshold {
        key: String,
        m: usize,
        tau_local: usize,
    },

    #[error("Invalid shard for {key}: {reason}")]
    InvalidShard { key: String, reason: String },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Key already registered: {0}")]
    KeyExists(String),

    #[error("Batch {0:?} is not newer than the last committed batch {1:?}")]
    StaleBatch(BatchId, BatchId),

    #[error("Worker pool is closed")]
    WorkerPoolClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid checkpoint format: {0}")]
    InvalidFormat(String),

    #[error("Checkpoint directory is locked by another process")]
    Locked,
}

impl EngineError {
    /// Whether this error only affects one key and the stream may go on.
    pub fn is_per_key(&self) -> bool {
        matches!(
            self,
            EngineError::DimensionMismatch { .. }
                | EngineError::IncompleteShardSet { .. }
                | EngineError::InvalidShard { .. }
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            EngineError::Serialization(e.to_string())
        } else {
            EngineError::Deserialization(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for EngineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EngineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        EngineError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

//! Error types for the master orchestration core
//!
//! Covers metadata, coordination, dispatch, messaging and lifecycle errors.
//! The type is `Clone` so that a single recorded fault can be handed out
//! repeatedly by the error center.

use thiserror::Error;

/// Primary error type for all master operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MasterError {
    // ========== Metadata Errors ==========

    /// Metadata record does not exist
    #[error("Metadata not found for {key}")]
    MetaNotFound { key: String },

    /// Metadata store failed or returned corrupt data
    #[error("Metadata store error: {message}")]
    MetaStore { message: String },

    /// Backend store registered twice under the same ID
    #[error("Metastore ID {id} already registered")]
    MetaStoreIdDuplicate { id: String },

    /// Config passed for a master-type worker is not a master record
    #[error("Invalid master meta for worker type {worker_type}")]
    InvalidMasterMeta { worker_type: String },

    /// Worker config could not be encoded
    #[error("Failed to encode worker config: {reason}")]
    ConfigEncode { reason: String },

    /// Configuration value out of range
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // ========== Coordination Errors ==========

    /// Worker missed heartbeats for longer than the timeout
    #[error("Worker {worker_id} heartbeat timed out after {elapsed_ms}ms")]
    WorkerTimeout { worker_id: String, elapsed_ms: u64 },

    /// Worker reported that it finished
    #[error("Worker {worker_id} finished")]
    WorkerFinished { worker_id: String },

    /// Worker is not tracked by the worker manager
    #[error("Worker {worker_id} not found")]
    WorkerNotFound { worker_id: String },

    /// Worker is not in a state that allows the operation
    #[error("Worker {worker_id} is not online")]
    WorkerNotOnline { worker_id: String },

    // ========== Dispatch Errors ==========

    /// Quota wait timed out
    #[error("Create worker concurrency exceeded: {reason}")]
    ConcurrencyExceeded { reason: String },

    /// Remote call failed
    #[error("RPC {method} failed ({code}): {message}")]
    Rpc {
        method: String,
        code: String,
        message: String,
    },

    /// Remote call did not finish in time
    #[error("RPC {method} timed out")]
    RpcTimeout { method: String },

    /// Executor could not be registered with the client manager
    #[error("Executor {executor_id} unavailable: {reason}")]
    ExecutorUnavailable { executor_id: String, reason: String },

    // ========== Messaging Errors ==========

    /// A handler already exists for the topic
    #[error("Duplicate message handler for topic {topic}")]
    DuplicateHandler { topic: String },

    /// Message could not be delivered or handled
    #[error("Message error on topic {topic}: {reason}")]
    Message { topic: String, reason: String },

    // ========== Lifecycle Errors ==========

    /// Master has been closed
    #[error("Master {master_id} is closed")]
    MasterClosed { master_id: String },

    /// Master has not been initialized
    #[error("Master {master_id} not initialized")]
    MasterNotInitialized { master_id: String },

    /// Operation was cancelled
    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: String },

    /// Business logic reported a failure
    #[error("Business logic error: {message}")]
    Business { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MasterError {
    /// Convert a transport status into an RPC error for `method`
    pub fn from_status(method: &str, status: tonic::Status) -> Self {
        MasterError::Rpc {
            method: method.into(),
            code: format!("{:?}", status.code()),
            message: status.message().into(),
        }
    }

    /// Returns true if retrying the operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MasterError::Rpc { .. }
                | MasterError::RpcTimeout { .. }
                | MasterError::ConcurrencyExceeded { .. }
                | MasterError::ExecutorUnavailable { .. }
                | MasterError::WorkerTimeout { .. }
        )
    }

    /// Returns true if the error must abort master startup
    pub fn is_fatal_to_master(&self) -> bool {
        matches!(
            self,
            MasterError::MetaNotFound { .. }
                | MasterError::MetaStore { .. }
                | MasterError::DuplicateHandler { .. }
        )
    }
}

impl From<serde_json::Error> for MasterError {
    fn from(e: serde_json::Error) -> Self {
        MasterError::ConfigEncode {
            reason: e.to_string(),
        }
    }
}

impl From<toml::ser::Error> for MasterError {
    fn from(e: toml::ser::Error) -> Self {
        MasterError::ConfigEncode {
            reason: e.to_string(),
        }
    }
}

/// Result type alias for master operations
pub type Result<T> = std::result::Result<T, MasterError>;

//! Metadata store contract and persisted records

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{Epoch, MasterId, NodeId, WorkerId, WorkerStatus};

/// Lifecycle code of a master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MasterStatusCode {
    /// Created but never started
    Uninit,
    /// Started at least once
    Init,
    Finished,
    Stopped,
}

impl MasterStatusCode {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MasterStatusCode::Finished | MasterStatusCode::Stopped)
    }
}

/// Persisted record describing one master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterMetadata {
    pub id: MasterId,
    /// Worker type this master runs as
    pub tp: i64,
    pub node_id: NodeId,
    pub addr: String,
    pub epoch: Epoch,
    pub status_code: MasterStatusCode,
    /// Opaque business config
    #[serde(default)]
    pub config: Vec<u8>,
}

impl MasterMetadata {
    /// Record for a master that has been created but not started
    pub fn new_uninit(id: impl Into<MasterId>, tp: i64, config: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            tp,
            node_id: NodeId::new(),
            addr: String::new(),
            epoch: 0,
            status_code: MasterStatusCode::Uninit,
            config,
        }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| crate::error::MasterError::MetaStore {
            message: format!("corrupt master metadata: {}", e),
        })
    }
}

/// Persisted status of one worker belonging to a master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatusRecord {
    pub master_id: MasterId,
    pub worker_id: WorkerId,
    /// Master epoch that created the worker
    pub epoch: Epoch,
    pub status: WorkerStatus,
}

/// Durable store for master and worker metadata
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Load a master record; `MetaNotFound` if absent
    async fn load_master_meta(&self, master_id: &str) -> Result<MasterMetadata>;

    /// Insert or replace a master record
    async fn upsert_master_meta(&self, meta: &MasterMetadata) -> Result<()>;

    /// Next epoch for `master_id`, strictly greater than any previous one
    async fn gen_epoch(&self, master_id: &str) -> Result<Epoch>;

    /// All persisted worker records for `master_id`
    async fn query_worker_statuses(&self, master_id: &str) -> Result<Vec<WorkerStatusRecord>>;

    /// Insert or replace a worker record
    async fn upsert_worker_status(&self, record: &WorkerStatusRecord) -> Result<()>;
}

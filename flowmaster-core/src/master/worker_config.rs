//! Worker types and config encoding
//!
//! A worker's business config is turned into the bytes the executor
//! receives. Master-type workers carry a pre-built master record whose
//! config bytes and ID pass through untouched; the legacy data-migration
//! kinds are encoded as TOML; everything else is JSON.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MasterError, Result};
use crate::metastore::MasterMetadata;
use crate::protocol::WorkerId;

/// Kind of worker a master can create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerType {
    CvsJobMaster,
    FakeJobMaster,
    DmJobMaster,
    CvsTask,
    FakeTask,
    DmDump,
    DmLoad,
    DmSync,
}

impl WorkerType {
    /// Workers that are themselves job masters
    pub fn is_master_type(&self) -> bool {
        matches!(
            self,
            WorkerType::CvsJobMaster | WorkerType::FakeJobMaster | WorkerType::DmJobMaster
        )
    }

    /// Kinds whose config is encoded as TOML
    pub fn is_legacy_text(&self) -> bool {
        matches!(self, WorkerType::DmDump | WorkerType::DmLoad | WorkerType::DmSync)
    }

    /// Numeric code sent to executors
    pub fn as_i64(&self) -> i64 {
        match self {
            WorkerType::CvsJobMaster => 1,
            WorkerType::FakeJobMaster => 2,
            WorkerType::DmJobMaster => 3,
            WorkerType::CvsTask => 4,
            WorkerType::FakeTask => 5,
            WorkerType::DmDump => 6,
            WorkerType::DmLoad => 7,
            WorkerType::DmSync => 8,
        }
    }
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Config supplied by business logic for a new worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerConfig {
    /// Pre-allocated master record, for master-type workers
    MasterMeta(MasterMetadata),
    /// Any serializable business config
    Structured(serde_json::Value),
}

impl WorkerConfig {
    /// Wrap a serializable business config
    pub fn structured<T: Serialize>(config: &T) -> Result<Self> {
        Ok(WorkerConfig::Structured(serde_json::to_value(config)?))
    }
}

/// Encoded config plus the worker ID it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedConfig {
    pub worker_id: WorkerId,
    pub raw: Bytes,
}

/// Encode `config` for `worker_type` and pick the worker ID.
///
/// The ID is taken from the master record for master-type workers and
/// freshly generated otherwise.
pub fn prepare_worker_config(
    worker_type: WorkerType,
    config: &WorkerConfig,
) -> Result<PreparedConfig> {
    if worker_type.is_master_type() {
        return match config {
            WorkerConfig::MasterMeta(meta) => Ok(PreparedConfig {
                worker_id: meta.id.clone(),
                raw: Bytes::from(meta.config.clone()),
            }),
            WorkerConfig::Structured(_) => Err(MasterError::InvalidMasterMeta {
                worker_type: worker_type.to_string(),
            }),
        };
    }

    let value = match config {
        WorkerConfig::Structured(value) => value,
        WorkerConfig::MasterMeta(_) => {
            return Err(MasterError::ConfigEncode {
                reason: format!("worker type {} does not take a master record", worker_type),
            })
        }
    };

    let raw = if worker_type.is_legacy_text() {
        Bytes::from(toml::to_string(value)?)
    } else {
        Bytes::from(serde_json::to_vec(value)?)
    };

    Ok(PreparedConfig {
        worker_id: Uuid::new_v4().to_string(),
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_master_type_passes_through() {
        let tp = WorkerType::FakeJobMaster.as_i64();
        let meta = MasterMetadata::new_uninit("job-42", tp, b"{\"a\":1}".to_vec());
        let config = WorkerConfig::MasterMeta(meta);
        let prepared = prepare_worker_config(WorkerType::FakeJobMaster, &config).unwrap();
        assert_eq!(prepared.worker_id, "job-42");
        assert_eq!(&prepared.raw[..], b"{\"a\":1}");
    }

    #[test]
    fn test_master_type_rejects_structured() {
        let config = WorkerConfig::Structured(json!({}));
        let err = prepare_worker_config(WorkerType::DmJobMaster, &config).unwrap_err();
        assert!(matches!(err, MasterError::InvalidMasterMeta { .. }));
    }

    #[test]
    fn test_legacy_kinds_use_toml() {
        let config = WorkerConfig::Structured(json!({"task": "dump", "threads": 4}));
        let prepared = prepare_worker_config(WorkerType::DmDump, &config).unwrap();
        let text = std::str::from_utf8(&prepared.raw).unwrap();
        assert!(text.contains("task = \"dump\""));
        assert!(text.contains("threads = 4"));
        assert!(Uuid::parse_str(&prepared.worker_id).is_ok());
    }

    #[test]
    fn test_default_kinds_use_json() {
        #[derive(Serialize)]
        struct FakeConfig {
            target_tick: u32,
        }
        let config = WorkerConfig::structured(&FakeConfig { target_tick: 10 }).unwrap();
        let a = prepare_worker_config(WorkerType::FakeTask, &config).unwrap();
        let b = prepare_worker_config(WorkerType::FakeTask, &config).unwrap();

        assert_eq!(&a.raw[..], b"{\"target_tick\":10}");
        assert_ne!(a.worker_id, b.worker_id);
    }
}

//! In-process metadata store
//!
//! Backs embedded deployments and tests. Master records are kept in their
//! encoded form, as an external store would hold them. Can be switched into
//! an unavailable mode to exercise store-failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::store::{MasterMetadata, MetaStore, WorkerStatusRecord};
use crate::error::{MasterError, Result};
use crate::protocol::{Epoch, MasterId, WorkerId};

/// Metadata store held entirely in memory
#[derive(Default)]
pub struct InMemoryMetaStore {
    masters: RwLock<HashMap<MasterId, Vec<u8>>>,
    epochs: RwLock<HashMap<MasterId, Epoch>>,
    workers: RwLock<HashMap<MasterId, HashMap<WorkerId, WorkerStatusRecord>>>,
    unavailable: AtomicBool,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite the encoded master record, bypassing encoding
    pub fn put_raw_master_meta(&self, master_id: &str, data: Vec<u8>) {
        self.masters.write().insert(master_id.to_string(), data);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MasterError::MetaStore {
                message: "metastore unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn load_master_meta(&self, master_id: &str) -> Result<MasterMetadata> {
        self.check_available()?;
        let masters = self.masters.read();
        let data = masters
            .get(master_id)
            .ok_or_else(|| MasterError::MetaNotFound {
                key: format!("master/{}", master_id),
            })?;
        MasterMetadata::from_bytes(data)
    }

    async fn upsert_master_meta(&self, meta: &MasterMetadata) -> Result<()> {
        self.check_available()?;
        let data = meta.to_bytes()?;
        self.masters.write().insert(meta.id.clone(), data);
        Ok(())
    }

    async fn gen_epoch(&self, master_id: &str) -> Result<Epoch> {
        self.check_available()?;
        let mut epochs = self.epochs.write();
        let epoch = epochs.entry(master_id.to_string()).or_insert(0);
        *epoch += 1;
        debug!(master_id, epoch = *epoch, "Generated epoch");
        Ok(*epoch)
    }

    async fn query_worker_statuses(&self, master_id: &str) -> Result<Vec<WorkerStatusRecord>> {
        self.check_available()?;
        let mut records: Vec<_> = self
            .workers
            .read()
            .get(master_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(records)
    }

    async fn upsert_worker_status(&self, record: &WorkerStatusRecord) -> Result<()> {
        self.check_available()?;
        self.workers
            .write()
            .entry(record.master_id.clone())
            .or_default()
            .insert(record.worker_id.clone(), record.clone());
        Ok(())
    }
}

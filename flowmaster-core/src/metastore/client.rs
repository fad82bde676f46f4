//! Load/update wrapper around one master's record

use std::sync::Arc;
use tracing::debug;

use super::store::{MasterMetadata, MasterStatusCode, MetaStore};
use crate::error::Result;
use crate::protocol::MasterId;

/// Metadata client bound to a single master ID
#[derive(Clone)]
pub struct MasterMetadataClient {
    master_id: MasterId,
    store: Arc<dyn MetaStore>,
}

impl MasterMetadataClient {
    pub fn new(master_id: MasterId, store: Arc<dyn MetaStore>) -> Self {
        Self { master_id, store }
    }

    /// Load the master's record
    pub async fn load(&self) -> Result<MasterMetadata> {
        self.store.load_master_meta(&self.master_id).await
    }

    /// Persist the master's record
    pub async fn update(&self, meta: &MasterMetadata) -> Result<()> {
        debug!(
            master_id = %self.master_id,
            epoch = meta.epoch,
            status = ?meta.status_code,
            "Updating master metadata"
        );
        self.store.upsert_master_meta(meta).await
    }

    /// Read-modify-write of the status code
    pub async fn set_status_code(&self, code: MasterStatusCode) -> Result<MasterMetadata> {
        let mut meta = self.load().await?;
        meta.status_code = code;
        self.update(&meta).await?;
        Ok(meta)
    }

    /// Generate a fresh epoch for this master
    pub async fn gen_epoch(&self) -> Result<i64> {
        self.store.gen_epoch(&self.master_id).await
    }

    pub fn master_id(&self) -> &str {
        &self.master_id
    }
}

//! Persistent metadata for masters and workers
//!
//! The store itself is an injected collaborator (`MetaStore`). This module
//! defines its contract, the per-master metadata client used by the base
//! master, an in-memory store, and the registry of backend store configs.

pub mod client;
pub mod manager;
pub mod memory;
pub mod store;

pub use client::MasterMetadataClient;
pub use manager::{MetaStoreManager, StoreConfig};
pub use memory::InMemoryMetaStore;
pub use store::{MasterMetadata, MasterStatusCode, MetaStore, WorkerStatusRecord};

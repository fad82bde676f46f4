//! Job master framework
//!
//! `BaseMaster` wraps business logic implementing `MasterImpl`; the
//! `WorkerManager` tracks the workers it creates.

pub mod base;
pub mod config;
pub mod worker_config;
pub mod worker_manager;

pub use base::{BaseMaster, MasterContext, MasterDeps, MasterImpl};
pub use config::{MasterConfig, TimeoutConfig};
pub use worker_config::{prepare_worker_config, PreparedConfig, WorkerConfig, WorkerType};
pub use worker_manager::{WorkerCallbacks, WorkerEvent, WorkerHandle, WorkerManager, WorkerPhase};

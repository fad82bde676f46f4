//! Flowmaster Core - job-master orchestration
//!
//! This crate provides the master side of a job:
//! - Epoch-fenced metadata recovery
//! - Bounded-concurrency worker creation and dispatch
//! - Heartbeat-driven worker lifecycle tracking
//! - First-error-wins fault propagation

pub mod client;
pub mod error;
pub mod master;
pub mod metastore;
pub mod metrics;
pub mod p2p;
pub mod protocol;
pub mod runtime;

pub use error::{MasterError, Result};
pub use master::{BaseMaster, MasterConfig, MasterContext, MasterDeps, MasterImpl};

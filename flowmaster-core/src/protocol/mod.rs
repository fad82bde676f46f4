//! Wire-level types shared between the master, its workers and executors
//!
//! Identifier aliases, message shapes and topic naming.

pub mod messages;

pub use messages::{
    CustomMessage, HeartbeatPing, HeartbeatPong, Message, WorkerStatus, WorkerStatusCode,
    WorkerStatusMessage,
};

/// Identifies a master (one job)
pub type MasterId = String;
/// Identifies a worker
pub type WorkerId = String;
/// Identifies an executor process
pub type ExecutorId = String;
/// Identifies a node on the message substrate
pub type NodeId = String;
/// Identifies an external resource a worker depends on
pub type ResourceId = String;
/// Message topic
pub type Topic = String;
/// Master incarnation fencing token
pub type Epoch = i64;
/// Unit of scheduling cost
pub type ResourceUnit = u32;

/// Topic on which workers send heartbeat pings to `master_id`
pub fn heartbeat_ping_topic(master_id: &str) -> Topic {
    format!("heartbeat-ping-{}", master_id)
}

/// Topic on which `master_id` answers `worker_id`'s pings
pub fn heartbeat_pong_topic(master_id: &str, worker_id: &str) -> Topic {
    format!("heartbeat-pong-{}-{}", master_id, worker_id)
}

/// Topic on which workers report status changes to `master_id`
pub fn worker_status_topic(master_id: &str) -> Topic {
    format!("worker-status-{}", master_id)
}

/// Topic for business-defined messages named `name` under `master_id`
pub fn worker_message_topic(master_id: &str, name: &str) -> Topic {
    format!("worker-message-{}-{}", master_id, name)
}

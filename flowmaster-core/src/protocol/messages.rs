//! Heartbeat and status messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Epoch, WorkerId};

/// Liveness probe sent by a worker to its master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPing {
    pub from_worker_id: WorkerId,
    pub send_time: DateTime<Utc>,
    /// Set by a worker that has completed and is about to exit
    pub is_finished: bool,
}

/// Master's reply to a ping, carrying the master's current epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPong {
    pub to_worker_id: WorkerId,
    pub send_time: DateTime<Utc>,
    pub reply_time: DateTime<Utc>,
    pub epoch: Epoch,
    pub is_finished: bool,
}

/// Lifecycle code reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatusCode {
    Normal,
    Created,
    Init,
    Error,
    Finished,
    Stopped,
}

impl WorkerStatusCode {
    /// Worker will not run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerStatusCode::Finished | WorkerStatusCode::Stopped)
    }
}

/// Status of a worker as seen by business logic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub code: WorkerStatusCode,
    pub error_message: Option<String>,
    /// Opaque business payload
    pub ext_bytes: Vec<u8>,
}

impl WorkerStatus {
    /// Status of a worker that has just been requested
    pub fn created() -> Self {
        Self {
            code: WorkerStatusCode::Created,
            error_message: None,
            ext_bytes: Vec::new(),
        }
    }

    pub fn with_code(code: WorkerStatusCode) -> Self {
        Self {
            code,
            error_message: None,
            ext_bytes: Vec::new(),
        }
    }
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::created()
    }
}

/// Status update pushed by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatusMessage {
    pub worker_id: WorkerId,
    /// Epoch of the master the worker believes it reports to
    pub master_epoch: Epoch,
    pub status: WorkerStatus,
}

/// Business-defined payload exchanged with one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMessage {
    /// Worker the message comes from or goes to
    pub worker_id: WorkerId,
    pub payload: serde_json::Value,
}

impl CustomMessage {
    pub fn new(worker_id: impl Into<WorkerId>, payload: serde_json::Value) -> Self {
        Self {
            worker_id: worker_id.into(),
            payload,
        }
    }
}

/// Every payload carried by the message substrate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    HeartbeatPing(HeartbeatPing),
    HeartbeatPong(HeartbeatPong),
    WorkerStatus(WorkerStatusMessage),
    Custom(CustomMessage),
}

impl Message {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::HeartbeatPing(_) => "heartbeat_ping",
            Message::HeartbeatPong(_) => "heartbeat_pong",
            Message::WorkerStatus(_) => "worker_status",
            Message::Custom(_) => "custom",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_json_shape() {
        let msg = Message::WorkerStatus(WorkerStatusMessage {
            worker_id: "w1".into(),
            master_epoch: 7,
            status: WorkerStatus::with_code(WorkerStatusCode::Normal),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "WorkerStatus");
        assert_eq!(json["payload"]["master_epoch"], 7);

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.kind(), "worker_status");
    }

    #[test]
    fn test_terminal_codes() {
        assert!(WorkerStatusCode::Finished.is_terminal());
        assert!(WorkerStatusCode::Stopped.is_terminal());
        assert!(!WorkerStatusCode::Normal.is_terminal());
        assert_eq!(WorkerStatus::default().code, WorkerStatusCode::Created);
    }
}

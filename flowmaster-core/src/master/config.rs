//! Master configuration
//!
//! All inputs are explicit; nothing is read from the environment. Durations
//! serialize as integer milliseconds so the structs can be embedded in a
//! hosting process's TOML config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MasterError, Result};

/// Maximum number of concurrent worker creations per master
pub const DEFAULT_CREATE_WORKER_CONCURRENCY: usize = 100;
/// How long `create_worker` waits for a quota token
pub const DEFAULT_CREATE_WORKER_WAIT_QUOTA_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline of the asynchronous schedule + dispatch sequence
pub const DEFAULT_CREATE_WORKER_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on waiting for background tasks at close
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Heartbeat and liveness timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// No heartbeat for this long marks a worker offline
    #[serde(with = "millis")]
    pub worker_timeout: Duration,
    /// Extra wait granted to recovered workers before they become tombstones
    #[serde(with = "millis")]
    pub worker_timeout_graceful: Duration,
    /// Interval at which workers send pings
    #[serde(with = "millis")]
    pub worker_heartbeat_interval: Duration,
    /// Interval at which workers report status
    #[serde(with = "millis")]
    pub worker_report_status_interval: Duration,
    /// Interval at which the hosting runtime is expected to poll
    #[serde(with = "millis")]
    pub master_heartbeat_check_interval: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(15),
            worker_timeout_graceful: Duration::from_secs(5),
            worker_heartbeat_interval: Duration::from_secs(3),
            worker_report_status_interval: Duration::from_secs(3),
            master_heartbeat_check_interval: Duration::from_secs(1),
        }
    }
}

impl TimeoutConfig {
    /// Window during which recovered workers may re-announce themselves
    pub fn recover_window(&self) -> Duration {
        self.worker_timeout + self.worker_timeout_graceful
    }
}

/// Configuration for a base master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Capacity of the creation quota
    pub create_worker_concurrency: usize,
    #[serde(with = "millis")]
    pub create_worker_wait_quota_timeout: Duration,
    #[serde(with = "millis")]
    pub create_worker_timeout: Duration,
    #[serde(with = "millis")]
    pub close_timeout: Duration,
    pub timeouts: TimeoutConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            create_worker_concurrency: DEFAULT_CREATE_WORKER_CONCURRENCY,
            create_worker_wait_quota_timeout: DEFAULT_CREATE_WORKER_WAIT_QUOTA_TIMEOUT,
            create_worker_timeout: DEFAULT_CREATE_WORKER_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl MasterConfig {
    /// Reject values the master cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.create_worker_concurrency == 0 {
            return Err(MasterError::InvalidConfig {
                reason: "create_worker_concurrency must be positive".into(),
            });
        }
        let durations = [
            ("create_worker_wait_quota_timeout", self.create_worker_wait_quota_timeout),
            ("create_worker_timeout", self.create_worker_timeout),
            ("close_timeout", self.close_timeout),
            ("timeouts.worker_timeout", self.timeouts.worker_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(MasterError::InvalidConfig {
                    reason: format!("{} must be positive", name),
                });
            }
        }
        Ok(())
    }
}

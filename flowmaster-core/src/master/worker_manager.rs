//! Worker registry and lifecycle state machine
//!
//! Every transition (dispatch path, heartbeat path, status path) mutates
//! one registry under a mutex and queues the business callback it implies.
//! Callbacks are delivered from `tick` only, in the order they were queued,
//! so business logic always runs on the poll path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::config::TimeoutConfig;
use crate::error::{MasterError, Result};
use crate::metastore::MetaStore;
use crate::protocol::{
    Epoch, ExecutorId, HeartbeatPing, MasterId, Message, NodeId, Topic, WorkerId, WorkerStatus,
    WorkerStatusMessage,
};
use crate::runtime::Clock;

/// How many finished worker IDs are remembered to reject late messages
const FINISHED_HISTORY: usize = 10_000;

/// Lifecycle phase of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerPhase {
    /// Requested, waiting for the scheduler
    Creating,
    /// Executor chosen, dispatch in progress
    Dispatching,
    /// Executor accepted the task, waiting for the first heartbeat
    Starting,
    /// First heartbeat received
    Online,
    /// Heartbeats or status updates after coming online
    Running,
    Offline,
    Aborted,
    /// Known from persisted state, waiting to re-announce after a restart
    Recovering,
    /// Did not re-announce within the recovery window
    Tombstone,
}

impl WorkerPhase {
    /// Phases before the first heartbeat of a newly created worker
    pub fn is_pre_online(&self) -> bool {
        matches!(
            self,
            WorkerPhase::Creating | WorkerPhase::Dispatching | WorkerPhase::Starting
        )
    }

    /// Phases in which the worker is known to be alive
    pub fn is_alive(&self) -> bool {
        matches!(self, WorkerPhase::Online | WorkerPhase::Running)
    }
}

/// Snapshot of a worker handed to business logic
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerHandle {
    pub worker_id: WorkerId,
    /// Set once scheduling succeeded
    pub executor_id: Option<ExecutorId>,
    /// Node the worker's heartbeats come from
    pub node_id: Option<NodeId>,
    pub phase: WorkerPhase,
    pub status: WorkerStatus,
    /// Epoch of the master incarnation that created the worker
    pub created_epoch: Epoch,
}

impl WorkerHandle {
    pub fn is_tombstone(&self) -> bool {
        self.phase == WorkerPhase::Tombstone
    }
}

struct WorkerEntry {
    handle: WorkerHandle,
    last_seen: Instant,
    dispatched_notified: bool,
    /// Recovered from persisted state or synthesized from a heartbeat
    adopted: bool,
}

impl WorkerEntry {
    fn new(handle: WorkerHandle, now: Instant, adopted: bool) -> Self {
        Self {
            handle,
            last_seen: now,
            dispatched_notified: false,
            adopted,
        }
    }
}

/// Business callback queued by a transition
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Dispatched {
        handle: WorkerHandle,
        result: std::result::Result<(), MasterError>,
    },
    Online {
        handle: WorkerHandle,
    },
    StatusUpdated {
        handle: WorkerHandle,
    },
    Offline {
        handle: WorkerHandle,
        reason: MasterError,
    },
    Message {
        handle: WorkerHandle,
        topic: Topic,
        message: Message,
    },
}

/// Receiver of worker lifecycle callbacks
#[async_trait]
pub trait WorkerCallbacks: Send {
    async fn on_worker_dispatched(
        &mut self,
        handle: WorkerHandle,
        result: std::result::Result<(), MasterError>,
    ) -> Result<()>;

    async fn on_worker_online(&mut self, handle: WorkerHandle) -> Result<()>;

    async fn on_worker_offline(&mut self, handle: WorkerHandle, reason: MasterError) -> Result<()>;

    async fn on_worker_status_updated(&mut self, handle: WorkerHandle) -> Result<()>;

    async fn on_worker_message(
        &mut self,
        handle: WorkerHandle,
        topic: Topic,
        message: Message,
    ) -> Result<()>;
}

#[derive(Default)]
struct Registry {
    workers: HashMap<WorkerId, WorkerEntry>,
    events: VecDeque<WorkerEvent>,
    finished: HashSet<WorkerId>,
    finished_order: VecDeque<WorkerId>,
    initialized: bool,
    recover_started: Option<Instant>,
    closed: bool,
}

impl Registry {
    fn remember_finished(&mut self, worker_id: &str) {
        if self.finished.insert(worker_id.to_string()) {
            self.finished_order.push_back(worker_id.to_string());
            while self.finished_order.len() > FINISHED_HISTORY {
                if let Some(old) = self.finished_order.pop_front() {
                    self.finished.remove(&old);
                }
            }
        }
    }

    fn forget_finished(&mut self, worker_id: &str) {
        if self.finished.remove(worker_id) {
            self.finished_order.retain(|id| id != worker_id);
        }
    }

    /// Remove a worker and queue its offline callback
    fn take_offline(&mut self, worker_id: &str, reason: MasterError) {
        if let Some(mut entry) = self.workers.remove(worker_id) {
            entry.handle.phase = WorkerPhase::Offline;
            self.remember_finished(worker_id);
            self.events.push_back(WorkerEvent::Offline {
                handle: entry.handle,
                reason,
            });
        }
    }
}

/// Authoritative registry of the workers of one master epoch
pub struct WorkerManager {
    master_id: MasterId,
    epoch: Epoch,
    timeouts: TimeoutConfig,
    clock: Arc<dyn Clock>,
    registry: Mutex<Registry>,
}

impl WorkerManager {
    /// Create a manager for `epoch`.
    ///
    /// `is_first_startup` marks the registry initialized right away; a
    /// recovering master must call `init_after_recover`.
    pub fn new(
        master_id: MasterId,
        epoch: Epoch,
        is_first_startup: bool,
        timeouts: TimeoutConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Registry {
            initialized: is_first_startup,
            ..Default::default()
        };
        Self {
            master_id,
            epoch,
            timeouts,
            clock,
            registry: Mutex::new(registry),
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Rebuild the registry from persisted worker records.
    ///
    /// Non-terminal workers enter `Recovering`; reconciliation then finishes
    /// in `tick`.
    pub async fn init_after_recover(&self, store: &dyn MetaStore) -> Result<()> {
        let records = store.query_worker_statuses(&self.master_id).await?;
        let now = self.clock.now();

        let mut registry = self.registry.lock();
        let mut recovered = 0usize;
        for record in records {
            if record.status.code.is_terminal() {
                registry.remember_finished(&record.worker_id);
                continue;
            }
            let handle = WorkerHandle {
                worker_id: record.worker_id.clone(),
                executor_id: None,
                node_id: None,
                phase: WorkerPhase::Recovering,
                status: record.status,
                created_epoch: record.epoch,
            };
            registry
                .workers
                .insert(record.worker_id, WorkerEntry::new(handle, now, true));
            recovered += 1;
        }

        registry.recover_started = Some(now);
        registry.initialized = recovered == 0;
        info!(
            master_id = %self.master_id,
            epoch = self.epoch,
            recovered,
            "Worker manager recovering from persisted state"
        );
        Ok(())
    }

    /// Whether the initial registry population has completed
    pub fn is_initialized(&self) -> bool {
        self.registry.lock().initialized
    }

    /// Register a speculative handle for a worker being created
    pub fn on_creating_worker(&self, worker_id: &str) -> Result<()> {
        let now = self.clock.now();
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(MasterError::MasterClosed {
                master_id: self.master_id.clone(),
            });
        }
        if registry.workers.contains_key(worker_id) {
            return Err(MasterError::Internal {
                message: format!("worker {} already exists", worker_id),
            });
        }
        registry.forget_finished(worker_id);

        let handle = WorkerHandle {
            worker_id: worker_id.to_string(),
            executor_id: None,
            node_id: None,
            phase: WorkerPhase::Creating,
            status: WorkerStatus::created(),
            created_epoch: self.epoch,
        };
        registry
            .workers
            .insert(worker_id.to_string(), WorkerEntry::new(handle, now, false));
        debug!(master_id = %self.master_id, worker_id, "Worker creating");
        Ok(())
    }

    /// Scheduling succeeded: attach the executor
    pub fn on_worker_scheduled(&self, worker_id: &str, executor_id: &str) {
        let mut registry = self.registry.lock();
        match registry.workers.get_mut(worker_id) {
            Some(entry) if entry.handle.phase == WorkerPhase::Creating => {
                entry.handle.phase = WorkerPhase::Dispatching;
                entry.handle.executor_id = Some(executor_id.to_string());
                debug!(worker_id, executor_id, "Worker dispatching");
            }
            _ => debug!(worker_id, "Ignoring schedule result for worker not in Creating"),
        }
    }

    /// The executor accepted the task
    pub fn before_starting_worker(&self, worker_id: &str, executor_id: &str) {
        let now = self.clock.now();
        let mut registry = self.registry.lock();
        match registry.workers.get_mut(worker_id) {
            Some(entry)
                if matches!(
                    entry.handle.phase,
                    WorkerPhase::Creating | WorkerPhase::Dispatching
                ) =>
            {
                entry.handle.phase = WorkerPhase::Starting;
                entry.handle.executor_id = Some(executor_id.to_string());
                entry.last_seen = now;
                debug!(worker_id, executor_id, "Worker starting");
            }
            _ => debug!(worker_id, "Ignoring start for worker not being dispatched"),
        }
    }

    /// The dispatch call returned successfully
    pub fn on_dispatch_succeeded(&self, worker_id: &str) {
        let now = self.clock.now();
        let mut registry = self.registry.lock();
        let Some(entry) = registry.workers.get_mut(worker_id) else {
            debug!(worker_id, "Dispatch succeeded for unknown worker");
            return;
        };
        if entry.adopted || entry.dispatched_notified || !entry.handle.phase.is_pre_online() {
            return;
        }
        entry.handle.phase = WorkerPhase::Starting;
        entry.last_seen = now;
        entry.dispatched_notified = true;
        let handle = entry.handle.clone();
        registry.events.push_back(WorkerEvent::Dispatched {
            handle,
            result: Ok(()),
        });
        info!(master_id = %self.master_id, worker_id, "Worker dispatched");
    }

    /// Creation failed; drop the speculative handle.
    ///
    /// No-op unless the worker is still before its dispatch outcome was
    /// reported, so repeated aborts deliver one callback.
    pub fn abort_creating_worker(&self, worker_id: &str, err: MasterError) {
        let mut registry = self.registry.lock();
        if registry.closed {
            return;
        }
        let abortable = matches!(
            registry.workers.get(worker_id),
            Some(entry) if entry.handle.phase.is_pre_online() && !entry.dispatched_notified
        );
        if !abortable {
            debug!(worker_id, error = %err, "Ignoring abort for worker past dispatch");
            return;
        }

        if let Some(mut entry) = registry.workers.remove(worker_id) {
            entry.handle.phase = WorkerPhase::Aborted;
            registry.remember_finished(worker_id);
            warn!(master_id = %self.master_id, worker_id, error = %err, "Worker creation aborted");
            registry.events.push_back(WorkerEvent::Dispatched {
                handle: entry.handle,
                result: Err(err),
            });
        }
    }

    /// Record a heartbeat ping from `sender`
    pub fn handle_heartbeat(&self, ping: &HeartbeatPing, sender: &str) {
        let now = self.clock.now();
        let worker_id = ping.from_worker_id.as_str();
        let mut registry = self.registry.lock();
        if registry.closed {
            return;
        }
        if registry.finished.contains(worker_id) {
            debug!(worker_id, "Dropping heartbeat from finished worker");
            return;
        }

        if !registry.workers.contains_key(worker_id) {
            if ping.is_finished {
                info!(worker_id, "Unknown worker reported finished");
                registry.remember_finished(worker_id);
                return;
            }
            info!(
                master_id = %self.master_id,
                worker_id,
                node_id = sender,
                "Adopting unknown worker from heartbeat"
            );
            let handle = WorkerHandle {
                worker_id: worker_id.to_string(),
                executor_id: None,
                node_id: Some(sender.to_string()),
                phase: WorkerPhase::Online,
                status: WorkerStatus::default(),
                created_epoch: self.epoch,
            };
            registry
                .workers
                .insert(worker_id.to_string(), WorkerEntry::new(handle, now, true));
            return;
        }

        let mut queued = Vec::new();
        if let Some(entry) = registry.workers.get_mut(worker_id) {
            if entry.handle.phase == WorkerPhase::Tombstone {
                warn!(worker_id, "Dropping heartbeat from tombstoned worker");
                return;
            }
            entry.last_seen = now;
            entry.handle.node_id = Some(sender.to_string());

            match entry.handle.phase {
                WorkerPhase::Creating | WorkerPhase::Dispatching | WorkerPhase::Starting => {
                    if !entry.dispatched_notified {
                        entry.dispatched_notified = true;
                        entry.handle.phase = WorkerPhase::Starting;
                        queued.push(WorkerEvent::Dispatched {
                            handle: entry.handle.clone(),
                            result: Ok(()),
                        });
                    }
                    entry.handle.phase = WorkerPhase::Online;
                    queued.push(WorkerEvent::Online {
                        handle: entry.handle.clone(),
                    });
                    info!(master_id = %self.master_id, worker_id, "Worker online");
                }
                WorkerPhase::Recovering => {
                    entry.handle.phase = WorkerPhase::Online;
                    debug!(worker_id, "Recovered worker re-announced");
                }
                WorkerPhase::Online => entry.handle.phase = WorkerPhase::Running,
                _ => {}
            }
        }
        registry.events.extend(queued);

        if ping.is_finished {
            info!(master_id = %self.master_id, worker_id, "Worker finished");
            registry.take_offline(
                worker_id,
                MasterError::WorkerFinished {
                    worker_id: worker_id.to_string(),
                },
            );
        }
    }

    /// Apply a status update pushed by a worker
    pub fn on_worker_status_update_message(&self, msg: &WorkerStatusMessage) {
        let now = self.clock.now();
        let worker_id = msg.worker_id.as_str();
        if msg.master_epoch != self.epoch {
            warn!(
                worker_id,
                current = self.epoch,
                received = msg.master_epoch,
                "Dropping status update with stale epoch"
            );
            return;
        }

        let mut registry = self.registry.lock();
        if registry.closed {
            return;
        }
        let Some(entry) = registry.workers.get_mut(worker_id) else {
            warn!(
                master_id = %self.master_id,
                worker_id,
                "Dropping status update for unknown worker"
            );
            return;
        };
        if entry.handle.phase == WorkerPhase::Tombstone {
            return;
        }

        entry.last_seen = now;
        entry.handle.status = msg.status.clone();
        if entry.handle.phase.is_alive() {
            entry.handle.phase = WorkerPhase::Running;
            let handle = entry.handle.clone();
            registry.events.push_back(WorkerEvent::StatusUpdated { handle });
        }
    }

    /// Queue a business-defined message from a live worker
    pub fn on_worker_message(&self, worker_id: &str, topic: Topic, message: Message) {
        let mut registry = self.registry.lock();
        if registry.closed {
            return;
        }
        match registry.workers.get(worker_id) {
            Some(entry) if entry.handle.phase.is_alive() => {
                let handle = entry.handle.clone();
                registry.events.push_back(WorkerEvent::Message {
                    handle,
                    topic,
                    message,
                });
            }
            _ => debug!(worker_id, topic = %topic, "Dropping message from a worker that is down"),
        }
    }

    /// Detect timeouts, finish reconciliation, then deliver queued callbacks
    pub async fn tick(&self, callbacks: &mut dyn WorkerCallbacks) -> Result<()> {
        self.scan();

        loop {
            let event = { self.registry.lock().events.pop_front() };
            let Some(event) = event else {
                return Ok(());
            };
            match event {
                WorkerEvent::Dispatched { handle, result } => {
                    callbacks.on_worker_dispatched(handle, result).await?
                }
                WorkerEvent::Online { handle } => callbacks.on_worker_online(handle).await?,
                WorkerEvent::StatusUpdated { handle } => {
                    callbacks.on_worker_status_updated(handle).await?
                }
                WorkerEvent::Offline { handle, reason } => {
                    callbacks.on_worker_offline(handle, reason).await?
                }
                WorkerEvent::Message {
                    handle,
                    topic,
                    message,
                } => callbacks.on_worker_message(handle, topic, message).await?,
            }
        }
    }

    fn scan(&self) {
        let now = self.clock.now();
        let timeout = self.timeouts.worker_timeout;
        let mut registry = self.registry.lock();
        if registry.closed {
            return;
        }

        let timed_out: Vec<(WorkerId, Duration)> = registry
            .workers
            .values()
            .filter(|entry| {
                entry.handle.phase.is_alive()
                    || (entry.handle.phase == WorkerPhase::Starting && entry.dispatched_notified)
            })
            .filter_map(|entry| {
                let elapsed = now.saturating_duration_since(entry.last_seen);
                (elapsed > timeout).then(|| (entry.handle.worker_id.clone(), elapsed))
            })
            .collect();

        for (worker_id, elapsed) in timed_out {
            let elapsed_ms = elapsed.as_millis() as u64;
            warn!(
                master_id = %self.master_id,
                worker_id = %worker_id,
                elapsed_ms,
                "Worker heartbeat timed out"
            );
            let reason = MasterError::WorkerTimeout {
                worker_id: worker_id.clone(),
                elapsed_ms,
            };
            registry.take_offline(&worker_id, reason);
        }

        if registry.initialized {
            return;
        }
        let pending = registry
            .workers
            .values()
            .filter(|entry| entry.handle.phase == WorkerPhase::Recovering)
            .count();
        let window_elapsed = registry
            .recover_started
            .map(|started| now.saturating_duration_since(started) >= self.timeouts.recover_window())
            .unwrap_or(true);

        if pending > 0 && !window_elapsed {
            return;
        }
        for entry in registry.workers.values_mut() {
            if entry.handle.phase == WorkerPhase::Recovering {
                entry.handle.phase = WorkerPhase::Tombstone;
            }
        }
        registry.initialized = true;
        info!(master_id = %self.master_id, tombstones = pending, "Worker reconciliation finished");
    }

    /// Remove a tombstoned worker
    pub fn clean_tombstone(&self, worker_id: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        match registry.workers.get(worker_id) {
            Some(entry) if entry.handle.is_tombstone() => {
                registry.workers.remove(worker_id);
                registry.remember_finished(worker_id);
                Ok(())
            }
            _ => Err(MasterError::WorkerNotFound {
                worker_id: worker_id.into(),
            }),
        }
    }

    /// Snapshot of all tracked workers
    pub fn get_workers(&self) -> HashMap<WorkerId, WorkerHandle> {
        self.registry
            .lock()
            .workers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.handle.clone()))
            .collect()
    }

    /// Snapshot of one worker
    pub fn get_worker(&self, worker_id: &str) -> Option<WorkerHandle> {
        self.registry
            .lock()
            .workers
            .get(worker_id)
            .map(|entry| entry.handle.clone())
    }

    /// Number of workers currently alive
    pub fn alive_count(&self) -> usize {
        self.registry
            .lock()
            .workers
            .values()
            .filter(|entry| entry.handle.phase.is_alive())
            .count()
    }

    /// Stop accepting transitions and drop undelivered callbacks
    pub fn close(&self) {
        let mut registry = self.registry.lock();
        registry.closed = true;
        registry.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metastore::{InMemoryMetaStore, WorkerStatusRecord};
    use crate::protocol::{CustomMessage, WorkerStatusCode};
    use crate::runtime::ManualClock;
    use chrono::Utc;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        fail_online: bool,
    }

    #[async_trait]
    impl WorkerCallbacks for Recorder {
        async fn on_worker_dispatched(
            &mut self,
            handle: WorkerHandle,
            result: std::result::Result<(), MasterError>,
        ) -> Result<()> {
            let outcome = if result.is_ok() { "ok" } else { "err" };
            self.events.push(format!("dispatched({outcome}):{}", handle.worker_id));
            Ok(())
        }

        async fn on_worker_online(&mut self, handle: WorkerHandle) -> Result<()> {
            self.events.push(format!("online:{}", handle.worker_id));
            if self.fail_online {
                return Err(MasterError::Business {
                    message: "online hook failed".into(),
                });
            }
            Ok(())
        }

        async fn on_worker_offline(
            &mut self,
            handle: WorkerHandle,
            reason: MasterError,
        ) -> Result<()> {
            let kind = match reason {
                MasterError::WorkerTimeout { .. } => "timeout",
                MasterError::WorkerFinished { .. } => "finished",
                _ => "other",
            };
            self.events.push(format!("offline({kind}):{}", handle.worker_id));
            Ok(())
        }

        async fn on_worker_status_updated(&mut self, handle: WorkerHandle) -> Result<()> {
            self.events.push(format!("status:{}", handle.worker_id));
            Ok(())
        }

        async fn on_worker_message(
            &mut self,
            handle: WorkerHandle,
            topic: Topic,
            _message: Message,
        ) -> Result<()> {
            self.events.push(format!("message({topic}):{}", handle.worker_id));
            Ok(())
        }
    }

    fn manager(clock: &ManualClock, first_startup: bool) -> WorkerManager {
        WorkerManager::new(
            "master-1".into(),
            5,
            first_startup,
            TimeoutConfig::default(),
            Arc::new(clock.clone()),
        )
    }

    fn ping(worker_id: &str, is_finished: bool) -> HeartbeatPing {
        HeartbeatPing {
            from_worker_id: worker_id.into(),
            send_time: Utc::now(),
            is_finished,
        }
    }

    fn status(worker_id: &str, epoch: Epoch) -> WorkerStatusMessage {
        WorkerStatusMessage {
            worker_id: worker_id.into(),
            master_epoch: epoch,
            status: WorkerStatus::with_code(WorkerStatusCode::Normal),
        }
    }

    fn dispatch(wm: &WorkerManager, worker_id: &str) {
        wm.on_creating_worker(worker_id).unwrap();
        wm.on_worker_scheduled(worker_id, "exec-1");
        wm.before_starting_worker(worker_id, "exec-1");
        wm.on_dispatch_succeeded(worker_id);
    }

    #[tokio::test]
    async fn test_full_lifecycle_order() {
        let clock = ManualClock::new();
        let wm = manager(&clock, true);
        let mut rec = Recorder::default();

        dispatch(&wm, "w1");
        assert_eq!(wm.get_worker("w1").unwrap().phase, WorkerPhase::Starting);

        wm.handle_heartbeat(&ping("w1", false), "node-a");
        wm.on_worker_status_update_message(&status("w1", 5));
        wm.tick(&mut rec).await.unwrap();

        let handle = wm.get_worker("w1").unwrap();
        assert_eq!(handle.phase, WorkerPhase::Running);
        assert_eq!(handle.node_id.as_deref(), Some("node-a"));
        assert_eq!(handle.executor_id.as_deref(), Some("exec-1"));

        clock.advance(Duration::from_secs(16));
        wm.tick(&mut rec).await.unwrap();
        wm.tick(&mut rec).await.unwrap();

        assert_eq!(
            rec.events,
            vec!["dispatched(ok):w1", "online:w1", "status:w1", "offline(timeout):w1"]
        );
        assert!(wm.get_worker("w1").is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_before_dispatch_return() {
        let clock = ManualClock::new();
        let wm = manager(&clock, true);
        let mut rec = Recorder::default();

        wm.on_creating_worker("w1").unwrap();
        wm.on_worker_scheduled("w1", "exec-1");
        wm.before_starting_worker("w1", "exec-1");
        wm.handle_heartbeat(&ping("w1", false), "node-a");
        wm.on_dispatch_succeeded("w1");
        wm.tick(&mut rec).await.unwrap();

        assert_eq!(rec.events, vec!["dispatched(ok):w1", "online:w1"]);
    }

    #[tokio::test]
    async fn test_abort_is_delivered_once() {
        let clock = ManualClock::new();
        let wm = manager(&clock, true);
        let mut rec = Recorder::default();

        wm.on_creating_worker("w1").unwrap();
        let err = MasterError::RpcTimeout {
            method: "ScheduleTask".into(),
        };
        wm.abort_creating_worker("w1", err.clone());
        wm.abort_creating_worker("w1", err);
        wm.handle_heartbeat(&ping("w1", false), "node-a");
        wm.tick(&mut rec).await.unwrap();

        assert_eq!(rec.events, vec!["dispatched(err):w1"]);
        assert!(wm.get_workers().is_empty());
    }

    #[tokio::test]
    async fn test_abort_after_dispatch_success_is_ignored() {
        let clock = ManualClock::new();
        let wm = manager(&clock, true);
        let mut rec = Recorder::default();

        dispatch(&wm, "w1");
        wm.abort_creating_worker("w1", MasterError::Internal { message: "late".into() });
        wm.tick(&mut rec).await.unwrap();

        assert_eq!(rec.events, vec!["dispatched(ok):w1"]);
        assert_eq!(wm.get_worker("w1").unwrap().phase, WorkerPhase::Starting);
    }

    #[tokio::test]
    async fn test_finished_heartbeat_goes_offline() {
        let clock = ManualClock::new();
        let wm = manager(&clock, true);
        let mut rec = Recorder::default();

        dispatch(&wm, "w1");
        wm.handle_heartbeat(&ping("w1", false), "node-a");
        wm.handle_heartbeat(&ping("w1", true), "node-a");
        wm.handle_heartbeat(&ping("w1", false), "node-a");
        wm.tick(&mut rec).await.unwrap();

        assert_eq!(
            rec.events,
            vec!["dispatched(ok):w1", "online:w1", "offline(finished):w1"]
        );
        assert!(wm.get_workers().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_heartbeat_adopts_worker() {
        let clock = ManualClock::new();
        let wm = manager(&clock, true);
        let mut rec = Recorder::default();

        wm.handle_heartbeat(&ping("stray", false), "node-b");
        wm.tick(&mut rec).await.unwrap();
        assert!(rec.events.is_empty());
        assert_eq!(wm.get_worker("stray").unwrap().phase, WorkerPhase::Online);

        clock.advance(Duration::from_secs(20));
        wm.tick(&mut rec).await.unwrap();
        assert_eq!(rec.events, vec!["offline(timeout):stray"]);
    }

    #[tokio::test]
    async fn test_status_update_policies() {
        let clock = ManualClock::new();
        let wm = manager(&clock, true);
        let mut rec = Recorder::default();

        wm.on_worker_status_update_message(&status("ghost", 5));
        assert!(wm.get_worker("ghost").is_none());

        dispatch(&wm, "w1");
        wm.on_worker_status_update_message(&status("w1", 5));
        wm.handle_heartbeat(&ping("w1", false), "node-a");
        wm.on_worker_status_update_message(&status("w1", 4));
        wm.tick(&mut rec).await.unwrap();

        assert_eq!(rec.events, vec!["dispatched(ok):w1", "online:w1"]);
        assert_eq!(wm.get_worker("w1").unwrap().status.code, WorkerStatusCode::Normal);
    }

    #[tokio::test]
    async fn test_callback_error_keeps_remaining_events() {
        let clock = ManualClock::new();
        let wm = manager(&clock, true);
        let mut rec = Recorder {
            fail_online: true,
            ..Default::default()
        };

        dispatch(&wm, "w1");
        wm.handle_heartbeat(&ping("w1", false), "node-a");
        let message = Message::Custom(CustomMessage::new("w1", serde_json::json!(1)));
        wm.on_worker_message("w1", "t".into(), message);
        assert!(wm.tick(&mut rec).await.is_err());

        rec.fail_online = false;
        wm.tick(&mut rec).await.unwrap();
        assert_eq!(rec.events, vec!["dispatched(ok):w1", "online:w1", "message(t):w1"]);
    }

    #[tokio::test]
    async fn test_recovery_reconciliation() {
        let clock = ManualClock::new();
        let store = InMemoryMetaStore::new();
        for (id, code) in [
            ("alive", WorkerStatusCode::Normal),
            ("silent", WorkerStatusCode::Normal),
            ("done", WorkerStatusCode::Finished),
        ] {
            store
                .upsert_worker_status(&WorkerStatusRecord {
                    master_id: "master-1".into(),
                    worker_id: id.into(),
                    epoch: 4,
                    status: WorkerStatus::with_code(code),
                })
                .await
                .unwrap();
        }

        let wm = manager(&clock, false);
        assert!(!wm.is_initialized());
        wm.init_after_recover(&store).await.unwrap();
        assert!(!wm.is_initialized());
        assert_eq!(wm.get_workers().len(), 2);

        let mut rec = Recorder::default();
        wm.handle_heartbeat(&ping("alive", false), "node-a");
        wm.tick(&mut rec).await.unwrap();
        assert!(!wm.is_initialized());

        clock.advance(Duration::from_secs(10));
        wm.handle_heartbeat(&ping("alive", false), "node-a");
        clock.advance(Duration::from_secs(10));
        wm.handle_heartbeat(&ping("alive", false), "node-a");
        wm.tick(&mut rec).await.unwrap();

        assert!(wm.is_initialized());
        assert!(rec.events.is_empty());
        assert_eq!(wm.get_worker("alive").unwrap().phase, WorkerPhase::Running);
        assert!(wm.get_worker("silent").unwrap().is_tombstone());

        wm.handle_heartbeat(&ping("done", false), "node-a");
        assert!(wm.get_worker("done").is_none());

        wm.clean_tombstone("silent").unwrap();
        assert!(wm.clean_tombstone("silent").is_err());
        assert!(wm.clean_tombstone("alive").is_err());
    }

    #[tokio::test]
    async fn test_recover_with_store_down_fails() {
        let clock = ManualClock::new();
        let store = InMemoryMetaStore::new();
        store.set_unavailable(true);
        let wm = manager(&clock, false);
        assert!(wm.init_after_recover(&store).await.is_err());
        assert!(!wm.is_initialized());
    }

    #[tokio::test]
    async fn test_closed_manager_ignores_transitions() {
        let clock = ManualClock::new();
        let wm = manager(&clock, true);
        let mut rec = Recorder::default();

        dispatch(&wm, "w1");
        wm.close();
        wm.handle_heartbeat(&ping("w1", false), "node-a");
        wm.abort_creating_worker("w1", MasterError::Internal { message: "x".into() });
        wm.tick(&mut rec).await.unwrap();

        assert!(rec.events.is_empty());
        assert!(wm.on_creating_worker("w2").is_err());
    }
}

//! Shared fakes and harness for master integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use flowmaster_core::client::{
    DispatchTaskArgs, ExecutorClient, ExecutorClientManager, OnAccepted, OnFailed,
    ScheduleTaskRequest, ScheduleTaskResponse, SchedulerClient,
};
use flowmaster_core::master::{WorkerConfig, WorkerHandle, WorkerType};
use flowmaster_core::metastore::{InMemoryMetaStore, MasterMetadata, MetaStore};
use flowmaster_core::metrics::MetricsRegistry;
use flowmaster_core::p2p::{MessageRouter, OutboxSender};
use flowmaster_core::protocol::{
    heartbeat_ping_topic, worker_status_topic, HeartbeatPing, Message, Topic, WorkerStatus,
    WorkerStatusCode, WorkerStatusMessage,
};
use flowmaster_core::runtime::ManualClock;
use flowmaster_core::{
    BaseMaster, MasterConfig, MasterContext, MasterDeps, MasterError, MasterImpl, Result,
};

pub const EXECUTOR_ID: &str = "executor-1";
pub const EXECUTOR_ADDR: &str = "127.0.0.1:10240";
pub const WORKER_NODE: &str = "node-a";

/// Install a test-writer subscriber once per binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scheduler answering from a script, then with a fixed placement
#[derive(Default)]
pub struct FakeScheduler {
    script: Mutex<VecDeque<std::result::Result<ScheduleTaskResponse, tonic::Status>>>,
    requests: Mutex<Vec<ScheduleTaskRequest>>,
}

impl FakeScheduler {
    pub fn push(&self, reply: std::result::Result<ScheduleTaskResponse, tonic::Status>) {
        self.script.lock().push_back(reply);
    }

    pub fn requests(&self) -> Vec<ScheduleTaskRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl SchedulerClient for FakeScheduler {
    async fn schedule_task(
        &self,
        _ctx: &CancellationToken,
        request: ScheduleTaskRequest,
        _timeout: Duration,
    ) -> std::result::Result<ScheduleTaskResponse, tonic::Status> {
        self.requests.lock().push(request);
        self.script.lock().pop_front().unwrap_or_else(|| {
            Ok(ScheduleTaskResponse {
                executor_id: EXECUTOR_ID.into(),
                executor_addr: EXECUTOR_ADDR.into(),
            })
        })
    }
}

/// How the fake executor reacts to a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Accept,
    /// Fails before acceptance
    Reject,
    /// Accepts, then fails confirmation
    FailAfterAccept,
    /// Never answers until cancelled
    Hang,
}

pub struct FakeExecutor {
    mode: Mutex<DispatchMode>,
    dispatched: Mutex<Vec<DispatchTaskArgs>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(DispatchMode::Accept),
            dispatched: Mutex::new(Vec::new()),
        }
    }

    pub fn set_mode(&self, mode: DispatchMode) {
        *self.mode.lock() = mode;
    }

    pub fn dispatched(&self) -> Vec<DispatchTaskArgs> {
        self.dispatched.lock().clone()
    }
}

#[async_trait]
impl ExecutorClient for FakeExecutor {
    async fn dispatch_task(
        &self,
        ctx: &CancellationToken,
        args: DispatchTaskArgs,
        on_accepted: OnAccepted,
        on_failed: OnFailed,
    ) -> std::result::Result<(), tonic::Status> {
        self.dispatched.lock().push(args);
        let mode = *self.mode.lock();
        match mode {
            DispatchMode::Accept => {
                on_accepted();
                Ok(())
            }
            DispatchMode::Reject => Err(tonic::Status::resource_exhausted("executor full")),
            DispatchMode::FailAfterAccept => {
                on_accepted();
                on_failed(tonic::Status::internal("confirm failed"));
                Err(tonic::Status::internal("confirm failed"))
            }
            DispatchMode::Hang => {
                ctx.cancelled().await;
                Err(tonic::Status::cancelled("dispatch cancelled"))
            }
        }
    }
}

/// Executor pool handing out one shared fake executor
pub struct FakeExecutorManager {
    executor: Arc<FakeExecutor>,
    added: Mutex<HashMap<String, String>>,
}

impl FakeExecutorManager {
    pub fn new(executor: Arc<FakeExecutor>) -> Self {
        Self {
            executor,
            added: Mutex::new(HashMap::new()),
        }
    }

    pub fn address_of(&self, executor_id: &str) -> Option<String> {
        self.added.lock().get(executor_id).cloned()
    }
}

impl ExecutorClientManager for FakeExecutorManager {
    fn add_executor(&self, executor_id: &str, addr: &str) -> Result<()> {
        self.added.lock().insert(executor_id.into(), addr.into());
        Ok(())
    }

    fn executor_client(&self, executor_id: &str) -> Option<Arc<dyn ExecutorClient>> {
        if self.added.lock().contains_key(executor_id) {
            Some(self.executor.clone() as Arc<dyn ExecutorClient>)
        } else {
            None
        }
    }
}

/// Business logic that records every hook it receives
#[derive(Default)]
pub struct RecordingMaster {
    events: Arc<Mutex<Vec<String>>>,
    ticks: Arc<AtomicUsize>,
    handles: Arc<Mutex<Vec<WorkerHandle>>>,
    /// Hook name that fails once
    fail_once: Mutex<Option<&'static str>>,
}

impl RecordingMaster {
    pub fn failing_once(hook: &'static str) -> Self {
        let master = Self::default();
        *master.fail_once.lock() = Some(hook);
        master
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn ticks(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn last_handle(&self) -> Option<WorkerHandle> {
        self.handles.lock().last().cloned()
    }

    fn record(&self, hook: &'static str, event: String) -> Result<()> {
        self.events.lock().push(event);
        let mut fail = self.fail_once.lock();
        if *fail == Some(hook) {
            *fail = None;
            return Err(MasterError::Business {
                message: format!("{} failed", hook),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MasterImpl for RecordingMaster {
    async fn init_impl(&mut self, _ctx: &MasterContext) -> Result<()> {
        self.record("init", "init".into())
    }

    async fn tick(&mut self, _ctx: &MasterContext) -> Result<()> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_master_recovered(&mut self, _ctx: &MasterContext) -> Result<()> {
        self.record("recovered", "recovered".into())
    }

    async fn on_worker_dispatched(
        &mut self,
        _ctx: &MasterContext,
        worker: WorkerHandle,
        result: std::result::Result<(), MasterError>,
    ) -> Result<()> {
        let outcome = if result.is_ok() { "ok" } else { "err" };
        let event = format!("dispatched({}):{}", outcome, worker.worker_id);
        self.handles.lock().push(worker);
        self.record("dispatched", event)
    }

    async fn on_worker_online(&mut self, _ctx: &MasterContext, worker: WorkerHandle) -> Result<()> {
        let event = format!("online:{}", worker.worker_id);
        self.handles.lock().push(worker);
        self.record("online", event)
    }

    async fn on_worker_offline(
        &mut self,
        _ctx: &MasterContext,
        worker: WorkerHandle,
        reason: MasterError,
    ) -> Result<()> {
        let kind = match reason {
            MasterError::WorkerTimeout { .. } => "timeout",
            MasterError::WorkerFinished { .. } => "finished",
            _ => "other",
        };
        let event = format!("offline({}):{}", kind, worker.worker_id);
        self.handles.lock().push(worker);
        self.record("offline", event)
    }

    async fn on_worker_message(
        &mut self,
        _ctx: &MasterContext,
        worker: WorkerHandle,
        topic: Topic,
        _message: Message,
    ) -> Result<()> {
        self.record("message", format!("message({}):{}", topic, worker.worker_id))
    }

    async fn on_worker_status_updated(
        &mut self,
        _ctx: &MasterContext,
        worker: WorkerHandle,
    ) -> Result<()> {
        let event = format!("status:{}", worker.worker_id);
        self.handles.lock().push(worker);
        self.record("status", event)
    }

    async fn close_impl(&mut self, _ctx: &MasterContext) -> Result<()> {
        self.record("close", "close".into())
    }
}

/// Every collaborator a master needs, backed by in-memory fakes
pub struct Harness {
    pub store: Arc<InMemoryMetaStore>,
    pub router: Arc<MessageRouter>,
    pub outbox: Arc<OutboxSender>,
    pub scheduler: Arc<FakeScheduler>,
    pub executor: Arc<FakeExecutor>,
    pub executors: Arc<FakeExecutorManager>,
    pub clock: ManualClock,
    pub metrics: Arc<MetricsRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let executor = Arc::new(FakeExecutor::new());
        Self {
            store: Arc::new(InMemoryMetaStore::new()),
            router: Arc::new(MessageRouter::new()),
            outbox: Arc::new(OutboxSender::new()),
            scheduler: Arc::new(FakeScheduler::default()),
            executors: Arc::new(FakeExecutorManager::new(executor.clone())),
            executor,
            clock: ManualClock::new(),
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn deps(&self) -> MasterDeps {
        MasterDeps {
            meta_store: self.store.clone(),
            handler_manager: self.router.clone(),
            message_sender: self.outbox.clone(),
            scheduler: self.scheduler.clone(),
            executor_clients: self.executors.clone(),
            clock: Arc::new(self.clock.clone()),
            metrics: self.metrics.clone(),
            node_id: "master-node".into(),
            advertise_addr: "127.0.0.1:10239".into(),
        }
    }

    /// Persist a never-started record for `master_id`
    pub async fn seed_master(&self, master_id: &str) {
        let tp = WorkerType::FakeJobMaster.as_i64();
        let meta = MasterMetadata::new_uninit(master_id, tp, Vec::new());
        self.store.upsert_master_meta(&meta).await.unwrap();
    }

    pub fn master(&self, master_id: &str) -> BaseMaster<RecordingMaster> {
        self.master_with(master_id, RecordingMaster::default(), MasterConfig::default())
    }

    pub fn master_with(
        &self,
        master_id: &str,
        imp: RecordingMaster,
        config: MasterConfig,
    ) -> BaseMaster<RecordingMaster> {
        BaseMaster::new(master_id, self.deps(), imp, config)
    }

    /// Seed, build and initialize a master on first startup
    pub async fn started_master(&self, master_id: &str) -> BaseMaster<RecordingMaster> {
        self.seed_master(master_id).await;
        let mut master = self.master(master_id);
        master.init(&CancellationToken::new()).await.unwrap();
        master
    }

    /// Deliver a heartbeat ping from `worker_id` on `WORKER_NODE`
    pub async fn ping(&self, master_id: &str, worker_id: &str, is_finished: bool) -> Result<()> {
        let ping = HeartbeatPing {
            from_worker_id: worker_id.into(),
            send_time: Utc::now(),
            is_finished,
        };
        self.router
            .deliver(WORKER_NODE, &heartbeat_ping_topic(master_id), Message::HeartbeatPing(ping))
            .await
    }

    /// Deliver a status update addressed to `epoch`
    pub async fn report_status(
        &self,
        master_id: &str,
        worker_id: &str,
        epoch: i64,
        code: WorkerStatusCode,
    ) -> Result<()> {
        let msg = WorkerStatusMessage {
            worker_id: worker_id.into(),
            master_epoch: epoch,
            status: WorkerStatus::with_code(code),
        };
        self.router
            .deliver(WORKER_NODE, &worker_status_topic(master_id), Message::WorkerStatus(msg))
            .await
    }
}

/// Poll `cond` until it holds, yielding to background tasks in between
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Create a `FakeTask` worker and wait for its dispatch to finish
pub async fn create_dispatched_worker(master: &BaseMaster<RecordingMaster>) -> String {
    let capacity = MasterConfig::default().create_worker_concurrency;
    let worker_id = master
        .context()
        .create_worker(
            WorkerType::FakeTask,
            WorkerConfig::Structured(serde_json::json!({"target_tick": 10})),
            1,
            Vec::new(),
        )
        .await
        .unwrap();
    wait_until(|| master.available_quota() == capacity).await;
    worker_id
}

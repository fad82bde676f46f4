//! Base master
//!
//! Owns the metadata client, the worker manager, the creation quota and the
//! error center of one job master, and drives the business `MasterImpl`
//! through `init`, `poll` and `close`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::config::MasterConfig;
use super::worker_config::{prepare_worker_config, WorkerConfig, WorkerType};
use super::worker_manager::{WorkerCallbacks, WorkerHandle, WorkerManager};
use crate::client::{
    DispatchTaskArgs, ExecutorClientManager, OnAccepted, OnFailed, ScheduleTaskRequest,
    SchedulerClient,
};
use crate::error::{MasterError, Result};
use crate::metastore::{MasterMetadata, MasterMetadataClient, MasterStatusCode, MetaStore};
use crate::metrics::{MasterMetrics, MetricsRegistry};
use crate::p2p::{MessageHandler, MessageHandlerManager, MessageSender};
use crate::protocol::{
    heartbeat_ping_topic, heartbeat_pong_topic, worker_message_topic, worker_status_topic,
    CustomMessage, Epoch, HeartbeatPong, MasterId, Message, NodeId, ResourceId, ResourceUnit,
    Topic, WorkerId,
};
use crate::runtime::{Clock, ConcurrencyQuota, ErrCenter, ErrCtx, QuotaGuard, ShutdownSignal};

/// Collaborators injected into a master
#[derive(Clone)]
pub struct MasterDeps {
    pub meta_store: Arc<dyn MetaStore>,
    pub handler_manager: Arc<dyn MessageHandlerManager>,
    pub message_sender: Arc<dyn MessageSender>,
    pub scheduler: Arc<dyn SchedulerClient>,
    pub executor_clients: Arc<dyn ExecutorClientManager>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<MetricsRegistry>,
    /// Node this master runs on
    pub node_id: NodeId,
    /// Address advertised in the master record
    pub advertise_addr: String,
}

/// Business logic of a job master
///
/// Every hook runs on the poll path (or inside `init`/`close`), never
/// concurrently with another hook.
#[async_trait]
pub trait MasterImpl: Send {
    /// First start of the master
    async fn init_impl(&mut self, ctx: &MasterContext) -> Result<()>;

    /// Called on every poll once the master is ready
    async fn tick(&mut self, ctx: &MasterContext) -> Result<()>;

    /// Called from `init` on a restart, after persisted workers are loaded
    async fn on_master_recovered(&mut self, ctx: &MasterContext) -> Result<()>;

    /// Outcome of a creation started with `create_worker`
    async fn on_worker_dispatched(
        &mut self,
        ctx: &MasterContext,
        worker: WorkerHandle,
        result: std::result::Result<(), MasterError>,
    ) -> Result<()>;

    async fn on_worker_online(&mut self, ctx: &MasterContext, worker: WorkerHandle) -> Result<()>;

    async fn on_worker_offline(
        &mut self,
        ctx: &MasterContext,
        worker: WorkerHandle,
        reason: MasterError,
    ) -> Result<()>;

    async fn on_worker_message(
        &mut self,
        ctx: &MasterContext,
        worker: WorkerHandle,
        topic: Topic,
        message: Message,
    ) -> Result<()>;

    async fn on_worker_status_updated(
        &mut self,
        ctx: &MasterContext,
        worker: WorkerHandle,
    ) -> Result<()>;

    async fn close_impl(&mut self, ctx: &MasterContext) -> Result<()>;
}

struct Shared {
    master_id: MasterId,
    config: MasterConfig,
    deps: MasterDeps,
    meta_client: MasterMetadataClient,
    meta: RwLock<Option<MasterMetadata>>,
    epoch: AtomicI64,
    worker_manager: RwLock<Option<Arc<WorkerManager>>>,
    quota: ConcurrencyQuota,
    err_center: ErrCenter,
    tracker: TaskTracker,
    shutdown: ShutdownSignal,
    metrics: Arc<MasterMetrics>,
    init_done: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    fn worker_manager(&self) -> Result<Arc<WorkerManager>> {
        self.worker_manager
            .read()
            .clone()
            .ok_or_else(|| MasterError::MasterNotInitialized {
                master_id: self.master_id.clone(),
            })
    }

    fn is_ready(&self) -> bool {
        self.init_done.load(Ordering::SeqCst)
            && self
                .worker_manager
                .read()
                .as_ref()
                .is_some_and(|wm| wm.is_initialized())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MasterError::MasterClosed {
                master_id: self.master_id.clone(),
            });
        }
        Ok(())
    }
}

/// Framework surface available to business logic
#[derive(Clone)]
pub struct MasterContext {
    shared: Arc<Shared>,
}

impl MasterContext {
    pub fn master_id(&self) -> &str {
        &self.shared.master_id
    }

    /// Current epoch; zero before `init`
    pub fn epoch(&self) -> Epoch {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    /// Report a fatal business error; in-flight creations are cancelled
    pub fn on_error(&self, err: MasterError) {
        self.shared.err_center.on_error(err);
    }

    /// Snapshot of all tracked workers
    pub fn get_workers(&self) -> HashMap<WorkerId, WorkerHandle> {
        self.shared
            .worker_manager()
            .map(|wm| wm.get_workers())
            .unwrap_or_default()
    }

    /// Remove a worker that did not come back after a restart
    pub fn clean_tombstone(&self, worker_id: &str) -> Result<()> {
        self.shared.worker_manager()?.clean_tombstone(worker_id)
    }

    /// Persist a new status code for this master
    pub async fn update_status_code(&self, code: MasterStatusCode) -> Result<()> {
        let meta = self.shared.meta_client.set_status_code(code).await?;
        info!(master_id = %self.shared.master_id, status = ?code, "Master status code updated");
        *self.shared.meta.write() = Some(meta);
        Ok(())
    }

    /// Send a business payload to the node hosting `worker_id`.
    ///
    /// Returns `Ok(false)` if the substrate could not deliver it right now.
    pub async fn send_message(
        &self,
        worker_id: &str,
        topic: Topic,
        payload: serde_json::Value,
    ) -> Result<bool> {
        self.shared.ensure_open()?;
        let worker = self
            .shared
            .worker_manager()?
            .get_worker(worker_id)
            .ok_or_else(|| MasterError::WorkerNotFound {
                worker_id: worker_id.into(),
            })?;
        let node_id = match (&worker.node_id, worker.phase.is_alive()) {
            (Some(node_id), true) => node_id.clone(),
            _ => {
                return Err(MasterError::WorkerNotOnline {
                    worker_id: worker_id.into(),
                })
            }
        };

        let message = Message::Custom(CustomMessage::new(worker_id, payload));
        self.shared
            .deps
            .message_sender
            .send_to_node(self.shared.shutdown.token(), &node_id, topic, message)
            .await
    }

    /// Route custom messages on `worker-message-{master_id}-{name}` to
    /// `MasterImpl::on_worker_message`
    pub async fn register_worker_message_topic(&self, name: &str) -> Result<()> {
        let wm = self.shared.worker_manager()?;
        let topic = worker_message_topic(&self.shared.master_id, name);
        let handler = Arc::new(WorkerMessageHandler {
            name: name.to_string(),
            worker_manager: wm,
        });
        register(&self.shared, topic, handler).await
    }

    /// Start creating a worker.
    ///
    /// Returns the worker ID once a quota token is held and the config is
    /// encoded; scheduling and dispatch continue in the background and end
    /// in `on_worker_dispatched`.
    pub async fn create_worker(
        &self,
        worker_type: WorkerType,
        config: WorkerConfig,
        cost: ResourceUnit,
        resources: Vec<ResourceId>,
    ) -> Result<WorkerId> {
        let shared = &self.shared;
        shared.ensure_open()?;
        let wm = shared.worker_manager()?;
        let ctx = shared
            .err_center
            .with_cancel_on_first_error(shared.shutdown.token());

        if let Err(e) = shared
            .quota
            .consume(&ctx, shared.config.create_worker_wait_quota_timeout)
            .await
        {
            shared.metrics.worker_create_failures.inc();
            warn!(
                master_id = %shared.master_id,
                %worker_type,
                error = %e,
                "No quota to create worker"
            );
            return Err(e);
        }
        let guard = QuotaGuard::new(shared.quota.clone());

        let prepared = prepare_worker_config(worker_type, &config).map_err(|e| {
            shared.metrics.worker_create_failures.inc();
            e
        })?;
        wm.on_creating_worker(&prepared.worker_id)?;

        let worker_id = prepared.worker_id.clone();
        info!(
            master_id = %shared.master_id,
            worker_id = %worker_id,
            %worker_type,
            cost,
            "Creating worker"
        );

        let args = DispatchTaskArgs {
            worker_id: prepared.worker_id,
            master_id: shared.master_id.clone(),
            worker_type: worker_type.as_i64(),
            worker_config: prepared.raw,
        };
        let request = ScheduleTaskRequest {
            task_id: worker_id.clone(),
            cost,
            resource_requirements: resources,
        };
        shared.tracker.spawn(run_create_worker(
            shared.clone(),
            wm,
            ctx,
            request,
            args,
            guard,
        ));
        Ok(worker_id)
    }
}

/// Background half of `create_worker`; the quota token is released when
/// `_guard` drops.
async fn run_create_worker(
    shared: Arc<Shared>,
    wm: Arc<WorkerManager>,
    ctx: ErrCtx,
    request: ScheduleTaskRequest,
    args: DispatchTaskArgs,
    _guard: QuotaGuard,
) {
    let worker_id = args.worker_id.clone();
    let started = Instant::now();

    let result = tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(MasterError::Cancelled {
            reason: format!("creation of worker {} cancelled", worker_id),
        }),
        outcome = tokio::time::timeout(
            shared.config.create_worker_timeout,
            schedule_and_dispatch(&shared, &wm, ctx.token(), request, args),
        ) => outcome.unwrap_or_else(|_| Err(MasterError::RpcTimeout {
            method: "CreateWorker".into(),
        })),
    };

    match result {
        Ok(()) => {
            shared.metrics.dispatch_duration.observe_duration(started.elapsed());
            wm.on_dispatch_succeeded(&worker_id);
        }
        Err(e) => {
            shared.metrics.worker_create_failures.inc();
            warn!(
                master_id = %shared.master_id,
                worker_id = %worker_id,
                error = %e,
                "Worker creation failed"
            );
            wm.abort_creating_worker(&worker_id, e);
        }
    }
}

async fn schedule_and_dispatch(
    shared: &Shared,
    wm: &Arc<WorkerManager>,
    ctx: &CancellationToken,
    request: ScheduleTaskRequest,
    args: DispatchTaskArgs,
) -> Result<()> {
    let worker_id = args.worker_id.clone();
    let placement = shared
        .deps
        .scheduler
        .schedule_task(ctx, request, shared.config.create_worker_timeout)
        .await
        .map_err(|status| MasterError::from_status("ScheduleTask", status))?;
    let executor_id = placement.executor_id;
    debug!(
        worker_id = %worker_id,
        executor_id = %executor_id,
        addr = %placement.executor_addr,
        "Worker scheduled"
    );

    shared
        .deps
        .executor_clients
        .add_executor(&executor_id, &placement.executor_addr)?;
    let client = shared
        .deps
        .executor_clients
        .executor_client(&executor_id)
        .ok_or_else(|| MasterError::ExecutorUnavailable {
            executor_id: executor_id.clone(),
            reason: "no client after add_executor".into(),
        })?;
    wm.on_worker_scheduled(&worker_id, &executor_id);

    let on_accepted: OnAccepted = {
        let wm = wm.clone();
        let worker_id = worker_id.clone();
        let executor_id = executor_id.clone();
        Box::new(move || wm.before_starting_worker(&worker_id, &executor_id))
    };
    let on_failed: OnFailed = {
        let wm = wm.clone();
        let worker_id = worker_id.clone();
        Box::new(move |status: tonic::Status| {
            wm.abort_creating_worker(&worker_id, MasterError::from_status("DispatchTask", status))
        })
    };

    client
        .dispatch_task(ctx, args, on_accepted, on_failed)
        .await
        .map_err(|status| MasterError::from_status("DispatchTask", status))
}

async fn register(shared: &Shared, topic: Topic, handler: Arc<dyn MessageHandler>) -> Result<()> {
    let added = shared
        .deps
        .handler_manager
        .register_handler(shared.shutdown.token(), topic.clone(), handler)
        .await?;
    if !added {
        error!(master_id = %shared.master_id, topic = %topic, "Duplicate message handler");
        return Err(MasterError::DuplicateHandler { topic });
    }
    Ok(())
}

/// Answers heartbeat pings and records them once the pong went out
struct HeartbeatPingHandler {
    master_id: MasterId,
    epoch: Epoch,
    sender: Arc<dyn MessageSender>,
    clock: Arc<dyn Clock>,
    worker_manager: Arc<WorkerManager>,
    ctx: CancellationToken,
}

#[async_trait]
impl MessageHandler for HeartbeatPingHandler {
    async fn handle(&self, sender: NodeId, message: Message) -> Result<()> {
        let ping = match message {
            Message::HeartbeatPing(ping) => ping,
            other => {
                warn!(kind = other.kind(), "Unexpected message on heartbeat topic");
                return Ok(());
            }
        };

        let pong = HeartbeatPong {
            to_worker_id: ping.from_worker_id.clone(),
            send_time: ping.send_time,
            reply_time: self.clock.wall_now(),
            epoch: self.epoch,
            is_finished: ping.is_finished,
        };
        let topic = heartbeat_pong_topic(&self.master_id, &ping.from_worker_id);
        let delivered = self
            .sender
            .send_to_node(&self.ctx, &sender, topic, Message::HeartbeatPong(pong))
            .await?;
        if !delivered {
            debug!(
                worker_id = %ping.from_worker_id,
                node_id = %sender,
                "Pong not delivered, ignoring heartbeat"
            );
            return Ok(());
        }

        self.worker_manager.handle_heartbeat(&ping, &sender);
        Ok(())
    }
}

struct WorkerStatusHandler {
    worker_manager: Arc<WorkerManager>,
}

#[async_trait]
impl MessageHandler for WorkerStatusHandler {
    async fn handle(&self, _sender: NodeId, message: Message) -> Result<()> {
        match message {
            Message::WorkerStatus(status) => {
                self.worker_manager.on_worker_status_update_message(&status)
            }
            other => warn!(kind = other.kind(), "Unexpected message on status topic"),
        }
        Ok(())
    }
}

struct WorkerMessageHandler {
    name: String,
    worker_manager: Arc<WorkerManager>,
}

#[async_trait]
impl MessageHandler for WorkerMessageHandler {
    async fn handle(&self, _sender: NodeId, message: Message) -> Result<()> {
        let worker_id = match &message {
            Message::Custom(custom) => custom.worker_id.clone(),
            other => {
                let kind = other.kind();
                warn!(kind, topic = %self.name, "Unexpected message on worker topic");
                return Ok(());
            }
        };
        self.worker_manager
            .on_worker_message(&worker_id, self.name.clone(), message);
        Ok(())
    }
}

/// Adapts queued worker events onto the business hooks
struct CallbackSink<'a, I> {
    imp: &'a mut I,
    ctx: &'a MasterContext,
    metrics: &'a MasterMetrics,
}

#[async_trait]
impl<'a, I: MasterImpl> WorkerCallbacks for CallbackSink<'a, I> {
    async fn on_worker_dispatched(
        &mut self,
        handle: WorkerHandle,
        result: std::result::Result<(), MasterError>,
    ) -> Result<()> {
        if result.is_ok() {
            self.metrics.workers_created.inc();
        }
        self.imp.on_worker_dispatched(self.ctx, handle, result).await
    }

    async fn on_worker_online(&mut self, handle: WorkerHandle) -> Result<()> {
        self.imp.on_worker_online(self.ctx, handle).await
    }

    async fn on_worker_offline(&mut self, handle: WorkerHandle, reason: MasterError) -> Result<()> {
        self.metrics.worker_offline.inc();
        self.imp.on_worker_offline(self.ctx, handle, reason).await
    }

    async fn on_worker_status_updated(&mut self, handle: WorkerHandle) -> Result<()> {
        self.imp.on_worker_status_updated(self.ctx, handle).await
    }

    async fn on_worker_message(
        &mut self,
        handle: WorkerHandle,
        topic: Topic,
        message: Message,
    ) -> Result<()> {
        self.imp.on_worker_message(self.ctx, handle, topic, message).await
    }
}

/// A job master wrapping business logic `I`
pub struct BaseMaster<I> {
    imp: I,
    ctx: MasterContext,
}

impl<I: MasterImpl> BaseMaster<I> {
    pub fn new(
        master_id: impl Into<MasterId>,
        deps: MasterDeps,
        imp: I,
        config: MasterConfig,
    ) -> Self {
        let master_id = master_id.into();
        let meta_client = MasterMetadataClient::new(master_id.clone(), deps.meta_store.clone());
        let metrics = deps.metrics.master(&master_id);
        let shared = Shared {
            quota: ConcurrencyQuota::new(config.create_worker_concurrency),
            master_id,
            config,
            deps,
            meta_client,
            meta: RwLock::new(None),
            epoch: AtomicI64::new(0),
            worker_manager: RwLock::new(None),
            err_center: ErrCenter::new(),
            tracker: TaskTracker::new(),
            shutdown: ShutdownSignal::new(),
            metrics,
            init_done: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        Self {
            imp,
            ctx: MasterContext {
                shared: Arc::new(shared),
            },
        }
    }

    /// Load metadata, take a new epoch and register handlers, then run
    /// `init_impl` (first start) or load persisted workers and run
    /// `on_master_recovered` (restart). Status `Init` is persisted last.
    ///
    /// After a restart the master becomes ready once `poll` has finished
    /// worker reconciliation.
    pub async fn init(&mut self, ctx: &CancellationToken) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(MasterError::Cancelled {
                reason: "master init cancelled".into(),
            });
        }
        self.ctx.shared.config.validate()?;

        let is_first_startup = self.do_init().await?;
        if is_first_startup {
            self.imp.init_impl(&self.ctx).await?;
        } else {
            self.imp.on_master_recovered(&self.ctx).await?;
        }
        self.ctx.update_status_code(MasterStatusCode::Init).await?;
        self.ctx.shared.init_done.store(true, Ordering::SeqCst);
        info!(
            master_id = %self.master_id(),
            epoch = self.current_epoch(),
            first_startup = is_first_startup,
            "Master initialized"
        );
        Ok(())
    }

    async fn do_init(&mut self) -> Result<bool> {
        let shared = self.ctx.shared.clone();
        let meta = self.refresh_metadata().await?;
        let is_first_startup = meta.status_code == MasterStatusCode::Uninit;

        let wm = Arc::new(WorkerManager::new(
            shared.master_id.clone(),
            meta.epoch,
            is_first_startup,
            shared.config.timeouts.clone(),
            shared.deps.clock.clone(),
        ));
        *shared.worker_manager.write() = Some(wm.clone());

        self.register_message_handlers(&wm, meta.epoch).await?;
        if !is_first_startup {
            wm.init_after_recover(shared.deps.meta_store.as_ref()).await?;
        }
        Ok(is_first_startup)
    }

    async fn refresh_metadata(&self) -> Result<MasterMetadata> {
        let shared = &self.ctx.shared;
        let mut meta = shared.meta_client.load().await?;
        let epoch = shared.meta_client.gen_epoch().await?;

        meta.epoch = epoch;
        meta.addr = shared.deps.advertise_addr.clone();
        meta.node_id = shared.deps.node_id.clone();
        shared.meta_client.update(&meta).await?;

        shared.epoch.store(epoch, Ordering::SeqCst);
        *shared.meta.write() = Some(meta.clone());
        info!(
            master_id = %shared.master_id,
            epoch,
            status = ?meta.status_code,
            "Master metadata refreshed"
        );
        Ok(meta)
    }

    async fn register_message_handlers(&self, wm: &Arc<WorkerManager>, epoch: Epoch) -> Result<()> {
        let shared = &self.ctx.shared;
        let ping = Arc::new(HeartbeatPingHandler {
            master_id: shared.master_id.clone(),
            epoch,
            sender: shared.deps.message_sender.clone(),
            clock: shared.deps.clock.clone(),
            worker_manager: wm.clone(),
            ctx: shared.shutdown.token().clone(),
        });
        register(shared, heartbeat_ping_topic(&shared.master_id), ping).await?;

        let status = Arc::new(WorkerStatusHandler {
            worker_manager: wm.clone(),
        });
        register(shared, worker_status_topic(&shared.master_id), status).await
    }

    /// Run one iteration: surface faults, deliver worker callbacks, then
    /// tick the business logic.
    pub async fn poll(&mut self, ctx: &CancellationToken) -> Result<()> {
        let shared = self.ctx.shared.clone();
        if let Some(err) = shared.err_center.check_error() {
            return Err(err);
        }
        shared.ensure_open()?;
        let wm = shared.worker_manager()?;

        shared.deps.handler_manager.check_error(ctx).await?;

        let mut sink = CallbackSink {
            imp: &mut self.imp,
            ctx: &self.ctx,
            metrics: &shared.metrics,
        };
        wm.tick(&mut sink).await?;
        shared.metrics.online_workers.set(wm.alive_count() as i64);

        if !shared.is_ready() {
            return Ok(());
        }
        self.imp.tick(&self.ctx).await
    }

    /// Stop the master.
    ///
    /// Runs `close_impl`, cancels in-flight creations and waits for them up
    /// to the close timeout, then releases handlers and metrics. The error
    /// of `close_impl`, if any, is returned after cleanup.
    pub async fn close(&mut self, ctx: &CancellationToken) -> Result<()> {
        let shared = self.ctx.shared.clone();
        if shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let impl_result = self.imp.close_impl(&self.ctx).await;
        if let Err(e) = &impl_result {
            error!(master_id = %shared.master_id, error = %e, "Business close failed");
        }

        shared.shutdown.shutdown();
        shared.tracker.close();
        if tokio::time::timeout(shared.config.close_timeout, shared.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                master_id = %shared.master_id,
                in_flight = shared.tracker.len(),
                "Worker creations still running after close timeout"
            );
        }

        if let Ok(wm) = shared.worker_manager() {
            wm.close();
        }
        if let Err(e) = shared.deps.handler_manager.clean(ctx).await {
            warn!(master_id = %shared.master_id, error = %e, "Failed to clean message handlers");
        }
        shared.deps.metrics.unregister(&shared.master_id);
        info!(master_id = %shared.master_id, "Master closed");

        impl_result
    }

    /// Record a fatal error; the next `poll` returns it
    pub fn on_error(&self, err: MasterError) {
        self.ctx.on_error(err);
    }

    pub fn master_id(&self) -> &str {
        self.ctx.master_id()
    }

    /// Metadata as of the last refresh or status update
    pub fn master_meta(&self) -> Option<MasterMetadata> {
        self.ctx.shared.meta.read().clone()
    }

    pub fn get_workers(&self) -> HashMap<WorkerId, WorkerHandle> {
        self.ctx.get_workers()
    }

    /// Whether `init` succeeded and worker reconciliation has finished
    pub fn is_master_ready(&self) -> bool {
        self.ctx.shared.is_ready()
    }

    pub fn current_epoch(&self) -> Epoch {
        self.ctx.epoch()
    }

    /// Handle for issuing framework calls outside of hooks
    pub fn context(&self) -> &MasterContext {
        &self.ctx
    }

    /// The wrapped business logic
    pub fn inner(&self) -> &I {
        &self.imp
    }

    /// Quota tokens currently free
    pub fn available_quota(&self) -> usize {
        self.ctx.shared.quota.available()
    }
}

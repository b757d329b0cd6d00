use crate::admission::{
    AdmissionRetryWorker, ConnectionAdmission, MessageRateLimiter, ResilientAdmission,
    StoreAdmission, UnregisterRetryQueue,
};
use crate::cluster::{
    build_route_cache, open_store, DeadNodeCleaner, KvStore, NodeDirectory, NodeInfo, NodeSnapshot,
    NodeSnapshotService, RouteCache, RouteStore,
};
use crate::config::Config;
use crate::connections::{ConnectionRegistry, DrainReport, HeartbeatSweeper, ShutdownDrainService};
use crate::core::ShutdownState;
use crate::events::{build_producer, dispatch_pipeline, DispatchWorker, DlqWorker};
use crate::forwarding::{NodeClientPool, NodeForwarder, NodeGatewayService, OfflineRouter};
use crate::gateway::{Gateway, GatewayParts};
use crate::hook::{HookClient, HookPolicyDefaults, TenantHookPolicyCache};
use crate::messaging::{OfflineBufferStore, OfflineLimits};
use crate::ops::metrics::MetricsRegistry;
use crate::ops::telemetry::{self, LogHandle, TelemetryState};
use crate::time::Clock;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Background tasks get this long to observe shutdown before being aborted.
const TASK_STOP_GRACE: Duration = Duration::from_secs(5);

/// Workers built in `new` and moved onto the runtime by `start`.
struct PendingWorkers<C: Clock> {
    admission_retry: AdmissionRetryWorker<C>,
    dispatch: DispatchWorker<C>,
    dlq: DlqWorker<C>,
}

/// Process wiring: builds every component from config, runs the background
/// loops, and drains the node on shutdown.
pub struct Runtime<C: Clock> {
    config: Config,
    clock: C,
    local: NodeInfo,
    metrics: Arc<MetricsRegistry>,
    state: Arc<ShutdownState>,
    store: Arc<dyn KvStore>,
    snapshot: Arc<NodeSnapshot>,
    registry: Arc<ConnectionRegistry>,
    admission: Arc<dyn ConnectionAdmission>,
    routes: RouteStore,
    route_cache: Arc<dyn RouteCache>,
    offline_store: Arc<OfflineBufferStore<C>>,
    gateway: Arc<Gateway<C>>,
    workers: Option<PendingWorkers<C>>,
    tasks: Vec<JoinHandle<()>>,
    rpc_addr: Option<SocketAddr>,
    telemetry_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    log_handle: Option<LogHandle>,
}

impl<C: Clock> Runtime<C> {
    pub fn new(config: Config, clock: C, log_handle: Option<LogHandle>) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.store.connection_string, clock.clone())
            .context("open distributed store")?;
        Self::with_store(config, clock, store, log_handle)
    }

    /// Build against an already opened store, e.g. one shared by several
    /// nodes in a single process.
    pub fn with_store(
        config: Config,
        clock: C,
        store: Arc<dyn KvStore>,
        log_handle: Option<LogHandle>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(MetricsRegistry::new());
        let state = Arc::new(ShutdownState::default());
        let local = NodeInfo::new(config.node.node_id.clone(), config.node.public_endpoint.clone());

        let routes = RouteStore::new(store.clone());
        let route_cache = build_route_cache(&config.route_cache, clock.clone());
        let snapshot = Arc::new(NodeSnapshot::new(vec![local.clone()]));
        let registry = Arc::new(ConnectionRegistry::new());

        let store_admission: Arc<dyn ConnectionAdmission> =
            Arc::new(StoreAdmission::new(store.clone(), routes.clone()));
        let (retry_queue, retry_rx) =
            UnregisterRetryQueue::bounded(config.admission.retry_queue_capacity);
        let admission: Arc<dyn ConnectionAdmission> = Arc::new(ResilientAdmission::new(
            store_admission.clone(),
            retry_queue.clone(),
            metrics.clone(),
        ));
        let admission_retry = AdmissionRetryWorker::new(
            store_admission,
            retry_queue,
            retry_rx,
            metrics.clone(),
            clock.clone(),
            &config.admission,
        );

        let offline_store = Arc::new(OfflineBufferStore::new(
            OfflineLimits::from_config(&config.offline),
            clock.clone(),
            metrics.clone(),
        ));
        let pool = Arc::new(NodeClientPool::from_config(
            &config.node_rpc,
            config.node.cluster_token.clone(),
        ));
        let forwarder = Arc::new(NodeForwarder::new(
            pool,
            &config.node_rpc,
            clock.clone(),
            metrics.clone(),
        ));
        let offline = Arc::new(OfflineRouter::new(
            local.node_id.clone(),
            snapshot.clone(),
            offline_store.clone(),
            forwarder.clone(),
            metrics.clone(),
        ));

        let auth_secrets = config
            .tenants
            .iter()
            .filter_map(|(tenant, cfg)| {
                cfg.hook_secret
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| (tenant.clone(), s.to_string()))
            })
            .collect();
        let hooks = Arc::new(HookClient::new(
            Duration::from_millis(config.hook.timeout_ms),
            TenantHookPolicyCache::new(HookPolicyDefaults::from_config(&config)),
            auth_secrets,
            config.hook.check_message_fail_open,
            clock.clone(),
            metrics.clone(),
        ));

        let (events, dispatch, dlq) = dispatch_pipeline(
            &config.events,
            build_producer(config.events.producer),
            metrics.clone(),
            clock.clone(),
        );

        let gateway = Arc::new(Gateway::new(GatewayParts {
            node: local.clone(),
            limits: config.limits.clone(),
            default_heartbeat_timeout: Duration::from_secs(u64::from(
                config.heartbeat.default_timeout_seconds.max(1),
            )),
            tenants: config.tenants.clone(),
            clock: clock.clone(),
            state: state.clone(),
            registry: registry.clone(),
            admission: admission.clone(),
            routes: routes.clone(),
            route_cache: route_cache.clone(),
            hooks,
            forwarder,
            offline,
            rate_limiter: Arc::new(MessageRateLimiter::new(store.clone(), clock.clone())),
            events,
            metrics: metrics.clone(),
        }));

        Ok(Self {
            config,
            clock,
            local,
            metrics,
            state,
            store,
            snapshot,
            registry,
            admission,
            routes,
            route_cache,
            offline_store,
            gateway,
            workers: Some(PendingWorkers {
                admission_retry,
                dispatch,
                dlq,
            }),
            tasks: Vec::new(),
            rpc_addr: None,
            telemetry_addr: None,
            shutdown_tx,
            shutdown_rx,
            log_handle,
        })
    }

    /// Start everything, wait for CTRL+C or a component-requested shutdown,
    /// then drain.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received");
            }
            _ = self.shutdown_rx.changed() => {
                tracing::info!("shutdown requested by component");
            }
        }
        self.shutdown().await.map(|_| ())
    }

    /// Register with the cluster and spawn background loops and listeners.
    pub async fn start(&mut self) -> Result<()> {
        let Some(workers) = self.workers.take() else {
            anyhow::bail!("runtime already started");
        };
        let node_id = self.local.node_id.clone();
        let refresh = Duration::from_millis(self.config.node.snapshot_refresh_ms);
        let cleanup_every = Duration::from_secs(self.config.node.dead_node_cleanup_seconds);
        tracing::info!(node = %node_id, endpoint = %self.local.endpoint, "starting gateway node");

        let snapshot_service = NodeSnapshotService::new(
            NodeDirectory::new(self.store.clone()),
            self.snapshot.clone(),
            self.local.clone(),
            self.config.node_ttl(),
            refresh,
            self.metrics.clone(),
        );
        if let Err(err) = snapshot_service.prime().await {
            tracing::warn!(node = %node_id, "initial node registration failed: {err}");
        }
        self.spawn(snapshot_service.run(self.shutdown_rx.clone()));

        let cleaner = DeadNodeCleaner::new(
            self.routes.clone(),
            self.route_cache.clone(),
            self.snapshot.clone(),
            node_id.clone(),
            self.metrics.clone(),
        );
        self.spawn(cleaner.run(cleanup_every, self.shutdown_rx.clone()));

        let sweeper = HeartbeatSweeper::new(
            self.local.node_id.clone(),
            self.registry.clone(),
            self.admission.clone(),
            self.metrics.clone(),
            self.clock.clone(),
            &self.config.heartbeat,
        );
        self.spawn(sweeper.run(self.shutdown_rx.clone()));
        self.spawn(workers.admission_retry.run(self.shutdown_rx.clone()));
        self.spawn(workers.dispatch.run(self.shutdown_rx.clone()));
        self.spawn(workers.dlq.run(self.shutdown_rx.clone()));

        self.start_rpc().await?;
        self.start_telemetry().await?;
        Ok(())
    }

    async fn start_rpc(&mut self) -> Result<()> {
        let bind = self.config.node.rpc_bind.clone();
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("failed to bind node rpc on {bind}"))?;
        let addr = listener.local_addr().context("node rpc local addr")?;
        let service = Arc::new(NodeGatewayService::new(
            self.registry.clone(),
            self.offline_store.clone(),
            self.metrics.clone(),
            self.config.node.cluster_token.clone(),
        ));
        let shutdown = self.shutdown_rx.clone();
        self.spawn(async move {
            if let Err(err) = service.serve(listener, shutdown).await {
                tracing::warn!("node rpc server stopped: {err}");
            }
        });
        tracing::info!(%addr, "node rpc listening");
        self.rpc_addr = Some(addr);
        Ok(())
    }

    async fn start_telemetry(&mut self) -> Result<()> {
        let Some(bind) = self.config.telemetry.metrics_bind.clone() else {
            return Ok(());
        };
        let state = Arc::new(TelemetryState {
            metrics: self.metrics.clone(),
            shutdown: self.state.clone(),
            registry: self.registry.clone(),
        });
        let (addr, handle) = telemetry::start_http(
            &bind,
            state,
            self.log_handle.clone(),
            self.shutdown_rx.clone(),
        )
        .await?;
        self.tasks.push(handle);
        self.telemetry_addr = Some(addr);
        Ok(())
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(task));
    }

    /// Evict every session, leave the node directory, then stop background
    /// loops.
    pub async fn shutdown(&mut self) -> Result<DrainReport> {
        tracing::info!(node = %self.local.node_id, "draining gateway node");
        let drain = ShutdownDrainService::new(
            self.local.node_id.clone(),
            self.config.drain_timeout(),
            self.state.clone(),
            self.registry.clone(),
            self.admission.clone(),
            self.metrics.clone(),
        );
        let report = drain.drain().await;
        match NodeDirectory::new(self.store.clone())
            .unregister_self(&self.local.node_id)
            .await
        {
            Ok(_) => {}
            Err(err) => tracing::warn!(node = %self.local.node_id, "node unregister failed: {err}"),
        }
        let _ = self.shutdown_tx.send(true);
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(TASK_STOP_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        Ok(report)
    }

    /// Ask `run` to begin shutdown.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn gateway(&self) -> Arc<Gateway<C>> {
        self.gateway.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    pub fn local_node(&self) -> &NodeInfo {
        &self.local
    }

    pub fn snapshot(&self) -> Arc<NodeSnapshot> {
        self.snapshot.clone()
    }

    pub fn store(&self) -> Arc<dyn KvStore> {
        self.store.clone()
    }

    pub fn ready(&self) -> bool {
        !self.state.is_draining()
    }

    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc_addr
    }

    pub fn telemetry_addr(&self) -> Option<SocketAddr> {
        self.telemetry_addr
    }

    pub fn clock(&self) -> C {
        self.clock.clone()
    }
}

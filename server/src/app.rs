//! Core application
//!
//! Owns the init order (broker, store, consumer groups, connection
//! recovery, workers, gateway listener) and tears everything down in
//! reverse on shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::auth::audit::{AuditSink, StoreAuditSink};
use crate::auth::quota::QuotaTracker;
use crate::auth::rbac::{AllowAllPolicyEngine, PolicyEngine, RbacPolicyEngine};
use crate::auth::{AllowAllAuthenticator, Authenticator, TokenAuthenticator};
use crate::broker::Broker;
use crate::core::bus::{Bus, BusEvent};
use crate::core::cli::{self, CliConfig, Commands};
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::gateway::session::GatewayReconnectTransport;
use crate::gateway::{Gateway, GatewayState};
use crate::queue::{MessageQueue, QueueName};
use crate::realtime::{ConnectionManager, EventRouter, HealthMonitor};
use crate::store::MetaService;

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub broker: Broker,
    pub store: MetaService,
    pub bus: Bus,
    pub queue: MessageQueue,
    pub quota: Arc<QuotaTracker>,
    pub audit: Arc<dyn AuditSink>,
    pub manager: ConnectionManager,
    pub router: EventRouter,
    pub health: HealthMonitor,
    pub authenticator: Arc<dyn Authenticator>,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        match command {
            Some(Commands::Start) | None => {}
        }

        let app = Self::init(&cli_config).await?;
        Self::start_server(app).await
    }

    async fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;
        Self::from_config(config).await
    }

    /// Wire all components from a resolved configuration
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let broker = Broker::from_config(&config.broker)
            .await
            .context("Failed to initialize stream broker")?;
        tracing::debug!(backend = broker.backend_name(), "Broker initialized");

        let store = MetaService::from_config(&config.store, config.tenant.strict_isolation)
            .await
            .context("Failed to initialize metadata store")?;
        tracing::debug!(backend = store.backend_name(), "Store initialized");

        let bus = Bus::new();
        let quota = Arc::new(QuotaTracker::new(
            config.tenant.limits.clone(),
            config.tenant.resource_limits,
        ));
        let audit: Arc<dyn AuditSink> = Arc::new(StoreAuditSink::new(
            store.clone(),
            config.tenant.audit_logging,
        ));
        let queue = MessageQueue::new(broker.clone(), config.queue.clone());

        let manager = ConnectionManager::new(
            store.clone(),
            broker.clone(),
            bus.clone(),
            config.ws.heartbeat.clone(),
            config.ws.retry.clone(),
        );

        let policy: Arc<dyn PolicyEngine> = if config.auth.enabled {
            Arc::new(RbacPolicyEngine::new(store.clone()))
        } else {
            Arc::new(AllowAllPolicyEngine)
        };
        let router = EventRouter::new(
            config.ws.channels.clone(),
            policy,
            Arc::clone(&quota),
            queue.clone(),
            store.clone(),
            bus.clone(),
            broker.clone(),
        );

        // Reconnection attempts probe the gateway's live-socket registry
        manager.set_transport(Arc::new(GatewayReconnectTransport::new(router.clone())));

        let health = HealthMonitor::new(
            Arc::new(manager.clone()),
            bus.clone(),
            config.health.clone(),
        );

        let authenticator: Arc<dyn Authenticator> = if config.auth.enabled {
            Arc::new(TokenAuthenticator::from_config(&config.auth))
        } else {
            tracing::warn!("Authentication disabled; all sessions join the 'local' organization");
            Arc::new(AllowAllAuthenticator)
        };

        Ok(Self {
            shutdown: ShutdownService::new(),
            config,
            broker,
            store,
            bus,
            queue,
            quota,
            audit,
            manager,
            router,
            health,
            authenticator,
        })
    }

    async fn start_server(app: Self) -> Result<()> {
        app.shutdown.install_signal_handlers();

        // Consumer groups are idempotent; recovery precedes workers so
        // recovered sessions are observable before traffic flows
        app.queue
            .init()
            .await
            .context("Failed to create consumer groups")?;
        app.manager
            .recover()
            .await
            .context("Failed to recover connections")?;

        app.start_background_tasks().await;

        let gateway = Gateway::new(app.gateway_state());
        gateway
            .serve(&app.config.server.host, app.config.server.port)
            .await?;

        // Teardown in reverse init order
        app.shutdown.shutdown().await;
        app.manager.shutdown().await;
        app.store.close().await;
        app.broker.close().await;
        tracing::debug!("Shutdown complete");
        Ok(())
    }

    pub fn gateway_state(&self) -> GatewayState {
        GatewayState {
            config: Arc::new(self.config.ws.clone()),
            authenticator: Arc::clone(&self.authenticator),
            manager: self.manager.clone(),
            router: self.router.clone(),
            quota: Arc::clone(&self.quota),
            audit: Arc::clone(&self.audit),
            broker: self.broker.clone(),
            store: self.store.clone(),
            health: self.health.clone(),
            queue: self.queue.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub async fn start_background_tasks(&self) {
        let shutdown = &self.shutdown;

        shutdown
            .register(self.queue.start_delayed_sweeper(shutdown.subscribe()))
            .await;
        shutdown
            .register(self.queue.start_retry_sweeper(shutdown.subscribe()))
            .await;

        for queue_name in QueueName::priority_queues() {
            let workers = self.queue.start_workers(
                queue_name,
                self.router.dispatch_handler(),
                shutdown.subscribe(),
            );
            for handle in workers {
                shutdown.register(handle).await;
            }
        }

        shutdown
            .register(self.health.start(shutdown.subscribe()))
            .await;
        shutdown
            .register(self.manager.start_cleanup_task(shutdown.subscribe()))
            .await;
        shutdown
            .register(self.router.start_channel_sweeper(shutdown.subscribe()))
            .await;
        shutdown
            .register(self.spawn_lifecycle_wiring(shutdown.subscribe()))
            .await;
        shutdown
            .register(self.spawn_metrics_sampler(shutdown.subscribe()))
            .await;

        tracing::debug!("Background tasks started");
    }

    /// A removed connection takes its subscriptions and quota slot with it
    fn spawn_lifecycle_wiring(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let router = self.router.clone();
        let quota = Arc::clone(&self.quota);
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Some(BusEvent::ConnectionRemoved { session_id, organization_id }) => {
                            router.drop_session(&session_id);
                            quota.release_connection(&organization_id);
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        })
    }

    /// Periodic operational snapshot at debug level
    fn spawn_metrics_sampler(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let queue = self.queue.clone();
        let router = self.router.clone();
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(60);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                let stats = manager.stats();
                let queues = queue.stats().await.unwrap_or_default();
                tracing::debug!(
                    connections = stats.total,
                    average_latency = stats.average_latency,
                    backpressure_drops = router.backpressure_drops(),
                    queues = ?queues,
                    "Metrics sample"
                );
            }
        })
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }
}

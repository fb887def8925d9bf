/**
 * KERNEL - Assemblage des composants
 *
 * pool -> transport -> routeur (+ sender) -> coordinateur -> recorder,
 * plus les boucles de fond : réception, health checks, statut, janitor.
 * Utilisé tel quel par le binaire et par le harness de test du devkit.
 */

use crate::config::KernelConfig;
use crate::coordinator::RoundCoordinator;
use crate::health::StatusTracker;
use crate::link::Connector;
use crate::pool::BrokerPool;
use crate::recorder::ReconciliationRecorder;
use crate::router::MessageRouter;
use crate::transport::TransportClient;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

const DRAIN_GRACE: Duration = Duration::from_secs(2);

pub struct Kernel {
    pub config: KernelConfig,
    pub transport: Arc<TransportClient>,
    pub router: Arc<MessageRouter>,
    pub coordinator: Arc<RoundCoordinator>,
    pub recorder: Arc<ReconciliationRecorder>,
    pub status: StatusTracker,
    tasks: Vec<JoinHandle<()>>,
}

impl Kernel {
    /// Démarre tout ; un pool entièrement injoignable est remonté à l'appelant
    pub async fn start(config: KernelConfig, connector: Arc<dyn Connector>) -> anyhow::Result<Self> {
        config.validate().context("invalid kernel configuration")?;

        let pool = Arc::new(BrokerPool::new(config.brokers.clone(), config.pool.clone(), connector)?);
        let transport = TransportClient::new(pool);
        let router = Arc::new(MessageRouter::new(&config.router));
        let recorder = Arc::new(ReconciliationRecorder::new(&config.recorder));
        let coordinator = RoundCoordinator::new(
            router.clone(),
            recorder.clone(),
            config.detection.clone(),
            config.topics.clone(),
        );
        coordinator.install();

        let status = StatusTracker::new(&config.table_id);
        let mut tasks = Vec::new();
        tasks.extend(transport.spawn_receive_loop(router.clone()));

        // mémorisé avant connexion, rejoué par connect_with_failover
        transport.subscribe(&config.topics.response).await?;
        transport
            .connect_with_failover()
            .await
            .context("connecting to the broker pool")?;
        status.mark_connected();
        info!(
            "[kernel] table {} connected via {}",
            config.table_id,
            transport.active_endpoint().await.unwrap_or_default()
        );

        tasks.push(router.spawn_sender(transport.clone()));
        tasks.extend(status.spawn_health_checks(transport.clone()));
        if config.status_interval_secs > 0 {
            tasks.push(status.spawn_status_publisher(
                transport.clone(),
                coordinator.clone(),
                router.clone(),
                config.topics.status.clone(),
                Duration::from_secs(config.status_interval_secs),
            ));
        }
        tasks.push(coordinator.spawn_janitor());

        Ok(Self { config, transport, router, coordinator, recorder, status, tasks })
    }

    /// Laisse partir les commandes en attente (borné), puis ferme tout
    pub async fn shutdown(self) {
        info!("[kernel] shutting down");
        self.coordinator.shutdown();

        let started = Instant::now();
        while !self.router.outbound().is_empty() && started.elapsed() < DRAIN_GRACE {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let left = self.router.outbound().len();
        if left > 0 {
            warn!("[kernel] {left} outbound messages dropped at shutdown");
        }
        self.router.outbound().close();

        for task in &self.tasks {
            task.abort();
        }
        self.transport.disconnect().await;
        info!("[kernel] stopped");
    }
}

use crate::coordinator::{CoordinatorStats, RoundCoordinator};
use crate::outbound::{OutboundMessage, Priority};
use crate::pool::{ConnectionSnapshot, ProbeOutcome};
use crate::router::{MessageRouter, RouterStats};
use crate::state::{new_state, read_state, replace_state, Shared};
use crate::transport::TransportClient;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
pub struct KernelStatus {
    pub table_id: String,
    pub uptime_seconds: u64,
    pub transport_state: String,
    pub active_endpoint: Option<String>,
    pub failovers: u32,
    pub recoveries: u32,
    pub connections: Vec<ConnectionSnapshot>,
    pub rounds: CoordinatorStats,
    pub router: RouterStats,
    pub outbound_pending: usize,
}

#[derive(Clone)]
pub struct StatusTracker {
    table_id: String,
    start_time: Instant,
    recoveries: Arc<AtomicU32>,
    transport_state: Shared<String>,
}

impl StatusTracker {
    pub fn new(table_id: &str) -> Self {
        Self {
            table_id: table_id.to_string(),
            start_time: Instant::now(),
            recoveries: Arc::new(AtomicU32::new(0)),
            transport_state: new_state("connecting".to_string()),
        }
    }

    fn set_state(&self, next: &str) {
        let previous = replace_state(&self.transport_state, next.to_string());
        if previous != next {
            info!("[health] transport {previous} -> {next}");
        }
    }

    pub fn mark_connected(&self) {
        self.set_state("connected");
    }

    pub fn mark_disconnected(&self) {
        self.set_state("disconnected");
    }

    pub fn mark_recovering(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        self.set_state("reconnecting");
    }

    pub fn transport_state(&self) -> String {
        read_state(&self.transport_state)
    }

    pub fn recoveries(&self) -> u32 {
        self.recoveries.load(Ordering::Relaxed)
    }

    pub async fn get_status(
        &self,
        transport: &TransportClient,
        coordinator: &RoundCoordinator,
        router: &MessageRouter,
    ) -> KernelStatus {
        KernelStatus {
            table_id: self.table_id.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            transport_state: self.transport_state(),
            active_endpoint: transport.active_endpoint().await,
            failovers: transport.failovers(),
            recoveries: self.recoveries(),
            connections: transport.pool().snapshot(),
            rounds: coordinator.stats(),
            router: router.stats(),
            outbound_pending: router.outbound().len(),
        }
    }

    async fn recover(&self, transport: &TransportClient) {
        self.mark_recovering();
        transport.recover().await;
        if transport.is_connected().await {
            self.mark_connected();
        } else {
            self.mark_disconnected();
        }
    }

    /// Une boucle de health check par connexion du pool
    pub fn spawn_health_checks(&self, transport: Arc<TransportClient>) -> Vec<JoinHandle<()>> {
        let period = transport.pool().health_interval();
        (0..transport.pool().len())
            .map(|index| {
                let tracker = self.clone();
                let transport = transport.clone();
                task::spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        match transport.pool().check_connection(index).await {
                            ProbeOutcome::ActiveLost => {
                                warn!("[health] active session lost, failing over");
                                tracker.recover(&transport).await;
                            }
                            ProbeOutcome::Recovered if !transport.is_connected().await => {
                                info!("[health] an endpoint recovered while disconnected, reconnecting");
                                tracker.recover(&transport).await;
                            }
                            outcome => debug!("[health] connection #{index}: {outcome:?}"),
                        }
                    }
                })
            })
            .collect()
    }

    /// Publie le statut kernel en priorité basse à intervalle fixe
    pub fn spawn_status_publisher(
        &self,
        transport: Arc<TransportClient>,
        coordinator: Arc<RoundCoordinator>,
        router: Arc<MessageRouter>,
        topic: String,
        every: Duration,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let status = tracker.get_status(&transport, &coordinator, &router).await;
                match OutboundMessage::json(topic.as_str(), &status, Priority::Low) {
                    Ok(msg) => {
                        router.enqueue(msg);
                        debug!(
                            "[health] status queued (uptime: {}s, rounds: {})",
                            status.uptime_seconds, status.rounds.rounds_tracked
                        );
                    }
                    Err(e) => warn!("[health] failed to encode status: {e}"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerEndpoint, DetectionConf, PoolConf, RecorderConf, RouterConf, TopicsConf};
    use crate::pool::tests::FakeConnector;
    use crate::pool::BrokerPool;
    use crate::recorder::ReconciliationRecorder;

    fn transport(fake: Arc<FakeConnector>) -> Arc<TransportClient> {
        let endpoints = vec![BrokerEndpoint::new("a", 1883, 0), BrokerEndpoint::new("b", 1883, 1)];
        let conf = PoolConf {
            health_interval_ms: 1_000,
            failure_threshold: 2,
            backoff_base_ms: 10,
            backoff_max_ms: 20,
            ..PoolConf::default()
        };
        TransportClient::new(Arc::new(BrokerPool::new(endpoints, conf, fake).unwrap()))
    }

    #[test]
    fn test_tracker_states() {
        let tracker = StatusTracker::new("t1");
        assert_eq!(tracker.transport_state(), "connecting");
        tracker.mark_recovering();
        assert_eq!(tracker.transport_state(), "reconnecting");
        tracker.mark_connected();
        assert_eq!(tracker.transport_state(), "connected");
        assert_eq!(tracker.recoveries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_fails_over_when_active_dies() {
        let fake = FakeConnector::with_up(&["a:1883", "b:1883"]);
        let t = transport(fake.clone());
        t.subscribe("x").await.unwrap();
        t.connect_with_failover().await.unwrap();
        assert_eq!(t.active_endpoint().await.as_deref(), Some("a:1883"));

        let tracker = StatusTracker::new("t1");
        let loops = tracker.spawn_health_checks(t.clone());
        fake.set_up("a:1883", false);
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(t.active_endpoint().await.as_deref(), Some("b:1883"));
        assert_eq!(tracker.transport_state(), "connected");
        assert!(tracker.recoveries() >= 1);
        for l in loops {
            l.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_is_enqueued_at_low_priority() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeConnector::with_up(&["a:1883"]);
        let t = transport(fake);
        let router = Arc::new(MessageRouter::new(&RouterConf::default()));
        let recorder = Arc::new(ReconciliationRecorder::new(&RecorderConf {
            path: dir.path().join("r.log").to_string_lossy().into_owned(),
            ..RecorderConf::default()
        }));
        let coord = RoundCoordinator::new(router.clone(), recorder, DetectionConf::default(), TopicsConf::default());

        let tracker = StatusTracker::new("t1");
        let handle = tracker.spawn_status_publisher(t, coord, router.clone(), "status".into(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort();

        let msg = router.outbound().pop().unwrap();
        assert_eq!(msg.topic, "status");
        assert_eq!(msg.priority, Priority::Low);
        let body: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(body["table_id"], "t1");
        assert_eq!(body["connections"].as_array().unwrap().len(), 2);
    }
}

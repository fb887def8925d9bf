/**
 * TRANSPORT CLIENT - Handle pub/sub logique adossé au pool de brokers
 *
 * RÔLE :
 * Vue unique "un client MQTT" pour le reste du kernel, quelle que soit la
 * session réellement active.
 *
 * FONCTIONNEMENT :
 * - `connect_with_failover()` délègue au pool puis rejoue tous les abonnements
 * - la migration (connexion + réabonnements) se fait sous le verrou en
 *   écriture de `active` ; la boucle de réception prend ce verrou en lecture
 *   avant chaque dispatch, donc aucun message n'atteint les handlers avant que
 *   tous les abonnements soient rétablis sur le nouvel endpoint
 * - `disconnect()` libère tout, appel multiple sans effet
 */

use crate::error::TransportError;
use crate::link::InboundFrame;
use crate::outbound::{Priority, Publisher};
use crate::pool::{ActiveLink, BrokerPool};
use crate::router::MessageRouter;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INBOUND_CAPACITY: usize = 1024;

pub struct TransportClient {
    pool: Arc<BrokerPool>,
    active: RwLock<Option<ActiveLink>>,
    subscriptions: Mutex<Vec<String>>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundFrame>>>,
    closed: AtomicBool,
    failovers: AtomicU32,
}

impl TransportClient {
    pub fn new(pool: Arc<BrokerPool>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        Arc::new(Self {
            pool,
            active: RwLock::new(None),
            subscriptions: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            closed: AtomicBool::new(false),
            failovers: AtomicU32::new(0),
        })
    }

    pub fn pool(&self) -> &Arc<BrokerPool> {
        &self.pool
    }

    pub fn failovers(&self) -> u32 {
        self.failovers.load(Ordering::Relaxed)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub async fn active_endpoint(&self) -> Option<String> {
        self.active.read().await.as_ref().map(|a| a.label.clone())
    }

    pub async fn is_connected(&self) -> bool {
        self.active.read().await.as_ref().is_some_and(|a| a.link.is_alive())
    }

    pub async fn connect_with_failover(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let mut active = self.active.write().await;
        if active.as_ref().is_some_and(|a| a.link.is_alive()) {
            return Ok(());
        }

        let previous = active.take();
        if let Some(old) = &previous {
            warn!("[transport] session on {} lost, failing over", old.label);
            if let Some(dead) = self.pool.mark_failure(old.index, "session lost") {
                dead.disconnect().await;
            }
        }

        // un réabonnement raté compte comme un échec d'endpoint ; borné au nombre d'endpoints
        let mut last_err = TransportError::NotConnected;
        for _ in 0..self.pool.len().max(1) {
            let candidate = self.pool.connect(self.inbound_tx.clone()).await?;
            match self.restore_subscriptions(&candidate).await {
                Ok(count) => {
                    match &previous {
                        Some(old) if old.label != candidate.label => {
                            self.failovers.fetch_add(1, Ordering::Relaxed);
                            warn!("[transport] migrated {} -> {} ({count} subscriptions restored)", old.label, candidate.label);
                        }
                        _ => info!("[transport] connected to {} ({count} subscriptions restored)", candidate.label),
                    }
                    *active = Some(candidate);
                    return Ok(());
                }
                Err(e) => {
                    warn!("[transport] resubscribe on {} failed: {e}", candidate.label);
                    if let Some(dead) = self.pool.mark_failure(candidate.index, &e.to_string()) {
                        dead.disconnect().await;
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn restore_subscriptions(&self, candidate: &ActiveLink) -> Result<usize, TransportError> {
        let topics = self.subscriptions();
        for topic in &topics {
            candidate.link.subscribe(topic).await?;
        }
        Ok(topics.len())
    }

    /// Abonnement mémorisé et rejoué à chaque reconnexion ; idempotent
    pub async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        {
            let mut subs = self.subscriptions.lock();
            if subs.iter().any(|t| t == topic) {
                return Ok(());
            }
            subs.push(topic.to_string());
        }

        let active = self.active.read().await.clone();
        match active {
            Some(a) if a.link.is_alive() => {
                a.link.subscribe(topic).await?;
                info!("[transport] subscribed to {topic} on {}", a.label);
            }
            _ => debug!("[transport] subscription to {topic} deferred until connected"),
        }
        Ok(())
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>, priority: Priority) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let active = self.active.read().await.clone();
        let Some(active) = active.filter(|a| a.link.is_alive()) else {
            return Err(TransportError::NotConnected);
        };
        match active.link.publish(topic, payload, priority.qos()).await {
            Ok(()) => {
                self.pool.note_activity(active.index);
                Ok(())
            }
            Err(e) => {
                warn!("[transport] publish on {topic} via {} failed: {e}", active.label);
                Err(e)
            }
        }
    }

    /// Relance la connexion si la session active est morte
    pub async fn recover(&self) {
        if let Err(e) = self.connect_with_failover().await {
            warn!("[transport] failover failed: {e}");
        }
    }

    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let previous = self.active.write().await.take();
        if let Some(a) = previous {
            info!("[transport] disconnecting from {}", a.label);
        }
        self.pool.shutdown().await;
    }

    /// Boucle de réception : seul chemin de dispatch entrant
    pub fn spawn_receive_loop(self: &Arc<Self>, router: Arc<MessageRouter>) -> Option<JoinHandle<()>> {
        let mut rx = self.inbound_rx.lock().take()?;
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                // attend la fin d'une éventuelle migration en cours
                drop(this.active.read().await);
                if this.closed.load(Ordering::SeqCst) {
                    break;
                }
                router.handle_inbound(&frame.topic, &frame.payload);
            }
            debug!("[transport] receive loop stopped");
        }))
    }
}

#[async_trait]
impl Publisher for TransportClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, priority: Priority) -> Result<(), TransportError> {
        TransportClient::publish(self, topic, payload, priority).await
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.connect_with_failover().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerEndpoint, PoolConf, RouterConf};
    use crate::pool::tests::FakeConnector;

    fn transport(fake: Arc<FakeConnector>) -> Arc<TransportClient> {
        let endpoints = vec![BrokerEndpoint::new("a", 1883, 0), BrokerEndpoint::new("b", 1883, 1)];
        let conf = PoolConf { backoff_base_ms: 10, backoff_max_ms: 20, ..PoolConf::default() };
        TransportClient::new(Arc::new(BrokerPool::new(endpoints, conf, fake).unwrap()))
    }

    fn link_subscriptions(fake: &FakeConnector, label: &str) -> Vec<String> {
        fake.links
            .lock()
            .iter()
            .filter(|(l, link)| l == label && link.alive.load(Ordering::SeqCst))
            .flat_map(|(_, link)| link.subscriptions.lock().clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_replays_subscriptions_on_backup() {
        let fake = FakeConnector::with_up(&["b:1883"]);
        let t = transport(fake.clone());
        t.subscribe("croupier/idp/response@v1").await.unwrap();
        t.subscribe("croupier/idp/response@v1").await.unwrap();

        t.connect_with_failover().await.unwrap();
        assert_eq!(t.active_endpoint().await.as_deref(), Some("b:1883"));
        assert_eq!(link_subscriptions(&fake, "b:1883"), vec!["croupier/idp/response@v1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_migration_after_active_loss() {
        let fake = FakeConnector::with_up(&["a:1883"]);
        let t = transport(fake.clone());
        t.subscribe("x").await.unwrap();
        t.connect_with_failover().await.unwrap();
        t.subscribe("y").await.unwrap();

        fake.set_up("a:1883", false);
        fake.set_up("b:1883", true);
        assert!(!t.is_connected().await);
        t.connect_with_failover().await.unwrap();

        assert_eq!(t.active_endpoint().await.as_deref(), Some("b:1883"));
        assert_eq!(link_subscriptions(&fake, "b:1883"), vec!["x", "y"]);
        assert_eq!(t.failovers(), 1);
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_is_typed() {
        let fake = FakeConnector::with_up(&[]);
        let t = transport(fake);
        let err = t.publish("t", b"{}".to_vec(), Priority::Normal).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_to_caller() {
        let fake = FakeConnector::with_up(&[]);
        let t = transport(fake);
        let err = t.connect_with_failover().await.unwrap_err();
        assert!(matches!(err, TransportError::Exhausted { ref failures } if failures.len() == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let fake = FakeConnector::with_up(&["a:1883"]);
        let t = transport(fake);
        t.connect_with_failover().await.unwrap();
        t.disconnect().await;
        t.disconnect().await;
        assert!(!t.is_connected().await);
        assert!(matches!(t.connect_with_failover().await, Err(TransportError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_loop_dispatches_to_router() {
        let fake = FakeConnector::with_up(&["a:1883"]);
        let t = transport(fake);
        let router = Arc::new(MessageRouter::new(&RouterConf::default()));
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        router.register("t", "count", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let handle = t.spawn_receive_loop(router.clone()).unwrap();
        assert!(t.spawn_receive_loop(router).is_none());
        t.inbound_tx
            .send(InboundFrame { endpoint: "a:1883".into(), topic: "t".into(), payload: br#"{"ok":true}"#.to_vec() })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        handle.abort();
    }
}

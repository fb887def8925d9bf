/*!
Broker MQTT simulé, multi-endpoints, pour tester le kernel sans broker réel

Implémente `Connector` : chaque endpoint (`"host:port"`) peut être monté ou
coupé à chaud. Enregistre toutes les publications, abonnements et tentatives
de connexion, et livre les messages retenus à l'abonnement comme un vrai broker.
*/

use async_trait::async_trait;
use croupier_kernel::config::BrokerEndpoint;
use croupier_kernel::error::TransportError;
use croupier_kernel::link::{Connector, InboundFrame, Link};
use croupier_kernel::router::topic_matches;
use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub endpoint: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

struct MockLink {
    endpoint: String,
    alive: AtomicBool,
    subscriptions: Mutex<Vec<String>>,
    inbound: mpsc::Sender<InboundFrame>,
    state: Arc<BrokerState>,
}

impl MockLink {
    fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        if !self.is_alive() || !self.subscriptions.lock().iter().any(|f| topic_matches(f, topic)) {
            return false;
        }
        let frame = InboundFrame { endpoint: self.endpoint.clone(), topic: topic.to_string(), payload: payload.to_vec() };
        self.inbound.try_send(frame).is_ok()
    }
}

#[async_trait]
impl Link for MockLink {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::SubscribeRejected { topic: topic.to_string(), reason: "session closed".into() });
        }
        self.subscriptions.lock().push(topic.to_string());
        debug!("[mock] {} subscribed to {topic}", self.endpoint);

        let retained: Vec<(String, Vec<u8>)> = self
            .state
            .retained
            .lock()
            .get(&self.endpoint)
            .map(|topics| {
                topics
                    .iter()
                    .filter(|(t, _)| topic_matches(topic, t))
                    .map(|(t, p)| (t.clone(), p.clone()))
                    .collect()
            })
            .unwrap_or_default();
        for (t, payload) in retained {
            self.deliver(&t, &payload);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::NotConnected);
        }
        self.state.published.lock().push(MockMessage {
            endpoint: self.endpoint.clone(),
            topic: topic.to_string(),
            payload: payload.clone(),
            qos,
        });
        debug!("[mock] {} published to {topic}: {} bytes", self.endpoint, payload.len());
        self.state.route(&self.endpoint, topic, &payload);
        Ok(())
    }

    async fn disconnect(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct BrokerState {
    up: Mutex<HashSet<String>>,
    attempts: Mutex<HashMap<String, u32>>,
    sessions: Mutex<Vec<Arc<MockLink>>>,
    published: Mutex<Vec<MockMessage>>,
    retained: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl BrokerState {
    fn live_sessions(&self, endpoint: Option<&str>) -> Vec<Arc<MockLink>> {
        self.sessions
            .lock()
            .iter()
            .filter(|s| s.is_alive() && endpoint.map_or(true, |e| s.endpoint == e))
            .cloned()
            .collect()
    }

    fn route(&self, endpoint: &str, topic: &str, payload: &[u8]) -> usize {
        self.live_sessions(Some(endpoint))
            .iter()
            .filter(|s| s.deliver(topic, payload))
            .count()
    }
}

/// Broker simulé partagé entre le kernel (via `Connector`) et le test
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_up(labels: &[&str]) -> Self {
        let broker = Self::new();
        for label in labels {
            broker.set_up(label, true);
        }
        broker
    }

    /// Monte ou coupe un endpoint ; couper ferme ses sessions ouvertes
    pub fn set_up(&self, label: &str, up: bool) {
        if up {
            self.state.up.lock().insert(label.to_string());
            info!("[mock] endpoint {label} up");
        } else {
            self.state.up.lock().remove(label);
            for session in self.state.live_sessions(Some(label)) {
                session.alive.store(false, Ordering::SeqCst);
            }
            info!("[mock] endpoint {label} down");
        }
    }

    /// Message retenu, livré à chaque abonnement correspondant sur cet endpoint
    pub fn retain(&self, label: &str, topic: &str, payload: impl Into<Vec<u8>>) {
        self.state
            .retained
            .lock()
            .entry(label.to_string())
            .or_default()
            .insert(topic.to_string(), payload.into());
    }

    /// Simule un message publié par un tiers (le détecteur) ; renvoie le nombre de sessions livrées
    pub fn simulate_incoming(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        let delivered = self
            .state
            .live_sessions(None)
            .iter()
            .filter(|s| s.deliver(topic, &payload))
            .count();
        debug!("[mock] simulated incoming on {topic}, delivered to {delivered} sessions");
        delivered
    }

    pub fn simulate_json(&self, topic: &str, body: &Value) -> usize {
        self.simulate_incoming(topic, body.to_string())
    }

    pub fn connect_attempts(&self, label: &str) -> u32 {
        self.state.attempts.lock().get(label).copied().unwrap_or(0)
    }

    /// Abonnements des sessions vivantes d'un endpoint
    pub fn subscriptions(&self, label: &str) -> Vec<String> {
        self.state
            .live_sessions(Some(label))
            .iter()
            .flat_map(|s| s.subscriptions.lock().clone())
            .collect()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.state
            .published
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Payloads JSON publiés sur un topic, dans l'ordre
    pub fn json_messages(&self, topic: &str) -> Vec<Value> {
        self.find_messages_by_topic(topic)
            .iter()
            .filter_map(|m| serde_json::from_slice(&m.payload).ok())
            .collect()
    }
}

#[async_trait]
impl Connector for MockBroker {
    async fn open(
        &self,
        endpoint: &BrokerEndpoint,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let label = endpoint.label();
        *self.state.attempts.lock().entry(label.clone()).or_default() += 1;
        if !self.state.up.lock().contains(&label) {
            return Err(TransportError::ConnectionRefused { endpoint: label, reason: "connection refused".into() });
        }
        let link = Arc::new(MockLink {
            endpoint: label.clone(),
            alive: AtomicBool::new(true),
            subscriptions: Mutex::new(Vec::new()),
            inbound,
            state: self.state.clone(),
        });
        self.state.sessions.lock().push(link.clone());
        info!("[mock] session opened on {label}");
        Ok(link)
    }

    async fn probe(&self, endpoint: &BrokerEndpoint) -> Result<(), TransportError> {
        let label = endpoint.label();
        if self.state.up.lock().contains(&label) {
            Ok(())
        } else {
            Err(TransportError::ConnectionRefused { endpoint: label, reason: "connection refused".into() })
        }
    }
}

/// Messages du protocole de détection, côté détecteur
pub struct DetectorMessageBuilder;

impl DetectorMessageBuilder {
    pub fn result(round_id: &str, res: Value) -> Value {
        json!({"response": "result", "arg": {"round_id": round_id, "res": res, "err": 0}})
    }

    pub fn error(round_id: &str, err: i64) -> Value {
        json!({"response": "result", "arg": {"round_id": round_id, "res": null, "err": err}})
    }}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str) -> BrokerEndpoint {
        BrokerEndpoint::new(host, 1883, 0)
    }

    #[tokio::test]
    async fn test_down_endpoint_refuses_and_counts_attempts() {
        let broker = MockBroker::with_up(&["b:1883"]);
        let (tx, _rx) = mpsc::channel(8);
        assert!(broker.open(&endpoint("a"), tx.clone()).await.is_err());
        assert!(broker.open(&endpoint("b"), tx).await.is_ok());
        assert_eq!(broker.connect_attempts("a:1883"), 1);
        assert!(broker.probe(&endpoint("a")).await.is_err());
    }

    #[tokio::test]
    async fn test_retained_message_delivered_on_subscribe() {
        let broker = MockBroker::with_up(&["b:1883"]);
        broker.retain("b:1883", "croupier/idp/response@v1", DetectorMessageBuilder::result("R1", json!(5)).to_string());
        let (tx, mut rx) = mpsc::channel(8);
        let link = broker.open(&endpoint("b"), tx).await.unwrap();

        link.subscribe("croupier/+/response@v1").await.unwrap();
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.topic, "croupier/idp/response@v1");
        assert_eq!(broker.subscriptions("b:1883"), vec!["croupier/+/response@v1"]);
    }

    #[tokio::test]
    async fn test_taking_endpoint_down_kills_sessions() {
        let broker = MockBroker::with_up(&["a:1883"]);
        let (tx, _rx) = mpsc::channel(8);
        let link = broker.open(&endpoint("a"), tx).await.unwrap();
        link.publish("t", b"{}".to_vec(), QoS::AtLeastOnce).await.unwrap();

        broker.set_up("a:1883", false);
        assert!(!link.is_alive());
        assert!(link.publish("t", b"{}".to_vec(), QoS::AtLeastOnce).await.is_err());
        assert_eq!(broker.find_messages_by_topic("t").len(), 1);
    }
}

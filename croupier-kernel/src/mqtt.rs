use crate::config::{BrokerEndpoint, PoolConf};
use crate::error::TransportError;
use crate::link::{Connector, InboundFrame, Link};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Ouvre des sessions rumqttc ; une session = un `AsyncClient` + sa task d'event loop
pub struct MqttConnector {
    client_prefix: String,
    keep_alive: Duration,
    connect_timeout: Duration,
}

impl MqttConnector {
    pub fn new(table_id: &str, pool: &PoolConf) -> Self {
        Self {
            client_prefix: format!("croupier-{table_id}"),
            keep_alive: Duration::from_secs(pool.keep_alive_secs.max(5)),
            connect_timeout: pool.connect_timeout(),
        }
    }
}

fn refused(endpoint: &BrokerEndpoint, reason: impl Into<String>) -> TransportError {
    TransportError::ConnectionRefused { endpoint: endpoint.label(), reason: reason.into() }
}

/// Poll l'event loop jusqu'au CONNACK
async fn handshake(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("broker refused session: {:?}", ack.code))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

async fn pump_events(
    label: String,
    mut eventloop: EventLoop,
    inbound: mpsc::Sender<InboundFrame>,
    alive: Arc<AtomicBool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                let frame = InboundFrame { endpoint: label.clone(), topic: p.topic.clone(), payload: p.payload.to_vec() };
                if inbound.send(frame).await.is_err() {
                    debug!("[mqtt] {label} inbound channel closed, stopping event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                warn!("[mqtt] {label} sent DISCONNECT");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                // pas de reconnexion ici : le pool décide du failover
                warn!("[mqtt] {label} connection lost: {e}");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}

#[async_trait]
impl Connector for MqttConnector {
    async fn open(
        &self,
        endpoint: &BrokerEndpoint,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> Result<Arc<dyn Link>, TransportError> {
        let suffix = Uuid::new_v4().simple().to_string();
        let client_id = format!("{}-{}", self.client_prefix, &suffix[..8]);

        let mut opts = MqttOptions::new(client_id, &endpoint.broker, endpoint.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        if let Some(user) = &endpoint.username {
            opts.set_credentials(user, endpoint.password.as_deref().unwrap_or(""));
        }

        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        match tokio::time::timeout(self.connect_timeout, handshake(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(refused(endpoint, reason)),
            Err(_) => return Err(refused(endpoint, format!("no CONNACK within {:?}", self.connect_timeout))),
        }

        let label = endpoint.label();
        let alive = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(pump_events(label.clone(), eventloop, inbound, alive.clone()));
        info!("[mqtt] session open on {label}");

        Ok(Arc::new(MqttLink { label, client, alive, pump: Mutex::new(Some(pump)) }))
    }

    async fn probe(&self, endpoint: &BrokerEndpoint) -> Result<(), TransportError> {
        let addr = endpoint.label();
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(refused(endpoint, e.to_string())),
            Err(_) => Err(refused(endpoint, "probe timed out")),
        }
    }
}

pub struct MqttLink {
    label: String,
    client: AsyncClient,
    alive: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Link for MqttLink {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::SubscribeRejected { topic: topic.to_string(), reason: e.to_string() })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| TransportError::PublishRejected { topic: topic.to_string(), reason: e.to_string() })
    }

    async fn disconnect(&self) {
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        if was_alive {
            if let Err(e) = self.client.try_disconnect() {
                debug!("[mqtt] {} disconnect request failed: {e}", self.label);
            }
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

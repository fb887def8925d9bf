/**
 * LINK - Frontière entre le pool de brokers et un client MQTT concret
 *
 * RÔLE : `Connector` ouvre une session vers un endpoint, `Link` est la session
 * ouverte. Le kernel utilise rumqttc (voir `mqtt.rs`), le devkit un broker simulé.
 *
 * Chaque `Link` pousse ses messages entrants dans le canal `inbound` fourni à
 * l'ouverture ; c'est la seule voie d'entrée vers le routeur.
 */

use crate::config::BrokerEndpoint;
use crate::error::TransportError;
use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message brut reçu sur une session, avant décodage
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub endpoint: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Link: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError>;

    /// Ferme la session ; sans effet si déjà fermée
    async fn disconnect(&self);

    fn is_alive(&self) -> bool;
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(
        &self,
        endpoint: &BrokerEndpoint,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> Result<Arc<dyn Link>, TransportError>;

    /// Sonde légère d'un endpoint sans session ouverte (health check)
    async fn probe(&self, endpoint: &BrokerEndpoint) -> Result<(), TransportError>;
}

/**
 * ERREURS - Taxonomie des erreurs du kernel
 *
 * RÔLE : Erreurs typées exposées par le transport, le routeur et la config.
 * Les doublons de trigger ne sont PAS des erreurs (voir `TriggerOutcome`).
 */

use std::fmt;
use std::time::Duration;

/// Raison d'échec d'un endpoint lors d'une tentative de connexion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    pub endpoint: String,
    pub reason: String,
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.endpoint, self.reason)
    }
}

fn summarize(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("not connected to any broker")]
    NotConnected,
    #[error("connection to {endpoint} refused: {reason}")]
    ConnectionRefused { endpoint: String, reason: String },
    #[error("publish on '{topic}' rejected: {reason}")]
    PublishRejected { topic: String, reason: String },
    #[error("subscribe to '{topic}' rejected: {reason}")]
    SubscribeRejected { topic: String, reason: String },
    #[error("all broker endpoints exhausted: {}", summarize(.failures))]
    Exhausted { failures: Vec<EndpointFailure> },
}

/// Payload entrant illisible : toujours loggé et jeté, jamais propagé
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8")]
    Utf8,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no broker endpoint configured")]
    NoEndpoints,
    #[error("duplicate broker endpoint {0}")]
    DuplicateEndpoint(String),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("no correlated response for round {round_id} within {waited:?}")]
pub struct CorrelationTimeout {
    pub round_id: String,
    pub waited: Duration,
}

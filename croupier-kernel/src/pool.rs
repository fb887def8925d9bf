/**
 * BROKER POOL - Gestion des endpoints MQTT et sélection de la connexion active
 *
 * RÔLE :
 * Possède la liste ordonnée des brokers, ouvre les sessions, suit leur santé
 * et choisit la connexion active selon la politique configurée.
 *
 * FONCTIONNEMENT :
 * - `connect()` essaie les endpoints dans l'ordre de la politique, avec
 *   backoff exponentiel borné par endpoint, et s'arrête au premier succès
 * - la connexion active saine est toujours conservée (sticky)
 * - N health checks ratés d'affilée => Degraded, exclue jusqu'à une sonde OK
 * - épuisement total => `TransportError::Exhausted`, jamais avalé
 *
 * Égalité de priorité : départagée par l'ordre de la configuration (tri stable).
 */

use crate::config::{BrokerEndpoint, PoolConf};
use crate::error::{ConfigError, EndpointFailure, TransportError};
use crate::link::{Connector, InboundFrame, Link};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    Priority,
    RoundRobin,
    LeastActive,
    HealthScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

struct Connection {
    endpoint: BrokerEndpoint,
    state: ConnectionState,
    consecutive_failures: u32,
    last_success: Option<Instant>,
    last_health_check: Option<Instant>,
    /// Messages publiés via cette connexion (politique least_active)
    activity: u64,
    link: Option<Arc<dyn Link>>,
}

impl Connection {
    fn new(endpoint: BrokerEndpoint) -> Self {
        Self {
            endpoint,
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
            last_success: None,
            last_health_check: None,
            activity: 0,
            link: None,
        }
    }

    fn healthy(&self) -> bool {
        self.state == ConnectionState::Connected && self.link.as_ref().is_some_and(|l| l.is_alive())
    }

    fn health_score(&self) -> i64 {
        let mut score = 100 - 25 * i64::from(self.consecutive_failures.min(4));
        if self.state == ConnectionState::Connected {
            score += 10;
        }
        if self.last_success.is_none() {
            score -= 5;
        }
        score
    }

    fn set_state(&mut self, next: ConnectionState, reason: &str) {
        if self.state == next {
            return;
        }
        let label = self.endpoint.label();
        match next {
            ConnectionState::Degraded => warn!("[pool] {label} {:?} -> {:?} ({reason})", self.state, next),
            _ => info!("[pool] {label} {:?} -> {:?} ({reason})", self.state, next),
        }
        self.state = next;
    }
}

/// Vue figée d'une connexion, pour le statut kernel et les tests
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub endpoint: String,
    pub priority: u32,
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub active: bool,
    pub activity: u64,
    pub checked_secs_ago: Option<u64>,
}

/// Session active partagée par tous les publishers/subscribers
#[derive(Clone)]
pub struct ActiveLink {
    pub index: usize,
    pub label: String,
    pub link: Arc<dyn Link>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Recovered,
    Failed,
    Degraded,
    /// La session active est morte : le transport doit basculer
    ActiveLost,
}

struct PoolInner {
    connections: Vec<Connection>,
    active: Option<usize>,
    cursor: usize,
}

pub struct BrokerPool {
    connector: Arc<dyn Connector>,
    conf: PoolConf,
    inner: Mutex<PoolInner>,
    connecting: tokio::sync::Mutex<()>,
}

fn same_link(a: &Option<Arc<dyn Link>>, b: &Option<Arc<dyn Link>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl BrokerPool {
    pub fn new(
        mut endpoints: Vec<BrokerEndpoint>,
        conf: PoolConf,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        if endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        for (i, ep) in endpoints.iter().enumerate() {
            if endpoints[..i].iter().any(|other| other.label() == ep.label()) {
                return Err(ConfigError::DuplicateEndpoint(ep.label()));
            }
        }

        // tri stable : à priorité égale, l'ordre de la config fait foi
        endpoints.sort_by_key(|ep| ep.priority);
        for pair in endpoints.windows(2) {
            if pair[0].priority == pair[1].priority {
                warn!(
                    "[pool] {} and {} share priority {}, keeping configuration order",
                    pair[0].label(),
                    pair[1].label(),
                    pair[0].priority
                );
            }
        }

        info!(
            "[pool] {} endpoints, policy {:?}: {}",
            endpoints.len(),
            conf.policy,
            endpoints.iter().map(BrokerEndpoint::label).collect::<Vec<_>>().join(", ")
        );

        Ok(Self {
            connector,
            conf,
            inner: Mutex::new(PoolInner {
                connections: endpoints.into_iter().map(Connection::new).collect(),
                active: None,
                cursor: 0,
            }),
            connecting: tokio::sync::Mutex::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn health_interval(&self) -> Duration {
        self.conf.health_interval()
    }

    /// Labels des endpoints dans l'ordre de priorité effectif
    pub fn labels(&self) -> Vec<String> {
        self.inner.lock().connections.iter().map(|c| c.endpoint.label()).collect()
    }

    pub fn active_label(&self) -> Option<String> {
        let inner = self.inner.lock();
        inner.active.map(|i| inner.connections[i].endpoint.label())
    }

    fn current_healthy(&self) -> Option<ActiveLink> {
        let inner = self.inner.lock();
        let index = inner.active?;
        let conn = &inner.connections[index];
        if !conn.healthy() {
            return None;
        }
        conn.link.clone().map(|link| ActiveLink { index, label: conn.endpoint.label(), link })
    }

    /// Ordre de candidature selon la politique ; les Degraded passent en dernier recours.
    /// Le curseur round-robin n'avance que pour une vraie tentative de connexion.
    fn candidate_order(&self, advance: bool) -> Vec<usize> {
        let mut inner = self.inner.lock();
        let n = inner.connections.len();
        let mut order: Vec<usize> = (0..n).collect();
        match self.conf.policy {
            SelectionPolicy::Priority => {}
            SelectionPolicy::RoundRobin => {
                let start = inner.cursor % n;
                if advance {
                    inner.cursor = (start + 1) % n;
                }
                order.rotate_left(start);
            }
            SelectionPolicy::LeastActive => {
                order.sort_by_key(|&i| inner.connections[i].activity);
            }
            SelectionPolicy::HealthScore => {
                order.sort_by_key(|&i| Reverse(inner.connections[i].health_score()));
            }
        }
        order.sort_by_key(|&i| inner.connections[i].state == ConnectionState::Degraded);
        order
    }

    /// Connexion à utiliser : l'active si saine, sinon la première éligible selon la politique
    pub fn select_active(&self) -> Option<usize> {
        if let Some(active) = self.current_healthy() {
            return Some(active.index);
        }
        let order = self.candidate_order(false);
        let inner = self.inner.lock();
        order.into_iter().find(|&i| inner.connections[i].state != ConnectionState::Degraded)
    }

    pub async fn connect(&self, inbound: mpsc::Sender<InboundFrame>) -> Result<ActiveLink, TransportError> {
        let _guard = self.connecting.lock().await;
        if let Some(active) = self.current_healthy() {
            return Ok(active);
        }

        let mut failures = Vec::new();
        for index in self.candidate_order(true) {
            let endpoint = {
                let mut inner = self.inner.lock();
                let conn = &mut inner.connections[index];
                conn.set_state(ConnectionState::Connecting, "connect attempt");
                conn.endpoint.clone()
            };

            match self.open_with_backoff(&endpoint, &inbound).await {
                Ok(link) => {
                    let stale = self.install_active(index, link.clone());
                    for old in stale {
                        old.disconnect().await;
                    }
                    return Ok(ActiveLink { index, label: endpoint.label(), link });
                }
                Err(reason) => {
                    if let Some(old) = self.mark_failure(index, &reason) {
                        old.disconnect().await;
                    }
                    failures.push(EndpointFailure { endpoint: endpoint.label(), reason });
                }
            }
        }

        error!("[pool] all {} broker endpoints exhausted", failures.len());
        Err(TransportError::Exhausted { failures })
    }

    async fn open_with_backoff(
        &self,
        endpoint: &BrokerEndpoint,
        inbound: &mpsc::Sender<InboundFrame>,
    ) -> Result<Arc<dyn Link>, String> {
        let attempts = self.conf.max_retries.max(1);
        let mut last = String::from("no attempt made");
        for attempt in 0..attempts {
            match self.connector.open(endpoint, inbound.clone()).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    last = e.to_string();
                    debug!("[pool] {} attempt {}/{} failed: {last}", endpoint.label(), attempt + 1, attempts);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.conf.backoff(attempt)).await;
                    }
                }
            }
        }
        Err(last)
    }

    /// Installe la nouvelle session active ; renvoie les sessions remplacées à fermer
    fn install_active(&self, index: usize, link: Arc<dyn Link>) -> Vec<Arc<dyn Link>> {
        let mut inner = self.inner.lock();
        let mut stale = Vec::new();
        if let Some(previous) = inner.active.filter(|&p| p != index) {
            let prev = &mut inner.connections[previous];
            stale.extend(prev.link.take());
            prev.set_state(ConnectionState::Disconnected, "replaced by another endpoint");
        }
        let conn = &mut inner.connections[index];
        stale.extend(conn.link.replace(link));
        conn.consecutive_failures = 0;
        conn.last_success = Some(Instant::now());
        conn.set_state(ConnectionState::Connected, "session established");
        inner.active = Some(index);
        stale
    }

    /// Enregistre un échec ; renvoie la session retirée pour fermeture
    pub fn mark_failure(&self, index: usize, reason: &str) -> Option<Arc<dyn Link>> {
        let mut inner = self.inner.lock();
        if inner.active == Some(index) {
            inner.active = None;
        }
        let threshold = self.conf.failure_threshold;
        let conn = &mut inner.connections[index];
        conn.consecutive_failures += 1;
        let next = if conn.consecutive_failures >= threshold {
            ConnectionState::Degraded
        } else {
            ConnectionState::Disconnected
        };
        conn.set_state(next, reason);
        conn.link.take()
    }

    pub fn note_activity(&self, index: usize) {
        if let Some(conn) = self.inner.lock().connections.get_mut(index) {
            conn.activity += 1;
        }
    }

    /// Un health check d'une connexion : session vivante, ou sonde si pas de session
    pub async fn check_connection(&self, index: usize) -> ProbeOutcome {
        let (endpoint, link) = {
            let inner = self.inner.lock();
            let conn = &inner.connections[index];
            (conn.endpoint.clone(), conn.link.clone())
        };

        let result = match &link {
            Some(l) if l.is_alive() => Ok(()),
            Some(_) => Err("session closed".to_string()),
            None => self.connector.probe(&endpoint).await.map_err(|e| e.to_string()),
        };

        let threshold = self.conf.failure_threshold;
        let (outcome, dead) = {
            let mut inner = self.inner.lock();
            let is_active = inner.active == Some(index);
            let conn = &mut inner.connections[index];
            if !same_link(&link, &conn.link) {
                // la session a changé pendant la sonde, résultat obsolète
                return ProbeOutcome::Healthy;
            }
            conn.last_health_check = Some(Instant::now());

            match result {
                Ok(()) => {
                    conn.consecutive_failures = 0;
                    conn.last_success = Some(Instant::now());
                    if conn.state == ConnectionState::Degraded {
                        let next = if conn.link.is_some() {
                            ConnectionState::Connected
                        } else {
                            ConnectionState::Disconnected
                        };
                        conn.set_state(next, "health probe succeeded");
                        (ProbeOutcome::Recovered, None)
                    } else {
                        (ProbeOutcome::Healthy, None)
                    }
                }
                Err(reason) => {
                    conn.consecutive_failures += 1;
                    let dead = conn.link.take();
                    let degraded = conn.consecutive_failures >= threshold;
                    if degraded {
                        let why = format!("{} consecutive failed health checks: {reason}", conn.consecutive_failures);
                        conn.set_state(ConnectionState::Degraded, &why);
                    } else if dead.is_some() {
                        conn.set_state(ConnectionState::Disconnected, &reason);
                    } else {
                        debug!("[pool] {} probe failed ({}x): {reason}", endpoint.label(), conn.consecutive_failures);
                    }
                    let outcome = if dead.is_some() && is_active {
                        inner.active = None;
                        ProbeOutcome::ActiveLost
                    } else if degraded {
                        ProbeOutcome::Degraded
                    } else {
                        ProbeOutcome::Failed
                    };
                    (outcome, dead)
                }
            }
        };

        if let Some(dead) = dead {
            dead.disconnect().await;
        }
        outcome
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let inner = self.inner.lock();
        inner
            .connections
            .iter()
            .enumerate()
            .map(|(i, c)| ConnectionSnapshot {
                endpoint: c.endpoint.label(),
                priority: c.endpoint.priority,
                state: c.state,
                consecutive_failures: c.consecutive_failures,
                active: inner.active == Some(i),
                activity: c.activity,
                checked_secs_ago: c.last_health_check.map(|t| t.elapsed().as_secs()),
            })
            .collect()
    }

    /// Ferme toutes les sessions ; les connexions ne sont jetées qu'ici
    pub async fn shutdown(&self) {
        let links: Vec<Arc<dyn Link>> = {
            let mut inner = self.inner.lock();
            inner.active = None;
            inner
                .connections
                .iter_mut()
                .filter_map(|c| {
                    c.set_state(ConnectionState::Disconnected, "shutdown");
                    c.link.take()
                })
                .collect()
        };
        for link in links {
            link.disconnect().await;
        }
    }
}

/**
 * MESSAGE ROUTER - Décodage, historique et dispatch des messages MQTT
 *
 * RÔLE :
 * Point d'entrée unique des messages reçus et point de sortie des commandes.
 *
 * FONCTIONNEMENT :
 * - `handle_inbound` décode le JSON (payload invalide => loggé et jeté),
 *   l'ajoute à l'historique borné du topic, puis appelle chaque handler
 *   enregistré pour ce topic (ou un filtre `+`/`#`) dans l'ordre d'enregistrement
 * - un handler en erreur ou qui panique est loggé, les suivants sont appelés
 * - `find_correlated` relit l'historique du plus récent au plus ancien, pour
 *   retrouver une réponse arrivée avant que le demandeur ne commence à attendre
 * - `enqueue` dépose une commande dans la file à priorité (voir `outbound.rs`)
 */

use crate::config::RouterConf;
use crate::error::DecodeError;
use crate::outbound::{spawn_sender, Admission, OutboundMessage, OutboundQueue, Publisher};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Message reçu et décodé ; conservé uniquement pour la corrélation
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub topic: String,
    pub payload: Value,
    pub received_at: Instant,
}

pub type Handler = Arc<dyn Fn(&InboundRecord) -> anyhow::Result<()> + Send + Sync>;

struct Registration {
    filter: String,
    name: String,
    handler: Handler,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RouterStats {
    pub received: u64,
    pub malformed: u64,
    pub handler_failures: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    malformed: AtomicU64,
    handler_failures: AtomicU64,
}

pub struct MessageRouter {
    handlers: RwLock<Vec<Registration>>,
    history: Mutex<HashMap<String, VecDeque<InboundRecord>>>,
    history_capacity: usize,
    history_ttl: Duration,
    outbound: Arc<OutboundQueue>,
    send_retry: Duration,
    max_send_attempts: u32,
    counters: Counters,
}

/// Filtre MQTT : `+` = un niveau, `#` = tous les niveaux restants
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn decode_payload(raw: &[u8]) -> Result<Value, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::Utf8)?;
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    Ok(value)
}

impl MessageRouter {
    pub fn new(conf: &RouterConf) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            history_capacity: conf.history_capacity.max(1),
            history_ttl: conf.history_ttl(),
            outbound: Arc::new(OutboundQueue::new(conf.queue_capacity)),
            send_retry: Duration::from_millis(conf.send_retry_ms),
            max_send_attempts: conf.max_send_attempts.max(1),
            counters: Counters::default(),
        }
    }

    pub fn history_ttl(&self) -> Duration {
        self.history_ttl
    }

    pub fn register<F>(&self, filter: &str, name: &str, handler: F)
    where
        F: Fn(&InboundRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        debug!("[router] handler '{name}' registered on {filter}");
        self.handlers.write().push(Registration {
            filter: filter.to_string(),
            name: name.to_string(),
            handler: Arc::new(handler),
        });
    }

    /// Traite un message reçu ; renvoie le nombre de handlers appelés
    pub fn handle_inbound(&self, topic: &str, raw: &[u8]) -> usize {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let payload = match decode_payload(raw) {
            Ok(payload) => payload,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("[router] dropping malformed message on {topic}: {e}");
                return 0;
            }
        };

        let record = InboundRecord { topic: topic.to_string(), payload, received_at: Instant::now() };
        self.remember(record.clone());

        // copie des handlers : aucun verrou tenu pendant l'appel
        let matching: Vec<(String, Handler)> = self
            .handlers
            .read()
            .iter()
            .filter(|r| topic_matches(&r.filter, topic))
            .map(|r| (r.name.clone(), r.handler.clone()))
            .collect();

        if matching.is_empty() {
            debug!("[router] no handler for {topic}");
        }

        for (name, handler) in &matching {
            match catch_unwind(AssertUnwindSafe(|| handler(&record))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("[router] handler '{name}' failed on {topic}: {e:#}");
                }
                Err(_) => {
                    self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!("[router] handler '{name}' panicked on {topic}");
                }
            }
        }
        matching.len()
    }

    fn remember(&self, record: InboundRecord) {
        let mut history = self.history.lock();
        let ring = history.entry(record.topic.clone()).or_default();
        while ring.len() >= self.history_capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Cherche dans l'historique (plus récent d'abord) un message reçu depuis moins de `within`
    pub fn find_correlated<P>(&self, topic: &str, predicate: P, within: Duration) -> Option<InboundRecord>
    where
        P: Fn(&Value) -> bool,
    {
        let history = self.history.lock();
        let ring = history.get(topic)?;
        ring.iter()
            .rev()
            .take_while(|r| r.received_at.elapsed() <= within)
            .find(|r| predicate(&r.payload))
            .cloned()
    }

    pub fn history_len(&self, topic: &str) -> usize {
        self.history.lock().get(topic).map_or(0, VecDeque::len)
    }

    pub fn enqueue(&self, msg: OutboundMessage) -> Admission {
        self.outbound.push(msg)
    }

    pub fn outbound(&self) -> &Arc<OutboundQueue> {
        &self.outbound
    }

    pub fn spawn_sender(&self, publisher: Arc<dyn Publisher>) -> JoinHandle<()> {
        spawn_sender(self.outbound.clone(), publisher, self.send_retry, self.max_send_attempts)
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            received: self.counters.received.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::Priority;

    fn router() -> MessageRouter {
        MessageRouter::new(&RouterConf { history_capacity: 3, ..RouterConf::default() })
    }

    #[test]
    fn test_topic_filters() {
        assert!(topic_matches("croupier/idp/response@v1", "croupier/idp/response@v1"));
        assert!(topic_matches("croupier/+/response@v1", "croupier/idp/response@v1"));
        assert!(topic_matches("croupier/#", "croupier/idp/response@v1"));
        assert!(!topic_matches("croupier/+", "croupier/idp/response@v1"));
        assert!(!topic_matches("croupier/idp/command@v1", "croupier/idp/response@v1"));
    }

    #[test]
    fn test_malformed_payloads_are_dropped() {
        let r = router();
        let calls = Arc::new(AtomicU64::new(0));
        let c = calls.clone();
        r.register("t", "count", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(r.handle_inbound("t", b"{not json"), 0);
        assert_eq!(r.handle_inbound("t", &[0xff, 0xfe]), 0);
        assert_eq!(r.handle_inbound("t", b"[1,2,3]"), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(r.stats().malformed, 3);
        assert_eq!(r.history_len("t"), 0);
    }

    #[test]
    fn test_handlers_run_in_registration_order_despite_failures() {
        let r = router();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        r.register("t", "first", move |_| {
            o.lock().push("first");
            anyhow::bail!("boom")
        });
        r.register("t", "second", |_| panic!("handler crash"));
        let o = order.clone();
        r.register("#", "third", move |_| {
            o.lock().push("third");
            Ok(())
        });
        let o = order.clone();
        r.register("other", "unrelated", move |_| {
            o.lock().push("unrelated");
            Ok(())
        });

        assert_eq!(r.handle_inbound("t", br#"{"k":1}"#), 3);
        assert_eq!(*order.lock(), vec!["first", "third"]);
        assert_eq!(r.stats().handler_failures, 2);
    }

    #[test]
    fn test_history_is_bounded_per_topic() {
        let r = router();
        for i in 0..5 {
            r.handle_inbound("t", format!(r#"{{"n":{i}}}"#).as_bytes());
        }
        r.handle_inbound("u", br#"{"n":99}"#);
        assert_eq!(r.history_len("t"), 3);
        assert_eq!(r.history_len("u"), 1);

        let oldest = r.find_correlated("t", |p| p["n"] == 2, Duration::from_secs(1));
        assert!(oldest.is_some());
        let evicted = r.find_correlated("t", |p| p["n"] == 1, Duration::from_secs(1));
        assert!(evicted.is_none());
    }

    #[test]
    fn test_find_correlated_prefers_most_recent() {
        let r = router();
        r.handle_inbound("t", br#"{"round_id":"R1","v":1}"#);
        r.handle_inbound("t", br#"{"round_id":"R1","v":2}"#);
        let found = r.find_correlated("t", |p| p["round_id"] == "R1", Duration::from_secs(5)).unwrap();
        assert_eq!(found.payload["v"], 2);
    }

    #[tokio::test]
    async fn test_early_response_found_within_ttl() {
        let r = router();
        r.handle_inbound("t", br#"{"round_id":"R7"}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let hit = r.find_correlated("t", |p| p["round_id"] == "R7", Duration::from_secs(30));
        assert!(hit.is_some());
        let expired = r.find_correlated("t", |p| p["round_id"] == "R7", Duration::from_millis(10));
        assert!(expired.is_none());
    }

    #[test]
    fn test_enqueue_goes_to_outbound_queue() {
        let r = router();
        r.enqueue(OutboundMessage::new("cmd", b"{}".to_vec(), Priority::High));
        assert_eq!(r.outbound().pending(), vec![("cmd".to_string(), Priority::High)]);
    }
}

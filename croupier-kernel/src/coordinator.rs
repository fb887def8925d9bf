/**
 * ROUND COORDINATOR - Une détection par manche, corrélée par round_id
 *
 * RÔLE :
 * Consomme les événements trigger/settle/résultat matériel, publie la commande
 * de détection, corrèle la réponse asynchrone et envoie la commande d'arrêt.
 *
 * FONCTIONNEMENT :
 * - `on_trigger` : sous le mutex de la manche, `detection_claimed` passe de
 *   false à true une seule fois ; un timer annulable lance la détection après
 *   le délai de stabilisation
 * - `fire_detection` : sous le même mutex, annulé si un settle est passé ;
 *   sinon enregistre l'attente one-shot PUIS publie la commande
 * - la réponse arrive par le routeur (`on_result`), ou est retrouvée dans
 *   l'historique si elle a précédé l'attente ; sinon timeout borné
 * - `resolve` : résultat figé, stop envoyé une seule fois (priorité haute),
 *   valeur transmise au recorder, manche close
 * - `on_settle` avant la détection : le recorder note qu'aucune détection n'a été demandée
 *
 * VERROUS :
 * `fire_detection` prend le mutex de manche puis la table des attentes ;
 * `on_result` ne prend jamais le mutex de manche en tenant la table.
 */

use crate::config::{DetectionConf, TopicsConf};
use crate::error::CorrelationTimeout;
use crate::outbound::{Admission, OutboundMessage, Priority};
use crate::protocol::{classify, DetectionResponse, DetectorCommand, DetectorOutcome};
use crate::recorder::{normalize, ReconciliationRecorder};
use crate::round::{RoundRegistry, RoundSnapshot, RoundState};
use crate::router::MessageRouter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Scheduled,
    /// Trigger répété : aucun effet
    Duplicate,
    AlreadyClosed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Détection pas encore partie : annulée, aucune commande publiée
    CancelledPending,
    /// Commande déjà publiée : seul le rapport local est supprimé
    CancelledInFlight,
    /// Manche inconnue : créée directement en Cancelled
    CancelledUnknown,
    AlreadyResolved,
    AlreadyClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDisposition {
    Delivered,
    /// Arrivée avant l'attente : gardée dans l'historique du routeur
    Early,
    Late,
    UnknownRound,
    NotTriggered,
    NotAResult,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionReport {
    pub round_id: String,
    pub outcome: DetectorOutcome,
    pub hardware: Option<i64>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CoordinatorStats {
    pub rounds_tracked: usize,
    pub triggers: u64,
    pub duplicate_triggers: u64,
    pub detections_requested: u64,
    pub stops_sent: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub late_results: u64,
}

#[derive(Default)]
struct Counters {
    triggers: AtomicU64,
    duplicate_triggers: AtomicU64,
    detections_requested: AtomicU64,
    stops_sent: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
    late_results: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct RoundCoordinator {
    registry: RoundRegistry,
    router: Arc<MessageRouter>,
    recorder: Arc<ReconciliationRecorder>,
    conf: DetectionConf,
    topics: TopicsConf,
    waiters: Mutex<HashMap<String, oneshot::Sender<DetectorOutcome>>>,
    reports: Mutex<Option<mpsc::UnboundedSender<DetectionReport>>>,
    counters: Counters,
}

impl RoundCoordinator {
    pub fn new(
        router: Arc<MessageRouter>,
        recorder: Arc<ReconciliationRecorder>,
        conf: DetectionConf,
        topics: TopicsConf,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: RoundRegistry::new(conf.closed_rounds_memory),
            router,
            recorder,
            conf,
            topics,
            waiters: Mutex::new(HashMap::new()),
            reports: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    /// Branche le handler de réponse du détecteur sur le routeur
    pub fn install(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.router.register(&self.topics.response, "round-coordinator", move |record| {
            let Some(this) = weak.upgrade() else {
                return Ok(());
            };
            match this.on_result(&record.payload) {
                ResultDisposition::Malformed => anyhow::bail!("undecodable detection response"),
                _ => Ok(()),
            }
        });
    }

    /// Reçoit un `DetectionReport` par manche résolue (hors manches annulées)
    pub fn attach_reports(&self) -> mpsc::UnboundedReceiver<DetectionReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.reports.lock() = Some(tx);
        rx
    }

    pub fn open_round(&self, round_id: &str) -> bool {
        match self.registry.get_or_create(round_id) {
            Some(_) => true,
            None => {
                info!("[coordinator] round {round_id} already closed, not reopened");
                false
            }
        }
    }

    pub fn on_trigger(self: &Arc<Self>, round_id: &str) -> TriggerOutcome {
        bump(&self.counters.triggers);
        let Some(handle) = self.registry.get_or_create(round_id) else {
            info!("[coordinator] trigger for closed round {round_id} ignored");
            return TriggerOutcome::AlreadyClosed;
        };

        let mut round = handle.lock();
        if round.state == RoundState::Cancelled {
            info!("[coordinator] trigger for cancelled round {round_id} ignored");
            return TriggerOutcome::Cancelled;
        }
        if round.detection_claimed {
            bump(&self.counters.duplicate_triggers);
            info!("[coordinator] duplicate trigger for round {round_id} suppressed ({:?})", round.state);
            return TriggerOutcome::Duplicate;
        }

        round.detection_claimed = true;
        round.transition(RoundState::DetectionScheduled, "trigger");

        let this = Arc::clone(self);
        let id = round_id.to_string();
        let delay = self.conf.settle_delay();
        round.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire_detection(&id).await;
        }));
        debug!("[coordinator] detection for round {round_id} scheduled in {delay:?}");
        TriggerOutcome::Scheduled
    }

    fn is_result_for(payload: &Value, round_id: &str) -> bool {
        payload.get("response").and_then(Value::as_str) == Some("result")
            && crate::protocol::response_round_id(payload) == Some(round_id)
    }

    fn decode_result(&self, payload: &Value) -> Option<(String, DetectorOutcome)> {
        let resp: DetectionResponse = serde_json::from_value(payload.clone()).ok()?;
        if !resp.is_result() {
            return None;
        }
        let outcome = classify(&resp.arg, self.conf.min_outcome, self.conf.max_outcome);
        Some((resp.arg.round_id, outcome))
    }

    async fn fire_detection(self: Arc<Self>, round_id: &str) {
        let Some(handle) = self.registry.get(round_id) else {
            return;
        };

        let rx = {
            let mut round = handle.lock();
            if round.detection_cancelled || round.state != RoundState::DetectionScheduled {
                debug!("[coordinator] detection for round {round_id} no longer wanted ({:?})", round.state);
                return;
            }

            let (tx, rx) = oneshot::channel();
            self.waiters.lock().insert(round_id.to_string(), tx);

            let cmd = DetectorCommand::detect(round_id, &self.conf.input, &self.conf.output_for(round_id));
            let admitted = match OutboundMessage::json(&self.topics.command, &cmd, Priority::Normal) {
                Ok(msg) => self.router.enqueue(msg) != Admission::Refused,
                Err(e) => {
                    warn!("[coordinator] cannot encode detect command for round {round_id}: {e}");
                    false
                }
            };
            round.timer.take();

            if !admitted {
                self.waiters.lock().remove(round_id);
                warn!("[coordinator] detect command for round {round_id} not queued, resolving as no detection");
                round.transition(RoundState::DetectionInFlight, "detect command dropped");
                None
            } else {
                round.detect_published = true;
                bump(&self.counters.detections_requested);
                round.transition(RoundState::DetectionInFlight, "detect command enqueued");
                Some(rx)
            }
        };

        let Some(mut rx) = rx else {
            self.resolve(round_id, DetectorOutcome::NoDetection { err: None });
            return;
        };

        // réponse arrivée avant le début de l'attente
        let early = self.router.find_correlated(
            &self.topics.response,
            |p| Self::is_result_for(p, round_id),
            self.router.history_ttl(),
        );
        let outcome = match early.and_then(|record| self.decode_result(&record.payload)) {
            Some((_, outcome)) => {
                debug!("[coordinator] round {round_id} resolved from history");
                self.waiters.lock().remove(round_id);
                outcome
            }
            None => {
                let waited = self.conf.result_timeout();
                match tokio::time::timeout(waited, &mut rx).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => {
                        debug!("[coordinator] wait for round {round_id} abandoned");
                        DetectorOutcome::TimedOut
                    }
                    Err(_) => self.expire_wait(round_id, &mut rx, waited),
                }
            }
        };
        self.resolve(round_id, outcome);
    }

    /// Fin de l'attente ; un résultat livré entre l'expiration et le retrait de l'attente est gardé
    fn expire_wait(
        &self,
        round_id: &str,
        rx: &mut oneshot::Receiver<DetectorOutcome>,
        waited: std::time::Duration,
    ) -> DetectorOutcome {
        self.waiters.lock().remove(round_id);
        if let Ok(outcome) = rx.try_recv() {
            debug!("[coordinator] result for round {round_id} delivered as the wait expired");
            return outcome;
        }
        bump(&self.counters.timeouts);
        warn!("[coordinator] {}", CorrelationTimeout { round_id: round_id.to_string(), waited });
        DetectorOutcome::TimedOut
    }

    fn resolve(&self, round_id: &str, outcome: DetectorOutcome) {
        let Some(handle) = self.registry.get(round_id) else {
            return;
        };
        let (cancelled, hardware) = {
            let mut round = handle.lock();
            let next = match outcome {
                DetectorOutcome::TimedOut => RoundState::TimedOut,
                _ => RoundState::ResultReceived,
            };
            round.transition(next, &format!("detector: {outcome}"));
            round.detector_result = Some(outcome.clone());
            (round.detection_cancelled, round.hardware_result)
        };

        self.issue_stop(round_id);
        self.recorder.record_detector(round_id, &outcome.as_value());
        handle.lock().transition(RoundState::Closed, "detector result recorded");

        if cancelled {
            info!("[coordinator] round {round_id} was settled during detection, report suppressed");
            return;
        }
        if let Some(tx) = self.reports.lock().as_ref() {
            let report = DetectionReport { round_id: round_id.to_string(), outcome, hardware };
            if tx.send(report).is_err() {
                debug!("[coordinator] report receiver dropped");
            }
        }
    }

    /// Commande d'arrêt, au plus une fois par manche et seulement après un detect publié
    pub fn issue_stop(&self, round_id: &str) -> bool {
        let Some(handle) = self.registry.get(round_id) else {
            return false;
        };
        let mut round = handle.lock();
        if round.stop_sent {
            debug!("[coordinator] stop for round {round_id} already sent");
            return false;
        }
        if !round.detect_published {
            return false;
        }

        let msg = match OutboundMessage::json(&self.topics.command, &DetectorCommand::stop(), Priority::High) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[coordinator] cannot encode stop command: {e}");
                return false;
            }
        };
        if self.router.enqueue(msg) == Admission::Refused {
            warn!("[coordinator] stop command for round {round_id} refused by outbound queue");
            return false;
        }
        round.stop_sent = true;
        bump(&self.counters.stops_sent);
        if matches!(round.state, RoundState::ResultReceived | RoundState::TimedOut) {
            round.transition(RoundState::StopSent, "stop command enqueued");
        } else {
            info!("[coordinator] stop command enqueued for round {round_id} ({:?})", round.state);
        }
        true
    }

    pub fn on_settle(&self, round_id: &str) -> SettleOutcome {
        let handle = match self.registry.get(round_id) {
            Some(handle) => handle,
            None => {
                let Some(handle) = self.registry.get_or_create(round_id) else {
                    debug!("[coordinator] settle for closed round {round_id}");
                    return SettleOutcome::AlreadyClosed;
                };
                let mut round = handle.lock();
                if round.state.is_pending() && !round.detection_claimed {
                    round.detection_cancelled = true;
                    round.transition(RoundState::Cancelled, "settle for unseen round");
                    bump(&self.counters.cancelled);
                    drop(round);
                    self.recorder.record_not_requested(round_id);
                    return SettleOutcome::CancelledUnknown;
                }
                drop(round);
                handle
            }
        };

        let mut round = handle.lock();
        if round.state.is_pending() {
            if let Some(timer) = round.timer.take() {
                timer.abort();
            }
            round.detection_cancelled = true;
            round.transition(RoundState::Cancelled, "settle before detection");
            bump(&self.counters.cancelled);
            info!("[coordinator] no detection requested for round {round_id}");
            drop(round);
            self.recorder.record_not_requested(round_id);
            return SettleOutcome::CancelledPending;
        }
        if round.state == RoundState::DetectionInFlight {
            round.detection_cancelled = true;
            bump(&self.counters.cancelled);
            info!("[coordinator] round {round_id} settled while detection in flight");
            return SettleOutcome::CancelledInFlight;
        }
        debug!("[coordinator] settle for round {round_id} in {:?}", round.state);
        SettleOutcome::AlreadyResolved
    }

    pub fn on_result(&self, payload: &Value) -> ResultDisposition {
        let resp: DetectionResponse = match serde_json::from_value(payload.clone()) {
            Ok(resp) => resp,
            Err(e) => {
                warn!("[coordinator] undecodable detection response: {e}");
                return ResultDisposition::Malformed;
            }
        };
        if !resp.is_result() {
            debug!("[coordinator] ignoring '{}' response", resp.response);
            return ResultDisposition::NotAResult;
        }

        let round_id = resp.arg.round_id.as_str();
        let Some(handle) = self.registry.get(round_id) else {
            info!("[coordinator] result for unknown round {round_id} ignored");
            return ResultDisposition::UnknownRound;
        };

        let waiter = self.waiters.lock().remove(round_id);
        if let Some(tx) = waiter {
            let outcome = classify(&resp.arg, self.conf.min_outcome, self.conf.max_outcome);
            info!("[coordinator] result for round {round_id}: {outcome}");
            if tx.send(outcome).is_err() {
                debug!("[coordinator] waiter for round {round_id} already gone");
            }
            return ResultDisposition::Delivered;
        }

        let (state, claimed, published) = {
            let round = handle.lock();
            (round.state, round.detection_claimed, round.detect_published)
        };
        if !claimed {
            info!("[coordinator] result for round {round_id} which was never triggered ignored");
            return ResultDisposition::NotTriggered;
        }
        if !published {
            debug!("[coordinator] result for round {round_id} arrived before the wait ({state:?})");
            return ResultDisposition::Early;
        }

        bump(&self.counters.late_results);
        let outcome = classify(&resp.arg, self.conf.min_outcome, self.conf.max_outcome);
        warn!("[coordinator] late result for round {round_id} ({state:?}): {outcome}");
        if self.issue_stop(round_id) {
            info!("[coordinator] stop sent for round {round_id} after late result");
        }
        ResultDisposition::Late
    }

    /// Résultat officiel de la roue : stocké sur la manche et transmis au recorder
    pub fn on_hardware_result(&self, round_id: &str, value: &Value) {
        let normalized = normalize(value);
        if let Some(handle) = self.registry.get(round_id) {
            let mut round = handle.lock();
            round.hardware_result = normalized;
            debug!("[coordinator] hardware result for round {round_id}: {normalized:?}");
        }
        self.recorder.record_hardware(round_id, value);
    }

    /// Évince les manches closes et celles inactives depuis trop longtemps
    pub fn sweep(&self) -> usize {
        let stale = self.registry.stale(self.conf.round_idle_timeout());
        for round_id in &stale {
            self.waiters.lock().remove(round_id);
            self.registry.evict(round_id);
        }
        if !stale.is_empty() {
            debug!("[coordinator] janitor evicted {} rounds", stale.len());
        }
        stale.len()
    }

    pub fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = std::time::Duration::from_secs(self.conf.janitor_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.sweep();
            }
        })
    }

    pub fn snapshot(&self, round_id: &str) -> Option<RoundSnapshot> {
        self.registry.get(round_id).map(|h| h.lock().snapshot())
    }

    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.counters;
        CoordinatorStats {
            rounds_tracked: self.registry.len(),
            triggers: c.triggers.load(Ordering::Relaxed),
            duplicate_triggers: c.duplicate_triggers.load(Ordering::Relaxed),
            detections_requested: c.detections_requested.load(Ordering::Relaxed),
            stops_sent: c.stops_sent.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            late_results: c.late_results.load(Ordering::Relaxed),
        }
    }

    /// Annule les détections programmées et libère les attentes
    pub fn shutdown(&self) {
        for handle in self.registry.handles() {
            let mut round = handle.lock();
            if round.state.is_pending() {
                if let Some(timer) = round.timer.take() {
                    timer.abort();
                }
            }
        }
        let dropped = std::mem::take(&mut *self.waiters.lock());
        if !dropped.is_empty() {
            info!("[coordinator] {} detections abandoned on shutdown", dropped.len());
        }
    }
}

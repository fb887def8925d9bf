/**
 * ROUNDS - État par manche et registre indexé par round_id
 *
 * RÔLE : Chaque manche a son propre mutex ; deux manches différentes ne se
 * bloquent jamais. Le registre garde aussi la mémoire (bornée) des manches
 * déjà closes pour qu'un trigger tardif ne relance pas de détection.
 */

use crate::protocol::DetectorOutcome;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Created,
    AwaitingTrigger,
    DetectionScheduled,
    DetectionInFlight,
    ResultReceived,
    TimedOut,
    StopSent,
    Cancelled,
    Closed,
}

impl RoundState {
    /// Détection pas encore partie : un settle peut encore l'annuler
    pub fn is_pending(self) -> bool {
        matches!(self, RoundState::Created | RoundState::AwaitingTrigger | RoundState::DetectionScheduled)
    }
}

#[derive(Debug)]
pub struct Round {
    pub round_id: String,
    pub created_at: Instant,
    pub state: RoundState,
    pub detection_claimed: bool,
    pub detection_cancelled: bool,
    pub detect_published: bool,
    pub stop_sent: bool,
    pub hardware_result: Option<i64>,
    pub detector_result: Option<DetectorOutcome>,
    pub(crate) timer: Option<JoinHandle<()>>,
    last_activity: Instant,
}

impl Round {
    fn new(round_id: &str) -> Self {
        let now = Instant::now();
        Self {
            round_id: round_id.to_string(),
            created_at: now,
            state: RoundState::Created,
            detection_claimed: false,
            detection_cancelled: false,
            detect_published: false,
            stop_sent: false,
            hardware_result: None,
            detector_result: None,
            timer: None,
            last_activity: now,
        }
    }

    pub fn transition(&mut self, next: RoundState, reason: &str) {
        if self.state != next {
            info!("[coordinator] round {} {:?} -> {:?} ({reason})", self.round_id, self.state, next);
            self.state = next;
        }
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            round_id: self.round_id.clone(),
            state: self.state,
            detection_claimed: self.detection_claimed,
            detection_cancelled: self.detection_cancelled,
            detect_published: self.detect_published,
            stop_sent: self.stop_sent,
            hardware_result: self.hardware_result,
            detector_result: self.detector_result.clone(),
            age_ms: self.created_at.elapsed().as_millis() as u64,
        }
    }
}

/// Copie immuable d'une manche ; jamais de référence vivante hors du coordinateur
#[derive(Debug, Clone, Serialize)]
pub struct RoundSnapshot {
    pub round_id: String,
    pub state: RoundState,
    pub detection_claimed: bool,
    pub detection_cancelled: bool,
    pub detect_published: bool,
    pub stop_sent: bool,
    pub hardware_result: Option<i64>,
    pub detector_result: Option<DetectorOutcome>,
    pub age_ms: u64,
}

pub type RoundHandle = Arc<Mutex<Round>>;

pub struct RoundRegistry {
    rounds: Mutex<HashMap<String, RoundHandle>>,
    closed: Mutex<VecDeque<String>>,
    closed_capacity: usize,
}

impl RoundRegistry {
    pub fn new(closed_capacity: usize) -> Self {
        Self {
            rounds: Mutex::new(HashMap::new()),
            closed: Mutex::new(VecDeque::new()),
            closed_capacity: closed_capacity.max(1),
        }
    }

    pub fn get(&self, round_id: &str) -> Option<RoundHandle> {
        self.rounds.lock().get(round_id).cloned()
    }

    pub fn is_closed(&self, round_id: &str) -> bool {
        self.closed.lock().iter().any(|id| id == round_id)
    }

    /// Manche existante ou nouvelle (en AwaitingTrigger) ; `None` si déjà close
    pub fn get_or_create(&self, round_id: &str) -> Option<RoundHandle> {
        if self.is_closed(round_id) {
            return None;
        }
        let mut rounds = self.rounds.lock();
        let handle = rounds.entry(round_id.to_string()).or_insert_with(|| {
            let mut round = Round::new(round_id);
            round.transition(RoundState::AwaitingTrigger, "round opened");
            Arc::new(Mutex::new(round))
        });
        Some(handle.clone())
    }

    pub fn len(&self) -> usize {
        self.rounds.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retire la manche et mémorise son id comme close
    pub fn evict(&self, round_id: &str) -> Option<RoundHandle> {
        let removed = self.rounds.lock().remove(round_id);
        if let Some(handle) = &removed {
            if let Some(timer) = handle.lock().timer.take() {
                timer.abort();
            }
            let mut closed = self.closed.lock();
            if closed.len() >= self.closed_capacity {
                closed.pop_front();
            }
            closed.push_back(round_id.to_string());
            debug!("[coordinator] round {round_id} evicted");
        }
        removed
    }

    /// Ids des manches à évincer : closes, ou inactives depuis plus de `idle`
    pub fn stale(&self, idle: Duration) -> Vec<String> {
        let rounds = self.rounds.lock();
        rounds
            .iter()
            .filter_map(|(id, handle)| {
                // une manche verrouillée est en cours de traitement, pas inactive
                let round = handle.try_lock()?;
                (round.state == RoundState::Closed || round.idle_for() >= idle).then(|| id.clone())
            })
            .collect()
    }

    /// Copie des handles : aucun verrou du registre tenu pendant l'usage
    pub fn handles(&self) -> Vec<RoundHandle> {
        self.rounds.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_returns_same_round() {
        let reg = RoundRegistry::new(4);
        let a = reg.get_or_create("R1").unwrap();
        let b = reg.get_or_create("R1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.lock().state, RoundState::AwaitingTrigger);
        assert!(reg.get("R2").is_none());
    }

    #[test]
    fn test_evicted_rounds_are_remembered() {
        let reg = RoundRegistry::new(2);
        for id in ["R1", "R2", "R3"] {
            reg.get_or_create(id).unwrap();
            reg.evict(id);
        }
        assert!(reg.is_empty());
        assert!(reg.get_or_create("R3").is_none());
        // mémoire bornée : R1 a été oublié
        assert!(!reg.is_closed("R1"));
        assert!(reg.get_or_create("R1").is_some());
    }

    #[test]
    fn test_stale_rounds() {
        let reg = RoundRegistry::new(4);
        reg.get_or_create("open").unwrap();
        let closed = reg.get_or_create("done").unwrap();
        closed.lock().transition(RoundState::Closed, "test");

        assert_eq!(reg.stale(Duration::from_secs(600)), vec!["done".to_string()]);
        let mut all = reg.stale(Duration::ZERO);
        all.sort();
        assert_eq!(all, vec!["done".to_string(), "open".to_string()]);
    }
}

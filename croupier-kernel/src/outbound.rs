/**
 * OUTBOUND - File de commandes sortantes à priorité
 *
 * RÔLE : Tamponne les commandes vers le broker et les draine en tâche de fond,
 * strictement par priorité puis FIFO dans un même niveau.
 *
 * File pleine : le plus ancien message du niveau le plus bas est évincé pour
 * admettre le nouveau ; un message strictement moins prioritaire que tout ce
 * qui attend est refusé. L'appelant n'est jamais bloqué.
 */

use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    fn tier(self) -> usize {
        self as usize
    }

    pub fn qos(self) -> QoS {
        match self {
            Priority::Low => QoS::AtMostOnce,
            Priority::Normal | Priority::High => QoS::AtLeastOnce,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub enqueued_at: Instant,
    attempts: u32,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, priority: Priority) -> Self {
        Self { topic: topic.into(), payload, priority, enqueued_at: Instant::now(), attempts: 0 }
    }

    pub fn json<T: Serialize>(topic: impl Into<String>, body: &T, priority: Priority) -> Result<Self, serde_json::Error> {
        Ok(Self::new(topic, serde_json::to_vec(body)?, priority))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Admis en évinçant un message moins (ou aussi) prioritaire
    Evicted { topic: String, priority: Priority },
    Refused,
}

/// Cible de publication du sender (le transport en production)
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, priority: Priority) -> Result<(), TransportError>;

    /// Appelé après un échec de publication, avant la nouvelle tentative
    async fn reconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct OutboundQueue {
    tiers: Mutex<[VecDeque<OutboundMessage>; 3]>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            tiers: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.tiers.lock().iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, msg: OutboundMessage) -> Admission {
        let mut tiers = self.tiers.lock();
        let len: usize = tiers.iter().map(VecDeque::len).sum();
        let mut admission = Admission::Accepted;

        if len >= self.capacity {
            let Some(lowest) = (0..tiers.len()).find(|&t| !tiers[t].is_empty()) else {
                return Admission::Refused;
            };
            if msg.priority.tier() < lowest {
                warn!("[router] outbound queue full, refusing {:?} message for {}", msg.priority, msg.topic);
                return Admission::Refused;
            }
            if let Some(evicted) = tiers[lowest].pop_front() {
                warn!(
                    "[router] outbound queue full, evicted {:?} message for {} (queued {:?} ago)",
                    evicted.priority,
                    evicted.topic,
                    evicted.enqueued_at.elapsed()
                );
                admission = Admission::Evicted { topic: evicted.topic, priority: evicted.priority };
            }
        }

        tiers[msg.priority.tier()].push_back(msg);
        drop(tiers);
        self.notify.notify_one();
        admission
    }

    /// Remet un message en tête de son niveau après un échec d'envoi
    fn requeue_front(&self, msg: OutboundMessage) {
        let mut tiers = self.tiers.lock();
        tiers[msg.priority.tier()].push_front(msg);
        let len: usize = tiers.iter().map(VecDeque::len).sum();
        if len > self.capacity {
            if let Some(lowest) = (0..tiers.len()).find(|&t| !tiers[t].is_empty()) {
                if let Some(dropped) = tiers[lowest].pop_back() {
                    warn!("[router] outbound queue over capacity, dropped message for {}", dropped.topic);
                }
            }
        }
        drop(tiers);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<OutboundMessage> {
        let mut tiers = self.tiers.lock();
        tiers.iter_mut().rev().find_map(VecDeque::pop_front)
    }

    /// Attend le prochain message ; `None` une fois la file fermée
    pub async fn next(&self) -> Option<OutboundMessage> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(msg) = self.pop() {
                return Some(msg);
            }
            self.notify.notified().await;
        }
    }

    /// Topics et priorités en attente, dans l'ordre de drainage
    pub fn pending(&self) -> Vec<(String, Priority)> {
        let tiers = self.tiers.lock();
        tiers.iter().rev().flat_map(|t| t.iter().map(|m| (m.topic.clone(), m.priority))).collect()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// Sender de fond : draine la file vers le publisher
pub fn spawn_sender(
    queue: Arc<OutboundQueue>,
    publisher: Arc<dyn Publisher>,
    retry: Duration,
    max_attempts: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(mut msg) = queue.next().await {
            match publisher.publish(&msg.topic, msg.payload.clone(), msg.priority).await {
                Ok(()) => debug!("[router] sent {:?} message on {}", msg.priority, msg.topic),
                Err(e) => {
                    msg.attempts += 1;
                    if msg.attempts >= max_attempts {
                        warn!("[router] dropping message for {} after {} attempts: {e}", msg.topic, msg.attempts);
                        continue;
                    }
                    warn!("[router] send on {} failed (attempt {}): {e}", msg.topic, msg.attempts);
                    queue.requeue_front(msg);
                    if let Err(e) = publisher.reconnect().await {
                        warn!("[router] reconnect before retry failed: {e}");
                    }
                    tokio::time::sleep(retry).await;
                }
            }
        }
        debug!("[router] outbound sender stopped");
    })
}

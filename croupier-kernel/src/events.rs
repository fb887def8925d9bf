/**
 * EVENTS - Adaptateur ligne à ligne vers le coordinateur de manches
 *
 * Remplace le décodeur série : une commande par ligne
 *   open <id> | trigger <id> | settle <id> [valeur] | hardware <id> <valeur>
 * Les lignes inconnues sont loggées et ignorées.
 */

use crate::coordinator::RoundCoordinator;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RoundEvent {
    Open(String),
    Trigger(String),
    Settle { round_id: String, value: Option<Value> },
    Hardware { round_id: String, value: Value },
}

/// Valeur matérielle : nombre si possible, sinon la chaîne brute ("None" => null)
fn parse_value(raw: &str) -> Value {
    match raw {
        "None" | "none" | "null" => Value::Null,
        _ => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

pub fn parse_line(line: &str) -> Option<RoundEvent> {
    let mut words = line.split_whitespace();
    let verb = words.next()?;
    let round_id = words.next()?.to_string();
    let value = words.next().map(parse_value);
    if words.next().is_some() {
        return None;
    }
    match (verb.to_ascii_lowercase().as_str(), value) {
        ("open", None) => Some(RoundEvent::Open(round_id)),
        ("trigger", None) => Some(RoundEvent::Trigger(round_id)),
        ("settle", value) => Some(RoundEvent::Settle { round_id, value }),
        ("hardware", Some(value)) => Some(RoundEvent::Hardware { round_id, value }),
        _ => None,
    }
}

pub fn apply(coordinator: &Arc<RoundCoordinator>, event: RoundEvent) {
    match event {
        RoundEvent::Open(id) => {
            coordinator.open_round(&id);
        }
        RoundEvent::Trigger(id) => {
            let outcome = coordinator.on_trigger(&id);
            debug!("[events] trigger {id}: {outcome:?}");
        }
        RoundEvent::Settle { round_id, value } => {
            let outcome = coordinator.on_settle(&round_id);
            debug!("[events] settle {round_id}: {outcome:?}");
            if let Some(value) = value {
                coordinator.on_hardware_result(&round_id, &value);
            }
        }
        RoundEvent::Hardware { round_id, value } => coordinator.on_hardware_result(&round_id, &value),
    }
}

/// Lit les événements jusqu'à la fin du flux
pub async fn run_events<R>(reader: R, coordinator: Arc<RoundCoordinator>) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut applied = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                match parse_line(trimmed) {
                    Some(event) => {
                        apply(&coordinator, event);
                        applied += 1;
                    }
                    None => warn!("[events] unrecognized event line: {trimmed}"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("[events] read error: {e}");
                break;
            }
        }
    }
    info!("[events] event stream closed after {applied} events");
    applied
}

pub fn spawn_stdin_events(coordinator: Arc<RoundCoordinator>) -> JoinHandle<usize> {
    tokio::spawn(run_events(BufReader::new(tokio::io::stdin()), coordinator))
}

/**
 * RECORDER - Journal de réconciliation SERIAL (roue) vs IDP (vision)
 *
 * RÔLE :
 * Compare pour chaque manche le résultat matériel et le résultat détecté,
 * et écrit UNE ligne append-only par manche pour l'audit QA.
 *
 * FONCTIONNEMENT :
 * - les deux côtés arrivent dans n'importe quel ordre, normalisés en
 *   numéro ou "None" (null, vide, erreur)
 * - la ligne est écrite quand les deux côtés sont connus, ou à l'expiration
 *   du délai de grâce lancé à l'arrivée du premier côté
 * - le suivi mémoire est borné aux N dernières manches, purgé du plus ancien ;
 *   les ids purgés restent connus (borné aussi) et leurs valeurs tardives ignorées
 * - une manche annulée avant détection est écrite "no detection requested"
 *
 * FORMAT :
 * [2026-10-19 21:04:11.532] R123 | SERIAL: 21 | IDP: 21 | MATCH | perfect match
 */

use crate::config::RecorderConf;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Match,
    Mismatch,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Match => "MATCH",
            Verdict::Mismatch => "MISMATCH",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationRecord {
    pub timestamp: OffsetDateTime,
    pub round_id: String,
    pub hardware: Option<i64>,
    pub detector: Option<i64>,
    pub verdict: Verdict,
    pub reason: &'static str,
}

fn show(value: Option<i64>) -> String {
    value.map_or_else(|| "None".to_string(), |v| v.to_string())
}

impl ReconciliationRecord {
    pub fn to_line(&self) -> String {
        let stamp = self
            .timestamp
            .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"))
            .unwrap_or_else(|_| self.timestamp.unix_timestamp().to_string());
        format!(
            "[{stamp}] {} | SERIAL: {} | IDP: {} | {} | {}",
            self.round_id,
            show(self.hardware),
            show(self.detector),
            self.verdict,
            self.reason
        )
    }
}

/// Numéro ou None : null, "", [], {} et toute forme d'erreur donnent None
pub fn normalize(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Array(items) if items.len() == 1 => normalize(&items[0]),
        Value::Object(map) => {
            if map.contains_key("err") || map.contains_key("error") {
                None
            } else {
                map.get("res").or_else(|| map.get("value")).and_then(normalize)
            }
        }
        _ => None,
    }
}

/// `None` côté = pas encore arrivé ; `Some(None)` = arrivé sans valeur
pub fn compare(hardware: Option<Option<i64>>, detector: Option<Option<i64>>) -> (Verdict, &'static str) {
    match (hardware, detector) {
        (Some(Some(h)), Some(Some(d))) if h == d => (Verdict::Match, "perfect match"),
        (Some(Some(_)), Some(Some(_))) => (Verdict::Mismatch, "value mismatch"),
        (Some(Some(_)), Some(None)) => (Verdict::Mismatch, "detector returned none"),
        (Some(None), Some(None)) => (Verdict::Match, "both empty"),
        (Some(None), Some(Some(_))) => (Verdict::Mismatch, "hardware returned none"),
        (Some(_), None) => (Verdict::Mismatch, "detector pending"),
        (None, _) => (Verdict::Mismatch, "hardware pending"),
    }
}

#[derive(Debug)]
struct Pending {
    hardware: Option<Option<i64>>,
    detector: Option<Option<i64>>,
    first_seen: Instant,
    written: bool,
    not_requested: bool,
}

impl Pending {
    fn new() -> Self {
        Self { hardware: None, detector: None, first_seen: Instant::now(), written: false, not_requested: false }
    }
}

#[derive(Default)]
struct Tracked {
    entries: HashMap<String, Pending>,
    order: VecDeque<String>,
    purged: VecDeque<String>,
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Hardware,
    Detector,
    /// Détection annulée avant publication
    NotRequested,
}

pub struct ReconciliationRecorder {
    path: PathBuf,
    grace: Duration,
    capacity: usize,
    tracked: Mutex<Tracked>,
    file_lock: Mutex<()>,
}

impl ReconciliationRecorder {
    pub fn new(conf: &RecorderConf) -> Self {
        Self {
            path: PathBuf::from(&conf.path),
            grace: Duration::from_millis(conf.grace_period_ms),
            capacity: conf.max_tracked_rounds.max(1),
            tracked: Mutex::new(Tracked::default()),
            file_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tracked(&self) -> usize {
        self.tracked.lock().entries.len()
    }

    pub fn record_hardware(self: &Arc<Self>, round_id: &str, value: &Value) -> Option<ReconciliationRecord> {
        self.record(round_id, Side::Hardware, normalize(value))
    }

    pub fn record_detector(self: &Arc<Self>, round_id: &str, value: &Value) -> Option<ReconciliationRecord> {
        self.record(round_id, Side::Detector, normalize(value))
    }

    /// Manche annulée avant l'envoi du detect : côté IDP clos sans valeur
    pub fn record_not_requested(self: &Arc<Self>, round_id: &str) -> Option<ReconciliationRecord> {
        self.record(round_id, Side::NotRequested, None)
    }

    fn record(self: &Arc<Self>, round_id: &str, side: Side, value: Option<i64>) -> Option<ReconciliationRecord> {
        let mut flush = Vec::new();
        let (ready, start_grace) = {
            let mut tracked = self.tracked.lock();
            if tracked.purged.iter().any(|id| id == round_id) {
                debug!("[recorder] round {round_id} no longer tracked, {side:?} value {} ignored", show(value));
                return None;
            }
            let is_new = !tracked.entries.contains_key(round_id);
            if is_new {
                tracked.order.push_back(round_id.to_string());
                tracked.entries.insert(round_id.to_string(), Pending::new());
            }
            let Some(entry) = tracked.entries.get_mut(round_id) else {
                return None;
            };
            if entry.written {
                debug!("[recorder] round {round_id} already reconciled, {side:?} value {} ignored", show(value));
                return None;
            }
            let slot = match side {
                Side::Hardware => &mut entry.hardware,
                Side::Detector | Side::NotRequested => &mut entry.detector,
            };
            if slot.is_some() {
                warn!("[recorder] duplicate {side:?} value for round {round_id}, keeping the first");
            } else {
                *slot = Some(value);
                entry.not_requested = matches!(side, Side::NotRequested);
            }

            let ready = if entry.hardware.is_some() && entry.detector.is_some() {
                entry.written = true;
                Some(Self::build(round_id, entry))
            } else {
                None
            };

            if is_new {
                flush = Self::purge(&mut tracked, self.capacity);
            }
            (ready, is_new)
        };

        for record in &flush {
            self.write(record);
        }
        if let Some(record) = &ready {
            self.write(record);
        } else if start_grace {
            self.spawn_grace_timer(round_id.to_string());
        }
        ready
    }

    fn build(round_id: &str, entry: &Pending) -> ReconciliationRecord {
        let (verdict, reason) = match (entry.not_requested, entry.hardware) {
            (true, Some(_)) => (Verdict::Mismatch, "no detection requested"),
            _ => compare(entry.hardware, entry.detector),
        };
        ReconciliationRecord {
            timestamp: OffsetDateTime::now_utc(),
            round_id: round_id.to_string(),
            hardware: entry.hardware.flatten(),
            detector: entry.detector.flatten(),
            verdict,
            reason,
        }
    }

    /// Purge du plus ancien au-delà de la capacité ; les manches non écrites sont écrites d'abord
    fn purge(tracked: &mut Tracked, capacity: usize) -> Vec<ReconciliationRecord> {
        let mut flush = Vec::new();
        while tracked.order.len() > capacity {
            let Some(oldest) = tracked.order.pop_front() else { break };
            if let Some(entry) = tracked.entries.remove(&oldest) {
                if !entry.written {
                    warn!("[recorder] round {oldest} purged before both results arrived");
                    flush.push(Self::build(&oldest, &entry));
                }
            }
            if tracked.purged.len() >= capacity {
                tracked.purged.pop_front();
            }
            tracked.purged.push_back(oldest);
        }
        flush
    }

    fn spawn_grace_timer(self: &Arc<Self>, round_id: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.grace).await;
            this.expire(&round_id);
        });
    }

    /// Fin du délai de grâce : écrit avec le côté manquant si rien n'a été écrit
    pub fn expire(&self, round_id: &str) -> Option<ReconciliationRecord> {
        let record = {
            let mut tracked = self.tracked.lock();
            let entry = tracked.entries.get_mut(round_id)?;
            if entry.written {
                return None;
            }
            entry.written = true;
            debug!("[recorder] grace period over for round {round_id} after {:?}", entry.first_seen.elapsed());
            Self::build(round_id, entry)
        };
        self.write(&record);
        Some(record)
    }

    fn write(&self, record: &ReconciliationRecord) {
        let line = record.to_line();
        info!("[recorder] {line}");

        let _guard = self.file_lock.lock();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("[recorder] cannot create {}: {e}", parent.display());
            }
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            warn!("[recorder] failed to append to {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(dir: &tempfile::TempDir, capacity: usize) -> Arc<ReconciliationRecorder> {
        let conf = RecorderConf {
            path: dir.path().join("audit/reconciliation.log").to_string_lossy().into_owned(),
            grace_period_ms: 1_000,
            max_tracked_rounds: capacity,
        };
        Arc::new(ReconciliationRecorder::new(&conf))
    }

    fn lines(rec: &ReconciliationRecorder) -> Vec<String> {
        std::fs::read_to_string(rec.path())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize(&json!(21)), Some(21));
        assert_eq!(normalize(&json!("21")), Some(21));
        assert_eq!(normalize(&json!(" 21 ")), Some(21));
        assert_eq!(normalize(&json!(21.0)), Some(21));
        assert_eq!(normalize(&json!([33])), Some(33));
        assert_eq!(normalize(&json!(null)), None);
        assert_eq!(normalize(&json!("")), None);
        assert_eq!(normalize(&json!([])), None);
        assert_eq!(normalize(&json!({"err": 2})), None);
    }

    #[test]
    fn test_verdicts() {
        assert_eq!(compare(Some(Some(21)), Some(Some(21))), (Verdict::Match, "perfect match"));
        assert_eq!(compare(Some(Some(21)), Some(Some(33))), (Verdict::Mismatch, "value mismatch"));
        assert_eq!(compare(Some(Some(8)), Some(None)), (Verdict::Mismatch, "detector returned none"));
        assert_eq!(compare(Some(None), Some(None)), (Verdict::Match, "both empty"));
        assert_eq!(compare(None, Some(Some(4))), (Verdict::Mismatch, "hardware pending"));
        assert_eq!(compare(Some(Some(4)), None), (Verdict::Mismatch, "detector pending"));
    }

    #[test]
    fn test_line_format() {
        let record = ReconciliationRecord {
            timestamp: time::macros::datetime!(2026-10-19 21:04:11.532 UTC),
            round_id: "R123".into(),
            hardware: Some(8),
            detector: None,
            verdict: Verdict::Mismatch,
            reason: "detector returned none",
        };
        assert_eq!(
            record.to_line(),
            "[2026-10-19 21:04:11.532] R123 | SERIAL: 8 | IDP: None | MISMATCH | detector returned none"
        );
    }

    #[tokio::test]
    async fn test_int_and_numeric_string_match_in_either_order() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(&dir, 10);

        assert!(rec.record_detector("R1", &json!("21")).is_none());
        let record = rec.record_hardware("R1", &json!(21)).unwrap();
        assert_eq!(record.verdict, Verdict::Match);

        assert!(rec.record_hardware("R2", &json!(8)).is_none());
        assert!(rec.record_detector("R2", &json!([])).is_some());

        let written = lines(&rec);
        assert_eq!(written.len(), 2);
        assert!(written[0].ends_with("R1 | SERIAL: 21 | IDP: 21 | MATCH | perfect match"));
        assert!(written[1].ends_with("R2 | SERIAL: 8 | IDP: None | MISMATCH | detector returned none"));
    }

    #[tokio::test]
    async fn test_written_at_most_once_per_round() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(&dir, 10);
        rec.record_hardware("R1", &json!(5));
        rec.record_detector("R1", &json!(5));
        assert!(rec.record_detector("R1", &json!(6)).is_none());
        assert!(rec.expire("R1").is_none());
        assert_eq!(lines(&rec).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_writes_missing_side() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(&dir, 10);
        rec.record_detector("R9", &json!(17));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let written = lines(&rec);
        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with("R9 | SERIAL: None | IDP: 17 | MISMATCH | hardware pending"));

        // le matériel arrive après la grâce : rien de plus
        assert!(rec.record_hardware("R9", &json!(17)).is_none());
        assert_eq!(lines(&rec).len(), 1);
    }

    #[tokio::test]
    async fn test_tracking_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(&dir, 3);
        for i in 0..5 {
            let id = format!("R{i}");
            rec.record_hardware(&id, &json!(i));
            rec.record_detector(&id, &json!(i));
        }
        assert_eq!(rec.tracked(), 3);
        assert_eq!(lines(&rec).len(), 5);
    }

    #[tokio::test]
    async fn test_purged_pending_round_is_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(&dir, 1);
        rec.record_hardware("old", &json!(3));
        rec.record_hardware("new", &json!(4));
        let written = lines(&rec);
        assert_eq!(written.len(), 1);
        assert!(written[0].contains("old | SERIAL: 3 | IDP: None | MISMATCH | detector pending"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purged_round_is_never_written_twice() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(&dir, 2);
        rec.record_hardware("X", &json!(5));
        rec.record_hardware("A", &json!(1));
        rec.record_hardware("B", &json!(2));
        assert!(rec.record_detector("X", &json!(5)).is_none());

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let x: Vec<_> = lines(&rec).into_iter().filter(|l| l.contains("] X |")).collect();
        assert_eq!(x.len(), 1);
        assert!(x[0].ends_with("X | SERIAL: 5 | IDP: None | MISMATCH | detector pending"));
    }

    #[tokio::test]
    async fn test_not_requested_detection_has_its_own_reason() {
        let dir = tempfile::tempdir().unwrap();
        let rec = recorder(&dir, 10);
        assert!(rec.record_not_requested("R4").is_none());
        let record = rec.record_hardware("R4", &json!(14)).unwrap();
        assert_eq!(record.verdict, Verdict::Mismatch);
        assert_eq!(record.reason, "no detection requested");
        assert!(lines(&rec)[0].ends_with("R4 | SERIAL: 14 | IDP: None | MISMATCH | no detection requested"));
    }
}

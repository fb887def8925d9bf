/**
 * PROTOCOL - Messages échangés avec le détecteur vision
 *
 * FORMATS :
 * - detect  : {"command":"detect","arg":{"round_id":..,"input":..,"output":..}}
 * - stop    : {"command":"timeout","arg":{}}
 * - réponse : {"response":"result","arg":{"round_id":..,"res":<int|null>,"err":<int>}}
 *
 * CLASSIFICATION :
 * numéro valide dans la plage, absence de détection, forme non reconnue, ou timeout
 */

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectArg {
    pub round_id: String,
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", content = "arg", rename_all = "snake_case")]
pub enum DetectorCommand {
    Detect(DetectArg),
    Timeout(serde_json::Map<String, Value>),
}

impl DetectorCommand {
    pub fn detect(round_id: &str, input: &str, output: &str) -> Self {
        DetectorCommand::Detect(DetectArg {
            round_id: round_id.to_string(),
            input: input.to_string(),
            output: output.to_string(),
        })
    }

    pub fn stop() -> Self {
        DetectorCommand::Timeout(serde_json::Map::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultArg {
    pub round_id: String,
    #[serde(default)]
    pub res: Value,
    #[serde(default)]
    pub err: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionResponse {
    pub response: String,
    pub arg: ResultArg,
}

impl DetectionResponse {
    pub fn is_result(&self) -> bool {
        self.response == "result"
    }
}

/// Round id d'une réponse, sans décoder le reste
pub fn response_round_id(payload: &Value) -> Option<&str> {
    payload.get("arg")?.get("round_id")?.as_str()
}

/// Classification d'un résultat de détection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorOutcome {
    Valid { value: i64 },
    NoDetection { err: Option<i64> },
    Unrecognized { raw: String },
    TimedOut,
}

impl DetectorOutcome {
    /// Valeur transmise à la réconciliation : le numéro, ou null
    pub fn as_value(&self) -> Value {
        match self {
            DetectorOutcome::Valid { value } => json!(value),
            _ => Value::Null,
        }
    }
}

impl fmt::Display for DetectorOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorOutcome::Valid { value } => write!(f, "{value}"),
            DetectorOutcome::NoDetection { err: Some(code) } => write!(f, "no detection (err {code})"),
            DetectorOutcome::NoDetection { err: None } => write!(f, "no detection"),
            DetectorOutcome::Unrecognized { raw } => write!(f, "unrecognized {raw}"),
            DetectorOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

fn classify_value(res: &Value, range: (i64, i64)) -> DetectorOutcome {
    let in_range = |n: i64| n >= range.0 && n <= range.1;
    let unrecognized = || DetectorOutcome::Unrecognized { raw: res.to_string() };
    match res {
        Value::Null => DetectorOutcome::NoDetection { err: None },
        Value::String(s) if s.trim().is_empty() => DetectorOutcome::NoDetection { err: None },
        Value::String(s) => match s.trim().parse::<i64>() {
            Ok(n) if in_range(n) => DetectorOutcome::Valid { value: n },
            _ => unrecognized(),
        },
        Value::Number(n) => match n.as_i64() {
            Some(n) if in_range(n) => DetectorOutcome::Valid { value: n },
            _ => unrecognized(),
        },
        Value::Array(items) if items.is_empty() => DetectorOutcome::NoDetection { err: None },
        Value::Array(items) if items.len() == 1 => classify_value(&items[0], range),
        Value::Object(map) if map.is_empty() => DetectorOutcome::NoDetection { err: None },
        Value::Object(map) if map.contains_key("error") || map.contains_key("err") => {
            let code = map.get("err").or_else(|| map.get("error")).and_then(Value::as_i64);
            DetectorOutcome::NoDetection { err: code }
        }
        _ => unrecognized(),
    }
}

/// Valide dans la plage => Valid ; vide/null/erreur => NoDetection ; autre forme => Unrecognized
pub fn classify(arg: &ResultArg, min_outcome: i64, max_outcome: i64) -> DetectorOutcome {
    if arg.err != 0 {
        return DetectorOutcome::NoDetection { err: Some(arg.err) };
    }
    let outcome = classify_value(&arg.res, (min_outcome, max_outcome));
    if let DetectorOutcome::Unrecognized { raw } = &outcome {
        warn!("[coordinator] unrecognized detector result for round {}: {raw}", arg.round_id);
    }
    outcome
}

use crate::error::ConfigError;
use crate::pool::SelectionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelConfig {
    #[serde(default = "default_table_id")]
    pub table_id: String,
    #[serde(default = "default_brokers")]
    pub brokers: Vec<BrokerEndpoint>,
    #[serde(default)]
    pub pool: PoolConf,
    #[serde(default)]
    pub topics: TopicsConf,
    #[serde(default)]
    pub detection: DetectionConf,
    #[serde(default)]
    pub router: RouterConf,
    #[serde(default)]
    pub recorder: RecorderConf,
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

/// Un broker MQTT candidat ; `priority` basse = préféré
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub broker: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub priority: u32,
}

impl BrokerEndpoint {
    pub fn new(broker: impl Into<String>, port: u16, priority: u32) -> Self {
        Self { broker: broker.into(), port, username: None, password: None, priority }
    }

    /// Identité loggée de l'endpoint, ex: "10.0.0.5:1883"
    pub fn label(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PoolConf {
    pub policy: SelectionPolicy,
    pub health_interval_ms: u64,
    pub failure_threshold: u32,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
}

impl Default for PoolConf {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::Priority,
            health_interval_ms: 5_000,
            failure_threshold: 3,
            max_retries: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 4_000,
            connect_timeout_ms: 5_000,
            keep_alive_secs: 15,
        }
    }
}

impl PoolConf {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Délai avant la tentative `attempt + 1` : base * 2^attempt, plafonné
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let ms = self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TopicsConf {
    pub command: String,
    pub response: String,
    pub status: String,
}

impl Default for TopicsConf {
    fn default() -> Self {
        Self {
            command: "croupier/idp/command@v1".into(),
            response: "croupier/idp/response@v1".into(),
            status: "croupier/kernel/status@v1".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DetectionConf {
    pub settle_delay_ms: u64,
    pub result_timeout_ms: u64,
    pub min_outcome: i64,
    pub max_outcome: i64,
    pub input: String,
    pub output_dir: String,
    pub round_idle_timeout_secs: u64,
    pub closed_rounds_memory: usize,
    pub janitor_interval_secs: u64,
}

impl Default for DetectionConf {
    fn default() -> Self {
        Self {
            settle_delay_ms: 3_000,
            result_timeout_ms: 10_000,
            min_outcome: 0,
            max_outcome: 36,
            input: "rtsp://127.0.0.1:8554/table".into(),
            output_dir: "./data/frames".into(),
            round_idle_timeout_secs: 600,
            closed_rounds_memory: 256,
            janitor_interval_secs: 30,
        }
    }
}

impl DetectionConf {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }

    pub fn round_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.round_idle_timeout_secs)
    }

    pub fn output_for(&self, round_id: &str) -> String {
        format!("{}/{}", self.output_dir.trim_end_matches('/'), round_id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RouterConf {
    pub history_capacity: usize,
    pub history_ttl_ms: u64,
    pub queue_capacity: usize,
    pub send_retry_ms: u64,
    pub max_send_attempts: u32,
}

impl Default for RouterConf {
    fn default() -> Self {
        Self {
            history_capacity: 32,
            history_ttl_ms: 30_000,
            queue_capacity: 64,
            send_retry_ms: 500,
            max_send_attempts: 5,
        }
    }
}

impl RouterConf {
    pub fn history_ttl(&self) -> Duration {
        Duration::from_millis(self.history_ttl_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RecorderConf {
    pub path: String,
    pub grace_period_ms: u64,
    pub max_tracked_rounds: usize,
}

impl Default for RecorderConf {
    fn default() -> Self {
        Self {
            path: "./data/reconciliation.log".into(),
            grace_period_ms: 15_000,
            max_tracked_rounds: 100,
        }
    }
}

fn default_table_id() -> String {
    "roulette-1".into()
}

fn default_brokers() -> Vec<BrokerEndpoint> {
    vec![BrokerEndpoint::new("localhost", 1883, 0)]
}

fn default_status_interval() -> u64 {
    30
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            table_id: default_table_id(),
            brokers: default_brokers(),
            pool: PoolConf::default(),
            topics: TopicsConf::default(),
            detection: DetectionConf::default(),
            router: RouterConf::default(),
            recorder: RecorderConf::default(),
            status_interval_secs: default_status_interval(),
        }
    }
}

impl KernelConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, ConfigError> {
        let cfg: KernelConfig = serde_yaml::from_str(txt)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        let mut seen = HashSet::new();
        for ep in &self.brokers {
            if ep.port == 0 {
                return Err(ConfigError::Invalid { field: "brokers.port", reason: format!("{} has port 0", ep.broker) });
            }
            if !seen.insert(ep.label()) {
                return Err(ConfigError::DuplicateEndpoint(ep.label()));
            }
        }
        let positive = [
            ("pool.failure_threshold", self.pool.failure_threshold as u64),
            ("pool.max_retries", self.pool.max_retries as u64),
            ("router.history_capacity", self.router.history_capacity as u64),
            ("router.queue_capacity", self.router.queue_capacity as u64),
            ("router.max_send_attempts", self.router.max_send_attempts as u64),
            ("recorder.max_tracked_rounds", self.recorder.max_tracked_rounds as u64),
            ("pool.health_interval_ms", self.pool.health_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid { field, reason: "must be at least 1".into() });
            }
        }
        if self.detection.min_outcome > self.detection.max_outcome {
            return Err(ConfigError::Invalid {
                field: "detection.min_outcome",
                reason: format!("{} > max_outcome {}", self.detection.min_outcome, self.detection.max_outcome),
            });
        }
        Ok(())
    }
}

pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var("CROUPIER_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if !Path::new(&path).exists() {
        warn!("[kernel] no config at {path}, using defaults");
        return Ok(KernelConfig::default());
    }
    let txt = fs::read_to_string(&path).await?;
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    KernelConfig::from_yaml_str(&txt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = KernelConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.brokers[0].label(), "localhost:1883");
        assert_eq!(cfg.detection.result_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.recorder.max_tracked_rounds, 100);
    }

    #[test]
    fn test_yaml_brokers_and_policy() {
        let cfg = KernelConfig::from_yaml_str(
            r#"
table_id: t7
brokers:
  - { broker: primary.local, port: 1883, username: dealer, password: s3cret, priority: 0 }
  - { broker: backup.local, port: 1884, priority: 1 }
pool:
  policy: round_robin
detection:
  settle_delay_ms: 1500
"#,
        )
        .unwrap();
        assert_eq!(cfg.table_id, "t7");
        assert_eq!(cfg.brokers.len(), 2);
        assert_eq!(cfg.brokers[0].username.as_deref(), Some("dealer"));
        assert_eq!(cfg.pool.policy, SelectionPolicy::RoundRobin);
        assert_eq!(cfg.detection.settle_delay(), Duration::from_millis(1500));
        // champs absents => défauts
        assert_eq!(cfg.detection.result_timeout_ms, 10_000);
        assert_eq!(cfg.pool.failure_threshold, 3);
    }

    #[test]
    fn test_rejects_empty_and_duplicate_brokers() {
        let empty = KernelConfig::from_yaml_str("brokers: []");
        assert!(matches!(empty, Err(ConfigError::NoEndpoints)));

        let dup = KernelConfig::from_yaml_str(
            "brokers:\n  - { broker: a, port: 1883, priority: 0 }\n  - { broker: a, port: 1883, priority: 1 }\n",
        );
        assert!(matches!(dup, Err(ConfigError::DuplicateEndpoint(ref l)) if l == "a:1883"));
    }

    #[test]
    fn test_equal_priorities_are_accepted() {
        let cfg = KernelConfig::from_yaml_str(
            "brokers:\n  - { broker: a, port: 1883, priority: 1 }\n  - { broker: b, port: 1883, priority: 1 }\n",
        );
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_backoff_is_bounded() {
        let pool = PoolConf { backoff_base_ms: 100, backoff_max_ms: 1_000, ..PoolConf::default() };
        assert_eq!(pool.backoff(0), Duration::from_millis(100));
        assert_eq!(pool.backoff(2), Duration::from_millis(400));
        assert_eq!(pool.backoff(10), Duration::from_millis(1_000));
        assert_eq!(pool.backoff(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_output_path_per_round() {
        let det = DetectionConf { output_dir: "/srv/frames/".into(), ..DetectionConf::default() };
        assert_eq!(det.output_for("R42"), "/srv/frames/R42");
    }
}

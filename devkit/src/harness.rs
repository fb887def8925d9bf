/*!
Harness de test : kernel complet sur broker simulé, timings courts

Démarre un vrai `Kernel` (pool, transport, routeur, coordinateur, recorder)
sur un `MockBroker`, avec un journal de réconciliation dans un répertoire
temporaire, et fournit les helpers d'attente et d'assertion des scénarios.
*/

use crate::mock_broker::{DetectorMessageBuilder, MockBroker};
use anyhow::Result;
use croupier_kernel::config::{BrokerEndpoint, KernelConfig};
use croupier_kernel::kernel::Kernel;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::warn;

/// Config rapide : délais en dizaines/centaines de ms
pub fn fast_config(dir: &TempDir, brokers: &[&str]) -> KernelConfig {
    let mut cfg = KernelConfig::default();
    cfg.table_id = "test-table".into();
    cfg.brokers = brokers
        .iter()
        .enumerate()
        .map(|(i, host)| BrokerEndpoint::new(*host, 1883, i as u32))
        .collect();
    cfg.pool.health_interval_ms = 100;
    cfg.pool.failure_threshold = 2;
    cfg.pool.backoff_base_ms = 5;
    cfg.pool.backoff_max_ms = 20;
    cfg.detection.settle_delay_ms = 200;
    cfg.detection.result_timeout_ms = 1_000;
    cfg.detection.janitor_interval_secs = 1;
    cfg.detection.input = "rtsp://test-cam".into();
    cfg.detection.output_dir = dir.path().join("frames").to_string_lossy().into_owned();
    cfg.router.send_retry_ms = 20;
    cfg.recorder.path = dir.path().join("reconciliation.log").to_string_lossy().into_owned();
    cfg.recorder.grace_period_ms = 500;
    cfg.status_interval_secs = 0;
    cfg
}

pub struct TestHarness {
    pub broker: MockBroker,
    pub kernel: Kernel,
    _dir: TempDir,
}

impl TestHarness {
    /// `brokers` en ordre de priorité, `up` les endpoints joignables au démarrage
    pub async fn start(brokers: &[&str], up: &[&str]) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let cfg = fast_config(&dir, brokers);
        let labels: Vec<String> = up.iter().map(|h| format!("{h}:1883")).collect();
        let broker = MockBroker::with_up(&labels.iter().map(String::as_str).collect::<Vec<_>>());
        Self::start_with(cfg, broker, dir).await
    }

    pub async fn start_with(cfg: KernelConfig, broker: MockBroker, dir: TempDir) -> Result<Self> {
        let kernel = Kernel::start(cfg, Arc::new(broker.clone())).await?;
        Ok(Self { broker, kernel, _dir: dir })
    }

    pub fn command_topic(&self) -> &str {
        &self.kernel.config.topics.command
    }

    pub fn response_topic(&self) -> &str {
        &self.kernel.config.topics.response
    }

    /// Le détecteur répond pour une manche
    pub fn respond(&self, round_id: &str, res: Value) -> usize {
        self.broker.simulate_json(self.response_topic(), &DetectorMessageBuilder::result(round_id, res))
    }

    pub fn commands(&self, name: &str) -> Vec<Value> {
        self.broker
            .json_messages(self.command_topic())
            .into_iter()
            .filter(|c| c["command"] == name)
            .collect()
    }

    pub fn detect_commands(&self) -> Vec<Value> {
        self.commands("detect")
    }

    pub fn stop_commands(&self) -> Vec<Value> {
        self.commands("timeout")
    }

    pub fn reconciliation_lines(&self) -> Vec<String> {
        std::fs::read_to_string(self.kernel.recorder.path())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Attend qu'une condition devienne vraie ; false à l'expiration
    pub async fn wait_until<F>(&self, timeout_ms: u64, mut condition: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let met = condition(self);
        if !met {
            warn!("[harness] condition not met after {timeout_ms}ms");
        }
        met
    }

    pub async fn shutdown(self) {
        self.kernel.shutdown().await;
    }
}

/**
 * CROUPIER KERNEL - Point d'entrée du coordinateur de manches
 *
 * RÔLE : Charge la config, connecte le pool de brokers, démarre le
 * coordinateur et lit les événements de table sur stdin.
 *
 * ARCHITECTURE : bus MQTT (détection vision) + événements matériels + journal
 * de réconciliation.
 */

use anyhow::Context;
use croupier_kernel::config::load_config;
use croupier_kernel::events::spawn_stdin_events;
use croupier_kernel::kernel::Kernel;
use croupier_kernel::mqtt::MqttConnector;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("croupier_kernel=info")))
        .init();

    let cfg = load_config().await.context("loading kernel configuration")?;
    info!("[kernel] {} broker endpoints configured for table {}", cfg.brokers.len(), cfg.table_id);

    let connector = Arc::new(MqttConnector::new(&cfg.table_id, &cfg.pool));
    let kernel = Kernel::start(cfg, connector).await?;

    // rapports de détection : journalisés
    let mut reports = kernel.coordinator.attach_reports();
    tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            info!("[kernel] round {} detected {} (hardware {:?})", report.round_id, report.outcome, report.hardware);
        }
    });

    // événements de table (remplace le décodeur série)
    let events = spawn_stdin_events(kernel.coordinator.clone());

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    events.abort();
    kernel.shutdown().await;
    Ok(())
}

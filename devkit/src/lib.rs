/*!
# Croupier DevKit - Broker simulé et harness de test

Bibliothèque facilitant le test du kernel croupier sans broker réel :
- `MockBroker` : endpoints montés/coupés à chaud, messages retenus, journal des publications
- `TestHarness` : kernel complet sur le broker simulé, timings courts
- `DetectorMessageBuilder` : réponses du détecteur vision
*/

pub mod harness;
pub mod mock_broker;

pub use harness::{fast_config, TestHarness};
pub use mock_broker::{DetectorMessageBuilder, MockBroker, MockMessage};

/// Logs des tests (`RUST_LOG=debug cargo test`) ; appel multiple sans effet
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

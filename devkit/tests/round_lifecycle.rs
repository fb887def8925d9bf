use croupier_devkit::{init_test_logging, DetectorMessageBuilder, TestHarness};
use croupier_kernel::coordinator::{SettleOutcome, TriggerOutcome};
use croupier_kernel::protocol::DetectorOutcome;
use croupier_kernel::round::RoundState;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

#[tokio::test(start_paused = true)]
async fn repeated_triggers_publish_a_single_detect() {
    init_test_logging();
    let h = TestHarness::start(&["a"], &["a"]).await.unwrap();
    let coord = h.kernel.coordinator.clone();

    assert_eq!(coord.on_trigger("R1"), TriggerOutcome::Scheduled);
    for _ in 0..9 {
        assert_eq!(coord.on_trigger("R1"), TriggerOutcome::Duplicate);
    }
    assert!(h.wait_until(500, |h| !h.detect_commands().is_empty()).await);
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let detects = h.detect_commands();
    assert_eq!(detects.len(), 1);
    assert_eq!(detects[0]["arg"]["round_id"], "R1");
    assert_eq!(detects[0]["arg"]["input"], "rtsp://test-cam");
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn detection_round_trip_writes_match_line() {
    init_test_logging();
    let h = TestHarness::start(&["a"], &["a"]).await.unwrap();
    let coord = h.kernel.coordinator.clone();

    coord.on_trigger("R1");
    assert!(h.wait_until(1_000, |h| h.detect_commands().len() == 1).await);
    assert_eq!(h.respond("R1", json!(21)), 1);
    assert!(h.wait_until(1_000, |h| h.stop_commands().len() == 1).await);

    coord.on_hardware_result("R1", &json!("21"));
    let lines = h.reconciliation_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].ends_with("R1 | SERIAL: 21 | IDP: 21 | MATCH | perfect match"), "{}", lines[0]);

    let snap = coord.snapshot("R1").unwrap();
    assert_eq!(snap.state, RoundState::Closed);
    assert_eq!(snap.detector_result, Some(DetectorOutcome::Valid { value: 21 }));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn result_for_another_round_does_not_resolve() {
    init_test_logging();
    let h = TestHarness::start(&["a"], &["a"]).await.unwrap();
    let coord = h.kernel.coordinator.clone();

    coord.on_trigger("R1");
    assert!(h.wait_until(1_000, |h| h.detect_commands().len() == 1).await);
    h.respond("R2", json!(33));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(coord.snapshot("R1").unwrap().state, RoundState::DetectionInFlight);
    assert!(coord.snapshot("R2").is_none());

    // pas de réponse pour R1 : timeout, stop quand même
    assert!(h.wait_until(2_000, |h| h.stop_commands().len() == 1).await);
    assert_eq!(coord.snapshot("R1").unwrap().detector_result, Some(DetectorOutcome::TimedOut));

    coord.on_hardware_result("R1", &json!(8));
    let lines = h.reconciliation_lines();
    assert!(lines[0].ends_with("R1 | SERIAL: 8 | IDP: None | MISMATCH | detector returned none"), "{}", lines[0]);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn settle_before_delay_cancels_detection() {
    init_test_logging();
    let h = TestHarness::start(&["a"], &["a"]).await.unwrap();
    let coord = h.kernel.coordinator.clone();

    coord.on_trigger("R1");
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(coord.on_settle("R1"), SettleOutcome::CancelledPending);
    tokio::time::sleep(std::time::Duration::from_millis(2_000)).await;

    assert!(h.detect_commands().is_empty());
    assert!(h.stop_commands().is_empty());
    assert_eq!(coord.on_trigger("R1"), TriggerOutcome::Cancelled);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stop_is_sent_once_when_result_and_timeout_race() {
    init_test_logging();
    let h = TestHarness::start(&["a"], &["a"]).await.unwrap();
    let coord = h.kernel.coordinator.clone();

    coord.on_trigger("R1");
    assert!(h.wait_until(1_000, |h| h.detect_commands().len() == 1).await);
    // juste avant l'expiration de l'attente
    tokio::time::sleep(std::time::Duration::from_millis(990)).await;
    h.respond("R1", json!([]));
    h.respond("R1", json!(4));
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert!(!coord.issue_stop("R1"));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert_eq!(h.stop_commands().len(), 1);
    assert_eq!(coord.stats().stops_sent, 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn connect_fails_over_to_backup_with_subscriptions() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let cfg = croupier_devkit::fast_config(&dir, &["a", "b"]);
    let broker = croupier_devkit::MockBroker::with_up(&["b:1883"]);
    broker.retain("b:1883", &cfg.topics.response, DetectorMessageBuilder::result("R0", json!(3)).to_string());

    let h = TestHarness::start_with(cfg, broker, dir).await.unwrap();
    assert_eq!(h.kernel.transport.active_endpoint().await.as_deref(), Some("b:1883"));
    assert_eq!(h.broker.subscriptions("b:1883"), vec![h.response_topic().to_string()]);
    assert_eq!(h.broker.connect_attempts("a:1883"), h.kernel.config.pool.max_retries);

    // le message retenu sur b atteint le routeur une fois abonné
    assert!(h.wait_until(500, |h| h.kernel.router.stats().received == 1).await);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn migration_restores_every_subscription_before_dispatch() {
    init_test_logging();
    let h = TestHarness::start(&["a", "b"], &["a", "b"]).await.unwrap();
    assert_eq!(h.kernel.transport.active_endpoint().await.as_deref(), Some("a:1883"));
    h.kernel.transport.subscribe("croupier/table/+/events").await.unwrap();

    h.broker.retain("b:1883", h.response_topic(), DetectorMessageBuilder::result("R0", json!(9)).to_string());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let probe = (seen.clone(), h.broker.clone());
    h.kernel.router.register(h.response_topic(), "gate-probe", move |_| {
        probe.0.lock().push(probe.1.subscriptions("b:1883"));
        Ok(())
    });

    h.broker.set_up("a:1883", false);
    assert!(h.wait_until(3_000, |h| !seen.lock().is_empty()).await);

    assert_eq!(h.kernel.transport.active_endpoint().await.as_deref(), Some("b:1883"));
    assert_eq!(h.kernel.transport.failovers(), 1);
    let at_dispatch = seen.lock()[0].clone();
    assert!(at_dispatch.contains(&h.response_topic().to_string()));
    assert!(at_dispatch.contains(&"croupier/table/+/events".to_string()));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn commands_keep_flowing_after_failover() {
    init_test_logging();
    let h = TestHarness::start(&["a", "b"], &["a", "b"]).await.unwrap();
    let coord = h.kernel.coordinator.clone();

    h.broker.set_up("a:1883", false);
    coord.on_trigger("R7");
    assert!(h.wait_until(3_000, |h| h.detect_commands().len() == 1).await);
    let sent = h.broker.find_messages_by_topic(h.command_topic());
    assert_eq!(sent[0].endpoint, "b:1883");

    assert_eq!(h.respond("R7", json!(17)), 1);
    assert!(h.wait_until(1_000, |h| h.stop_commands().len() == 1).await);
    assert_eq!(coord.snapshot("R7").unwrap().detector_result, Some(DetectorOutcome::Valid { value: 17 }));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn detector_error_is_reconciled_as_none() {
    init_test_logging();
    let h = TestHarness::start(&["a"], &["a"]).await.unwrap();
    let coord = h.kernel.coordinator.clone();

    coord.on_hardware_result("R3", &json!(null));
    coord.on_trigger("R3");
    assert!(h.wait_until(1_000, |h| h.detect_commands().len() == 1).await);
    h.broker.simulate_json(h.response_topic(), &DetectorMessageBuilder::error("R3", 2));
    assert!(h.wait_until(1_000, |h| h.reconciliation_lines().len() == 1).await);

    assert!(h.reconciliation_lines()[0].ends_with("R3 | SERIAL: None | IDP: None | MATCH | both empty"));
    assert_eq!(
        coord.snapshot("R3").unwrap().detector_result,
        Some(DetectorOutcome::NoDetection { err: Some(2) })
    );
    h.shutdown().await;
}

mod support;

use std::time::Duration;

use relay_agent::{LifecycleState, HEALTH_SNAPSHOT_FILE};
use relay_cli::BotConfig;
use relay_contract::TransportEvent;
use support::{base_config, launch, say, spawn, Harness, OPERATOR};
use tempfile::tempdir;

#[tokio::test(start_paused = true)]
async fn integration_scheduled_tasks_back_up_sweep_and_report_health() {
    let state_dir = tempdir().expect("tempdir");
    let minute = Duration::from_secs(60);
    let config = BotConfig {
        backup_interval: minute,
        sweep_interval: minute,
        health_interval: minute,
        idle_session_threshold: Duration::from_secs(30),
        state_dir: Some(state_dir.path().to_path_buf()),
        ..base_config()
    };
    let harness = Harness::new();
    let mut bot = launch(config, &harness).await;

    say(&harness, "erin", "/ping").await;
    bot.next_record().await;
    assert_eq!(bot.gate.sessions().len(), 1);

    harness.clock.advance(Duration::from_secs(61));
    tokio::time::sleep(Duration::from_secs(125)).await;

    assert!(harness.journal.count("storage.backup") >= 2);
    assert_eq!(bot.gate.sessions().len(), 0);
    let raw = std::fs::read_to_string(state_dir.path().join(HEALTH_SNAPSHOT_FILE))
        .expect("health snapshot");
    let snapshot: serde_json::Value = serde_json::from_str(&raw).expect("snapshot json");
    assert_eq!(snapshot["lifecycle_state"], "running");
    assert_eq!(snapshot["commands"]["ping"]["total"], 1);

    let backups_before_stop = harness.journal.count("storage.backup");
    assert_eq!(bot.stop().await, 0);
    assert_eq!(harness.journal.count("storage.backup"), backups_before_stop + 1);
}

#[tokio::test(start_paused = true)]
async fn integration_invalid_configuration_never_builds_a_transport() {
    let harness = Harness::new();
    let config = BotConfig {
        operator: String::new(),
        ..base_config()
    };
    let mut bot = spawn(config, &harness);

    bot.wait_for(LifecycleState::Terminated).await;
    assert_eq!(bot.handle.await.expect("controller task"), 1);
    assert_eq!(harness.connector.build_count(), 0);
    assert_eq!(harness.journal.count("security.pre_launch_check"), 0);
    assert_eq!(harness.journal.count("storage.backup"), 0);
    assert_eq!(harness.journal.count("storage.disconnect"), 1);
}

#[tokio::test(start_paused = true)]
async fn integration_shutdown_during_reconnect_backoff_is_graceful() {
    let harness = Harness::with_plan(vec![None, Some("gateway unavailable".to_string())]);
    let mut bot = launch(base_config(), &harness).await;

    let first = harness.transport();
    assert!(
        first
            .emit(TransportEvent::Disconnected {
                reason: "socket closed".to_string(),
            })
            .await
    );
    bot.wait_for(LifecycleState::Recovering).await;

    assert_eq!(bot.stop().await, 0);
    assert_eq!(harness.connector.build_count(), 1);
    assert_eq!(harness.journal.count("storage.backup"), 1);
    assert_eq!(harness.journal.count("storage.disconnect"), 1);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(harness.connector.build_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn integration_operator_sees_startup_notice_and_goodbye() {
    let harness = Harness::new();
    let bot = launch(base_config(), &harness).await;
    let transport = harness.transport();

    let notices = transport.sent_texts_to(OPERATOR);
    assert_eq!(notices.len(), 1);
    assert!(notices[0].starts_with("relay-bot started"), "{}", notices[0]);

    assert_eq!(bot.stop().await, 0);
    let notices = transport.sent_texts_to(OPERATOR);
    assert_eq!(notices.len(), 2);
    assert!(notices[1].ends_with("Goodbye!"), "{}", notices[1]);
}

#[tokio::test(start_paused = true)]
async fn integration_reported_fault_ends_the_run_with_emergency_exit() {
    let harness = Harness::new();
    let bot = launch(base_config(), &harness).await;

    bot.faults.report("worker thread panicked");
    assert_eq!(bot.handle.await.expect("controller task"), 1);
    assert_eq!(harness.journal.count("storage.backup"), 0);
    assert_eq!(harness.journal.count("transport.clean_shutdown"), 1);
}

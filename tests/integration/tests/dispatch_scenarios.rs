mod support;

use std::collections::BTreeMap;
use std::time::Duration;

use relay_agent::dispatch::{COMMAND_FAILURE_NOTICE, COOLDOWN_NOTICE};
use relay_agent::DispatchOutcome;
use relay_cli::BotConfig;
use relay_contract::{TransportEvent, VoiceMessage};
use support::{base_config, launch, say, Harness};

fn gated_config() -> BotConfig {
    BotConfig {
        command_risk: BTreeMap::from([("ban".to_string(), 5), ("ping".to_string(), 1)]),
        blocked_identities: vec!["spammer".to_string()],
        ..base_config()
    }
}

#[tokio::test(start_paused = true)]
async fn integration_commands_pass_risk_and_cooldown_gates_in_order() {
    let harness = Harness::new();
    let mut bot = launch(gated_config(), &harness).await;

    say(&harness, "alice", "/ping").await;
    assert_eq!(
        bot.next_record().await.outcome,
        DispatchOutcome::Executed { success: true }
    );

    say(&harness, "alice", "/PING again").await;
    assert_eq!(bot.next_record().await.outcome, DispatchOutcome::CooldownBlocked);

    harness.clock.advance(Duration::from_millis(2_000));
    say(&harness, "alice", "/ping").await;
    assert_eq!(
        bot.next_record().await.outcome,
        DispatchOutcome::Executed { success: true }
    );

    say(&harness, "alice", "/ban bob").await;
    assert_eq!(bot.next_record().await.outcome, DispatchOutcome::RiskBlocked);

    say(&harness, "alice", "/deploy prod").await;
    assert_eq!(
        bot.next_record().await.outcome,
        DispatchOutcome::Executed { success: false }
    );

    let replies = harness.transport().sent_texts_to("alice");
    assert_eq!(replies.len(), 5, "{replies:?}");
    assert_eq!(replies[0], "pong");
    assert_eq!(replies[1], COOLDOWN_NOTICE);
    assert_eq!(replies[2], "pong");
    assert!(replies[3].contains("ban"), "{}", replies[3]);
    assert!(replies[3].contains("Risk level: 5/5"), "{}", replies[3]);
    assert_eq!(replies[4], COMMAND_FAILURE_NOTICE);

    let ping = bot.gate.statistics().get("ping").expect("ping counters");
    assert_eq!((ping.total, ping.successful), (2, 2));
    let deploy = bot.gate.statistics().get("deploy").expect("deploy counters");
    assert_eq!((deploy.total, deploy.successful), (1, 0));
    assert!(bot.gate.statistics().get("ban").is_none());

    let session = bot.gate.sessions().session("alice").expect("alice session");
    assert_eq!(session.message_count, 5);
    assert_eq!(bot.stop().await, 0);
}

#[tokio::test(start_paused = true)]
async fn integration_risky_messages_are_dropped_without_reply_or_session() {
    let harness = Harness::new();
    let mut bot = launch(gated_config(), &harness).await;

    say(&harness, "mallory", "BUY NOW CHEAP WATCHES HTTP://DEALS.EXAMPLE TODAY").await;
    assert_eq!(
        bot.next_record().await.outcome,
        DispatchOutcome::Dropped { risk_level: 3 }
    );

    say(&harness, "spammer", "/ping").await;
    assert_eq!(
        bot.next_record().await.outcome,
        DispatchOutcome::Dropped { risk_level: 5 }
    );

    let transport = harness.transport();
    assert!(transport.sent_texts_to("mallory").is_empty());
    assert!(transport.sent_texts_to("spammer").is_empty());
    assert_eq!(bot.gate.dropped_messages(), 2);
    assert!(bot.gate.sessions().session("mallory").is_none());
    assert!(harness.plugins.executed().is_empty());
    assert_eq!(bot.stop().await, 0);
}

#[tokio::test(start_paused = true)]
async fn integration_plain_and_voice_messages_follow_feature_toggles() {
    let harness = Harness::new();
    let mut bot = launch(gated_config(), &harness).await;

    say(&harness, "carol", "hello relay").await;
    assert_eq!(bot.next_record().await.outcome, DispatchOutcome::AiResponded);

    harness
        .transport()
        .emit(TransportEvent::VoiceMessage(VoiceMessage {
            id: "voice-1".to_string(),
            from: "carol".to_string(),
            mime_type: "audio/ogg".to_string(),
            audio: b"status".to_vec(),
        }))
        .await;
    assert_eq!(bot.next_record().await.outcome, DispatchOutcome::VoiceHandled);

    let sent = harness
        .transport()
        .sent_messages()
        .into_iter()
        .filter(|(identity, _)| identity == "carol")
        .map(|(_, payload)| payload)
        .collect::<Vec<_>>();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].text, "hello there");
    assert_eq!(sent[0].watermark.as_deref(), Some("relay-bot"));
    assert_eq!(sent[1].text, "heard: status");
    assert_eq!(harness.ai.responded(), 1);
    assert_eq!(bot.stop().await, 0);
}

#[tokio::test(start_paused = true)]
async fn integration_disabled_features_ignore_plain_and_voice_messages() {
    let harness = Harness::new();
    let config = BotConfig {
        ai_responder: false,
        voice_mode: false,
        ..gated_config()
    };
    let mut bot = launch(config, &harness).await;

    say(&harness, "dave", "anyone around?").await;
    assert_eq!(bot.next_record().await.outcome, DispatchOutcome::Ignored);

    harness
        .transport()
        .emit(TransportEvent::VoiceMessage(VoiceMessage {
            id: "voice-2".to_string(),
            from: "dave".to_string(),
            mime_type: "audio/ogg".to_string(),
            audio: b"status".to_vec(),
        }))
        .await;
    assert_eq!(bot.next_record().await.outcome, DispatchOutcome::VoiceDisabled);

    assert!(harness.transport().sent_texts_to("dave").is_empty());
    assert_eq!(harness.journal.count("ai.initialize"), 0);
    assert_eq!(bot.stop().await, 0);
}

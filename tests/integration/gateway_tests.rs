//! Gateway operations: session keys, reset, inspection, budgets.

use std::sync::Arc;

use session_runtime::config::{CountingPolicy, KeepPolicy, TriggerPolicy};
use session_runtime::gateway::{session_key, ChatRequest, SessionGateway};
use session_runtime::models::checkpoint::MilestoneValue;
use session_runtime::persistence::CheckpointStore;

use super::test_helpers::{gateway, request, test_config, EchoStep, FixedSummarizer};

#[test]
fn session_key_joins_prefix_user_and_conversation() {
    assert_eq!(session_key("bc", "alice", "c42"), "bc::alice::c42");
}

#[test]
fn conversation_defaults_when_omitted() {
    let parsed: ChatRequest =
        serde_json::from_str(r#"{"user_id":"alice","message":"hi"}"#).expect("request");
    assert_eq!(parsed.conversation_id, "default");
}

#[tokio::test]
async fn conversations_are_isolated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gw = gateway(test_config(dir.path()), EchoStep::default().shared());

    gw.chat(request("u1", "first"), None).await.expect("chat");
    let mut other = request("u1", "second");
    other.conversation_id = "c2".into();
    gw.chat(other, None).await.expect("chat");

    assert_eq!(
        gw.store().session_ids(),
        vec!["chat::u1::c2".to_owned(), "chat::u1::default".to_owned()]
    );
}

#[tokio::test]
async fn reset_removes_state_and_next_chat_starts_fresh() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gw = gateway(test_config(dir.path()), EchoStep::default().shared());

    gw.chat(request("u1", "one"), None).await.expect("chat");
    gw.chat(request("u1", "two"), None).await.expect("chat");
    assert_eq!(gw.inspect("u1", "default").await.message_count, 4);

    assert!(gw.reset("u1", "default").await);
    assert!(!gw.reset("u1", "default").await);
    assert!(!gw.locks().contains("chat::u1::default"));

    gw.chat(request("u1", "three"), None).await.expect("chat");
    assert_eq!(gw.inspect("u1", "default").await.message_count, 2);
}

#[tokio::test]
async fn reset_is_durable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let gw = gateway(config.clone(), EchoStep::default().shared());
    gw.chat(request("u1", "one"), None).await.expect("chat");
    assert!(gw.reset("u1", "default").await);

    let reopened = CheckpointStore::open(&config.store_path);
    assert!(reopened.is_empty());
}

#[tokio::test]
async fn inspect_reports_counters_and_milestones() {
    let dir = tempfile::tempdir().expect("tempdir");
    let step = EchoStep {
        actions: 2,
        ..EchoStep::default()
    };
    let gw = gateway(test_config(dir.path()), step.shared());

    let empty = gw.inspect("u1", "default").await;
    assert_eq!(empty.message_count, 0);
    assert!(empty.milestones.is_empty());

    gw.chat(request("u1", "do things"), None).await.expect("chat");
    let snapshot = gw.inspect("u1", "default").await;
    assert_eq!(snapshot.session_id, "chat::u1::default");
    assert_eq!(snapshot.action_count, 2);
    assert_eq!(snapshot.tokens_in, 10);
    assert_eq!(snapshot.tokens_out, 5);
    // user, assistant with calls, two results, reply
    assert_eq!(snapshot.message_count, 5);
    assert_eq!(
        snapshot.milestones.get("greeted"),
        Some(&MilestoneValue::Flag(true))
    );
    assert!(!snapshot.summarized);
}

#[tokio::test]
async fn action_cap_spans_steps_with_batch_overshoot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.accountant.max_actions = 3;
    let step = EchoStep {
        actions: 2,
        ..EchoStep::default()
    };
    let gw = gateway(config, step.shared());

    for message in ["a", "b", "c"] {
        gw.chat(request("u1", message), None).await.expect("chat");
    }
    // 2 + 2 (snapshot 2 < 3) + 0 (snapshot 4 >= 3)
    assert_eq!(gw.inspect("u1", "default").await.action_count, 4);

    let checkpoint = gw.store().get("chat::u1::default").expect("committed");
    let refusals = checkpoint
        .turns
        .iter()
        .filter(|turn| turn.text().starts_with("Action limit exceeded"))
        .count();
    assert_eq!(refusals, 2);
}

#[tokio::test]
async fn strict_action_cap_is_exact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.accountant.max_actions = 3;
    config.accountant.policy = CountingPolicy::Strict;
    let step = EchoStep {
        actions: 2,
        ..EchoStep::default()
    };
    let gw = gateway(config, step.shared());

    for message in ["a", "b", "c"] {
        gw.chat(request("u1", message), None).await.expect("chat");
    }
    assert_eq!(gw.inspect("u1", "default").await.action_count, 3);
}

#[tokio::test]
async fn history_is_compressed_once_over_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.budget.trigger = TriggerPolicy::Tokens(100);
    config.budget.keep = KeepPolicy::Turns(2);
    let gw = Arc::new(
        SessionGateway::builder(config, EchoStep::default().shared())
            .summarizer(Arc::new(FixedSummarizer))
            .build()
            .expect("gateway"),
    );

    for index in 0..6 {
        gw.chat(request("u1", &format!("message {index}")), None)
            .await
            .expect("chat");
    }

    let checkpoint = gw.store().get("chat::u1::default").expect("committed");
    assert!(checkpoint.is_summarized());
    assert!(checkpoint.turns[0]
        .text()
        .ends_with("earlier turns were greetings"));
    assert_eq!(
        checkpoint.turns.iter().filter(|turn| turn.is_summary()).count(),
        1
    );
    assert_eq!(
        checkpoint.turns.last().map(|turn| turn.text()),
        Some("echo: message 5".to_owned())
    );
    assert!(gw.inspect("u1", "default").await.summarized);
}

#[tokio::test]
async fn state_survives_gateway_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    {
        let gw = gateway(config.clone(), EchoStep::default().shared());
        gw.chat(request("u1", "remember me"), None).await.expect("chat");
    }

    let gw = gateway(config, EchoStep::default().shared());
    gw.chat(request("u1", "again"), None).await.expect("chat");
    let checkpoint = gw.store().get("chat::u1::default").expect("committed");
    assert_eq!(checkpoint.turns.len(), 4);
    assert_eq!(checkpoint.turns[0].text(), "remember me");
    assert_eq!(checkpoint.tokens_in, 20);
}

//! Blocking and streaming execution through the bridge.

use std::time::Duration;

use session_runtime::models::event::StreamEvent;
use session_runtime::models::turn::Role;
use session_runtime::AppError;

use super::test_helpers::{gateway, request, test_config, EchoStep};

#[tokio::test]
async fn blocking_chat_commits_turns_and_counters() {
    let dir = tempfile::tempdir().expect("tempdir");
    let gw = gateway(test_config(dir.path()), EchoStep::default().shared());

    let reply = gw.chat(request("u1", "hello"), None).await.expect("chat");
    assert_eq!(reply.session_id, "chat::u1::default");
    assert_eq!(reply.reply, "echo: hello");

    let checkpoint = gw.store().get("chat::u1::default").expect("committed");
    assert_eq!(checkpoint.turns.len(), 2);
    assert_eq!(checkpoint.turns[0].role, Role::User);
    assert_eq!(checkpoint.turns[1].text(), "echo: hello");
    assert_eq!(checkpoint.tokens_in, 10);
    assert_eq!(checkpoint.tokens_out, 5);
    assert!(checkpoint.milestone_flags.is_set("greeted"));
}

#[tokio::test]
async fn step_failure_commits_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let step = EchoStep {
        fail_with: Some(AppError::step("ModelError", "upstream 502")),
        ..EchoStep::default()
    };
    let gw = gateway(test_config(dir.path()), step.shared());

    let err = gw.chat(request("u1", "hello"), None).await.expect_err("fails");
    assert_eq!(err, AppError::step("ModelError", "upstream 502"));
    assert!(gw.store().get("chat::u1::default").is_none());
}

#[tokio::test]
async fn non_step_errors_are_reported_as_step_execution() {
    let dir = tempfile::tempdir().expect("tempdir");
    let step = EchoStep {
        fail_with: Some(AppError::Io("disk full".into())),
        ..EchoStep::default()
    };
    let gw = gateway(test_config(dir.path()), step.shared());

    let err = gw.chat(request("u1", "hello"), None).await.expect_err("fails");
    assert_eq!(err, AppError::step("IoError", "disk full"));
}

#[tokio::test]
async fn blocking_timeout_leaves_step_running_to_commit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let step = EchoStep {
        delay: Duration::from_millis(300),
        ..EchoStep::default()
    };
    let gw = gateway(test_config(dir.path()), step.shared());

    let err = gw
        .chat(request("u1", "slow"), Some(Duration::from_millis(50)))
        .await
        .expect_err("times out");
    assert!(matches!(err, AppError::StepTimeout { ref session_id, .. } if session_id == "chat::u1::default"));

    // The step finishes and persists on its own.
    let committed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(checkpoint) = gw.store().get("chat::u1::default") {
                return checkpoint;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("step committed after timeout");
    assert_eq!(committed.turns.len(), 2);

    // The lock was released: a follow-up request goes through.
    let reply = gw.chat(request("u1", "again"), None).await.expect("chat");
    assert_eq!(reply.reply, "echo: again");
}

#[tokio::test]
async fn inline_blocking_runs_to_completion_past_deadline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.bridge.allow_spawn = false;
    let step = EchoStep {
        delay: Duration::from_millis(100),
        ..EchoStep::default()
    };
    let gw = gateway(config, step.shared());

    let reply = gw
        .chat(request("u1", "inline"), Some(Duration::from_millis(10)))
        .await
        .expect("inline steps are not preempted");
    assert_eq!(reply.reply, "echo: inline");
}

fn assert_single_terminal(events: &[StreamEvent]) {
    let terminal = events.iter().filter(|event| event.is_terminal()).count();
    assert_eq!(terminal, 1, "{events:?}");
    assert!(events.last().is_some_and(StreamEvent::is_terminal));
}

#[tokio::test]
async fn streaming_emits_ordered_events_then_final() {
    let dir = tempfile::tempdir().expect("tempdir");
    let step = EchoStep {
        extra_deltas: 3,
        actions: 1,
        ..EchoStep::default()
    };
    let gw = gateway(test_config(dir.path()), step.shared());

    let events = gw.chat_stream(request("u1", "stream me")).collect().await;

    assert_single_terminal(&events);
    assert_eq!(
        events[0],
        StreamEvent::Progress {
            message: "thinking".into()
        }
    );
    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Delta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["chunk0 ", "chunk1 ", "chunk2 ", "echo: stream me"]);
    assert!(events.contains(&StreamEvent::Progress {
        message: "Running tool0...".into()
    }));
    assert!(events.contains(&StreamEvent::Progress {
        message: "Finished tool0".into()
    }));
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Final {
            text: "echo: stream me".into()
        })
    );

    let checkpoint = gw.store().get("chat::u1::default").expect("committed");
    assert_eq!(checkpoint.action_count, 1);
    // user, assistant with call, action result, assistant reply
    assert_eq!(checkpoint.turns.len(), 4);
}

#[tokio::test]
async fn inline_streaming_preserves_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.bridge.allow_spawn = false;
    let step = EchoStep {
        extra_deltas: 150,
        ..EchoStep::default()
    };
    let gw = gateway(config, step.shared());

    let events = gw.chat_stream(request("u1", "inline")).collect().await;

    assert_single_terminal(&events);
    let deltas: Vec<String> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Delta { text } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas.len(), 151);
    assert_eq!(deltas[0], "chunk0 ");
    assert_eq!(deltas[149], "chunk149 ");
    assert_eq!(
        events.last(),
        Some(&StreamEvent::Final {
            text: "echo: inline".into()
        })
    );
}

#[tokio::test]
async fn streaming_failure_ends_with_error_event() {
    let dir = tempfile::tempdir().expect("tempdir");
    let step = EchoStep {
        fail_with: Some(AppError::step("ModelError", "context overflow")),
        ..EchoStep::default()
    };
    let gw = gateway(test_config(dir.path()), step.shared());

    let events = gw.chat_stream(request("u1", "boom")).collect().await;
    assert_single_terminal(&events);
    let Some(StreamEvent::Error { detail }) = events.last() else {
        panic!("expected error event, got {events:?}");
    };
    assert_eq!(detail.error_type, "ModelError");
    assert_eq!(detail.error_message, "context overflow");
    assert_eq!(detail.session_id, "chat::u1::default");
    assert!(!events
        .iter()
        .any(|event| matches!(event, StreamEvent::Final { .. })));
}

#[tokio::test]
async fn stalled_consumer_cancels_producer_without_commit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.bridge.send_timeout_seconds = 1;
    let step = EchoStep {
        extra_deltas: 150,
        ..EchoStep::default()
    };
    let gw = gateway(config, step.shared());

    let stream = gw.chat_stream(request("u1", "flood"));
    // Do not read: the channel fills at 100 and the producer times out.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let events = stream.collect().await;
    assert_single_terminal(&events);
    let Some(StreamEvent::Error { detail }) = events.last() else {
        panic!("expected cancellation, got {:?}", events.last());
    };
    assert_eq!(detail.error_type, "Cancelled");
    assert!(gw.store().get("chat::u1::default").is_none());

    // A retry commits exactly one user turn and one reply.
    let retry = gw.chat_stream(request("u1", "flood")).collect().await;
    assert!(matches!(retry.last(), Some(StreamEvent::Final { .. })));
    let checkpoint = gw.store().get("chat::u1::default").expect("committed");
    assert_eq!(checkpoint.turns.len(), 2);
    assert_eq!(checkpoint.turns[0].text(), "flood");
}

#[tokio::test]
async fn dropped_stream_abandons_step() {
    let dir = tempfile::tempdir().expect("tempdir");
    let step = EchoStep {
        extra_deltas: 150,
        ..EchoStep::default()
    };
    let gw = gateway(test_config(dir.path()), step.shared());

    let mut stream = gw.chat_stream(request("u1", "bye"));
    let first = stream.next().await.expect("first event");
    assert!(!first.is_terminal());
    drop(stream);

    // Wait for the producer to observe the closed channel and release the lock.
    let snapshot = tokio::time::timeout(Duration::from_secs(2), gw.inspect("u1", "default"))
        .await
        .expect("lock released");
    assert_eq!(snapshot.message_count, 0);
}

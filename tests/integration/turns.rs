//! Turn lifecycle tests.
//!
//! Tests cover:
//! - Generation tickets rejecting late completions
//! - Processing state matching the open turn
//! - Queueing behind an open turn
//! - Independence between sessions

use super::fixtures::{text, Reply, TestHub};

use polyphon::session::MessageRole;
use polyphon::turn::{SessionEvent, Submission};
use polyphon::{Error, TransportEvent, TurnOutcome};

/// Test: A late completion from an aborted turn is ignored
///
/// Given: A turn that was aborted and replaced by a new turn
/// When: The old turn's completion arrives
/// Then: The new turn stays open and only its own ticket can close it
#[tokio::test]
async fn test_late_completion_does_not_clear_newer_turn() {
    let mut t = TestHub::new(&["alpha"]).await;
    t.transport.script("alpha", [Reply::Hang, Reply::Hang]);

    let first = t.hub.begin_turn("alpha", "first").await.unwrap();
    assert!(t.hub.abort("alpha").await.unwrap());
    assert_eq!(first.outcome().await.unwrap(), TurnOutcome::Cancelled);

    let second = t.hub.begin_turn("alpha", "second").await.unwrap();
    assert!(second.ticket > 1);

    let late = TurnOutcome::Completed {
        response: "stale".to_string(),
    };
    assert!(!t.hub.complete_turn("alpha", 1, late).await.unwrap());
    let record = t.hub.snapshot("alpha").await.unwrap();
    assert!(record.is_processing());
    assert!(record.processing_started_at().is_some());

    let current = TurnOutcome::Completed {
        response: "fresh".to_string(),
    };
    assert!(t.hub.complete_turn("alpha", second.ticket, current.clone()).await.unwrap());
    assert_eq!(second.outcome().await.unwrap(), current);
    assert!(!t.hub.snapshot("alpha").await.unwrap().is_processing());

    t.wait_for(|e| matches!(e, SessionEvent::StaleEventIgnored { ticket: 1, .. }))
        .await;
}

/// Test: Processing state follows the turn across its lifecycle
///
/// Given: A session with a streamed turn that uses a tool
/// When: The turn completes
/// Then: The transcript records each part and every turn field is cleared
#[tokio::test]
async fn test_streamed_turn_with_tools() {
    let t = TestHub::new(&["alpha"]).await;
    t.transport.script(
        "alpha",
        [Reply::Events(vec![
            TransportEvent::Reasoning("thinking".to_string()),
            TransportEvent::ToolStart {
                name: "grep".to_string(),
            },
            TransportEvent::ToolEnd {
                name: "grep".to_string(),
                output: Some("3 matches".to_string()),
            },
            TransportEvent::Content("Found ".to_string()),
            TransportEvent::Content("three".to_string()),
            TransportEvent::TurnIdle,
        ])],
    );

    let response = t.hub.send_prompt("alpha", "search").await.unwrap();
    assert_eq!(response, "Found three");

    let record = t.hub.snapshot("alpha").await.unwrap();
    assert!(!record.is_processing());
    assert!(record.processing_started_at().is_none());
    assert_eq!(record.active_tool_calls(), 0);
    assert!(!record.has_used_tools_this_turn());

    let roles: Vec<MessageRole> = record.transcript().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::User,
            MessageRole::Reasoning,
            MessageRole::Tool,
            MessageRole::Tool,
            MessageRole::Assistant,
        ]
    );
    assert_eq!(record.last_response(), Some("Found three"));
}

/// Test: A transport failure ends the turn with an error
///
/// Given: A transport that refuses the prompt
/// When: A prompt is sent
/// Then: The caller sees a turn failure and the session is idle again
#[tokio::test]
async fn test_transport_failure_fails_turn() {
    let t = TestHub::new(&["alpha"]).await;
    t.transport
        .script("alpha", [Reply::Fail("connection refused".to_string())]);

    let err = t.hub.send_prompt("alpha", "hi").await.unwrap_err();
    assert!(err.is_turn_failure());
    let record = t.hub.snapshot("alpha").await.unwrap();
    assert!(!record.is_processing());
    let last = record.transcript().last().unwrap();
    assert!(last.is_system());
    assert!(last.content.contains("connection refused"));

    assert_eq!(t.hub.send_prompt("alpha", "again").await.unwrap(), "alpha ok");
}

/// Test: Prompts submitted during a turn wait their turn
///
/// Given: A session with an open turn
/// When: Two more prompts are submitted and the open turn completes
/// Then: The queued prompts are sent in order
#[tokio::test]
async fn test_queue_drains_in_order() {
    let mut t = TestHub::new(&["alpha"]).await;
    t.transport
        .script("alpha", [Reply::Hang, text("second done"), text("third done")]);

    let first = match t.hub.submit("alpha", "first").await.unwrap() {
        Submission::Started(turn) => turn,
        other => panic!("expected a started turn, got {:?}", other),
    };
    assert!(matches!(
        t.hub.submit("alpha", "second").await.unwrap(),
        Submission::Queued { depth: 1 }
    ));
    assert!(matches!(
        t.hub.submit("alpha", "third").await.unwrap(),
        Submission::Queued { depth: 2 }
    ));

    let done = TurnOutcome::Completed {
        response: "first done".to_string(),
    };
    assert!(t.hub.complete_turn("alpha", first.ticket, done).await.unwrap());

    // first, then the two drained prompts
    for _ in 0..3 {
        t.wait_for(|e| matches!(e, SessionEvent::TurnCompleted { .. }))
            .await;
    }
    assert_eq!(
        t.transport.prompts_for("alpha"),
        vec!["first", "second", "third"]
    );
    let record = t.hub.snapshot("alpha").await.unwrap();
    assert!(record.queue().is_empty());
    assert_eq!(record.last_response(), Some("third done"));
}

/// Test: Abort clears the queue and is idempotent
///
/// Given: A session with an open turn and a queued prompt
/// When: It is aborted twice
/// Then: The first abort clears everything and the second is a no-op
#[tokio::test]
async fn test_abort_clears_queue() {
    let t = TestHub::new(&["alpha"]).await;
    t.transport.script("alpha", [Reply::Hang]);

    let turn = t.hub.begin_turn("alpha", "long job").await.unwrap();
    t.hub.submit("alpha", "follow up").await.unwrap();

    assert!(t.hub.abort("alpha").await.unwrap());
    assert!(!t.hub.abort("alpha").await.unwrap());
    assert_eq!(turn.outcome().await.unwrap(), TurnOutcome::Cancelled);

    let record = t.hub.snapshot("alpha").await.unwrap();
    assert!(!record.is_processing());
    assert!(record.queue().is_empty());
    t.wait_for_transport_abort("alpha").await;
    assert_eq!(t.transport.prompts_for("alpha"), vec!["long job"]);
}

/// Test: Sessions do not affect each other
///
/// Given: Two sessions with open turns
/// When: One is aborted
/// Then: The other turn still completes normally
#[tokio::test]
async fn test_sessions_are_independent() {
    let t = TestHub::new(&["alpha", "beta"]).await;
    t.transport.script("alpha", [Reply::Hang]);
    t.transport.script("beta", [Reply::Hang]);

    let _alpha = t.hub.begin_turn("alpha", "a").await.unwrap();
    let beta = t.hub.begin_turn("beta", "b").await.unwrap();
    t.hub.abort("alpha").await.unwrap();

    assert!(t.hub.snapshot("beta").await.unwrap().is_processing());
    let done = TurnOutcome::Completed {
        response: "beta done".to_string(),
    };
    assert!(t.hub.complete_turn("beta", beta.ticket, done).await.unwrap());
    assert_eq!(beta.response("beta").await.unwrap(), "beta done");
}

/// Test: A second begin on a busy session is rejected
///
/// Given: A session with an open turn on a real transport
/// When: Another turn is begun directly
/// Then: It fails without disturbing the open turn
#[tokio::test]
async fn test_begin_while_processing_rejected() {
    let t = TestHub::new(&["alpha"]).await;
    t.transport.script("alpha", [Reply::Hang]);

    let open = t.hub.begin_turn("alpha", "one").await.unwrap();
    let err = t.hub.begin_turn("alpha", "two").await.unwrap_err();
    assert!(matches!(err, Error::AlreadyProcessing(_)));

    let record = t.hub.snapshot("alpha").await.unwrap();
    assert!(record.is_processing());
    assert_eq!(record.generation(), open.ticket);
}

/// Test: Unknown sessions are reported
#[tokio::test]
async fn test_unknown_session() {
    let t = TestHub::new(&[]).await;
    assert!(matches!(
        t.hub.send_prompt("ghost", "hi").await,
        Err(Error::SessionNotFound(_))
    ));
    assert!(matches!(
        t.hub.abort("ghost").await,
        Err(Error::SessionNotFound(_))
    ));
}

/// Test: A caller deadline aborts a hung turn
///
/// Given: A session whose agent never answers
/// When: A prompt is sent with a short deadline
/// Then: The call times out and the session is left idle
#[tokio::test]
async fn test_send_prompt_within_deadline() {
    let t = TestHub::new(&["alpha"]).await;
    t.transport.script("alpha", [Reply::Hang]);

    let err = t
        .hub
        .send_prompt_within("alpha", "hello?", std::time::Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(!t.hub.snapshot("alpha").await.unwrap().is_processing());
    t.wait_for_transport_abort("alpha").await;

    let reply = t
        .hub
        .send_prompt_within("alpha", "again", std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, "alpha ok");
}

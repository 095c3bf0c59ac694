//! Watchdog recovery tests.
//!
//! Tests cover:
//! - Recovering a silent turn through the abort path
//! - The longer timeout for tool use, multi-agent members and resumed turns
//! - The periodic actor end to end

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use super::fixtures::{Reply, TestHub};

use polyphon::actors::WatchdogActor;
use polyphon::config::WatchdogSettings;
use polyphon::turn::SessionEvent;
use polyphon::{GroupMode, MemberRole, Organization, TransportEvent, TurnOutcome};

fn settings() -> WatchdogSettings {
    WatchdogSettings {
        check_interval_secs: 15,
        inactivity_timeout_secs: 120,
        tool_timeout_secs: 600,
    }
}

fn later(secs: i64) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(secs)
}

/// Test: A silent turn is recovered after the base timeout
///
/// Given: A session whose agent never answers
/// When: The watchdog scans after the inactivity timeout
/// Then: The turn is cancelled, a notice is posted and the transport is aborted
#[tokio::test]
async fn test_silent_turn_recovered() {
    let mut t = TestHub::new(&["alpha", "beta"]).await;
    t.transport.script("alpha", [Reply::Hang]);

    let turn = t.hub.begin_turn("alpha", "hello?").await.unwrap();

    let early = t
        .hub
        .watchdog_scan(later(60), settings(), HashSet::new())
        .await
        .unwrap();
    assert!(early.is_empty());

    let recovered = t
        .hub
        .watchdog_scan(later(200), settings(), HashSet::new())
        .await
        .unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].session, "alpha");
    assert_eq!(recovered[0].timeout, Duration::from_secs(120));

    assert_eq!(turn.outcome().await.unwrap(), TurnOutcome::Cancelled);
    let record = t.hub.snapshot("alpha").await.unwrap();
    assert!(!record.is_processing());
    assert!(record.processing_started_at().is_none());
    let notice = record.transcript().last().unwrap();
    assert!(notice.is_system());
    assert!(notice.content.contains("limit 120s"));

    t.wait_for_transport_abort("alpha").await;
    t.wait_for(|e| matches!(e, SessionEvent::WatchdogRecovered { session, .. } if session == "alpha"))
        .await;

    // The recovered session takes new prompts
    assert_eq!(t.hub.send_prompt("alpha", "again").await.unwrap(), "alpha ok");
}

/// Test: Tool use earns the longer timeout
///
/// Given: A silent turn that started a tool call
/// When: The watchdog scans past the base timeout but before the tool timeout
/// Then: The turn is left alone until the tool timeout passes
#[tokio::test]
async fn test_tool_activity_extends_timeout() {
    let t = TestHub::new(&["alpha"]).await;
    t.transport.script(
        "alpha",
        [Reply::Events(vec![TransportEvent::ToolStart {
            name: "cargo".to_string(),
        }])],
    );

    t.hub.begin_turn("alpha", "build").await.unwrap();
    // Let the pump deliver the tool start
    for _ in 0..100 {
        if t.hub.snapshot("alpha").await.unwrap().active_tool_calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(t.hub.snapshot("alpha").await.unwrap().active_tool_calls(), 1);

    let recovered = t
        .hub
        .watchdog_scan(later(200), settings(), HashSet::new())
        .await
        .unwrap();
    assert!(recovered.is_empty());
    assert!(t.hub.snapshot("alpha").await.unwrap().is_processing());

    let recovered = t
        .hub
        .watchdog_scan(later(700), settings(), HashSet::new())
        .await
        .unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].timeout, Duration::from_secs(600));
}

/// Test: Multi-agent members get the longer timeout
///
/// Given: Two silent sessions, one in an orchestrated group
/// When: The watchdog scans past the base timeout
/// Then: Only the standalone session is recovered
#[tokio::test]
async fn test_multi_agent_member_gets_tool_timeout() {
    let t = TestHub::new(&["lead", "solo"]).await;
    t.transport.script("lead", [Reply::Hang]);
    t.transport.script("solo", [Reply::Hang]);

    let mut org = Organization::new();
    let id = org.create_group("team", GroupMode::Orchestrator, true);
    org.add_member(id, "lead", MemberRole::Orchestrator).unwrap();

    t.hub.begin_turn("lead", "plan").await.unwrap();
    t.hub.begin_turn("solo", "chat").await.unwrap();

    let recovered = t
        .hub
        .watchdog_scan(later(200), settings(), org.multi_agent_sessions())
        .await
        .unwrap();
    let names: Vec<&str> = recovered.iter().map(|s| s.session.as_str()).collect();
    assert_eq!(names, vec!["solo"]);
    assert!(t.hub.snapshot("lead").await.unwrap().is_processing());
}

/// Test: A turn resumed after restart gets the longer timeout
///
/// Given: A session persisted mid-turn and restored into a fresh hub
/// When: The watchdog scans past the base timeout, then past the tool timeout
/// Then: It survives the first scan, is recovered by the second, and the
///       resumed flag is cleared
#[tokio::test]
async fn test_resumed_turn_gets_tool_timeout() {
    let before = TestHub::new(&["alpha"]).await;
    before.transport.script("alpha", [Reply::Hang]);
    before.hub.begin_turn("alpha", "long job").await.unwrap();
    let persisted = before.hub.snapshot("alpha").await.unwrap();
    assert!(persisted.is_processing());
    before.hub.shutdown();

    let after = TestHub::new(&[]).await;
    after.hub.restore_session(persisted.clone()).await.unwrap();
    let record = after.hub.snapshot("alpha").await.unwrap();
    assert!(record.is_resumed());
    assert!(record.generation() > persisted.generation());

    let recovered = after
        .hub
        .watchdog_scan(later(200), settings(), HashSet::new())
        .await
        .unwrap();
    assert!(recovered.is_empty());

    let recovered = after
        .hub
        .watchdog_scan(later(700), settings(), HashSet::new())
        .await
        .unwrap();
    assert_eq!(recovered.len(), 1);
    let record = after.hub.snapshot("alpha").await.unwrap();
    assert!(!record.is_processing());
    assert!(!record.is_resumed());
}

/// Test: The periodic actor recovers a hung turn on its own
///
/// Given: A watchdog actor ticking every 100ms with a 2s base timeout
/// When: A turn hangs
/// Then: A recovery event arrives without any manual scan
#[tokio::test]
async fn test_actor_recovers_hung_turn() {
    let mut t = TestHub::new(&["alpha"]).await;
    t.transport.script("alpha", [Reply::Hang]);
    let tight = WatchdogSettings {
        check_interval_secs: 1,
        inactivity_timeout_secs: 2,
        tool_timeout_secs: 3,
    };
    let handle = WatchdogActor::new(t.hub.clone(), Arc::new(RwLock::new(Organization::new())), tight)
        .with_interval(Duration::from_millis(100))
        .spawn()
        .unwrap();

    let turn = t.hub.begin_turn("alpha", "hello?").await.unwrap();
    t.wait_for(|e| matches!(e, SessionEvent::WatchdogRecovered { .. }))
        .await;
    assert_eq!(turn.outcome().await.unwrap(), TurnOutcome::Cancelled);
    handle.shutdown();
    assert!(handle.is_cancelled());
}

//! Group orchestration tests.
//!
//! Tests cover:
//! - Broadcast fan-out and its concurrency
//! - Sequential chains and halting
//! - Orchestrator planning, delegation and synthesis

use std::time::Duration;

use super::fixtures::{text, Reply, ScriptedTransport, TestTeam};

use polyphon::config::ReflectionSettings;
use polyphon::orchestration::RunReport;
use polyphon::{Error, GroupMode};

/// Test: Broadcast sends the prompt to every member
///
/// Given: A broadcast group of three sessions
/// When: A prompt is run through the group
/// Then: Each member answers independently
#[tokio::test]
async fn test_broadcast_reaches_every_member() {
    let team = TestTeam::new(
        ScriptedTransport::new(),
        GroupMode::Broadcast,
        None,
        &["a", "b", "c"],
        ReflectionSettings::default(),
    )
    .await;

    let report = team.coordinator.run(team.group, "status?").await.unwrap();
    let RunReport::Broadcast(responses) = report else {
        panic!("expected a broadcast report");
    };
    assert_eq!(responses.len(), 3);
    for response in &responses {
        assert_eq!(
            response.result.as_deref().unwrap(),
            format!("{} ok", response.session)
        );
        assert_eq!(team.transport().prompts_for(&response.session), vec!["status?"]);
    }
}

/// Test: One failing member does not spoil a broadcast
///
/// Given: A broadcast group where one member's transport fails
/// When: A prompt is run through the group
/// Then: The others still answer and the failure is reported per member
#[tokio::test]
async fn test_broadcast_reports_member_failure() {
    let transport = ScriptedTransport::new();
    transport.script("b", [Reply::Fail("agent crashed".to_string())]);
    let team = TestTeam::new(
        transport,
        GroupMode::Broadcast,
        None,
        &["a", "b"],
        ReflectionSettings::default(),
    )
    .await;

    let RunReport::Broadcast(responses) = team.coordinator.run(team.group, "go").await.unwrap()
    else {
        panic!("expected a broadcast report");
    };
    let ok: Vec<bool> = responses.iter().map(|r| r.is_ok()).collect();
    assert_eq!(ok, vec![true, false]);
}

/// Test: A hung member does not hold up the rest of a broadcast
///
/// Given: A broadcast group whose middle member never answers
/// When: A prompt is run through the group for a bounded time
/// Then: The members on either side are prompted and answer while the
///       hung member is still processing
#[tokio::test]
async fn test_broadcast_runs_members_concurrently() {
    let transport = ScriptedTransport::new();
    transport.script("b", [Reply::Hang]);
    let team = TestTeam::new(
        transport,
        GroupMode::Broadcast,
        None,
        &["a", "b", "c"],
        ReflectionSettings::default(),
    )
    .await;

    let run = team.coordinator.run(team.group, "status?");
    assert!(tokio::time::timeout(Duration::from_millis(500), run).await.is_err());

    for name in ["a", "b", "c"] {
        assert_eq!(team.transport().prompts_for(name), vec!["status?"]);
    }
    let hub = &team.hub.hub;
    assert_eq!(hub.snapshot("a").await.unwrap().last_response(), Some("a ok"));
    assert_eq!(hub.snapshot("c").await.unwrap().last_response(), Some("c ok"));
    assert!(hub.snapshot("b").await.unwrap().is_processing());
}

/// Test: Delegated tasks run on their workers at the same time
///
/// Given: An orchestrator plan whose first worker never answers
/// When: The group runs for a bounded time
/// Then: The second worker still receives and finishes its task
#[tokio::test]
async fn test_delegation_runs_workers_concurrently() {
    let transport = ScriptedTransport::new();
    transport.script(
        "lead",
        [text(
            "@worker:slow\nIndex the repository\n@end\n\
             @worker:fast\nWrite the changelog\n@end",
        )],
    );
    transport.script("slow", [Reply::Hang]);
    transport.script("fast", [text("changelog written")]);
    let team = TestTeam::new(
        transport,
        GroupMode::Orchestrator,
        Some("lead"),
        &["slow", "fast"],
        ReflectionSettings::default(),
    )
    .await;

    let run = team.coordinator.run(team.group, "Prepare the release");
    assert!(tokio::time::timeout(Duration::from_millis(500), run).await.is_err());

    assert_eq!(
        team.transport().prompts_for("slow"),
        vec!["Index the repository"]
    );
    assert_eq!(
        team.transport().prompts_for("fast"),
        vec!["Write the changelog"]
    );
    let hub = &team.hub.hub;
    assert_eq!(
        hub.snapshot("fast").await.unwrap().last_response(),
        Some("changelog written")
    );
    assert!(hub.snapshot("slow").await.unwrap().is_processing());
    // Synthesis waits for every worker
    assert_eq!(team.transport().prompts_for("lead").len(), 1);
}

/// Test: A sequential chain forwards each output to the next member
///
/// Given: A sequential group of three members
/// When: A prompt is run through the group
/// Then: Each member sees its predecessor's response
#[tokio::test]
async fn test_sequential_chain_forwards_output() {
    let transport = ScriptedTransport::new();
    transport.script("drafter", [text("rough draft")]);
    transport.script("editor", [text("edited draft")]);
    transport.script("reviewer", [text("approved")]);
    let team = TestTeam::new(
        transport,
        GroupMode::Sequential,
        None,
        &["drafter", "editor", "reviewer"],
        ReflectionSettings::default(),
    )
    .await;

    let RunReport::Sequential(steps) = team.coordinator.run(team.group, "Write a memo").await.unwrap()
    else {
        panic!("expected a sequential report");
    };
    let sessions: Vec<&str> = steps.iter().map(|s| s.session.as_str()).collect();
    assert_eq!(sessions, vec!["drafter", "editor", "reviewer"]);
    assert_eq!(steps[2].response, "approved");

    assert_eq!(team.transport().prompts_for("drafter"), vec!["Write a memo"]);
    let editor_prompt = &team.transport().prompts_for("editor")[0];
    assert!(editor_prompt.starts_with("Write a memo"));
    assert!(editor_prompt.contains("rough draft"));
    assert!(team.transport().prompts_for("reviewer")[0].contains("edited draft"));
}

/// Test: A failing member halts the chain
///
/// Given: A sequential group whose middle member fails
/// When: A prompt is run through the group
/// Then: The error names that member and later members are never prompted
#[tokio::test]
async fn test_sequential_chain_halts_on_failure() {
    let transport = ScriptedTransport::new();
    transport.script("editor", [Reply::Fail("timeout".to_string())]);
    let team = TestTeam::new(
        transport,
        GroupMode::Sequential,
        None,
        &["drafter", "editor", "reviewer"],
        ReflectionSettings::default(),
    )
    .await;

    let err = team.coordinator.run(team.group, "Write").await.unwrap_err();
    match err {
        Error::ChainHalted { member, source } => {
            assert_eq!(member, "editor");
            assert!(source.is_turn_failure());
        }
        other => panic!("expected ChainHalted, got {:?}", other),
    }
    assert!(team.transport().prompts_for("reviewer").is_empty());
}

/// Test: The orchestrator delegates to workers and synthesizes their results
///
/// Given: An orchestrator whose plan names workers loosely and one unknown worker
/// When: A prompt is run through the group
/// Then: Known workers get their tasks (with persona), the unknown one is
///       dropped, and the synthesis sees every result
#[tokio::test]
async fn test_orchestrator_delegates_and_synthesizes() {
    let transport = ScriptedTransport::new();
    transport.script(
        "lead",
        [
            text(
                "Plan:\n@worker:FRONTEND\nBuild the login form\n@end\n\
                 @worker:ghost\nHaunt the house\n@end\n\
                 @worker:back:\nAdd the session endpoint\n@end",
            ),
            text("Login feature complete"),
        ],
    );
    transport.script("frontend", [text("form done")]);
    transport.script("backend", [text("endpoint done")]);
    let team = TestTeam::new(
        transport,
        GroupMode::Orchestrator,
        Some("lead"),
        &["frontend", "backend"],
        ReflectionSettings::default(),
    )
    .await;
    team.organization
        .write()
        .await
        .set_persona("frontend", Some("You are a careful UI engineer."))
        .unwrap();

    let RunReport::Orchestrated(round) = team.coordinator.run(team.group, "Add login").await.unwrap()
    else {
        panic!("expected an orchestrated report");
    };

    let workers: Vec<&str> = round.assignments.iter().map(|a| a.worker.as_str()).collect();
    assert_eq!(workers, vec!["frontend", "backend"]);
    assert_eq!(round.results.len(), 2);
    assert!(round.results.iter().all(|r| r.is_ok()));
    assert_eq!(round.synthesis, "Login feature complete");

    let frontend_prompt = &team.transport().prompts_for("frontend")[0];
    assert!(frontend_prompt.starts_with("You are a careful UI engineer."));
    assert!(frontend_prompt.contains("Build the login form"));
    assert_eq!(
        team.transport().prompts_for("backend"),
        vec!["Add the session endpoint"]
    );

    let lead_prompts = team.transport().prompts_for("lead");
    assert_eq!(lead_prompts.len(), 2);
    assert!(lead_prompts[0].contains("- frontend"));
    assert!(lead_prompts[0].contains("- backend"));
    assert!(lead_prompts[1].contains("form done"));
    assert!(lead_prompts[1].contains("endpoint done"));
}

/// Test: A plan with no delegation is the answer
///
/// Given: An orchestrator that answers directly
/// When: A prompt is run through the group
/// Then: No worker is prompted and the plan is returned as the synthesis
#[tokio::test]
async fn test_orchestrator_answers_directly() {
    let transport = ScriptedTransport::new();
    transport.script("lead", [text("Nothing to delegate: the answer is 42.")]);
    let team = TestTeam::new(
        transport,
        GroupMode::Orchestrator,
        Some("lead"),
        &["worker"],
        ReflectionSettings::default(),
    )
    .await;

    let RunReport::Orchestrated(round) = team.coordinator.run(team.group, "6 * 7?").await.unwrap()
    else {
        panic!("expected an orchestrated report");
    };
    assert!(round.assignments.is_empty());
    assert_eq!(round.synthesis, "Nothing to delegate: the answer is 42.");
    assert!(team.transport().prompts_for("worker").is_empty());
}

/// Test: Orchestrated modes require an orchestrator
#[tokio::test]
async fn test_orchestrator_mode_without_orchestrator() {
    let team = TestTeam::new(
        ScriptedTransport::new(),
        GroupMode::Orchestrator,
        None,
        &["a", "b"],
        ReflectionSettings::default(),
    )
    .await;

    let err = team.coordinator.run(team.group, "go").await.unwrap_err();
    assert!(matches!(err, Error::NoOrchestrator(_)));
}

/// Test: An empty group is rejected
#[tokio::test]
async fn test_empty_group_rejected() {
    let team = TestTeam::new(
        ScriptedTransport::new(),
        GroupMode::Broadcast,
        None,
        &[],
        ReflectionSettings::default(),
    )
    .await;

    let err = team.coordinator.run(team.group, "anyone?").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

//! Drives a group of sessions according to its [`GroupMode`].
//!
//! All four modes are dispatched from [`Coordinator::run`]. Broadcast and
//! delegated work fan out concurrently; sequential chains and reflection
//! iterations are strictly ordered.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::ReflectionSettings;
use crate::reflection::{
    build_evaluator_prompt, build_follow_up_prompt, build_initial_prompt, parse_evaluation,
    ReflectionCycle, ReflectionDecision,
};
use crate::turn::SessionHub;
use crate::util::preview;
use crate::{plog, plog_debug, plog_warn, Error, Result};

use super::group::{Group, GroupId, GroupMode, Member, Organization};
use super::tasks::{parse_task_assignments, TaskAssignment};

const DEFAULT_ORCHESTRATOR_PROMPT: &str =
    "You coordinate a team of worker agents. Break the request into focused tasks and delegate them.";

/// One member's answer in a fan-out.
#[derive(Debug)]
pub struct MemberResponse {
    pub session: String,
    pub result: Result<String>,
}

impl MemberResponse {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// One member's answer in a sequential chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStep {
    pub session: String,
    pub response: String,
}

/// Plan, delegated work, and synthesis of one orchestrated round.
#[derive(Debug)]
pub struct OrchestrationRound {
    pub plan: String,
    pub assignments: Vec<TaskAssignment>,
    pub results: Vec<MemberResponse>,
    /// The orchestrator's final answer. Equals `plan` when nothing was delegated.
    pub synthesis: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectionOutcome {
    GoalMet,
    Stalled,
    BudgetExhausted,
    Stopped,
    /// Paused between iterations; run again after resuming.
    Paused,
    /// A newer cycle replaced this one while it was running.
    Superseded,
}

impl From<ReflectionDecision> for ReflectionOutcome {
    fn from(decision: ReflectionDecision) -> Self {
        match decision {
            ReflectionDecision::GoalMet => ReflectionOutcome::GoalMet,
            ReflectionDecision::Stalled => ReflectionOutcome::Stalled,
            ReflectionDecision::BudgetExhausted => ReflectionOutcome::BudgetExhausted,
            ReflectionDecision::Continue | ReflectionDecision::Stopped => ReflectionOutcome::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionReport {
    pub cycle_id: Uuid,
    pub outcome: ReflectionOutcome,
    pub iterations: u32,
    pub summary: String,
    pub final_response: Option<String>,
}

#[derive(Debug)]
pub enum RunReport {
    Broadcast(Vec<MemberResponse>),
    Sequential(Vec<ChainStep>),
    Orchestrated(OrchestrationRound),
    Reflected(ReflectionReport),
}

pub struct Coordinator {
    hub: SessionHub,
    organization: Arc<RwLock<Organization>>,
    settings: ReflectionSettings,
}

impl Coordinator {
    pub fn new(
        hub: SessionHub,
        organization: Arc<RwLock<Organization>>,
        settings: ReflectionSettings,
    ) -> Self {
        Self {
            hub,
            organization,
            settings,
        }
    }

    pub fn organization(&self) -> &Arc<RwLock<Organization>> {
        &self.organization
    }

    async fn snapshot(&self, group_id: GroupId) -> Result<(Group, Vec<Member>)> {
        let org = self.organization.read().await;
        let group = org
            .group(group_id)
            .cloned()
            .ok_or_else(|| Error::GroupNotFound(group_id.to_string()))?;
        let members: Vec<Member> = org.members_of(group_id).into_iter().cloned().collect();
        if members.is_empty() {
            return Err(Error::Validation(format!("group '{}' has no members", group.name)));
        }
        Ok((group, members))
    }

    /// Run `prompt` through the group according to its mode.
    pub async fn run(&self, group_id: GroupId, prompt: &str) -> Result<RunReport> {
        let (group, members) = self.snapshot(group_id).await?;
        plog!(
            "Coordinator run: group={} mode={} members={}",
            group.name,
            group.mode,
            members.len()
        );

        match group.mode {
            GroupMode::Broadcast => Ok(RunReport::Broadcast(self.broadcast(&members, prompt).await)),
            GroupMode::Sequential => Ok(RunReport::Sequential(self.sequential(&members, prompt).await?)),
            GroupMode::Orchestrator => Ok(RunReport::Orchestrated(
                self.orchestrate(&group, &members, prompt).await?,
            )),
            GroupMode::OrchestratorReflect => {
                Ok(RunReport::Reflected(self.reflect(group_id, prompt).await?))
            }
        }
    }

    async fn broadcast(&self, members: &[Member], prompt: &str) -> Vec<MemberResponse> {
        join_all(members.iter().map(|member| async move {
            MemberResponse {
                session: member.session.clone(),
                result: self.hub.send_prompt(&member.session, prompt).await,
            }
        }))
        .await
    }

    async fn sequential(&self, members: &[Member], prompt: &str) -> Result<Vec<ChainStep>> {
        let mut steps: Vec<ChainStep> = Vec::with_capacity(members.len());
        for member in members {
            let input = match steps.last() {
                Some(previous) => chain_prompt(prompt, previous),
                None => prompt.to_string(),
            };
            let response = self
                .hub
                .send_prompt(&member.session, &input)
                .await
                .map_err(|e| {
                    plog_warn!("Sequential chain halted at '{}': {}", member.session, e);
                    Error::ChainHalted {
                        member: member.session.clone(),
                        source: Box::new(e),
                    }
                })?;
            steps.push(ChainStep {
                session: member.session.clone(),
                response,
            });
        }
        Ok(steps)
    }

    async fn orchestrate(
        &self,
        group: &Group,
        members: &[Member],
        prompt: &str,
    ) -> Result<OrchestrationRound> {
        let orchestrator = members
            .iter()
            .find(|m| m.is_orchestrator())
            .ok_or_else(|| Error::NoOrchestrator(group.name.clone()))?;
        let workers: Vec<&Member> = members.iter().filter(|m| !m.is_orchestrator()).collect();
        let worker_names: Vec<String> = workers.iter().map(|m| m.session.clone()).collect();

        let planning = planning_prompt(group.orchestrator_prompt.as_deref(), prompt, &workers);
        let plan = self.hub.send_prompt(&orchestrator.session, &planning).await?;
        let assignments = parse_task_assignments(&plan, &worker_names);
        plog_debug!(
            "Orchestrator '{}' delegated {} task(s): {:?}",
            orchestrator.session,
            assignments.len(),
            preview(&plan, 80)
        );

        if assignments.is_empty() {
            return Ok(OrchestrationRound {
                synthesis: plan.clone(),
                plan,
                assignments,
                results: Vec::new(),
            });
        }

        let results = self.dispatch(&assignments, &workers).await;
        let synthesis = self
            .hub
            .send_prompt(&orchestrator.session, &synthesis_prompt(prompt, &results))
            .await?;

        Ok(OrchestrationRound {
            plan,
            assignments,
            results,
            synthesis,
        })
    }

    /// Run assignments concurrently across workers. Tasks for the same
    /// worker go one after another since a session holds one turn at a time.
    async fn dispatch(&self, assignments: &[TaskAssignment], workers: &[&Member]) -> Vec<MemberResponse> {
        let mut per_worker: Vec<(String, Vec<String>)> = Vec::new();
        for assignment in assignments {
            let persona = workers
                .iter()
                .find(|w| w.session == assignment.worker)
                .and_then(|w| w.persona.as_deref());
            let task = with_persona(persona, &assignment.task);
            match per_worker.iter_mut().find(|(w, _)| *w == assignment.worker) {
                Some((_, tasks)) => tasks.push(task),
                None => per_worker.push((assignment.worker.clone(), vec![task])),
            }
        }

        let batches = join_all(per_worker.into_iter().map(|(worker, tasks)| async move {
            let mut responses = Vec::with_capacity(tasks.len());
            for task in tasks {
                responses.push(MemberResponse {
                    session: worker.clone(),
                    result: self.hub.send_prompt(&worker, &task).await,
                });
            }
            responses
        }))
        .await;
        batches.into_iter().flatten().collect()
    }

    /// Start a reflection cycle on the group, replacing any previous one.
    pub async fn start_reflection(
        &self,
        group_id: GroupId,
        goal: &str,
        evaluator: Option<&str>,
    ) -> Result<Uuid> {
        let mut cycle = ReflectionCycle::from_settings(goal, &self.settings);
        if let Some(evaluator) = evaluator {
            cycle = cycle.with_evaluator(evaluator);
        }
        let id = cycle.id;
        let mut org = self.organization.write().await;
        org.set_reflection(group_id, Some(cycle))?;
        plog!("Reflection cycle {} started on group {}", id, group_id.short());
        Ok(id)
    }

    pub async fn pause_reflection(&self, group_id: GroupId) -> Result<()> {
        self.with_cycle(group_id, |cycle| cycle.pause()).await
    }

    pub async fn resume_reflection(&self, group_id: GroupId) -> Result<()> {
        self.with_cycle(group_id, |cycle| cycle.resume()).await
    }

    pub async fn stop_reflection(&self, group_id: GroupId) -> Result<()> {
        self.with_cycle(group_id, |cycle| cycle.stop()).await
    }

    async fn with_cycle(&self, group_id: GroupId, f: impl FnOnce(&mut ReflectionCycle)) -> Result<()> {
        let mut org = self.organization.write().await;
        let group = org
            .group_mut(group_id)
            .ok_or_else(|| Error::GroupNotFound(group_id.to_string()))?;
        let cycle = group
            .reflection
            .as_mut()
            .ok_or_else(|| Error::Validation(format!("group '{}' has no reflection cycle", group.name)))?;
        f(cycle);
        Ok(())
    }

    /// Apply `f` to the group's cycle if it is still the `cycle_id` run.
    async fn update_cycle<T>(
        &self,
        group_id: GroupId,
        cycle_id: Uuid,
        f: impl FnOnce(&mut ReflectionCycle) -> T,
    ) -> Option<T> {
        let mut org = self.organization.write().await;
        let cycle = org.group_mut(group_id)?.reflection.as_mut()?;
        if !cycle.is_epoch(cycle_id) {
            plog_debug!("Dropping result for superseded reflection cycle {}", cycle_id);
            return None;
        }
        Some(f(cycle))
    }

    async fn reflect(&self, group_id: GroupId, prompt: &str) -> Result<ReflectionReport> {
        let cycle_id = {
            let running = self
                .organization
                .read()
                .await
                .group(group_id)
                .and_then(|g| g.reflection.as_ref())
                .filter(|c| c.is_active)
                .map(|c| c.id);
            match running {
                Some(id) => id,
                None => self.start_reflection(group_id, prompt, None).await?,
            }
        };

        let mut final_response = None;
        loop {
            let step = self
                .update_cycle(group_id, cycle_id, |cycle| {
                    if !cycle.is_active {
                        return Err(ReflectionOutcome::from(
                            cycle.outcome().unwrap_or(ReflectionDecision::Stopped),
                        ));
                    }
                    if cycle.is_paused {
                        return Err(ReflectionOutcome::Paused);
                    }
                    let sentinel = cycle.uses_sentinel();
                    let text = if cycle.current_iteration == 0 {
                        build_initial_prompt(cycle, sentinel)
                    } else {
                        build_follow_up_prompt(cycle, sentinel)
                    };
                    cycle.take_pending_adjustments();
                    cycle.begin_iteration();
                    Ok((text, cycle.evaluator_session.clone()))
                })
                .await;

            let (iteration_prompt, evaluator) = match step {
                None => return self.report(group_id, cycle_id, ReflectionOutcome::Superseded, final_response).await,
                Some(Err(outcome)) => return self.report(group_id, cycle_id, outcome, final_response).await,
                Some(Ok(step)) => step,
            };

            let decision = match self.reflect_iteration(group_id, cycle_id, &iteration_prompt, evaluator).await {
                Ok(Some((decision, response))) => {
                    final_response = Some(response);
                    Some(decision)
                }
                Ok(None) => None,
                Err(e) => {
                    plog_warn!("Reflection iteration failed, retrying: {}", e);
                    self.update_cycle(group_id, cycle_id, |cycle| cycle.retry_iteration())
                        .await
                }
            };

            match decision {
                None => return self.report(group_id, cycle_id, ReflectionOutcome::Superseded, final_response).await,
                Some(decision) if decision.is_terminal() => {
                    let report = self.report(group_id, cycle_id, decision.into(), final_response).await?;
                    self.post_summary(group_id, &report.summary).await;
                    return Ok(report);
                }
                Some(_) => {}
            }
        }
    }

    /// One orchestrated round plus its evaluation. `Ok(None)` means the
    /// cycle was superseded while the round ran.
    async fn reflect_iteration(
        &self,
        group_id: GroupId,
        cycle_id: Uuid,
        prompt: &str,
        evaluator: Option<String>,
    ) -> Result<Option<(ReflectionDecision, String)>> {
        let (group, members) = self.snapshot(group_id).await?;
        let round = self.orchestrate(&group, &members, prompt).await?;
        let response = round.synthesis;

        let Some(evaluator) = evaluator else {
            let decision = self
                .update_cycle(group_id, cycle_id, |cycle| cycle.conclude_iteration(&response))
                .await;
            return Ok(decision.map(|d| (d, response)));
        };

        let Some(evaluator_prompt) = self
            .update_cycle(group_id, cycle_id, |cycle| build_evaluator_prompt(cycle, &response))
            .await
        else {
            return Ok(None);
        };
        let verdict = self.hub.send_prompt(&evaluator, &evaluator_prompt).await?;
        let evaluation = parse_evaluation(&verdict, self.settings.pass_score);
        let model = self.hub.snapshot(&evaluator).await?.model().to_string();
        plog_debug!(
            "Evaluator '{}' scored {:.2} (passed={})",
            evaluator,
            evaluation.score,
            evaluation.passed
        );

        let decision = self
            .update_cycle(group_id, cycle_id, |cycle| {
                cycle.conclude_with_evaluation(&response, &evaluation, Some(&model))
            })
            .await;
        Ok(decision.map(|d| (d, response)))
    }

    async fn report(
        &self,
        group_id: GroupId,
        cycle_id: Uuid,
        outcome: ReflectionOutcome,
        final_response: Option<String>,
    ) -> Result<ReflectionReport> {
        let org = self.organization.read().await;
        let cycle = org
            .group(group_id)
            .and_then(|g| g.reflection.as_ref())
            .filter(|c| c.is_epoch(cycle_id));
        let (iterations, summary) = match cycle {
            Some(cycle) => (cycle.current_iteration, cycle.completion_summary()),
            None => (0, "Reflection cycle was replaced before it finished.".to_string()),
        };
        plog!("Reflection cycle {} ended: {:?}", cycle_id, outcome);
        Ok(ReflectionReport {
            cycle_id,
            outcome,
            iterations,
            summary,
            final_response,
        })
    }

    async fn post_summary(&self, group_id: GroupId, summary: &str) {
        let target = {
            let org = self.organization.read().await;
            org.orchestrator_of(group_id).map(|m| m.session.clone())
        };
        if let Some(session) = target {
            if let Err(e) = self.hub.post_notice(&session, summary).await {
                plog_warn!("Could not post reflection summary to '{}': {}", session, e);
            }
        }
    }
}

fn with_persona(persona: Option<&str>, task: &str) -> String {
    match persona {
        Some(persona) if !persona.trim().is_empty() => format!("{}\n\n{}", persona.trim(), task),
        _ => task.to_string(),
    }
}

fn chain_prompt(prompt: &str, previous: &ChainStep) -> String {
    format!(
        "{}\n\nOutput from the previous step ({}):\n{}",
        prompt, previous.session, previous.response
    )
}

fn planning_prompt(system: Option<&str>, prompt: &str, workers: &[&Member]) -> String {
    let mut text = String::from(system.unwrap_or(DEFAULT_ORCHESTRATOR_PROMPT));
    text.push_str("\n\nAvailable workers:");
    for worker in workers {
        text.push_str(&format!("\n- {}", worker.session));
        if let Some(model) = &worker.preferred_model {
            text.push_str(&format!(" ({})", model));
        }
    }
    text.push_str(
        "\n\nTo delegate, write one block per task:\n@worker:NAME\ntask description\n@end\n\
         Anything outside these blocks is kept as your own notes.",
    );
    text.push_str(&format!("\n\nRequest:\n{}", prompt));
    text
}

fn synthesis_prompt(prompt: &str, results: &[MemberResponse]) -> String {
    let mut text = format!("Original request:\n{}\n\nWorker results:", prompt);
    for result in results {
        match &result.result {
            Ok(response) => text.push_str(&format!("\n\n### {}\n{}", result.session, response)),
            Err(e) => text.push_str(&format!("\n\n### {}\nFAILED: {}", result.session, e)),
        }
    }
    text.push_str("\n\nCombine these results into one answer to the original request.");
    text
}

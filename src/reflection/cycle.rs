//! Reflection cycle state: iterate toward a goal until it is met, the
//! responses stall, or the iteration budget runs out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{
    ReflectionSettings, DEFAULT_STALL_SIMILARITY, DEFAULT_STALL_THRESHOLD,
    DEFAULT_TREND_THRESHOLD,
};
use crate::plog_debug;

use super::evaluator::{check_stall, classify_trend, contains_sentinel, Evaluation, QualityTrend};

const STALL_ADJUSTMENT: &str =
    "Your last response was nearly identical to the one before it. Take a clearly different approach.";
const RETRY_ADJUSTMENT: &str =
    "The previous attempt at this iteration failed before finishing. Try again.";

fn default_stall_threshold() -> u32 {
    DEFAULT_STALL_THRESHOLD
}

fn default_stall_similarity() -> f64 {
    DEFAULT_STALL_SIMILARITY
}

fn default_trend_threshold() -> f64 {
    DEFAULT_TREND_THRESHOLD
}

/// One scored evaluation in a cycle's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub iteration: u32,
    pub score: f64,
    #[serde(default)]
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_model: Option<String>,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

/// What the caller should do after an iteration concludes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionDecision {
    Continue,
    GoalMet,
    Stalled,
    BudgetExhausted,
    /// The cycle was already inactive, or was stopped explicitly.
    Stopped,
}

impl ReflectionDecision {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReflectionDecision::Continue)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionCycle {
    /// Epoch for this run; late results carrying another id are dropped.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub goal: String,
    /// Replaces the goal as the evaluation criteria when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_rubric: Option<String>,
    pub max_iterations: u32,
    #[serde(default)]
    pub current_iteration: u32,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub goal_met: bool,
    #[serde(default)]
    pub is_stalled: bool,
    #[serde(default)]
    pub consecutive_stalls: u32,
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,
    #[serde(default = "default_stall_similarity")]
    pub stall_similarity: f64,
    #[serde(default = "default_trend_threshold")]
    pub trend_threshold: f64,
    #[serde(default)]
    pub last_similarity: f64,
    #[serde(default)]
    pub evaluation_history: Vec<EvaluationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator_feedback: Option<String>,
    #[serde(default)]
    pub pending_adjustments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<String>,
    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReflectionCycle {
    pub fn new(goal: &str, max_iterations: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal: goal.to_string(),
            evaluation_rubric: None,
            max_iterations: max_iterations.max(1),
            current_iteration: 0,
            is_active: true,
            is_paused: false,
            goal_met: false,
            is_stalled: false,
            consecutive_stalls: 0,
            stall_threshold: DEFAULT_STALL_THRESHOLD,
            stall_similarity: DEFAULT_STALL_SIMILARITY,
            trend_threshold: DEFAULT_TREND_THRESHOLD,
            last_similarity: 0.0,
            evaluation_history: Vec::new(),
            evaluator_session: None,
            evaluator_feedback: None,
            pending_adjustments: Vec::new(),
            last_response: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// A cycle using the configured iteration budget and thresholds.
    pub fn from_settings(goal: &str, settings: &ReflectionSettings) -> Self {
        Self {
            stall_threshold: settings.stall_threshold.max(1),
            stall_similarity: settings.stall_similarity,
            trend_threshold: settings.trend_threshold,
            ..Self::new(goal, settings.max_iterations)
        }
    }

    pub fn with_stall_threshold(mut self, threshold: u32) -> Self {
        self.stall_threshold = threshold.max(1);
        self
    }

    pub fn with_evaluator(mut self, session: &str) -> Self {
        self.evaluator_session = Some(session.to_string());
        self
    }

    pub fn with_rubric(mut self, rubric: &str) -> Self {
        self.evaluation_rubric = Some(rubric.to_string());
        self
    }

    /// Sentinel mode when no evaluator session is attached.
    pub fn uses_sentinel(&self) -> bool {
        self.evaluator_session.is_none()
    }

    pub fn is_epoch(&self, id: Uuid) -> bool {
        self.id == id
    }

    /// Start the next iteration and return its number.
    pub fn begin_iteration(&mut self) -> u32 {
        if self.is_active {
            self.current_iteration += 1;
        }
        self.current_iteration
    }

    /// Conclude the current iteration, detecting completion by sentinel.
    pub fn conclude_iteration(&mut self, response: &str) -> ReflectionDecision {
        if !self.is_active {
            return ReflectionDecision::Stopped;
        }
        self.conclude(response, contains_sentinel(response))
    }

    /// Conclude the current iteration using an evaluator's verdict.
    pub fn conclude_with_evaluation(
        &mut self,
        response: &str,
        evaluation: &Evaluation,
        evaluator_model: Option<&str>,
    ) -> ReflectionDecision {
        if !self.is_active {
            return ReflectionDecision::Stopped;
        }
        let previous = self.evaluation_history.last().map(|r| r.score);
        let trend = self.record_evaluation(evaluation.score, &evaluation.rationale, evaluator_model);
        self.evaluator_feedback = if evaluation.passed {
            None
        } else {
            Some(evaluation.rationale.clone())
        };
        if let (QualityTrend::Degrading, Some(previous)) = (trend, previous) {
            self.pending_adjustments.push(format!(
                "Quality dropped from {:.2} to {:.2}. Revisit what changed since the previous iteration.",
                previous, evaluation.score
            ));
        }
        self.conclude(response, evaluation.passed)
    }

    /// Sentinel-mode iteration in one call.
    pub fn advance(&mut self, response: &str) -> ReflectionDecision {
        self.begin_iteration();
        self.conclude_iteration(response)
    }

    /// Evaluator-mode iteration in one call.
    pub fn advance_with_evaluation(
        &mut self,
        response: &str,
        evaluation: &Evaluation,
        evaluator_model: Option<&str>,
    ) -> ReflectionDecision {
        self.begin_iteration();
        self.conclude_with_evaluation(response, evaluation, evaluator_model)
    }

    /// The current iteration failed partway: give it back and count a stall.
    pub fn retry_iteration(&mut self) -> ReflectionDecision {
        if !self.is_active {
            return ReflectionDecision::Stopped;
        }
        self.current_iteration = self.current_iteration.saturating_sub(1);
        self.consecutive_stalls += 1;
        plog_debug!(
            "Reflection cycle {} retrying iteration {} (stalls={})",
            self.id,
            self.current_iteration + 1,
            self.consecutive_stalls
        );
        if self.consecutive_stalls >= self.stall_threshold {
            self.is_stalled = true;
            self.finish();
            return ReflectionDecision::Stalled;
        }
        self.pending_adjustments.push(RETRY_ADJUSTMENT.to_string());
        ReflectionDecision::Continue
    }

    fn conclude(&mut self, response: &str, goal_met: bool) -> ReflectionDecision {
        let check = check_stall(self.last_response.as_deref(), response, self.stall_similarity);
        self.last_similarity = check.similarity;
        self.last_response = Some(response.to_string());

        if goal_met {
            self.goal_met = true;
            self.consecutive_stalls = 0;
            self.finish();
            return ReflectionDecision::GoalMet;
        }

        if check.is_stall {
            self.consecutive_stalls += 1;
            if self.consecutive_stalls >= self.stall_threshold {
                self.is_stalled = true;
                self.finish();
                return ReflectionDecision::Stalled;
            }
            self.pending_adjustments.push(STALL_ADJUSTMENT.to_string());
        } else {
            self.consecutive_stalls = 0;
        }

        if self.current_iteration >= self.max_iterations {
            self.finish();
            return ReflectionDecision::BudgetExhausted;
        }
        ReflectionDecision::Continue
    }

    /// Append a score and classify the trend against the previous one.
    pub fn record_evaluation(
        &mut self,
        score: f64,
        rationale: &str,
        evaluator_model: Option<&str>,
    ) -> QualityTrend {
        self.evaluation_history.push(EvaluationRecord {
            iteration: self.current_iteration,
            score: super::evaluator::clamp_score(score),
            rationale: rationale.to_string(),
            evaluator_model: evaluator_model.map(str::to_string),
            recorded_at: Utc::now(),
        });
        classify_trend(&self.evaluation_history, self.trend_threshold)
    }

    pub fn trend(&self) -> QualityTrend {
        classify_trend(&self.evaluation_history, self.trend_threshold)
    }

    pub fn last_score(&self) -> Option<f64> {
        self.evaluation_history.last().map(|r| r.score)
    }

    /// Adjustments to fold into the next prompt; cleared once taken.
    pub fn take_pending_adjustments(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_adjustments)
    }

    pub fn pause(&mut self) {
        if self.is_active {
            self.is_paused = true;
        }
    }

    pub fn resume(&mut self) {
        self.is_paused = false;
    }

    pub fn stop(&mut self) {
        if self.is_active {
            self.finish();
        }
    }

    fn finish(&mut self) {
        self.is_active = false;
        self.is_paused = false;
        self.completed_at = Some(Utc::now());
    }

    /// How the cycle ended, or `None` while it is still running.
    pub fn outcome(&self) -> Option<ReflectionDecision> {
        if self.is_active {
            None
        } else if self.goal_met {
            Some(ReflectionDecision::GoalMet)
        } else if self.is_stalled {
            Some(ReflectionDecision::Stalled)
        } else if self.current_iteration >= self.max_iterations {
            Some(ReflectionDecision::BudgetExhausted)
        } else {
            Some(ReflectionDecision::Stopped)
        }
    }

    /// Operator-facing one-line summary.
    pub fn completion_summary(&self) -> String {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        let duration = format_duration(end - self.started_at);
        let score = match self.last_score() {
            Some(score) => format!("last score {:.2}", score),
            None => "no score".to_string(),
        };
        let n = self.current_iteration;
        let plural = if n == 1 { "" } else { "s" };

        match self.outcome() {
            None => format!(
                "Reflection in progress: iteration {} of {} ({}, {}).",
                n, self.max_iterations, duration, score
            ),
            Some(ReflectionDecision::GoalMet) => format!(
                "Goal met after {} iteration{} in {} ({}).",
                n, plural, duration, score
            ),
            Some(ReflectionDecision::Stalled) => format!(
                "Stalled after {} iteration{} in {}: responses stopped changing ({}).",
                n, plural, duration, score
            ),
            Some(ReflectionDecision::BudgetExhausted) => format!(
                "Iteration budget exhausted ({}/{}) in {} without meeting the goal ({}).",
                n, self.max_iterations, duration, score
            ),
            Some(_) => format!(
                "Stopped after {} iteration{} in {} ({}).",
                n, plural, duration, score
            ),
        }
    }
}

fn format_duration(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

//! Evaluation text handling for reflection cycles.
//!
//! Everything here is pure: parsing evaluator verdicts, detecting the
//! completion sentinel, measuring response similarity, classifying the score
//! trend, and building the prompts a cycle sends.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::cycle::{EvaluationRecord, ReflectionCycle};

/// Marker a worker emits, alone on a line, to report the goal as met.
pub const COMPLETION_SENTINEL: &str = "[[COMPLETE]]";

/// A parsed evaluator response. Always produced, never an error.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// In `[0.0, 1.0]`.
    pub score: f64,
    pub passed: bool,
    /// Evaluator rationale, or the raw response when it could not be parsed.
    pub rationale: String,
}

impl Evaluation {
    fn failing(rationale: &str) -> Self {
        Self {
            score: 0.0,
            passed: false,
            rationale: rationale.trim().to_string(),
        }
    }
}

pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Parse an evaluator response.
///
/// Accepted shapes, in order of precedence:
/// - a leading `PASS` token (not `PASSED`, not `pass` mid-sentence)
/// - a leading `FAIL:` with feedback inline or on the following lines
/// - a `SCORE: <float>` line with an optional `RATIONALE:` section, passing
///   when the clamped score reaches `pass_score`
///
/// Anything else fails with score 0 and the raw text as rationale.
pub fn parse_evaluation(text: &str, pass_score: f64) -> Evaluation {
    let trimmed = text.trim();
    let score_line = find_score(trimmed);

    if starts_with_pass(trimmed) {
        let rest = trimmed["PASS".len()..].trim_start_matches([':', '.', '!']).trim();
        return Evaluation {
            score: score_line.unwrap_or(1.0),
            passed: true,
            rationale: extract_rationale(rest).unwrap_or_else(|| rest.to_string()),
        };
    }

    if let Some(rest) = trimmed.strip_prefix("FAIL:") {
        let feedback = rest.trim();
        return Evaluation {
            score: score_line.unwrap_or(0.0),
            passed: false,
            rationale: extract_rationale(feedback).unwrap_or_else(|| feedback.to_string()),
        };
    }

    match score_line {
        Some(score) => Evaluation {
            score,
            passed: score >= pass_score,
            rationale: extract_rationale(trimmed).unwrap_or_else(|| trimmed.to_string()),
        },
        None => Evaluation::failing(trimmed),
    }
}

fn starts_with_pass(text: &str) -> bool {
    text.split_whitespace()
        .next()
        .map(|token| token.trim_end_matches([':', '.', '!']) == "PASS")
        .unwrap_or(false)
}

fn find_score(text: &str) -> Option<f64> {
    text.lines().find_map(|line| {
        let line = line.trim();
        let prefix = line.get(..6)?;
        if !prefix.eq_ignore_ascii_case("SCORE:") {
            return None;
        }
        let value = line[6..].split_whitespace().next()?;
        let value = value.trim_end_matches([',', ';']);
        value.parse::<f64>().ok().map(clamp_score)
    })
}

fn extract_rationale(text: &str) -> Option<String> {
    let upper = text.to_ascii_uppercase();
    let idx = upper.find("RATIONALE:")?;
    let rationale = text[idx + "RATIONALE:".len()..].trim();
    Some(rationale.to_string())
}

/// Whether the sentinel appears alone on one of the lines of `text`.
pub fn contains_sentinel(text: &str) -> bool {
    text.lines().any(|line| line.trim() == COMPLETION_SENTINEL)
}

fn word_set(text: &str) -> HashSet<&str> {
    text.split_whitespace().collect()
}

/// Jaccard similarity of the whitespace-separated word sets of `a` and `b`.
///
/// Two empty texts are identical (1.0); one empty text shares nothing (0.0).
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a = word_set(a);
    let set_b = word_set(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallCheck {
    pub is_stall: bool,
    pub similarity: f64,
}

/// Compare a response with the one before it.
pub fn check_stall(previous: Option<&str>, current: &str, threshold: f64) -> StallCheck {
    let Some(previous) = previous else {
        return StallCheck {
            is_stall: false,
            similarity: 0.0,
        };
    };
    if previous == current {
        return StallCheck {
            is_stall: true,
            similarity: 1.0,
        };
    }
    let similarity = jaccard_similarity(previous, current);
    StallCheck {
        is_stall: similarity > threshold,
        similarity,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTrend {
    Improving,
    Degrading,
    Stable,
}

/// Compare the latest score with the one before it.
pub fn classify_trend(history: &[EvaluationRecord], threshold: f64) -> QualityTrend {
    let [.., previous, latest] = history else {
        return QualityTrend::Stable;
    };
    let delta = latest.score - previous.score;
    if delta > threshold {
        QualityTrend::Improving
    } else if delta < -threshold {
        QualityTrend::Degrading
    } else {
        QualityTrend::Stable
    }
}

/// Where an iteration sits in the cycle's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationPhase {
    Early,
    Middle,
    Final,
}

pub fn iteration_phase(iteration: u32, max_iterations: u32) -> IterationPhase {
    if iteration >= max_iterations {
        IterationPhase::Final
    } else if iteration * 2 <= max_iterations {
        IterationPhase::Early
    } else {
        IterationPhase::Middle
    }
}

fn criteria(cycle: &ReflectionCycle) -> &str {
    cycle.evaluation_rubric.as_deref().unwrap_or(&cycle.goal)
}

/// Prompt for the first iteration of a cycle.
pub fn build_initial_prompt(cycle: &ReflectionCycle, sentinel_mode: bool) -> String {
    let mut prompt = format!(
        "Goal: {}\n\nThis is iteration 1 of at most {}. Work toward the goal.",
        cycle.goal, cycle.max_iterations
    );
    if sentinel_mode {
        prompt.push_str(&format!(
            "\n\nOnly when the goal is genuinely and fully achieved, end your response with {} on a line by itself.",
            COMPLETION_SENTINEL
        ));
    }
    prompt
}

/// Prompt for every iteration after the first.
///
/// The goal is presented as NOT complete so the model keeps working instead
/// of declaring victory early.
pub fn build_follow_up_prompt(cycle: &ReflectionCycle, sentinel_mode: bool) -> String {
    let mut prompt = format!(
        "Iteration {} of {}.\n\nEvaluation criteria: {}\n\n\
         The goal is NOT complete. Treat it as not complete unless it is genuinely, fully achieved. \
         Review your previous output critically and improve it.",
        cycle.current_iteration + 1,
        cycle.max_iterations,
        criteria(cycle)
    );

    if let Some(feedback) = &cycle.evaluator_feedback {
        prompt.push_str(&format!("\n\nEvaluator feedback:\n{}", feedback));
    }
    if !cycle.pending_adjustments.is_empty() {
        prompt.push_str("\n\nAdjustments:");
        for adjustment in &cycle.pending_adjustments {
            prompt.push_str(&format!("\n- {}", adjustment));
        }
    }
    if sentinel_mode {
        prompt.push_str(&format!(
            "\n\nOnly when the goal is genuinely and fully achieved, end your response with {} on a line by itself.",
            COMPLETION_SENTINEL
        ));
    }
    prompt
}

/// Prompt for the evaluator session, tuned to the iteration's phase.
pub fn build_evaluator_prompt(cycle: &ReflectionCycle, response: &str) -> String {
    let stance = match iteration_phase(cycle.current_iteration, cycle.max_iterations) {
        IterationPhase::Early => {
            "Be demanding. This is an early iteration: you must identify at least one concrete flaw \
             or missing piece, and you must not answer PASS yet."
        }
        IterationPhase::Middle => {
            "Be demanding but fair. Answer PASS only if the criteria are fully met."
        }
        IterationPhase::Final => {
            "This is the final iteration. Be lenient: answer PASS if the work substantially meets \
             the criteria, even with minor imperfections."
        }
    };

    format!(
        "You are evaluating work toward this goal.\n\nCriteria: {}\n\nIteration {} of {}. {}\n\n\
         Work to evaluate:\n---\n{}\n---\n\n\
         Reply with either:\nPASS\nor\nFAIL: <what is wrong and how to fix it>\n\n\
         Then add:\nSCORE: <number between 0.0 and 1.0>\nRATIONALE: <one paragraph>",
        criteria(cycle),
        cycle.current_iteration,
        cycle.max_iterations,
        stance,
        response
    )
}

//! Reflection loop: iterate, evaluate, detect stalls, classify quality.

pub mod cycle;
pub mod evaluator;

pub use cycle::{EvaluationRecord, ReflectionCycle, ReflectionDecision};
pub use evaluator::{
    build_evaluator_prompt, build_follow_up_prompt, build_initial_prompt, check_stall,
    classify_trend, contains_sentinel, jaccard_similarity, parse_evaluation, Evaluation,
    IterationPhase, QualityTrend, StallCheck, COMPLETION_SENTINEL,
};

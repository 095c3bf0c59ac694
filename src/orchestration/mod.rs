//! Multi-agent orchestration.
//!
//! Groups of sessions are described by an [`Organization`] and driven by a
//! [`Coordinator`] in one of four modes: broadcast, sequential, orchestrator
//! delegation, and orchestrator delegation under a reflection cycle.

mod coordinator;
mod group;
mod tasks;

pub use coordinator::{
    ChainStep, Coordinator, MemberResponse, OrchestrationRound, ReflectionOutcome,
    ReflectionReport, RunReport,
};
pub use group::{
    Group, GroupId, GroupMode, Member, MemberRole, Organization, SessionPlacement, WorktreeLookup,
};
pub use tasks::{parse_task_assignments, resolve_worker_name, TaskAssignment};

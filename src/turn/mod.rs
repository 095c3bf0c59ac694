//! Turn lifecycle: the engine state machine and the hub that drives it.

pub mod engine;
pub mod hub;
pub mod message;

pub use engine::{BeginOptions, EventDisposition, OpenedTurn, TurnEngine, TurnOutcome};
pub use hub::SessionHub;
pub use message::{HubMessage, PendingTurn, SessionEvent, StuckTurn, Submission};

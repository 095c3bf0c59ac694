//! Coordination core for many concurrent agent sessions.
//!
//! Start an [`App`] (or a bare [`SessionHub`]) on a [`Transport`], then drive
//! sessions directly or through a [`Coordinator`]. Call [`log::init`] once at
//! startup to write `~/.polyphon/polyphon.log`.

pub mod actors;
pub mod app;
pub mod config;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod reflection;
pub mod session;
pub mod state;
pub mod transport;
pub mod turn;
pub mod util;
pub mod watchdog;

pub use app::App;
pub use config::Config;
pub use error::{Error, Result};
pub use orchestration::{Coordinator, GroupId, GroupMode, MemberRole, Organization};
pub use reflection::{ReflectionCycle, ReflectionDecision};
pub use session::{ChatMessage, MessageRole, SessionRecord};
pub use state::OrganizationState;
pub use transport::{DemoTransport, SessionIdentity, Transport, TransportEvent};
pub use turn::{SessionEvent, SessionHub, TurnEngine, TurnOutcome};

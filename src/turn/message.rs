//! Messages consumed by the session hub loop, and events it emits.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::config::WatchdogSettings;
use crate::session::SessionRecord;
use crate::transport::TransportEvent;
use crate::{Error, Result};

use super::engine::TurnOutcome;

pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Everything that can change hub state arrives as one of these.
#[derive(Debug)]
pub enum HubMessage {
    // Session lifecycle
    CreateSession {
        name: String,
        model: String,
        reply: Reply<()>,
    },
    RestoreSession {
        record: Box<SessionRecord>,
        reply: Reply<()>,
    },
    CloseSession {
        name: String,
        reply: Reply<SessionRecord>,
    },
    SetModel {
        name: String,
        model: String,
        reply: Reply<()>,
    },

    // Turns
    BeginTurn {
        name: String,
        prompt: String,
        suppress_user_message: bool,
        reply: Reply<PendingTurn>,
    },
    Submit {
        name: String,
        prompt: String,
        reply: Reply<Submission>,
    },
    CompleteTurn {
        name: String,
        ticket: u64,
        outcome: TurnOutcome,
        reply: Reply<bool>,
    },
    Abort {
        name: String,
        reply: Reply<bool>,
    },
    NextGeneration {
        name: String,
        reply: Reply<u64>,
    },

    /// A transport event pumped in by the turn's forwarding task.
    Event {
        name: String,
        ticket: u64,
        event: TransportEvent,
    },

    // Queries and notices
    PostNotice {
        name: String,
        notice: String,
        reply: Reply<()>,
    },
    Snapshot {
        name: String,
        reply: Reply<SessionRecord>,
    },
    ListSessions {
        reply: Reply<Vec<SessionRecord>>,
    },

    /// One watchdog pass, evaluated against `now`.
    WatchdogScan {
        now: DateTime<Utc>,
        settings: WatchdogSettings,
        multi_agent: HashSet<String>,
        reply: Reply<Vec<StuckTurn>>,
    },

    Shutdown,
}

/// A turn that was opened and is now in flight.
#[derive(Debug)]
pub struct PendingTurn {
    pub ticket: u64,
    pub completion: oneshot::Receiver<TurnOutcome>,
}

impl PendingTurn {
    /// Wait for the turn to end. A dropped signal means the hub went away.
    pub async fn outcome(self) -> Result<TurnOutcome> {
        self.completion.await.map_err(|_| Error::HubClosed)
    }

    /// Wait for the turn and return its response text.
    pub async fn response(self, session: &str) -> Result<String> {
        self.outcome().await?.into_result(session)
    }
}

/// Result of [`HubMessage::Submit`].
#[derive(Debug)]
pub enum Submission {
    Started(PendingTurn),
    Queued { depth: usize },
}

/// A turn the watchdog found past its effective timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct StuckTurn {
    pub session: String,
    pub elapsed: Duration,
    pub timeout: Duration,
}

/// Observer notifications, sent best-effort to an optional listener.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionCreated {
        session: String,
    },
    SessionClosed {
        session: String,
    },
    TurnStarted {
        session: String,
        ticket: u64,
    },
    TurnCompleted {
        session: String,
        ticket: u64,
        outcome: TurnOutcome,
    },
    TurnAborted {
        session: String,
    },
    PromptQueued {
        session: String,
        depth: usize,
    },
    StaleEventIgnored {
        session: String,
        ticket: u64,
    },
    WatchdogRecovered {
        session: String,
        elapsed: Duration,
        timeout: Duration,
    },
    Notice {
        session: String,
        text: String,
    },
}

//! Turn engine: exactly-once completion of one logical turn per session.
//!
//! The engine is a synchronous state machine over an arena of
//! [`SessionRecord`]s. It never awaits; the session hub drives it from a
//! single message loop, so every mutation here happens on one execution
//! context.
//!
//! ## Generation tickets
//!
//! Every [`TurnEngine::begin_turn`] bumps the session's generation and hands
//! the new value back as the turn's ticket. Completions and streamed events
//! carry their ticket; anything whose ticket no longer matches the session's
//! generation belongs to a superseded turn and is ignored.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::session::{ChatMessage, SessionRecord};
use crate::transport::TransportEvent;
use crate::util::preview;
use crate::{plog, plog_debug, plog_trace, plog_warn, Error, Result};

/// How a turn ended, as seen by whoever is waiting on it.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed { response: String },
    Failed { error: String },
    Cancelled,
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TurnOutcome::Completed { .. })
    }

    /// Convert into the response text, or the matching turn error.
    pub fn into_result(self, session: &str) -> Result<String> {
        match self {
            TurnOutcome::Completed { response } => Ok(response),
            TurnOutcome::Failed { error } => Err(Error::TurnFailed {
                session: session.to_string(),
                message: error,
            }),
            TurnOutcome::Cancelled => Err(Error::TurnCancelled(session.to_string())),
        }
    }
}

/// Options for [`TurnEngine::begin_turn`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BeginOptions {
    /// Do not append the prompt to the transcript (orchestration plumbing).
    pub suppress_user_message: bool,
    /// Skip the single-flight guard. Only the demo transport sets this.
    pub allow_overlap: bool,
}

/// A successfully opened turn.
#[derive(Debug)]
pub struct OpenedTurn {
    pub ticket: u64,
    pub completion: oneshot::Receiver<TurnOutcome>,
}

/// What applying a streamed event did.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDisposition {
    Applied,
    /// The event's ticket is stale or no turn is open.
    Ignored,
    /// The event ended the turn.
    Completed(TurnOutcome),
}

struct PendingCompletion {
    ticket: u64,
    tx: oneshot::Sender<TurnOutcome>,
}

/// Arena of session records plus the completion signals of open turns.
#[derive(Default)]
pub struct TurnEngine {
    sessions: HashMap<String, SessionRecord>,
    pending: HashMap<String, PendingCompletion>,
}

impl TurnEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_session(&mut self, record: SessionRecord) -> Result<()> {
        let name = record.name().to_string();
        if self.sessions.contains_key(&name) {
            return Err(Error::SessionExists(name));
        }
        plog!("Session created: name={} model={}", name, record.model());
        self.sessions.insert(name, record);
        Ok(())
    }

    /// Re-insert a record loaded from before a restart.
    ///
    /// A record that was mid-turn keeps its transcript but gets a fresh
    /// generation and start time, and is flagged as resumed so the watchdog
    /// gives it the longer timeout.
    pub fn restore_session(&mut self, mut record: SessionRecord, now: DateTime<Utc>) -> Result<()> {
        let name = record.name().to_string();
        if self.sessions.contains_key(&name) {
            return Err(Error::SessionExists(name));
        }
        if record.is_processing() {
            record.bump_generation();
            record.open_turn(now);
            record.set_resumed(true);
            plog!(
                "Session restored mid-turn: name={} generation={}",
                name,
                record.generation()
            );
        } else {
            record.set_resumed(false);
        }
        self.sessions.insert(name, record);
        Ok(())
    }

    /// Remove a session, cancelling any turn still waiting on it.
    pub fn close_session(&mut self, name: &str) -> Result<SessionRecord> {
        if let Some(pending) = self.pending.remove(name) {
            let _ = pending.tx.send(TurnOutcome::Cancelled);
        }
        let record = self
            .sessions
            .remove(name)
            .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;
        plog!("Session closed: name={}", name);
        Ok(record)
    }

    pub fn get(&self, name: &str) -> Option<&SessionRecord> {
        self.sessions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionRecord> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn record_mut(&mut self, name: &str) -> Result<&mut SessionRecord> {
        self.sessions
            .get_mut(name)
            .ok_or_else(|| Error::SessionNotFound(name.to_string()))
    }

    /// Advance the session's generation, invalidating every outstanding ticket.
    pub fn next_generation(&mut self, name: &str) -> Result<u64> {
        Ok(self.record_mut(name)?.bump_generation())
    }

    /// Open a turn and return its ticket and completion signal.
    pub fn begin_turn(
        &mut self,
        name: &str,
        prompt: &str,
        options: BeginOptions,
        now: DateTime<Utc>,
    ) -> Result<OpenedTurn> {
        let record = self.record_mut(name)?;
        if record.is_processing() && !options.allow_overlap {
            plog_warn!("begin_turn rejected: session '{}' is already processing", name);
            return Err(Error::AlreadyProcessing(name.to_string()));
        }

        if !options.suppress_user_message {
            record.push_message(ChatMessage::user(prompt));
        }
        let ticket = record.bump_generation();
        record.open_turn(now);

        // Only reachable with allow_overlap: the older waiter would otherwise
        // never hear back, since its ticket is now stale.
        if let Some(superseded) = self.pending.remove(name) {
            plog_debug!(
                "begin_turn on '{}' supersedes ticket {}",
                name,
                superseded.ticket
            );
            let _ = superseded.tx.send(TurnOutcome::Cancelled);
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(name.to_string(), PendingCompletion { ticket, tx });

        plog!(
            "Turn started: session={} ticket={} prompt={:?}",
            name,
            ticket,
            preview(prompt, 60)
        );
        Ok(OpenedTurn {
            ticket,
            completion: rx,
        })
    }

    fn is_current(&self, name: &str, ticket: u64) -> bool {
        self.sessions
            .get(name)
            .map(|r| r.is_processing() && r.generation() == ticket)
            .unwrap_or(false)
    }

    /// Apply one streamed event to the turn identified by `ticket`.
    pub fn apply_event(
        &mut self,
        name: &str,
        ticket: u64,
        event: TransportEvent,
    ) -> EventDisposition {
        if !self.is_current(name, ticket) {
            plog_debug!(
                "Ignoring event for stale ticket {} on '{}': {:?}",
                ticket,
                name,
                event
            );
            return EventDisposition::Ignored;
        }

        let outcome = {
            let Some(record) = self.sessions.get_mut(name) else {
                return EventDisposition::Ignored;
            };
            match event {
                TransportEvent::Content(chunk) => {
                    plog_trace!("content chunk on '{}': {} bytes", name, chunk.len());
                    record.append_content(&chunk);
                    None
                }
                TransportEvent::Reasoning(chunk) => {
                    record.append_reasoning(&chunk);
                    None
                }
                TransportEvent::ToolStart { name: tool } => {
                    record.tool_started(&tool);
                    plog_debug!(
                        "tool start on '{}': {} (active={})",
                        name,
                        tool,
                        record.active_tool_calls()
                    );
                    None
                }
                TransportEvent::ToolEnd { name: tool, output } => {
                    record.tool_finished(&tool, output.as_deref());
                    None
                }
                TransportEvent::TurnIdle => {
                    record.flush_pending();
                    Some(TurnOutcome::Completed {
                        response: record.take_turn_response(),
                    })
                }
                TransportEvent::Error(error) => Some(TurnOutcome::Failed { error }),
            }
        };

        match outcome {
            Some(outcome) => {
                self.complete_turn(name, ticket, outcome.clone());
                EventDisposition::Completed(outcome)
            }
            None => EventDisposition::Applied,
        }
    }

    /// Complete the turn identified by `ticket`.
    ///
    /// Returns `false` without touching anything when the ticket is stale or
    /// the turn is already closed. Otherwise the processing flags are cleared
    /// first and the completion signal is resolved last, so a waiter resumed
    /// by the signal never observes the session as still processing.
    pub fn complete_turn(&mut self, name: &str, ticket: u64, outcome: TurnOutcome) -> bool {
        let Some(record) = self.sessions.get_mut(name) else {
            return false;
        };
        if ticket != record.generation() {
            plog_warn!(
                "Stale completion ignored: session={} ticket={} current={}",
                name,
                ticket,
                record.generation()
            );
            return false;
        }
        if !record.is_processing() {
            plog_debug!("Duplicate completion ignored: session={} ticket={}", name, ticket);
            return false;
        }

        record.flush_pending();
        if let TurnOutcome::Failed { error } = &outcome {
            record.push_message(ChatMessage::system(format!("Turn failed: {}", error)));
        }
        record.close_turn();
        record.set_resumed(false);

        plog!(
            "Turn completed: session={} ticket={} completed={}",
            name,
            ticket,
            outcome.is_completed()
        );

        if let Some(pending) = self.pending.remove(name) {
            if pending.ticket == ticket {
                let _ = pending.tx.send(outcome);
            } else {
                self.pending.insert(name.to_string(), pending);
            }
        }
        true
    }

    /// Force the session idle, whatever its ticket bookkeeping says.
    ///
    /// Clears processing, start time, tool counters and the queue, and
    /// resolves any pending completion as cancelled. Returns `false` when the
    /// session was already idle with nothing queued or pending.
    pub fn abort(&mut self, name: &str) -> Result<bool> {
        let pending = self.pending.remove(name);
        let record = self.record_mut(name)?;
        let changed = record.is_processing() || !record.queue().is_empty() || pending.is_some();
        if !changed {
            return Ok(false);
        }

        record.flush_pending();
        record.close_turn();
        record.clear_queue();
        record.set_resumed(false);
        plog!("Turn aborted: session={} generation={}", name, record.generation());

        if let Some(pending) = pending {
            let _ = pending.tx.send(TurnOutcome::Cancelled);
        }
        Ok(true)
    }

    /// Queue a prompt to be sent once the current turn closes.
    pub fn enqueue(&mut self, name: &str, prompt: &str) -> Result<usize> {
        let record = self.record_mut(name)?;
        record.enqueue(prompt.to_string());
        plog_debug!("Queued prompt on '{}' (depth={})", name, record.queue().len());
        Ok(record.queue().len())
    }

    /// Pop the next queued prompt if the session is idle.
    pub fn take_next_queued(&mut self, name: &str) -> Option<String> {
        let record = self.sessions.get_mut(name)?;
        if record.is_processing() {
            return None;
        }
        record.dequeue()
    }

    /// Append an operator-visible notice to the transcript.
    pub fn post_notice(&mut self, name: &str, notice: &str) -> Result<()> {
        self.record_mut(name)?.push_message(ChatMessage::system(notice));
        Ok(())
    }

    /// Watchdog recovery: post the notice, then go through [`Self::abort`].
    pub fn recover_stuck(&mut self, name: &str, notice: &str) -> Result<bool> {
        self.post_notice(name, notice)?;
        let aborted = self.abort(name)?;
        self.record_mut(name)?.set_resumed(false);
        Ok(aborted)
    }

    pub fn set_model(&mut self, name: &str, model: &str) -> Result<()> {
        self.record_mut(name)?.set_model(model);
        Ok(())
    }
}

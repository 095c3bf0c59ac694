//! Session hub: the single consumer that owns the turn engine.
//!
//! Callers hold a cheap, cloneable [`SessionHub`] handle. Every request and
//! every transport event becomes a [`HubMessage`] on one unbounded channel,
//! and one spawned task applies them to the [`TurnEngine`] in arrival order.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::config::WatchdogSettings;
use crate::session::SessionRecord;
use crate::transport::{SessionIdentity, Transport, TransportEvent};
use crate::util::with_timeout;
use crate::watchdog;
use crate::{plog, plog_debug, plog_error, plog_warn, Error, Result};

use super::engine::{BeginOptions, EventDisposition, TurnEngine, TurnOutcome};
use super::message::{HubMessage, PendingTurn, Reply, SessionEvent, StuckTurn, Submission};

/// Handle to a running session hub.
#[derive(Clone)]
pub struct SessionHub {
    tx: mpsc::UnboundedSender<HubMessage>,
}

impl SessionHub {
    pub fn spawn(transport: Arc<dyn Transport>) -> Self {
        Self::spawn_inner(transport, None)
    }

    /// Spawn a hub that reports [`SessionEvent`]s to `events`.
    pub fn spawn_with_events(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self::spawn_inner(transport, Some(events))
    }

    fn spawn_inner(
        transport: Arc<dyn Transport>,
        events: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = HubActor {
            engine: TurnEngine::new(),
            transport,
            self_tx: tx.downgrade(),
            events,
        };
        plog_debug!("SessionHub::spawn");
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> HubMessage) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| Error::HubClosed)?;
        rx.await.map_err(|_| Error::HubClosed)?
    }

    pub async fn create_session(&self, name: &str, model: &str) -> Result<()> {
        self.request(|reply| HubMessage::CreateSession {
            name: name.to_string(),
            model: model.to_string(),
            reply,
        })
        .await
    }

    /// Re-insert a record persisted before a restart.
    pub async fn restore_session(&self, record: SessionRecord) -> Result<()> {
        self.request(|reply| HubMessage::RestoreSession {
            record: Box::new(record),
            reply,
        })
        .await
    }

    pub async fn close_session(&self, name: &str) -> Result<SessionRecord> {
        self.request(|reply| HubMessage::CloseSession {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn set_model(&self, name: &str, model: &str) -> Result<()> {
        self.request(|reply| HubMessage::SetModel {
            name: name.to_string(),
            model: model.to_string(),
            reply,
        })
        .await
    }

    /// Open a turn and return without waiting for it to finish.
    pub async fn begin_turn(&self, name: &str, prompt: &str) -> Result<PendingTurn> {
        self.begin(name, prompt, false).await
    }

    async fn begin(&self, name: &str, prompt: &str, suppress_user_message: bool) -> Result<PendingTurn> {
        self.request(|reply| HubMessage::BeginTurn {
            name: name.to_string(),
            prompt: prompt.to_string(),
            suppress_user_message,
            reply,
        })
        .await
    }

    /// Run one turn to completion and return the response text.
    pub async fn send_prompt(&self, name: &str, prompt: &str) -> Result<String> {
        self.begin(name, prompt, false).await?.response(name).await
    }

    /// Like [`Self::send_prompt`], but abort the turn if it outlives `limit`.
    pub async fn send_prompt_within(&self, name: &str, prompt: &str, limit: Duration) -> Result<String> {
        let turn = self.begin(name, prompt, false).await?;
        match with_timeout(limit, turn.response(name)).await {
            Err(Error::Timeout(elapsed)) => {
                plog_warn!("Turn on '{}' exceeded {:?}, aborting", name, elapsed);
                self.abort(name).await?;
                Err(Error::Timeout(elapsed))
            }
            other => other,
        }
    }

    /// Like [`Self::send_prompt`], without recording the prompt in the transcript.
    pub async fn send_internal(&self, name: &str, prompt: &str) -> Result<String> {
        self.begin(name, prompt, true).await?.response(name).await
    }

    /// Send now if idle, otherwise queue behind the open turn.
    pub async fn submit(&self, name: &str, prompt: &str) -> Result<Submission> {
        self.request(|reply| HubMessage::Submit {
            name: name.to_string(),
            prompt: prompt.to_string(),
            reply,
        })
        .await
    }

    /// Complete a turn from outside the transport stream. Returns whether the
    /// ticket was current.
    pub async fn complete_turn(&self, name: &str, ticket: u64, outcome: TurnOutcome) -> Result<bool> {
        self.request(|reply| HubMessage::CompleteTurn {
            name: name.to_string(),
            ticket,
            outcome,
            reply,
        })
        .await
    }

    pub async fn abort(&self, name: &str) -> Result<bool> {
        self.request(|reply| HubMessage::Abort {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn next_generation(&self, name: &str) -> Result<u64> {
        self.request(|reply| HubMessage::NextGeneration {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn post_notice(&self, name: &str, notice: &str) -> Result<()> {
        self.request(|reply| HubMessage::PostNotice {
            name: name.to_string(),
            notice: notice.to_string(),
            reply,
        })
        .await
    }

    /// A copy of the session's current record.
    pub async fn snapshot(&self, name: &str) -> Result<SessionRecord> {
        self.request(|reply| HubMessage::Snapshot {
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Copies of every record, ordered by name.
    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        self.request(|reply| HubMessage::ListSessions { reply }).await
    }

    /// Run one watchdog pass as of `now` and return what was recovered.
    pub async fn watchdog_scan(
        &self,
        now: DateTime<Utc>,
        settings: WatchdogSettings,
        multi_agent: HashSet<String>,
    ) -> Result<Vec<StuckTurn>> {
        self.request(|reply| HubMessage::WatchdogScan {
            now,
            settings,
            multi_agent,
            reply,
        })
        .await
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(HubMessage::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct HubActor {
    engine: TurnEngine,
    transport: Arc<dyn Transport>,
    // Weak so the loop ends once every handle and pump is gone.
    self_tx: mpsc::WeakUnboundedSender<HubMessage>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl HubActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubMessage>) {
        while let Some(msg) = rx.recv().await {
            if matches!(msg, HubMessage::Shutdown) {
                plog_debug!("SessionHub shutdown requested");
                break;
            }
            self.handle(msg).await;
        }
        plog_debug!("SessionHub stopped with {} sessions", self.engine.len());
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    async fn handle(&mut self, msg: HubMessage) {
        match msg {
            HubMessage::CreateSession { name, model, reply } => {
                let result = SessionRecord::new(&name, &model)
                    .and_then(|record| self.engine.create_session(record));
                if result.is_ok() {
                    self.emit(SessionEvent::SessionCreated { session: name });
                }
                let _ = reply.send(result);
            }
            HubMessage::RestoreSession { record, reply } => {
                let name = record.name().to_string();
                let result = self.engine.restore_session(*record, Utc::now());
                if result.is_ok() {
                    self.emit(SessionEvent::SessionCreated { session: name });
                }
                let _ = reply.send(result);
            }
            HubMessage::CloseSession { name, reply } => {
                let result = self.engine.close_session(&name);
                if let Ok(record) = &result {
                    if record.is_processing() {
                        self.abort_transport(&name);
                    }
                    self.emit(SessionEvent::SessionClosed {
                        session: name.clone(),
                    });
                }
                let _ = reply.send(result);
            }
            HubMessage::SetModel { name, model, reply } => {
                let _ = reply.send(self.engine.set_model(&name, &model));
            }
            HubMessage::BeginTurn {
                name,
                prompt,
                suppress_user_message,
                reply,
            } => {
                let result = self.start_turn(&name, prompt, suppress_user_message).await;
                let _ = reply.send(result);
                self.drain_queue(&name).await;
            }
            HubMessage::Submit { name, prompt, reply } => {
                let result = self.submit(&name, prompt).await;
                let _ = reply.send(result);
                self.drain_queue(&name).await;
            }
            HubMessage::CompleteTurn {
                name,
                ticket,
                outcome,
                reply,
            } => {
                let applied = self.engine.complete_turn(&name, ticket, outcome.clone());
                if applied {
                    self.emit(SessionEvent::TurnCompleted {
                        session: name.clone(),
                        ticket,
                        outcome,
                    });
                } else {
                    self.emit(SessionEvent::StaleEventIgnored {
                        session: name.clone(),
                        ticket,
                    });
                }
                let _ = reply.send(Ok(applied));
                if applied {
                    self.drain_queue(&name).await;
                }
            }
            HubMessage::Abort { name, reply } => {
                let result = self.engine.abort(&name);
                if let Ok(true) = result {
                    self.abort_transport(&name);
                    self.emit(SessionEvent::TurnAborted {
                        session: name.clone(),
                    });
                }
                let _ = reply.send(result);
            }
            HubMessage::NextGeneration { name, reply } => {
                let _ = reply.send(self.engine.next_generation(&name));
            }
            HubMessage::Event {
                name,
                ticket,
                event,
            } => {
                if self.apply(&name, ticket, event) {
                    self.drain_queue(&name).await;
                }
            }
            HubMessage::PostNotice {
                name,
                notice,
                reply,
            } => {
                let result = self.engine.post_notice(&name, &notice);
                if result.is_ok() {
                    self.emit(SessionEvent::Notice {
                        session: name,
                        text: notice,
                    });
                }
                let _ = reply.send(result);
            }
            HubMessage::Snapshot { name, reply } => {
                let result = self
                    .engine
                    .get(&name)
                    .cloned()
                    .ok_or(Error::SessionNotFound(name));
                let _ = reply.send(result);
            }
            HubMessage::ListSessions { reply } => {
                let mut records: Vec<SessionRecord> = self.engine.sessions().cloned().collect();
                records.sort_by(|a, b| a.name().cmp(b.name()));
                let _ = reply.send(Ok(records));
            }
            HubMessage::WatchdogScan {
                now,
                settings,
                multi_agent,
                reply,
            } => {
                let recovered = self.recover_stuck(now, &settings, &multi_agent);
                let _ = reply.send(Ok(recovered));
            }
            HubMessage::Shutdown => {}
        }
    }

    async fn submit(&mut self, name: &str, prompt: String) -> Result<Submission> {
        let busy = self
            .engine
            .get(name)
            .map(|r| r.is_processing())
            .ok_or_else(|| Error::SessionNotFound(name.to_string()))?;

        if busy && !self.transport.is_demo() {
            let depth = self.engine.enqueue(name, &prompt)?;
            self.emit(SessionEvent::PromptQueued {
                session: name.to_string(),
                depth,
            });
            return Ok(Submission::Queued { depth });
        }
        Ok(Submission::Started(self.start_turn(name, prompt, false).await?))
    }

    async fn start_turn(
        &mut self,
        name: &str,
        prompt: String,
        suppress_user_message: bool,
    ) -> Result<PendingTurn> {
        let demo = self.transport.is_demo();
        let options = BeginOptions {
            suppress_user_message,
            allow_overlap: demo,
        };
        let opened = self.engine.begin_turn(name, &prompt, options, Utc::now())?;
        let model = self
            .engine
            .get(name)
            .map(|r| r.model().to_string())
            .unwrap_or_default();
        let identity = SessionIdentity {
            name: name.to_string(),
            model,
            ticket: opened.ticket,
        };
        self.emit(SessionEvent::TurnStarted {
            session: name.to_string(),
            ticket: opened.ticket,
        });

        if demo {
            self.run_inline(identity, &prompt).await;
        } else {
            self.spawn_pump(identity, prompt);
        }

        Ok(PendingTurn {
            ticket: opened.ticket,
            completion: opened.completion,
        })
    }

    /// The demo transport finishes immediately, so its events are applied
    /// before the next message is taken.
    async fn run_inline(&mut self, identity: SessionIdentity, prompt: &str) {
        match self.transport.send(&identity, prompt).await {
            Ok(mut stream) => {
                while let Some(event) = stream.next().await {
                    let terminal = event.is_terminal();
                    self.apply(&identity.name, identity.ticket, event);
                    if terminal {
                        break;
                    }
                }
            }
            Err(e) => {
                self.apply(
                    &identity.name,
                    identity.ticket,
                    TransportEvent::Error(e.to_string()),
                );
            }
        }
    }

    /// Forward the turn's events back into the hub, tagged with its ticket.
    fn spawn_pump(&self, identity: SessionIdentity, prompt: String) {
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let SessionIdentity { name, ticket, .. } = identity.clone();
            match transport.send(&identity, &prompt).await {
                Ok(mut stream) => {
                    while let Some(event) = stream.next().await {
                        let terminal = event.is_terminal();
                        let msg = HubMessage::Event {
                            name: name.clone(),
                            ticket,
                            event,
                        };
                        if tx.send(msg).is_err() || terminal {
                            return;
                        }
                    }
                    // Silent end of stream; the watchdog owns this turn now.
                    plog_debug!("Event stream for '{}' ticket {} ended without idle", name, ticket);
                }
                Err(e) => {
                    plog_error!("Transport send failed for '{}': {}", name, e);
                    let _ = tx.send(HubMessage::Event {
                        name,
                        ticket,
                        event: TransportEvent::Error(e.to_string()),
                    });
                }
            }
        });
    }

    /// Apply an event; returns true when it completed the turn.
    fn apply(&mut self, name: &str, ticket: u64, event: TransportEvent) -> bool {
        match self.engine.apply_event(name, ticket, event) {
            EventDisposition::Applied => false,
            EventDisposition::Ignored => {
                self.emit(SessionEvent::StaleEventIgnored {
                    session: name.to_string(),
                    ticket,
                });
                false
            }
            EventDisposition::Completed(outcome) => {
                self.emit(SessionEvent::TurnCompleted {
                    session: name.to_string(),
                    ticket,
                    outcome,
                });
                true
            }
        }
    }

    async fn drain_queue(&mut self, name: &str) {
        while let Some(prompt) = self.engine.take_next_queued(name) {
            plog_debug!("Draining queued prompt on '{}'", name);
            if let Err(e) = self.start_turn(name, prompt, false).await {
                plog_warn!("Queued prompt on '{}' could not start: {}", name, e);
                break;
            }
        }
    }

    fn recover_stuck(
        &mut self,
        now: DateTime<Utc>,
        settings: &WatchdogSettings,
        multi_agent: &HashSet<String>,
    ) -> Vec<StuckTurn> {
        let stuck = watchdog::find_stuck(self.engine.sessions(), settings, now, multi_agent);
        let mut recovered = Vec::with_capacity(stuck.len());
        for turn in stuck {
            let notice = watchdog::recovery_notice(&turn);
            match self.engine.recover_stuck(&turn.session, &notice) {
                Ok(_) => {
                    plog!(
                        "Watchdog recovered '{}' after {}s (timeout {}s)",
                        turn.session,
                        turn.elapsed.as_secs(),
                        turn.timeout.as_secs()
                    );
                    self.abort_transport(&turn.session);
                    self.emit(SessionEvent::Notice {
                        session: turn.session.clone(),
                        text: notice,
                    });
                    self.emit(SessionEvent::WatchdogRecovered {
                        session: turn.session.clone(),
                        elapsed: turn.elapsed,
                        timeout: turn.timeout,
                    });
                    recovered.push(turn);
                }
                Err(e) => {
                    plog_error!("Watchdog could not recover '{}': {}", turn.session, e);
                }
            }
        }
        recovered
    }

    fn abort_transport(&self, name: &str) {
        let transport = self.transport.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = transport.abort(&name).await {
                plog_warn!("Transport abort for '{}' failed: {}", name, e);
            }
        });
    }
}

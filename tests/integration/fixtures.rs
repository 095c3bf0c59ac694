//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted transport with per-session reply queues
//! - Hubs and coordinators wired to it
//! - Waiting on session events

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, RwLock};

use polyphon::config::ReflectionSettings;
use polyphon::orchestration::{Coordinator, GroupId, GroupMode, MemberRole, Organization};
use polyphon::transport::{EventStream, SessionIdentity, Transport, TransportEvent};
use polyphon::turn::{SessionEvent, SessionHub};
use polyphon::{Error, Result};

/// What the transport does with one prompt.
#[derive(Debug, Clone)]
pub enum Reply {
    /// One content chunk, then idle.
    Text(String),
    /// Exactly these events.
    Events(Vec<TransportEvent>),
    /// Open a stream that never produces anything.
    Hang,
    /// Refuse to send.
    Fail(String),
}

pub fn text(s: &str) -> Reply {
    Reply::Text(s.to_string())
}

type Fallback = Box<dyn Fn(&SessionIdentity, &str) -> Reply + Send + Sync>;

/// Transport whose replies are queued per session by the test.
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    fallback: Fallback,
    prompts: Mutex<Vec<(String, String)>>,
    aborts: Mutex<Vec<String>>,
    // Keeps hung streams open
    hung: Mutex<Vec<futures::channel::mpsc::UnboundedSender<TransportEvent>>>,
}

impl ScriptedTransport {
    /// Unscripted prompts get "<session> ok".
    pub fn new() -> Self {
        Self::with_fallback(|identity, _| Reply::Text(format!("{} ok", identity.name)))
    }

    pub fn with_fallback(
        fallback: impl Fn(&SessionIdentity, &str) -> Reply + Send + Sync + 'static,
    ) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: Box::new(fallback),
            prompts: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
            hung: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, session: &str, replies: impl IntoIterator<Item = Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(session.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn prompts_for(&self, session: &str) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == session)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.aborts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, session: &SessionIdentity, prompt: &str) -> Result<EventStream> {
        self.prompts
            .lock()
            .unwrap()
            .push((session.name.clone(), prompt.to_string()));

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&session.name)
            .and_then(|queue| queue.pop_front());
        let reply = scripted.unwrap_or_else(|| (self.fallback)(session, prompt));

        match reply {
            Reply::Text(content) => Ok(stream::iter(vec![
                TransportEvent::Content(content),
                TransportEvent::TurnIdle,
            ])
            .boxed()),
            Reply::Events(events) => Ok(stream::iter(events).boxed()),
            Reply::Hang => {
                let (tx, rx) = futures::channel::mpsc::unbounded();
                self.hung.lock().unwrap().push(tx);
                Ok(rx.boxed())
            }
            Reply::Fail(message) => Err(Error::Transport(message)),
        }
    }

    async fn abort(&self, session: &str) -> Result<()> {
        self.aborts.lock().unwrap().push(session.to_string());
        Ok(())
    }
}

/// A hub on a scripted transport, with its event stream.
pub struct TestHub {
    pub hub: SessionHub,
    pub transport: Arc<ScriptedTransport>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl TestHub {
    pub async fn new(sessions: &[&str]) -> Self {
        Self::with_transport(ScriptedTransport::new(), sessions).await
    }

    pub async fn with_transport(transport: ScriptedTransport, sessions: &[&str]) -> Self {
        let transport = Arc::new(transport);
        let (events_tx, events) = mpsc::unbounded_channel();
        let hub = SessionHub::spawn_with_events(transport.clone(), events_tx);
        for name in sessions {
            hub.create_session(name, "sonnet")
                .await
                .expect("Failed to create session");
        }
        Self {
            hub,
            transport,
            events,
        }
    }

    /// Wait for the first event matching `pred`, skipping the rest.
    pub async fn wait_for(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), self.events.recv())
                .await
                .expect("Timed out waiting for session event")
                .expect("Event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    /// Poll until the transport has been asked to abort `session`.
    pub async fn wait_for_transport_abort(&self, session: &str) {
        for _ in 0..200 {
            if self.transport.aborts().iter().any(|s| s == session) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Transport abort for '{}' never happened", session);
    }
}

/// A coordinator over one group whose members are created on the hub.
pub struct TestTeam {
    pub hub: TestHub,
    pub organization: Arc<RwLock<Organization>>,
    pub coordinator: Coordinator,
    pub group: GroupId,
}

impl TestTeam {
    /// `orchestrator` is added first, then `workers` in order.
    pub async fn new(
        transport: ScriptedTransport,
        mode: GroupMode,
        orchestrator: Option<&str>,
        workers: &[&str],
        settings: ReflectionSettings,
    ) -> Self {
        let mut names: Vec<&str> = orchestrator.into_iter().collect();
        names.extend_from_slice(workers);
        let hub = TestHub::with_transport(transport, &names).await;

        let mut org = Organization::new();
        let group = org.create_group("team", mode, mode != GroupMode::Broadcast);
        if let Some(lead) = orchestrator {
            org.add_member(group, lead, MemberRole::Orchestrator).unwrap();
        }
        for worker in workers {
            org.add_member(group, worker, MemberRole::Worker).unwrap();
        }
        let organization = Arc::new(RwLock::new(org));
        let coordinator = Coordinator::new(hub.hub.clone(), organization.clone(), settings);

        Self {
            hub,
            organization,
            coordinator,
            group,
        }
    }

    pub fn transport(&self) -> &ScriptedTransport {
        &self.hub.transport
    }
}

//! Transport contract for talking to an agent process.
//!
//! The core treats a transport as an opaque event source: sending a prompt
//! yields a stream of [`TransportEvent`]s, and a turn can be aborted
//! explicitly. No wire encoding is assumed.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::Result;

/// Typed events produced by a transport while a turn is open.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A chunk of assistant-visible content.
    Content(String),
    /// A chunk of model reasoning.
    Reasoning(String),
    /// A tool call began.
    ToolStart { name: String },
    /// A tool call finished, optionally with its output.
    ToolEnd { name: String, output: Option<String> },
    /// The agent finished the turn and is waiting for input.
    TurnIdle,
    /// The agent reported an error that ends the turn.
    Error(String),
}

impl TransportEvent {
    /// Whether this event ends the turn it belongs to.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::TurnIdle | TransportEvent::Error(_))
    }
}

/// Who a prompt is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub name: String,
    pub model: String,
    /// Generation ticket of the turn this prompt opens.
    pub ticket: u64,
}

pub type EventStream = BoxStream<'static, TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a prompt and return the events of the turn it opens.
    async fn send(&self, session: &SessionIdentity, prompt: &str) -> Result<EventStream>;

    /// Ask the agent to stop the turn in progress for `session`.
    async fn abort(&self, session: &str) -> Result<()>;

    /// Demo transports complete synchronously and never hold a turn open,
    /// so the single-flight guard is bypassed for them.
    fn is_demo(&self) -> bool {
        false
    }
}

/// In-process transport that echoes each prompt back as one content chunk.
#[derive(Debug, Clone, Default)]
pub struct DemoTransport {
    prefix: String,
}

impl DemoTransport {
    pub fn new() -> Self {
        Self {
            prefix: "Echo: ".to_string(),
        }
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn reply_for(&self, prompt: &str) -> String {
        format!("{}{}", self.prefix, prompt)
    }
}

#[async_trait]
impl Transport for DemoTransport {
    async fn send(&self, _session: &SessionIdentity, prompt: &str) -> Result<EventStream> {
        let events = vec![
            TransportEvent::Content(self.reply_for(prompt)),
            TransportEvent::TurnIdle,
        ];
        Ok(stream::iter(events).boxed())
    }

    async fn abort(&self, _session: &str) -> Result<()> {
        Ok(())
    }

    fn is_demo(&self) -> bool {
        true
    }
}

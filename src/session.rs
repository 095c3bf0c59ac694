//! Session records: identity, transcript, queue and turn flags.
//!
//! A [`SessionRecord`] is plain data. Its turn fields are only changed by the
//! turn engine (and by the watchdog, through the engine's abort path), which
//! is why they are exposed through getters rather than public fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::{Error, Result};

const MAX_SESSION_NAME_LENGTH: usize = 64;

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Reasoning,
    Tool,
    /// Operator-visible notices (watchdog recovery, loop summaries).
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Reasoning => write!(f, "reasoning"),
            MessageRole::Tool => write!(f, "tool"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// A single immutable transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_name: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn tool(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            ..Self::new(MessageRole::Tool, content)
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == MessageRole::System
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    name: String,
    model: String,
    #[serde(default)]
    transcript: Vec<ChatMessage>,
    #[serde(default)]
    queue: VecDeque<String>,
    #[serde(default)]
    is_processing: bool,
    #[serde(default)]
    processing_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    active_tool_calls: u32,
    #[serde(default)]
    has_used_tools_this_turn: bool,
    #[serde(default)]
    is_resumed: bool,
    #[serde(default)]
    generation: u64,
    /// Content streamed so far in the open turn, not yet in the transcript.
    #[serde(default)]
    pending_content: String,
    /// Reasoning streamed so far in the open turn, not yet in the transcript.
    #[serde(default)]
    pending_reasoning: String,
    /// All assistant content produced by the open turn.
    #[serde(default)]
    turn_response: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(name: &str, model: &str) -> Result<Self> {
        validate_session_name(name)?;
        let now = Utc::now();
        Ok(Self {
            name: name.to_string(),
            model: model.to_string(),
            transcript: Vec::new(),
            queue: VecDeque::new(),
            is_processing: false,
            processing_started_at: None,
            active_tool_calls: 0,
            has_used_tools_this_turn: false,
            is_resumed: false,
            generation: 0,
            pending_content: String::new(),
            pending_reasoning: String::new(),
            turn_response: String::new(),
            created_at: now,
            last_active: now,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: &str) {
        self.model = model.to_string();
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn queue(&self) -> &VecDeque<String> {
        &self.queue
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    pub fn processing_started_at(&self) -> Option<DateTime<Utc>> {
        self.processing_started_at
    }

    pub fn active_tool_calls(&self) -> u32 {
        self.active_tool_calls
    }

    pub fn has_used_tools_this_turn(&self) -> bool {
        self.has_used_tools_this_turn
    }

    pub fn is_resumed(&self) -> bool {
        self.is_resumed
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Content streamed in the open turn that has not been flushed yet.
    pub fn pending_content(&self) -> &str {
        &self.pending_content
    }

    /// The most recent assistant entry, if any.
    pub fn last_response(&self) -> Option<&str> {
        self.transcript
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .map(|m| m.content.as_str())
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    pub(crate) fn push_message(&mut self, message: ChatMessage) {
        self.transcript.push(message);
        self.touch();
    }

    pub(crate) fn enqueue(&mut self, prompt: String) {
        self.queue.push_back(prompt);
    }

    pub(crate) fn dequeue(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    pub(crate) fn open_turn(&mut self, started_at: DateTime<Utc>) {
        self.is_processing = true;
        self.processing_started_at = Some(started_at);
        self.active_tool_calls = 0;
        self.has_used_tools_this_turn = false;
        self.pending_content.clear();
        self.pending_reasoning.clear();
        self.turn_response.clear();
        self.touch();
    }

    pub(crate) fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub(crate) fn append_content(&mut self, chunk: &str) {
        self.flush_reasoning();
        self.pending_content.push_str(chunk);
        self.turn_response.push_str(chunk);
        self.touch();
    }

    pub(crate) fn append_reasoning(&mut self, chunk: &str) {
        self.pending_reasoning.push_str(chunk);
        self.touch();
    }

    pub(crate) fn tool_started(&mut self, tool_name: &str) {
        self.flush_pending();
        self.active_tool_calls += 1;
        self.has_used_tools_this_turn = true;
        self.push_message(ChatMessage::tool(tool_name, format!("{} started", tool_name)));
    }

    pub(crate) fn tool_finished(&mut self, tool_name: &str, output: Option<&str>) {
        self.active_tool_calls = self.active_tool_calls.saturating_sub(1);
        let content = match output {
            Some(out) => out.to_string(),
            None => format!("{} finished", tool_name),
        };
        self.push_message(ChatMessage::tool(tool_name, content));
    }

    /// Move streamed reasoning and content into the transcript.
    pub(crate) fn flush_pending(&mut self) {
        self.flush_reasoning();
        if !self.pending_content.is_empty() {
            let content = std::mem::take(&mut self.pending_content);
            self.push_message(ChatMessage::assistant(content));
        }
    }

    fn flush_reasoning(&mut self) {
        if !self.pending_reasoning.is_empty() {
            let content = std::mem::take(&mut self.pending_reasoning);
            self.push_message(ChatMessage::new(MessageRole::Reasoning, content));
        }
    }

    pub(crate) fn take_turn_response(&mut self) -> String {
        std::mem::take(&mut self.turn_response)
    }

    /// Clear every per-turn field. Does not touch the queue or generation.
    pub(crate) fn close_turn(&mut self) {
        self.is_processing = false;
        self.processing_started_at = None;
        self.active_tool_calls = 0;
        self.has_used_tools_this_turn = false;
    }

    pub(crate) fn clear_queue(&mut self) {
        self.queue.clear();
    }

    pub(crate) fn set_resumed(&mut self, resumed: bool) {
        self.is_resumed = resumed;
    }
}

pub fn validate_session_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation(
            "Session name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_SESSION_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "Session name too long (max {} characters)",
            MAX_SESSION_NAME_LENGTH
        )));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(Error::Validation(
            "Session name cannot contain control characters".to_string(),
        ));
    }

    Ok(())
}

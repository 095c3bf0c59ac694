use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session '{0}' is already processing a turn")]
    AlreadyProcessing(String),

    #[error("Turn on session '{0}' was cancelled")]
    TurnCancelled(String),

    #[error("Turn on session '{session}' failed: {message}")]
    TurnFailed { session: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Group '{0}' has no orchestrator")]
    NoOrchestrator(String),

    #[error("Sequential chain halted at '{member}': {source}")]
    ChainHalted {
        member: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Session hub is no longer running")]
    HubClosed,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Whether this error came from a turn that ended without a response
    /// (cancelled, failed, or never started because the session was busy).
    pub fn is_turn_failure(&self) -> bool {
        matches!(
            self,
            Error::TurnCancelled(_) | Error::TurnFailed { .. } | Error::AlreadyProcessing(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

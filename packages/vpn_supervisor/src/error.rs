use std::path::PathBuf;

/// Errors surfaced to callers of the supervisor
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Credentials were missing a field or carried both/neither secret
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The client process could not be spawned
    #[error("failed to start {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The client was spawned but one of its pipes could not be attached
    #[error("failed to attach {0} of the client process")]
    StreamUnavailable(&'static str),
}

impl SupervisorError {
    /// True for errors raised before any process was touched
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, SupervisorError::InvalidCredentials(_))
    }
}

/// Non-fatal problems found while classifying client output.
///
/// These are logged and never change supervisor state.
#[derive(Debug, thiserror::Error)]
pub enum ParseWarning {
    #[error("could not parse session expiration {raw:?}: {source}")]
    SessionExpiry {
        raw: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("session expiration {raw:?} does not exist in the local timezone")]
    NonexistentLocalTime { raw: String },
}

use thiserror::Error;

pub type Result<T, E = VoxError> = std::result::Result<T, E>;

/// Error taxonomy shared by the engine and the HTTP surfaces.
///
/// RPC handlers translate these into status codes; periodic loops log them
/// and move on to the next tick.
#[derive(Debug, Error)]
pub enum VoxError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// A duplicate discover for the same join string within the TTL window.
    #[error("chat is already being discovered")]
    AlreadyJoined,

    /// The session hit its subscription cap; aborts that join only.
    #[error("too many chats for this session")]
    MaxChatsExceeded,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Unrecoverable boot failure (missing sessions, unreachable store).
    #[error("startup failed: {0}")]
    Startup(String),
}

impl VoxError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn bad_request(why: impl std::fmt::Display) -> Self {
        Self::BadRequest(why.to_string())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }
}

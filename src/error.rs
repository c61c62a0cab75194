use thiserror::Error;

/// Every failure the business layer can hand back to a router.
///
/// Routers never propagate these past a single connection or packet: the
/// control channel turns them into an `ERROR` reply, the data channel logs
/// them and keeps receiving.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("internal inconsistency: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn lobby_not_found(lobby_id: &str) -> Self {
        Self::NotFound(format!("lobby {}", lobby_id))
    }

    pub fn client_not_found(client_id: &str) -> Self {
        Self::NotFound(format!("client {}", client_id))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

//! Relay error taxonomy

use thiserror::Error;
use uuid::Uuid;

use crate::bridge::SocketError;
use crate::http::auth::AuthError;
use crate::session::services::CollaboratorError;
use crate::ssh::SshError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(#[from] AuthError),

    #[error("User {user} has no access to host {host}")]
    AccessDenied { user: Uuid, host: Uuid },

    #[error("Session {0} belongs to another user")]
    NotOwner(Uuid),

    #[error("Host not found: {0}")]
    HostNotFound(Uuid),

    #[error("No SSH key assigned to user {user} for host {host}")]
    KeyNotFound { user: Uuid, host: Uuid },

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Session {0} already has a client attached")]
    AlreadyAttached(Uuid),

    #[error("Session {0} is already live")]
    AlreadyLive(Uuid),

    #[error("Session limit reached ({max})")]
    SessionLimitReached { max: usize },

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// HTTP status class of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    TooManyRequests,
    Unavailable,
    Internal,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::BadRequest(_) => ErrorKind::BadRequest,
            RelayError::Unauthenticated(_) => ErrorKind::Unauthorized,
            RelayError::AccessDenied { .. } | RelayError::NotOwner(_) => ErrorKind::Forbidden,
            RelayError::HostNotFound(_) | RelayError::SessionNotFound(_) => ErrorKind::NotFound,
            RelayError::AlreadyAttached(_) | RelayError::AlreadyLive(_) => ErrorKind::Conflict,
            RelayError::Store(StoreError::Conflict(_)) => ErrorKind::Conflict,
            RelayError::RateLimited => ErrorKind::TooManyRequests,
            RelayError::SessionLimitReached { .. } => ErrorKind::Unavailable,
            RelayError::KeyNotFound { .. }
            | RelayError::InvalidState(_)
            | RelayError::Server(_)
            | RelayError::Ssh(_)
            | RelayError::Store(_)
            | RelayError::Collaborator(_)
            | RelayError::Socket(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let id = Uuid::new_v4();
        assert_eq!(RelayError::NotOwner(id).kind(), ErrorKind::Forbidden);
        assert_eq!(RelayError::SessionNotFound(id).kind(), ErrorKind::NotFound);
        assert_eq!(
            RelayError::Ssh(SshError::Timeout("dial".into())).kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            RelayError::Store(StoreError::Conflict(id)).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            RelayError::from(AuthError::MissingToken).kind(),
            ErrorKind::Unauthorized
        );
    }
}

//! HTTP / WebSocket surface
//!
//! Thin translators from requests to [`SshConnectionManager`] calls:
//!
//! | Route | Method |
//! |---|---|
//! | `/ssh/connect` | POST |
//! | `/ssh/connect/{id}` | DELETE |
//! | `/ssh/websocket/{id}` | GET (upgrade) |
//! | `/ssh/sessions` | GET |

pub mod auth;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::error::{ErrorKind, RelayError};
use crate::rate_limit::RateLimiter;
use crate::session::SshConnectionManager;

pub use auth::{extract_token, AuthError, Authenticator, Claims, StaticTokenAuthenticator, TokenGrant};
pub use handlers::{ConnectRequest, ConnectResponse, SessionView};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SshConnectionManager>,
    pub authenticator: Arc<dyn Authenticator>,
    pub limiter: Arc<RateLimiter>,
    /// Prefix of the `websocketUrl` handed back by connect
    pub public_websocket_base: String,
    /// Honor X-Forwarded-For / X-Real-IP for the client address
    pub trust_forwarded_headers: bool,
}

impl AppState {
    pub fn websocket_url(&self, id: uuid::Uuid) -> String {
        format!(
            "{}/ssh/websocket/{}",
            self.public_websocket_base.trim_end_matches('/'),
            id
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// All relay routes, with unmatched requests answered as JSON.
pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = std::convert::Infallible> + Clone {
    handlers::connect_route(state.clone())
        .or(handlers::disconnect_route(state.clone()))
        .or(handlers::websocket_route(state.clone()))
        .or(handlers::list_sessions_route(state))
        .recover(handlers::handle_rejection)
}

/// Serve until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), RelayError> {
    let (bound, server) = warp::serve(routes(state))
        .try_bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await })
        .map_err(|e| RelayError::Server(format!("failed to bind {}: {}", addr, e)))?;

    info!("SSH relay listening on {}", bound);
    server.await;
    info!("HTTP server stopped");
    Ok(())
}

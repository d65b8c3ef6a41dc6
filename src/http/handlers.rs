use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::{self, Response};
use warp::ws::Ws;
use warp::{Filter, Rejection, Reply};

use super::auth::{extract_token, Claims};
use super::{status_for, ApiError, AppState};
use crate::bridge::{ClientSocket, ServerMessage};
use crate::error::RelayError;
use crate::session::{
    ClientContext, SessionLookup, SessionMetadata, SshConnectionManager, TerminalSize,
};

const MAX_BODY_BYTES: u64 = 16 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub host_server_id: Uuid,
    pub username: String,
    #[serde(default)]
    pub columns: Option<u32>,
    #[serde(default)]
    pub rows: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub connection_id: Uuid,
    pub websocket_url: String,
    pub success: bool,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

/// One entry of `GET /ssh/sessions`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    #[serde(flatten)]
    pub metadata: SessionMetadata,
    /// Transport held by this process
    pub live: bool,
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Raw credentials as they arrived.
#[derive(Debug, Clone, Default)]
struct Credentials {
    authorization: Option<String>,
    query_token: Option<String>,
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn credentials() -> impl Filter<Extract = (Credentials,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(warp::query::<TokenQuery>())
        .map(|authorization, query: TokenQuery| Credentials {
            authorization,
            query_token: query.token,
        })
}

/// Behind a trusted proxy: X-Forwarded-For (first hop), then X-Real-IP,
/// then the socket address. Otherwise the socket address only.
pub(crate) fn resolve_client_ip(
    trust_forwarded: bool,
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    remote: Option<SocketAddr>,
) -> Option<String> {
    let peer = remote.map(|addr| addr.ip().to_string());
    if !trust_forwarded {
        return peer;
    }
    let forwarded = forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real = real_ip.map(str::trim).filter(|v| !v.is_empty());

    forwarded.or(real).map(str::to_string).or(peer)
}

fn client_context(
    trust_forwarded: bool,
) -> impl Filter<Extract = (ClientContext,), Error = Rejection> + Clone {
    warp::addr::remote()
        .and(warp::header::optional::<String>("x-forwarded-for"))
        .and(warp::header::optional::<String>("x-real-ip"))
        .and(warp::header::optional::<String>("user-agent"))
        .map(
            move |remote: Option<SocketAddr>,
                  forwarded: Option<String>,
                  real: Option<String>,
                  user_agent: Option<String>| ClientContext {
                client_ip: resolve_client_ip(
                    trust_forwarded,
                    forwarded.as_deref(),
                    real.as_deref(),
                    remote,
                ),
                user_agent,
            },
        )
}

fn json_reply<T: Serialize>(value: &T, status: StatusCode) -> Response {
    reply::with_status(reply::json(value), status).into_response()
}

fn error_reply(err: &RelayError) -> Response {
    let status = status_for(err.kind());
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected ({}): {}", status, err);
    }
    json_reply(
        &ApiError {
            message: err.to_string(),
        },
        status,
    )
}

fn respond<T: Serialize>(result: Result<T, RelayError>) -> Response {
    match result {
        Ok(body) => json_reply(&body, StatusCode::OK),
        Err(e) => error_reply(&e),
    }
}

fn rate_limit(state: &AppState, client: &ClientContext) -> Result<(), RelayError> {
    let key = client.client_ip.as_deref().unwrap_or("unknown");
    state.limiter.check(key)
}

async fn authenticate(state: &AppState, creds: &Credentials) -> Result<Claims, RelayError> {
    let token = extract_token(creds.authorization.as_deref(), creds.query_token.as_deref())?;
    Ok(state.authenticator.authenticate(&token).await?)
}

fn parse_id(raw: &str) -> Result<Uuid, RelayError> {
    Uuid::parse_str(raw).map_err(|_| RelayError::BadRequest(format!("invalid connection id {:?}", raw)))
}

/// Look up `id` and check the caller owns it.
async fn owned_session(
    state: &AppState,
    id: Uuid,
    claims: &Claims,
) -> Result<SessionLookup, RelayError> {
    let lookup = state
        .manager
        .get_session(id)
        .await?
        .ok_or(RelayError::SessionNotFound(id))?;
    state.manager.authorize(&lookup, claims.sub)?;
    Ok(lookup)
}

/// POST /ssh/connect
pub fn connect_route(state: AppState) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let trust = state.trust_forwarded_headers;
    warp::path!("ssh" / "connect")
        .and(warp::post())
        .and(with_state(state))
        .and(client_context(trust))
        .and(credentials())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and_then(
            |state: AppState, client: ClientContext, creds: Credentials, body: Bytes| async move {
                Ok::<_, Rejection>(respond(connect(&state, &client, &creds, &body).await))
            },
        )
}

async fn connect(
    state: &AppState,
    client: &ClientContext,
    creds: &Credentials,
    body: &[u8],
) -> Result<ConnectResponse, RelayError> {
    rate_limit(state, client)?;
    let claims = authenticate(state, creds).await?;

    let request: ConnectRequest = serde_json::from_slice(body)
        .map_err(|e| RelayError::BadRequest(format!("invalid connect request: {}", e)))?;
    let username = request.username.trim();
    if username.is_empty() {
        return Err(RelayError::BadRequest("username is required".into()));
    }
    let defaults = state.manager.config().default_size;
    let size = TerminalSize::new(
        request.columns.unwrap_or(defaults.cols),
        request.rows.unwrap_or(defaults.rows),
    );
    if !size.is_valid() {
        return Err(RelayError::BadRequest("columns and rows must be positive".into()));
    }

    let session = state
        .manager
        .open_session(claims.sub, request.host_server_id, username, size, client)
        .await?;

    info!(
        "User {} connected to host {} (session {})",
        claims.sub,
        request.host_server_id,
        session.id()
    );
    Ok(ConnectResponse {
        connection_id: session.id(),
        websocket_url: state.websocket_url(session.id()),
        success: true,
    })
}

/// DELETE /ssh/connect/{id}
pub fn disconnect_route(state: AppState) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("ssh" / "connect" / String)
        .and(warp::delete())
        .and(with_state(state))
        .and(credentials())
        .and_then(|raw_id: String, state: AppState, creds: Credentials| async move {
            Ok::<_, Rejection>(respond(disconnect(&state, &creds, &raw_id).await))
        })
}

async fn disconnect(
    state: &AppState,
    creds: &Credentials,
    raw_id: &str,
) -> Result<MessageResponse, RelayError> {
    let claims = authenticate(state, creds).await?;
    let id = parse_id(raw_id)?;
    owned_session(state, id, &claims).await?;

    state.manager.remove_session(id).await?;
    Ok(MessageResponse {
        message: "Connection closed successfully".to_string(),
    })
}

/// GET /ssh/websocket/{id}
pub fn websocket_route(state: AppState) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let trust = state.trust_forwarded_headers;
    warp::path!("ssh" / "websocket" / String)
        .and(warp::get())
        .and(with_state(state))
        .and(client_context(trust))
        .and(credentials())
        .and(warp::ws())
        .and_then(
            |raw_id: String, state: AppState, client: ClientContext, creds: Credentials, ws: Ws| async move {
                let response = match upgrade(&state, &client, &creds, &raw_id, ws).await {
                    Ok(response) => response,
                    Err(e) => error_reply(&e),
                };
                Ok::<_, Rejection>(response)
            },
        )
}

async fn upgrade(
    state: &AppState,
    client: &ClientContext,
    creds: &Credentials,
    raw_id: &str,
    ws: Ws,
) -> Result<Response, RelayError> {
    rate_limit(state, client)?;
    let claims = authenticate(state, creds).await?;
    let id = parse_id(raw_id)?;

    let lookup = owned_session(state, id, &claims).await?;
    match &lookup {
        SessionLookup::Live(session) => {
            if session.has_client().await {
                return Err(RelayError::AlreadyAttached(id));
            }
        }
        SessionLookup::Stored(meta) => {
            if !meta.is_active {
                return Err(RelayError::SessionNotFound(id));
            }
        }
    }

    let manager = state.manager.clone();
    let user = claims.sub;
    Ok(ws
        .on_upgrade(move |socket| bridge_client(manager, lookup, user, ClientSocket::from_warp(socket)))
        .into_response())
}

/// Runs once the upgrade has completed; a stored session is only re-dialed
/// here, so an abandoned upgrade never opens an SSH connection.
async fn bridge_client(
    manager: Arc<SshConnectionManager>,
    lookup: SessionLookup,
    user: Uuid,
    mut socket: ClientSocket,
) {
    let session = match lookup {
        SessionLookup::Live(session) => session,
        SessionLookup::Stored(meta) => {
            let size = manager.config().default_size;
            match manager.rehydrate_and_connect(&meta, user, size).await {
                Ok(session) => session,
                Err(e) => {
                    warn!("Failed to rehydrate session {}: {}", meta.id, e);
                    if let Ok(frame) = ServerMessage::Error(e.to_string()).to_json() {
                        let _ = socket.sink.send(frame).await;
                    }
                    let _ = socket.sink.close().await;
                    return;
                }
            }
        }
    };

    if let Err(e) = manager.attach_client(&session, socket).await {
        warn!("Failed to attach client to session {}: {}", session.id(), e);
    }
}

/// GET /ssh/sessions
pub fn list_sessions_route(state: AppState) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("ssh" / "sessions")
        .and(warp::get())
        .and(with_state(state))
        .and(credentials())
        .and_then(|state: AppState, creds: Credentials| async move {
            Ok::<_, Rejection>(respond(list_sessions(&state, &creds).await))
        })
}

async fn list_sessions(state: &AppState, creds: &Credentials) -> Result<Vec<SessionView>, RelayError> {
    let claims = authenticate(state, creds).await?;
    let sessions = state.manager.list_active_sessions(Some(claims.sub)).await?;
    Ok(sessions
        .into_iter()
        .map(|s| SessionView {
            metadata: s.metadata,
            live: s.live,
        })
        .collect())
}

/// Unmatched routes and filter failures as `{message}` bodies.
pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large".to_string())
    } else {
        (StatusCode::BAD_REQUEST, format!("Bad request: {:?}", err))
    };
    Ok(json_reply(&ApiError { message }, status))
}

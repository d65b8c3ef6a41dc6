//! Request authentication
//!
//! Callers present a bearer token, either in the `Authorization` header or,
//! for WebSocket upgrades where browsers cannot set headers, in the `token`
//! query parameter. An [`Authenticator`] turns it into typed [`Claims`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    Expired,
}

/// Authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    /// User id
    pub sub: Uuid,
    #[serde(default)]
    pub role_ids: Vec<Uuid>,
    #[serde(default)]
    pub exp: Option<DateTime<Utc>>,
}

impl Claims {
    pub fn new(sub: Uuid) -> Self {
        Self {
            sub,
            role_ids: Vec::new(),
            exp: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.exp.is_some_and(|exp| exp <= now)
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// A pre-shared token and the identity it stands for.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub token: String,
    pub user_id: Uuid,
    #[serde(default)]
    pub role_ids: Vec<Uuid>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Authenticates against a fixed list of grants.
pub struct StaticTokenAuthenticator {
    /// (sha256(token), claims)
    grants: Vec<([u8; 32], Claims)>,
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

impl StaticTokenAuthenticator {
    pub fn new(grants: impl IntoIterator<Item = TokenGrant>) -> Self {
        let grants = grants
            .into_iter()
            .map(|g| {
                (
                    digest(&g.token),
                    Claims {
                        sub: g.user_id,
                        role_ids: g.role_ids,
                        exp: g.expires_at,
                    },
                )
            })
            .collect();
        Self { grants }
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Claims, AuthError> {
        let presented = digest(token.trim());

        // Compare against every grant so timing does not reveal which matched
        let mut found: Option<&Claims> = None;
        for (expected, claims) in &self.grants {
            if bool::from(presented[..].ct_eq(&expected[..])) {
                found = Some(claims);
            }
        }

        let claims = found.ok_or_else(|| {
            warn!("Rejected unknown bearer token");
            AuthError::InvalidToken
        })?;
        if claims.is_expired_at(Utc::now()) {
            return Err(AuthError::Expired);
        }
        Ok(claims.clone())
    }
}

/// Pick the token from `Authorization: Bearer ...`, falling back to the
/// `token` query parameter.
pub fn extract_token(
    authorization: Option<&str>,
    query_token: Option<&str>,
) -> Result<String, AuthError> {
    if let Some(header) = authorization {
        let mut parts = header.trim().splitn(2, ' ');
        let scheme = parts.next().unwrap_or_default();
        let value = parts.next().map(str::trim).unwrap_or_default();
        if scheme.eq_ignore_ascii_case("bearer") && !value.is_empty() {
            return Ok(value.to_string());
        }
        return Err(AuthError::InvalidToken);
    }
    match query_token.map(str::trim) {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(AuthError::MissingToken),
    }
}

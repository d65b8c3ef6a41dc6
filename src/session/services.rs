//! External collaborators consumed by the relay
//!
//! Host inventory, user/host key mappings, secret storage and audit logging
//! are owned by other services. The relay only talks to them through these
//! traits; [`crate::inventory::Inventory`] is a file-backed implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::types::HostInfo;
use crate::ssh::SshConnector;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
}

/// Grants one user one SSH key on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyHostMapping {
    pub user_id: Uuid,
    pub host_server_id: Uuid,
    pub ssh_key_id: Uuid,
    #[serde(default)]
    pub host_username: Option<String>,
}

/// SSH key record. Holds secret references, never key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshKeyRecord {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    pub private_key_secret: String,
    #[serde(default)]
    pub passphrase_secret: Option<String>,
}

/// Decrypted key material for one dial.
pub struct KeyMaterial {
    pub key_id: Uuid,
    pub private_key: Zeroizing<String>,
    pub passphrase: Option<Zeroizing<String>>,
    /// Username recorded on the mapping; informational only.
    pub host_username: Option<String>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("private_key", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("host_username", &self.host_username)
            .finish()
    }
}

#[async_trait]
pub trait HostDirectory: Send + Sync {
    async fn get_host(&self, host_id: Uuid) -> Result<Option<HostInfo>, CollaboratorError>;
}

#[async_trait]
pub trait AccessMappings: Send + Sync {
    async fn mappings_for_host(
        &self,
        host_id: Uuid,
    ) -> Result<Vec<KeyHostMapping>, CollaboratorError>;

    async fn ssh_key(&self, key_id: Uuid) -> Result<Option<SshKeyRecord>, CollaboratorError>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn retrieve_secret(&self, reference: &str)
        -> Result<Zeroizing<String>, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub action: AuditAction,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub host_server_id: Uuid,
    pub username: String,
    pub client_ip: Option<String>,
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), CollaboratorError>;
}

/// Audit log that emits structured tracing events.
#[derive(Debug, Default)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn record(&self, event: AuditEvent) -> Result<(), CollaboratorError> {
        info!(
            target: "ssh_relay::audit",
            action = ?event.action,
            session = %event.session_id,
            user = %event.user_id,
            host = %event.host_server_id,
            username = %event.username,
            client_ip = event.client_ip.as_deref().unwrap_or("-"),
            "ssh session event"
        );
        Ok(())
    }
}

/// Collaborator handles injected into the manager.
#[derive(Clone)]
pub struct RelayServices {
    pub hosts: Arc<dyn HostDirectory>,
    pub mappings: Arc<dyn AccessMappings>,
    pub secrets: Arc<dyn SecretStore>,
    pub audit: Arc<dyn AuditLog>,
    pub connector: Arc<dyn SshConnector>,
}

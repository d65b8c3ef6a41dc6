//! File-backed collaborators
//!
//! A JSON inventory of hosts, SSH key records, user/host key mappings,
//! secrets and API tokens. It backs the host directory, access mappings and
//! secret store when the relay runs standalone.
//!
//! ```json
//! {
//!   "hosts": [{"id": "...", "name": "web-1", "address": "10.0.0.5", "port": 22}],
//!   "keys": [{"id": "...", "privateKeySecret": "keys/deploy"}],
//!   "mappings": [{"userId": "...", "hostServerId": "...", "sshKeyId": "..."}],
//!   "secrets": {"keys/deploy": {"file": "/etc/ssh-relay/deploy_ed25519"}},
//!   "tokens": [{"token": "...", "userId": "..."}]
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::http::auth::TokenGrant;
use crate::session::services::{
    AccessMappings, CollaboratorError, HostDirectory, KeyHostMapping, SecretStore, SshKeyRecord,
};
use crate::session::types::HostInfo;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Failed to read inventory {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid inventory {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Where a secret's value lives.
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretSource {
    File { file: PathBuf },
    Inline(String),
}

impl std::fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretSource::File { file } => f.debug_struct("File").field("file", file).finish(),
            SecretSource::Inline(_) => f.write_str("Inline(<redacted>)"),
        }
    }
}

/// On-disk layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryFile {
    pub hosts: Vec<HostInfo>,
    pub keys: Vec<SshKeyRecord>,
    pub mappings: Vec<KeyHostMapping>,
    pub secrets: HashMap<String, SecretSource>,
    pub tokens: Vec<TokenGrant>,
}

#[derive(Debug, Default)]
struct Indexed {
    hosts: HashMap<Uuid, HostInfo>,
    keys: HashMap<Uuid, SshKeyRecord>,
    mappings: Vec<KeyHostMapping>,
    secrets: HashMap<String, SecretSource>,
    tokens: Vec<TokenGrant>,
}

impl From<InventoryFile> for Indexed {
    fn from(file: InventoryFile) -> Self {
        Self {
            hosts: file.hosts.into_iter().map(|h| (h.id, h)).collect(),
            keys: file.keys.into_iter().map(|k| (k.id, k)).collect(),
            mappings: file.mappings,
            secrets: file.secrets,
            tokens: file.tokens,
        }
    }
}

#[derive(Debug, Default)]
pub struct Inventory {
    data: Indexed,
}

impl Inventory {
    pub fn new(file: InventoryFile) -> Self {
        Self {
            data: file.into(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let content = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: InventoryFile =
            serde_json::from_str(&content).map_err(|source| InventoryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        info!(
            "Loaded inventory {:?}: {} host(s), {} mapping(s), {} token(s)",
            path,
            file.hosts.len(),
            file.mappings.len(),
            file.tokens.len()
        );
        Ok(Self::new(file))
    }


    pub fn builder() -> InventoryBuilder {
        InventoryBuilder::default()
    }

    pub fn tokens(&self) -> Vec<TokenGrant> {
        self.data.tokens.clone()
    }
}

/// Assembles an [`Inventory`] in code.
#[derive(Debug, Default)]
pub struct InventoryBuilder {
    file: InventoryFile,
}

impl InventoryBuilder {
    pub fn host(mut self, host: HostInfo) -> Self {
        self.file.hosts.push(host);
        self
    }

    pub fn key(mut self, key: SshKeyRecord) -> Self {
        self.file.keys.push(key);
        self
    }

    pub fn mapping(mut self, mapping: KeyHostMapping) -> Self {
        self.file.mappings.push(mapping);
        self
    }

    pub fn secret(mut self, reference: &str, value: &str) -> Self {
        self.file
            .secrets
            .insert(reference.to_string(), SecretSource::Inline(value.to_string()));
        self
    }

    pub fn build(self) -> Inventory {
        Inventory::new(self.file)
    }
}

#[async_trait]
impl HostDirectory for Inventory {
    async fn get_host(&self, host_id: Uuid) -> Result<Option<HostInfo>, CollaboratorError> {
        Ok(self.data.hosts.get(&host_id).cloned())
    }
}

#[async_trait]
impl AccessMappings for Inventory {
    async fn mappings_for_host(
        &self,
        host_id: Uuid,
    ) -> Result<Vec<KeyHostMapping>, CollaboratorError> {
        Ok(self
            .data
            .mappings
            .iter()
            .filter(|m| m.host_server_id == host_id)
            .cloned()
            .collect())
    }

    async fn ssh_key(&self, key_id: Uuid) -> Result<Option<SshKeyRecord>, CollaboratorError> {
        Ok(self.data.keys.get(&key_id).cloned())
    }
}

#[async_trait]
impl SecretStore for Inventory {
    async fn retrieve_secret(
        &self,
        reference: &str,
    ) -> Result<Zeroizing<String>, CollaboratorError> {
        let source = self
            .data
            .secrets
            .get(reference)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("secret {:?}", reference)))?;

        match source {
            SecretSource::Inline(value) => Ok(Zeroizing::new(value)),
            SecretSource::File { file } => tokio::fs::read_to_string(&file)
                .await
                .map(Zeroizing::new)
                .map_err(|e| {
                    CollaboratorError::Unavailable(format!(
                        "secret {:?} at {:?}: {}",
                        reference, file, e
                    ))
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("deploy_ed25519");
        std::fs::write(&key_path, "KEY-BYTES").unwrap();

        let host = Uuid::new_v4();
        let key = Uuid::new_v4();
        let user = Uuid::new_v4();
        let json = serde_json::json!({
            "hosts": [{"id": host, "name": "web-1", "address": "10.0.0.5"}],
            "keys": [{"id": key, "privateKeySecret": "keys/deploy", "passphraseSecret": "keys/pass"}],
            "mappings": [{"userId": user, "hostServerId": host, "sshKeyId": key}],
            "secrets": {
                "keys/deploy": {"file": key_path},
                "keys/pass": "hunter2"
            },
            "tokens": [{"token": "t0k", "userId": user}]
        });
        let path = dir.path().join("inventory.json");
        std::fs::write(&path, json.to_string()).unwrap();

        let inv = Inventory::load(&path).unwrap();
        assert_eq!(inv.get_host(host).await.unwrap().unwrap().port, 22);
        assert!(inv.get_host(Uuid::new_v4()).await.unwrap().is_none());
        assert_eq!(inv.mappings_for_host(host).await.unwrap().len(), 1);
        assert!(inv.mappings_for_host(Uuid::new_v4()).await.unwrap().is_empty());
        assert_eq!(*inv.retrieve_secret("keys/deploy").await.unwrap(), "KEY-BYTES");
        assert_eq!(*inv.retrieve_secret("keys/pass").await.unwrap(), "hunter2");
        assert!(matches!(
            inv.retrieve_secret("nope").await,
            Err(CollaboratorError::NotFound(_))
        ));
        assert_eq!(inv.tokens().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_secret_file_is_unavailable() {
        let inv = Inventory::new(InventoryFile {
            secrets: HashMap::from([(
                "k".to_string(),
                SecretSource::File {
                    file: PathBuf::from("/nonexistent/ssh-relay/key"),
                },
            )]),
            ..InventoryFile::default()
        });
        assert!(matches!(
            inv.retrieve_secret("k").await,
            Err(CollaboratorError::Unavailable(_))
        ));
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            Inventory::load(&path),
            Err(InventoryError::Parse { .. })
        ));
        assert!(matches!(
            Inventory::load(&dir.path().join("missing.json")),
            Err(InventoryError::Io { .. })
        ));
    }

    #[test]
    fn test_secret_debug_redacts_inline() {
        let s = SecretSource::Inline("hunter2".into());
        assert!(!format!("{:?}", s).contains("hunter2"));
    }
}

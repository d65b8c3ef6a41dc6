//! Session Types and Data Structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable description of a relay session.
///
/// This is everything the store knows; live transport handles never leave
/// the process that owns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub id: Uuid,
    pub user_id: Uuid,
    pub host_server_id: Uuid,
    pub username: String,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
}

impl SessionMetadata {
    pub fn new(
        id: Uuid,
        user_id: Uuid,
        host_server_id: Uuid,
        username: impl Into<String>,
        client: &ClientContext,
    ) -> Self {
        let now = now_millis();
        Self {
            id,
            user_id,
            host_server_id,
            username: username.into(),
            client_ip: client.client_ip.clone(),
            user_agent: client.user_agent.clone(),
            created_at: now,
            last_activity: now,
            is_active: true,
        }
    }
}

/// Current time at millisecond precision, the resolution every store keeps.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Session lifecycle
///
/// ```text
/// Idle -> Connecting -> Live -> Closing -> Closed
///              |                              ^
///              +------------- failed ---------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Live,
    Closing,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Live => "live",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// PTY geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }

    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

/// Where a connect request came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Managed host as reported by the host directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

/// Everything needed to dial one host as one login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl DialTarget {
    pub fn new(host: &HostInfo, username: impl Into<String>) -> Self {
        Self {
            host: host.address.clone(),
            port: host.port,
            username: username.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_serializes_camel_case() {
        let meta = SessionMetadata::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "deploy",
            &ClientContext {
                client_ip: Some("10.1.2.3".into()),
                user_agent: None,
            },
        );
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["username"], "deploy");
        assert_eq!(json["clientIp"], "10.1.2.3");
        assert_eq!(json["isActive"], true);
        assert!(json.get("hostServerId").is_some());
    }

    #[test]
    fn test_host_info_default_port() {
        let host: HostInfo = serde_json::from_str(
            r#"{"id":"6f1c1b1e-7d0e-4e55-9c35-0d2b8b7c8a01","address":"10.0.0.5"}"#,
        )
        .unwrap();
        assert_eq!(host.port, 22);
        let target = DialTarget::new(&host, "root");
        assert_eq!(target.host, "10.0.0.5");
    }

    #[test]
    fn test_terminal_size_validity() {
        assert!(TerminalSize::default().is_valid());
        assert!(!TerminalSize::new(0, 24).is_valid());
    }
}

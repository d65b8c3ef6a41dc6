//! Session Management Module
//!
//! - `types`: durable metadata, lifecycle state, terminal geometry
//! - `services`: external collaborators (hosts, key mappings, secrets, audit)
//! - `ssh_session`: one live SSH shell bridged to one client socket
//! - `manager`: live-session map, access control, rehydration, expiry sweeps

mod manager;
pub mod services;
mod ssh_session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{ActiveSession, ManagerConfig, SessionLookup, SshConnectionManager, SweepReport};
pub use services::{
    AccessMappings, AuditAction, AuditEvent, AuditLog, CollaboratorError, HostDirectory,
    KeyHostMapping, KeyMaterial, RelayServices, SecretStore, SshKeyRecord, TracingAuditLog,
};
pub use ssh_session::{SessionContext, SshSession};
pub use types::{ClientContext, DialTarget, HostInfo, SessionMetadata, SessionState, TerminalSize};

//! SSH Relay - browser-to-host interactive shells over WebSocket
//!
//! A browser asks for a shell on a managed host; the relay checks the
//! caller's access mapping, resolves the assigned SSH key through the secret
//! store, dials the host and bridges the PTY to a WebSocket. Session metadata
//! lives in a pluggable store so another relay process can rehydrate a
//! session after a restart or failover.

pub mod bridge;
pub mod config;
pub mod error;
pub mod http;
pub mod inventory;
pub mod rate_limit;
pub mod session;
pub mod ssh;
pub mod store;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{ConfigError, RelayConfig};
pub use error::{ErrorKind, RelayError};
pub use session::{ManagerConfig, RelayServices, SessionLookup, SshConnectionManager, SshSession};
pub use store::{open_store, SessionStore, StoreConfig, StoreError};

/// Install the global tracing subscriber; `RUST_LOG` overrides the `info`
/// default.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

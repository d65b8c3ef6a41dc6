//! SSH module - outbound connections to managed hosts
//!
//! # Features
//! - Public-key authentication with key material resolved per user/host
//! - Trust-on-first-use host key verification via a known_hosts file
//! - PTY-backed interactive shell with resize support

mod client;
mod error;
pub mod known_hosts;
mod shell;

pub use client::{parse_private_key, ClientHandler, RusshConnector};
pub use error::SshError;
pub use known_hosts::{HostKeyPolicy, HostKeyVerification};
pub use shell::{RemoteShell, RusshShell, ShellCommand, ShellIo, SshConnector};

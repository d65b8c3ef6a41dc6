//! Interactive shell over an SSH session channel
//!
//! [`RemoteShell`] is the transport seam used by the relay session; the
//! russh-backed implementation owns the client handle and the session
//! channel and runs one driver task per shell.

use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use crate::session::services::KeyMaterial;
use crate::session::types::{DialTarget, TerminalSize};

/// Output channels are bounded; a slow browser applies backpressure to SSH.
const OUTPUT_BUFFER: usize = 1024;
const DRIVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Commands that can be sent to the shell driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    /// Data to send to SSH stdin
    Data(Vec<u8>),
    /// PTY window-change
    Resize(TerminalSize),
    /// Send EOF and close the channel
    Close,
}

/// Streams of a started shell.
pub struct ShellIo {
    pub cmd_tx: mpsc::Sender<ShellCommand>,
    pub stdout_rx: mpsc::Receiver<Vec<u8>>,
    pub stderr_rx: mpsc::Receiver<Vec<u8>>,
}

/// A connected SSH client with one PTY-backed session channel.
#[async_trait]
pub trait RemoteShell: Send {
    /// Request the interactive shell and hand out its streams.
    async fn start_shell(&mut self) -> Result<ShellIo, SshError>;

    /// Close the session channel. Safe to call more than once.
    async fn close_session(&mut self);

    /// Disconnect the SSH client. Safe to call more than once.
    async fn close_client(&mut self);
}

/// Dials a host and returns a shell-ready connection.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(
        &self,
        target: &DialTarget,
        key: &KeyMaterial,
        size: TerminalSize,
    ) -> Result<Box<dyn RemoteShell>, SshError>;
}

/// russh-backed [`RemoteShell`].
pub struct RusshShell {
    label: String,
    handle: Option<Handle<ClientHandler>>,
    /// Present until the shell is started
    channel: Option<Channel<client::Msg>>,
    cmd_tx: Option<mpsc::Sender<ShellCommand>>,
    driver: Option<JoinHandle<()>>,
}

impl RusshShell {
    pub(crate) fn new(
        label: String,
        handle: Handle<ClientHandler>,
        channel: Channel<client::Msg>,
    ) -> Self {
        Self {
            label,
            handle: Some(handle),
            channel: Some(channel),
            cmd_tx: None,
            driver: None,
        }
    }
}

#[async_trait]
impl RemoteShell for RusshShell {
    async fn start_shell(&mut self) -> Result<ShellIo, SshError> {
        let channel = self
            .channel
            .take()
            .ok_or_else(|| SshError::ChannelError("shell already started".to_string()))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<ShellCommand>(OUTPUT_BUFFER);
        let (stdout_tx, stdout_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_BUFFER);
        let (stderr_tx, stderr_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_BUFFER);

        info!("Interactive shell started for {}", self.label);

        self.driver = Some(tokio::spawn(drive_channel(
            self.label.clone(),
            channel,
            cmd_rx,
            stdout_tx,
            stderr_tx,
        )));
        self.cmd_tx = Some(cmd_tx.clone());

        Ok(ShellIo {
            cmd_tx,
            stdout_rx,
            stderr_rx,
        })
    }

    async fn close_session(&mut self) {
        if let Some(channel) = self.channel.take() {
            // Shell never started
            let _ = channel.close().await;
        }
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(ShellCommand::Close).await;
        }
        if let Some(driver) = self.driver.take() {
            if tokio::time::timeout(DRIVER_SHUTDOWN_TIMEOUT, driver)
                .await
                .is_err()
            {
                warn!("Shell driver for {} did not stop in time", self.label);
            }
        }
    }

    async fn close_client(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "session closed", "en")
                .await
            {
                debug!("Disconnect for {} returned: {}", self.label, e);
            }
        }
    }
}

/// Pump between the command channel and the SSH session channel until
/// either side finishes.
async fn drive_channel(
    label: String,
    mut channel: Channel<client::Msg>,
    mut cmd_rx: mpsc::Receiver<ShellCommand>,
    stdout_tx: mpsc::Sender<Vec<u8>>,
    stderr_tx: mpsc::Sender<Vec<u8>>,
) {
    debug!("Channel driver started for {}", label);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ShellCommand::Data(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            error!("Failed to send data to SSH channel {}: {}", label, e);
                            break;
                        }
                    }
                    Some(ShellCommand::Resize(size)) => {
                        if let Err(e) = channel.window_change(size.cols, size.rows, 0, 0).await {
                            // Not fatal, the shell keeps its old geometry
                            warn!("Failed to resize PTY for {}: {}", label, e);
                        } else {
                            debug!("PTY resized to {}x{} for {}", size.cols, size.rows, label);
                        }
                    }
                    Some(ShellCommand::Close) | None => {
                        let _ = channel.eof().await;
                        let _ = channel.close().await;
                        break;
                    }
                }
            }

            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if stdout_tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext == 1 && stderr_tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        info!("SSH channel finished for {}", label);
                        break;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        info!("Remote shell for {} exited with {}", label, exit_status);
                    }
                    Some(_) => {}
                }
            }
        }
    }

    debug!("Channel driver terminated for {}", label);
}

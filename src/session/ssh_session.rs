//! One relay session: an SSH shell bridged to one client socket
//!
//! Locking is two-level: the manager's map lock only guards membership,
//! while each session serializes its own transports behind `transport`.
//! Teardown runs exactly once, whichever pump or caller triggers it first.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::services::{AuditAction, AuditEvent, AuditLog, KeyMaterial};
use super::types::{now_millis, DialTarget, HostInfo, SessionMetadata, SessionState, TerminalSize};
use crate::bridge::{ClientMessage, ClientSocket, Inbound, ServerMessage, SocketSink, Utf8Chunker};
use crate::error::RelayError;
use crate::ssh::{RemoteShell, ShellCommand, SshConnector};
use crate::store::{SessionStore, StoreError};

/// A client that cannot take a frame within this window is dropped
const SOCKET_SEND_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Transport {
    shell: Option<Box<dyn RemoteShell>>,
    connect_attempted: bool,
    /// Attached, pumps not started yet
    socket: Option<ClientSocket>,
    /// Shared by the two output pumps once started
    sink: Option<Arc<AsyncMutex<SocketSink>>>,
    pumps_started: bool,
}

/// Collaborators a session reports to.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn SessionStore>,
    pub audit: Arc<dyn AuditLog>,
    /// Minimum spacing between activity writes to the store
    pub activity_flush: Duration,
}

pub struct SshSession {
    meta: SessionMetadata,
    ctx: SessionContext,
    live_since: Instant,
    state: Mutex<SessionState>,
    /// Unix millis; only ever moves forward
    last_activity_ms: AtomicI64,
    last_flush_ms: AtomicI64,
    transport: AsyncMutex<Transport>,
    /// Close-once guard
    closing: AtomicBool,
    /// Stops the pumps
    cancel: CancellationToken,
    /// Fires when teardown has finished
    closed: CancellationToken,
    persist_task: Mutex<Option<JoinHandle<()>>>,
    persisted: Arc<AtomicBool>,
}

impl SshSession {
    pub fn new(meta: SessionMetadata, ctx: SessionContext) -> Self {
        let last = meta.last_activity.timestamp_millis();
        Self {
            meta,
            ctx,
            live_since: Instant::now(),
            state: Mutex::new(SessionState::Idle),
            last_activity_ms: AtomicI64::new(last),
            last_flush_ms: AtomicI64::new(last),
            transport: AsyncMutex::new(Transport::default()),
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            persist_task: Mutex::new(None),
            persisted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.meta.id
    }

    pub fn user_id(&self) -> Uuid {
        self.meta.user_id
    }

    pub fn host_server_id(&self) -> Uuid {
        self.meta.host_server_id
    }

    pub fn username(&self) -> &str {
        &self.meta.username
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_live(&self) -> bool {
        self.state() == SessionState::Live
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// When this process brought the session up.
    pub fn live_since(&self) -> Instant {
        self.live_since
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity_ms.load(Ordering::SeqCst))
            .unwrap_or(self.meta.last_activity)
    }

    /// Metadata snapshot with the in-memory activity timestamp.
    pub fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            last_activity: self.last_activity(),
            is_active: !self.is_closed(),
            ..self.meta.clone()
        }
    }

    pub async fn has_client(&self) -> bool {
        let t = self.transport.lock().await;
        t.socket.is_some() || t.pumps_started
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        debug!("Session {} state {} -> {}", self.meta.id, *state, next);
        *state = next;
    }

    /// Dial, authenticate and allocate the PTY. At most once per session.
    pub async fn connect(
        &self,
        connector: &dyn SshConnector,
        host: &HostInfo,
        key: &KeyMaterial,
        size: TerminalSize,
    ) -> Result<(), RelayError> {
        let mut transport = self.transport.lock().await;
        if transport.connect_attempted {
            return Err(RelayError::InvalidState(format!(
                "connect called twice on session {}",
                self.meta.id
            )));
        }
        if self.is_closed() {
            return Err(RelayError::SessionNotFound(self.meta.id));
        }
        transport.connect_attempted = true;
        self.set_state(SessionState::Connecting);

        let target = DialTarget::new(host, self.meta.username.clone());
        match connector.connect(&target, key, size).await {
            Ok(mut shell) if self.is_closed() => {
                // Closed while dialing; `close` is waiting on the transport
                shell.close_session().await;
                shell.close_client().await;
                drop(transport);
                warn!("Session {} closed while connecting", self.meta.id);
                Err(RelayError::SessionNotFound(self.meta.id))
            }
            Ok(shell) => {
                transport.shell = Some(shell);
                // Under the transport lock so a racing `close` sees the task
                self.spawn_persist();
                self.set_state(SessionState::Live);
                drop(transport);
                info!(
                    "Session {} live: {}@{}:{}",
                    self.meta.id, self.meta.username, host.address, host.port
                );
                Ok(())
            }
            Err(e) => {
                drop(transport);
                warn!("Session {} failed to connect: {}", self.meta.id, e);
                // Never persisted, nothing else to release
                self.closing.store(true, Ordering::SeqCst);
                self.set_state(SessionState::Closed);
                self.cancel.cancel();
                self.closed.cancel();
                Err(RelayError::Ssh(e))
            }
        }
    }

    /// Record (or revive) the metadata row and the connect audit event.
    fn spawn_persist(&self) {
        let store = self.ctx.store.clone();
        let audit = self.ctx.audit.clone();
        let persisted = self.persisted.clone();
        let meta = SessionMetadata {
            last_activity: self.last_activity(),
            is_active: true,
            ..self.meta.clone()
        };

        let task = tokio::spawn(async move {
            let result = match store.create_session(&meta).await {
                Err(StoreError::Conflict(_)) => {
                    store.reactivate_session(meta.id, now_millis()).await
                }
                other => other,
            };
            match result {
                Ok(()) => persisted.store(true, Ordering::SeqCst),
                // The live session carries on; other processes cannot see it
                Err(e) => warn!("Failed to persist session {}: {}", meta.id, e),
            }

            if let Err(e) = audit.record(audit_event(&meta, AuditAction::Connect)).await {
                warn!("Failed to record connect event for {}: {}", meta.id, e);
            }
        });
        *self.persist_task.lock() = Some(task);
    }

    /// Attach the client transport. Allowed once, after `connect`.
    pub async fn set_websocket(&self, socket: ClientSocket) -> Result<(), RelayError> {
        let mut transport = self.transport.lock().await;
        if self.is_closed() {
            return Err(RelayError::SessionNotFound(self.meta.id));
        }
        if transport.shell.is_none() {
            return Err(RelayError::InvalidState(format!(
                "session {} is not connected",
                self.meta.id
            )));
        }
        if transport.socket.is_some() || transport.pumps_started {
            return Err(RelayError::AlreadyAttached(self.meta.id));
        }
        transport.socket = Some(socket);
        debug!("Client socket attached to session {}", self.meta.id);
        Ok(())
    }

    /// Start the shell and the three pumps.
    pub async fn start_data_transfer(self: &Arc<Self>) -> Result<(), RelayError> {
        let mut guard = self.transport.lock().await;
        let transport = &mut *guard;
        if transport.pumps_started {
            return Err(RelayError::InvalidState(format!(
                "data transfer already running for {}",
                self.meta.id
            )));
        }
        let Some(socket) = transport.socket.take() else {
            return Err(RelayError::InvalidState(format!(
                "session {} has no client attached",
                self.meta.id
            )));
        };
        let Some(shell) = transport.shell.as_mut() else {
            return Err(RelayError::InvalidState(format!(
                "session {} is not connected",
                self.meta.id
            )));
        };

        let io = match shell.start_shell().await {
            Ok(io) => io,
            Err(e) => {
                drop(socket);
                drop(guard);
                self.close().await;
                return Err(RelayError::Ssh(e));
            }
        };

        let sink = Arc::new(AsyncMutex::new(socket.sink));
        transport.sink = Some(sink.clone());
        transport.pumps_started = true;
        drop(guard);

        tokio::spawn(self.clone().pump_input(socket.stream, io.cmd_tx));
        tokio::spawn(
            self.clone()
                .pump_output(io.stdout_rx, sink.clone(), ServerMessage::Data, "stdout"),
        );
        tokio::spawn(
            self.clone()
                .pump_output(io.stderr_rx, sink, ServerMessage::Error, "stderr"),
        );

        info!("Data transfer started for session {}", self.meta.id);
        Ok(())
    }

    /// Client socket -> SSH stdin / PTY resize
    async fn pump_input(
        self: Arc<Self>,
        mut stream: crate::bridge::SocketStream,
        cmd_tx: mpsc::Sender<ShellCommand>,
    ) {
        let reason = loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break "cancelled",
                event = stream.next() => event,
            };

            let command = match event {
                Some(Inbound::Text(text)) => match ClientMessage::parse(&text) {
                    ClientMessage::Input(bytes) => {
                        self.touch();
                        ShellCommand::Data(bytes)
                    }
                    ClientMessage::Resize(size) => ShellCommand::Resize(size),
                    ClientMessage::Ignored(why) => {
                        debug!("Session {}: ignoring client frame ({})", self.meta.id, why);
                        continue;
                    }
                },
                Some(Inbound::Other) => continue,
                Some(Inbound::Closed) | None => break "client closed",
            };

            if cmd_tx.send(command).await.is_err() {
                break "ssh stdin closed";
            }
        };

        debug!("Input pump for {} stopped: {}", self.meta.id, reason);
        self.close().await;
    }

    /// SSH stdout/stderr -> client socket
    async fn pump_output(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Vec<u8>>,
        sink: Arc<AsyncMutex<SocketSink>>,
        wrap: fn(String) -> ServerMessage,
        stream_name: &'static str,
    ) {
        let mut chunker = Utf8Chunker::new();
        let reason = loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => break "cancelled",
                chunk = rx.recv() => chunk,
            };

            let text = match chunk {
                Some(bytes) => {
                    self.touch();
                    chunker.push(&bytes)
                }
                None => {
                    if let Some(rest) = chunker.flush() {
                        let _ = Self::send_frame(&sink, wrap(rest)).await;
                    }
                    break "ssh channel closed";
                }
            };
            if text.is_empty() {
                continue;
            }
            if let Err(e) = Self::send_frame(&sink, wrap(text)).await {
                debug!("Session {} {} send failed: {}", self.meta.id, stream_name, e);
                break "client write failed";
            }
        };

        debug!("{} pump for {} stopped: {}", stream_name, self.meta.id, reason);
        self.close().await;
    }

    async fn send_frame(
        sink: &AsyncMutex<SocketSink>,
        frame: ServerMessage,
    ) -> Result<(), RelayError> {
        let json = frame
            .to_json()
            .map_err(|e| RelayError::InvalidState(format!("encode frame: {}", e)))?;
        let mut sink = sink.lock().await;
        match tokio::time::timeout(SOCKET_SEND_TIMEOUT, sink.send(json)).await {
            Ok(result) => result.map_err(RelayError::from),
            Err(_) => Err(RelayError::InvalidState(
                "client unresponsive, send timed out".into(),
            )),
        }
    }

    /// Record traffic; persists at most once per flush interval.
    pub fn touch(&self) {
        let now = Utc::now().timestamp_millis();
        self.last_activity_ms.fetch_max(now, Ordering::SeqCst);

        if !self.persisted.load(Ordering::SeqCst) {
            return;
        }
        let last = self.last_flush_ms.load(Ordering::SeqCst);
        if now - last < self.ctx.activity_flush.as_millis() as i64 {
            return;
        }
        if self
            .last_flush_ms
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Another pump is flushing
            return;
        }

        let store = self.ctx.store.clone();
        let id = self.meta.id;
        let Some(at) = DateTime::from_timestamp_millis(now) else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = store.update_session_activity(id, at).await {
                warn!("Failed to persist activity for {}: {}", id, e);
            }
        });
    }

    /// Tear down channel, client and socket, in that order. Returns `false`
    /// if another caller already did.
    pub async fn close(&self) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.set_state(SessionState::Closing);
        self.cancel.cancel();

        let sink = {
            let mut transport = self.transport.lock().await;
            if let Some(mut shell) = transport.shell.take() {
                shell.close_session().await;
                shell.close_client().await;
            }
            // Attached but never started
            transport.socket = None;
            transport.sink.take()
        };

        if let Some(sink) = sink {
            let result = tokio::time::timeout(SOCKET_CLOSE_TIMEOUT, async {
                sink.lock().await.close().await
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Socket close for {} returned: {}", self.meta.id, e),
                Err(_) => debug!("Socket close for {} timed out", self.meta.id),
            }
        }

        // Only a connect that went live recorded the connect event
        let persist = self.persist_task.lock().take();
        let connected = persist.is_some();
        if let Some(task) = persist {
            let _ = task.await;
        }

        if self.persisted.load(Ordering::SeqCst) {
            let at = self.last_activity();
            if let Err(e) = self.ctx.store.update_session_activity(self.meta.id, at).await {
                debug!("Final activity write for {} failed: {}", self.meta.id, e);
            }
            if let Err(e) = self.ctx.store.mark_session_inactive(self.meta.id).await {
                warn!("Failed to mark session {} inactive: {}", self.meta.id, e);
            }
        }

        if connected {
            let event = audit_event(&self.meta, AuditAction::Disconnect);
            if let Err(e) = self.ctx.audit.record(event).await {
                warn!("Failed to record disconnect event for {}: {}", self.meta.id, e);
            }
        }

        self.set_state(SessionState::Closed);
        self.closed.cancel();
        info!("SSH connection closed for session {}", self.meta.id);
        true
    }

    /// Resolves once teardown has completed.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await
    }
}

fn audit_event(meta: &SessionMetadata, action: AuditAction) -> AuditEvent {
    AuditEvent {
        action,
        session_id: meta.id,
        user_id: meta.user_id,
        host_server_id: meta.host_server_id,
        username: meta.username.clone(),
        client_ip: meta.client_ip.clone(),
    }
}

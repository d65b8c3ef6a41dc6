//! Client-facing socket transport
//!
//! The relay session only needs a sink of text frames and a stream of
//! inbound events; [`ClientSocket`] erases whether they come from a warp
//! WebSocket or from in-process channels.

use std::pin::Pin;

use futures_util::{future, sink, stream, Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket};

#[derive(Debug, Error)]
#[error("WebSocket error: {0}")]
pub struct SocketError(pub String);

/// What the client sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text (or UTF-8 binary) frame
    Text(String),
    /// Control frames and undecodable payloads
    Other,
    /// Close frame or transport error
    Closed,
}

pub type SocketSink = Pin<Box<dyn Sink<String, Error = SocketError> + Send>>;
pub type SocketStream = Pin<Box<dyn Stream<Item = Inbound> + Send>>;

pub struct ClientSocket {
    pub sink: SocketSink,
    pub stream: SocketStream,
}

impl ClientSocket {
    pub fn new(sink: SocketSink, stream: SocketStream) -> Self {
        Self { sink, stream }
    }

    /// Wrap an upgraded warp WebSocket.
    pub fn from_warp(ws: WebSocket) -> Self {
        let (tx, rx) = ws.split();

        let sink = tx
            .with(|text: String| future::ready(Ok::<_, warp::Error>(Message::text(text))))
            .sink_map_err(|e| SocketError(e.to_string()));

        let stream = rx.map(|frame| match frame {
            Ok(msg) if msg.is_close() => Inbound::Closed,
            Ok(msg) if msg.is_text() || msg.is_binary() => {
                match String::from_utf8(msg.into_bytes()) {
                    Ok(text) => Inbound::Text(text),
                    Err(_) => Inbound::Other,
                }
            }
            Ok(_) => Inbound::Other,
            Err(_) => Inbound::Closed,
        });

        Self::new(Box::pin(sink), Box::pin(stream))
    }

    /// In-process socket: returns the relay side and the peer's channels.
    pub fn from_channels() -> (Self, SocketPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();

        let sink = sink::unfold(out_tx, |tx, frame: String| async move {
            tx.send(frame)
                .map_err(|_| SocketError("peer dropped".to_string()))?;
            Ok::<_, SocketError>(tx)
        });

        let stream = stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        (
            Self::new(Box::pin(sink), Box::pin(stream)),
            SocketPeer {
                to_relay: in_tx,
                from_relay: out_rx,
            },
        )
    }
}

/// Browser side of [`ClientSocket::from_channels`].
pub struct SocketPeer {
    pub to_relay: mpsc::UnboundedSender<Inbound>,
    /// Yields `None` once the relay has dropped its sink
    pub from_relay: mpsc::UnboundedReceiver<String>,
}

impl SocketPeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_relay.send(Inbound::Text(text.into())).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_socket_both_directions() {
        let (mut socket, mut peer) = ClientSocket::from_channels();

        socket.sink.send("out".to_string()).await.unwrap();
        assert_eq!(peer.from_relay.recv().await.as_deref(), Some("out"));

        assert!(peer.send_text("in"));
        assert_eq!(
            socket.stream.next().await,
            Some(Inbound::Text("in".to_string()))
        );

        drop(peer.to_relay);
        assert_eq!(socket.stream.next().await, None);
    }

    #[tokio::test]
    async fn test_dropping_sink_ends_peer_stream() {
        let (socket, mut peer) = ClientSocket::from_channels();
        drop(socket);
        assert_eq!(peer.from_relay.recv().await, None);
    }
}

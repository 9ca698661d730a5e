//! Per-socket plumbing: read/write pumps, keepalive pings, send buffering.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

use threateye_protocol::Envelope;
use threateye_protocol::codec;
use threateye_protocol::constants::WS_PING_PERIOD;
use threateye_sessions::{CloseReason, DeviceLink, LinkError};

/// Frames read but not yet handled by the connection worker.
const INBOUND_BUFFER_SIZE: usize = 64;

/// Handle for writing to one WebSocket connection.
///
/// Cloneable and cheap; wraps an `mpsc::Sender` feeding the write pump.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
}

impl Sender {
    /// Queues an envelope without waiting.
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), SendError> {
        let text = codec::encode(envelope).map_err(|e| SendError::Encode(e.to_string()))?;
        self.tx
            .try_send(WsMessage::Text(text.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!("send buffer full, dropping message");
                    SendError::Full
                }
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Queues an envelope, waiting for buffer space.
    pub async fn deliver(&self, envelope: &Envelope) -> Result<(), SendError> {
        let text = codec::encode(envelope).map_err(|e| SendError::Encode(e.to_string()))?;
        self.tx
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Sends a close frame after whatever is already queued.
    ///
    /// Falls back to tearing the connection down if the buffer is full.
    pub fn close_with(&self, code: CloseCode, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        if self.tx.try_send(WsMessage::Close(Some(frame))).is_err() {
            self.cancel.cancel();
        }
    }

    /// Returns `true` while the write pump is running.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed() && !self.cancel.is_cancelled()
    }
}

impl DeviceLink for Sender {
    fn send(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.send_envelope(&envelope).map_err(|e| match e {
            SendError::Full => LinkError::Full,
            SendError::Closed | SendError::Encode(_) => LinkError::ConnectionLost,
        })
    }

    fn close(&self, reason: CloseReason) {
        let (code, text) = match reason {
            CloseReason::Normal => (CloseCode::Normal, "closing"),
            CloseReason::AuthRejected => (CloseCode::Policy, "authentication failed"),
            CloseReason::Evicted => (CloseCode::Policy, "session replaced"),
            CloseReason::HeartbeatTimeout => (CloseCode::Policy, "heartbeat timeout"),
            CloseReason::Shutdown => (CloseCode::Away, "hub shutting down"),
        };
        self.close_with(code, text);
    }

    fn is_open(&self) -> bool {
        self.is_connected()
    }
}

/// Error returned when a frame cannot be queued.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("send buffer full")]
    Full,

    #[error("connection closed")]
    Closed,

    #[error("encode failed: {0}")]
    Encode(String),
}

/// An upgraded connection: text frames in, a [`Sender`] out.
///
/// `recv` returning `None` is the single closure signal, whether the peer
/// closed cleanly, the socket broke, or the hub is shutting down.
pub struct Connection {
    pub peer_addr: SocketAddr,
    sender: Sender,
    inbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Waits for the next text frame.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts the read and write pumps for an upgraded socket.
pub fn spawn_connection<S>(
    ws_stream: S,
    peer_addr: SocketAddr,
    send_buffer: usize,
    parent: &CancellationToken,
) -> Connection
where
    S: futures_util::Stream<Item = Result<WsMessage, WsError>>
        + futures_util::Sink<WsMessage, Error = WsError>
        + Send
        + 'static,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(send_buffer.max(1));
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_BUFFER_SIZE);
    let cancel = parent.child_token();
    let sender = Sender {
        tx,
        cancel: cancel.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let read_cancel = cancel.clone();
    let read_sender = sender.clone();
    tokio::spawn(async move {
        read_pump(ws_stream, inbound_tx, read_sender, read_cancel.clone()).await;
        read_cancel.cancel();
        tracing::debug!(%peer_addr, "read pump finished");
    });

    Connection {
        peer_addr,
        sender,
        inbound: inbound_rx,
        cancel,
    }
}

/// Write pump: drains the send channel and sends keepalive pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = WsError> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.reset();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        let closing = matches!(ws_msg, WsMessage::Close(_));
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    cancel.cancel();
}

/// Read pump: forwards text frames to the worker, in order.
async fn read_pump<S>(
    mut stream: S,
    inbound: mpsc::Sender<String>,
    sender: Sender,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, WsError>> + Send + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let forwarded = tokio::select! {
                            _ = cancel.cancelled() => false,
                            res = inbound.send(text.as_str().to_owned()) => res.is_ok(),
                        };
                        if !forwarded {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        tracing::warn!(len = data.len(), "ignoring binary frame");
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = sender.tx.try_send(WsMessage::Pong(data));
                    }
                    // Keepalive only; pongs are not session activity.
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) => {
                        tracing::debug!("received close frame");
                        break;
                    }
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(e)) => {
                        tracing::warn!("read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

//! Hub WebSocket listener.
//!
//! Listens on a TCP port and upgrades `/ws/device` and `/ws/observer`;
//! any other path is refused with 404 during the handshake.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use threateye_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::ServerError;
use crate::connection;
use crate::hub::Hub;
use crate::{device, observer};

pub const DEVICE_PATH: &str = "/ws/device";
pub const OBSERVER_PATH: &str = "/ws/observer";

/// Which kind of peer a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Device,
    Observer,
}

impl Endpoint {
    pub fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            DEVICE_PATH => Some(Self::Device),
            OBSERVER_PATH => Some(Self::Observer),
            _ => None,
        }
    }
}

/// A bound listener serving one [`Hub`].
pub struct HubServer {
    hub: Arc<Hub>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl HubServer {
    /// Binds to `addr` (port 0 picks a free port).
    pub async fn bind(hub: Arc<Hub>, addr: SocketAddr) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("hub listening on {local_addr}");
        Ok(Self {
            hub,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Accepts connections until the hub shuts down.
    pub async fn run(self) -> Result<(), ServerError> {
        let cancel = self.hub.cancel_token().clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("listener shutting down");
                    break Ok(());
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let hub = Arc::clone(&self.hub);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(hub, stream, peer_addr).await {
                                    tracing::warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }
}

/// Upgrades one TCP connection and hands it to the matching worker.
async fn handle_connection(
    hub: Arc<Hub>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<(), ServerError> {
    let mut endpoint = None;
    let route = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        match Endpoint::from_path(req.uri().path()) {
            Some(e) => {
                endpoint = Some(e);
                Ok(resp)
            }
            None => {
                let mut not_found = ErrorResponse::new(Some("not found".into()));
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Err(not_found)
            }
        }
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    let ws_stream = accept_hdr_async_with_config(stream, route, Some(ws_config)).await?;

    let endpoint = endpoint.ok_or(ServerError::UnknownEndpoint)?;
    tracing::debug!(%peer_addr, ?endpoint, "WebSocket connection established");

    let conn = connection::spawn_connection(
        ws_stream,
        peer_addr,
        hub.config().send_buffer_size,
        hub.cancel_token(),
    );
    match endpoint {
        Endpoint::Device => {
            let state = device::run(hub, conn).await;
            tracing::debug!(%peer_addr, %state, "device connection finished");
        }
        Endpoint::Observer => observer::run(hub, conn).await,
    }
    Ok(())
}

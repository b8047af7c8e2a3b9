//! Tunnel broker (C7): per-sandbox WebSocket endpoint, binary frame codec,
//! and request/response demultiplexer for remote (`is_local`) agents.
//!
//! Binary frames ride on top of the raw-`hyper` upgrade path; the registry
//! keeps a mutex-guarded `HashMap<id, Handle>` owning a spawned task per
//! connection, demuxing inbound frames to whichever caller is awaiting that
//! request id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{SandboxCatalog, SandboxStatus};
use crate::errors::CoreError;

/// Upper bound on a single `stream` frame's payload, per §4.7.
pub const STREAM_CHUNK_LIMIT: usize = 16 * 1024;
/// WebSocket message read limit, per §5.
pub const WS_READ_LIMIT: usize = 64 * 1024 * 1024;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const REQUEST_DEADLINE: Duration = Duration::from_secs(120);

/// Frame header, discriminated by `type`. `Request` travels server→agent,
/// `Stream` travels agent→server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FrameHeader {
    Request {
        id: String,
        method: String,
        path: String,
        headers: HashMap<String, String>,
    },
    Stream {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        done: bool,
    },
}

impl FrameHeader {
    pub fn request_id(&self) -> &str {
        match self {
            FrameHeader::Request { id, .. } => id,
            FrameHeader::Stream { id, .. } => id,
        }
    }
}

/// A decoded `stream` frame handed to the demultiplexer's per-request channel.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub status: Option<u16>,
    pub headers: Option<HashMap<String, String>>,
    pub done: bool,
    pub payload: Bytes,
}

/// Encodes `[4 bytes BE header_length][header JSON][payload]`.
pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Vec<u8> {
    let header_json = serde_json::to_vec(header).expect("frame header is always serializable");
    let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
    buf.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&header_json);
    buf.extend_from_slice(payload);
    buf
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short to contain a header length prefix")]
    Truncated,
    #[error("declared header length {0} exceeds frame size")]
    HeaderOverrun(u32),
    #[error("invalid frame header JSON: {0}")]
    InvalidHeader(#[from] serde_json::Error),
}

/// Decodes a single binary WebSocket message back into its header and payload.
pub fn decode_frame(raw: &[u8]) -> Result<(FrameHeader, Bytes), FrameError> {
    if raw.len() < 4 {
        return Err(FrameError::Truncated);
    }
    let header_len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if 4 + header_len > raw.len() {
        return Err(FrameError::HeaderOverrun(header_len as u32));
    }
    let header: FrameHeader = serde_json::from_slice(&raw[4..4 + header_len])?;
    let payload = Bytes::copy_from_slice(&raw[4 + header_len..]);
    Ok((header, payload))
}

/// One tunneled agent's WebSocket connection: the outbound sender half plus
/// the request demultiplexer for frames read back from the agent.
struct Tunnel {
    sandbox_id: Uuid,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<String, mpsc::Sender<StreamFrame>>>,
    last_pong: Mutex<Instant>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl Tunnel {
    async fn register(&self, request_id: String, tx: mpsc::Sender<StreamFrame>) {
        self.pending.lock().await.insert(request_id, tx);
    }

    async fn deregister(&self, request_id: &str) {
        self.pending.lock().await.remove(request_id);
    }

    async fn dispatch(&self, header: FrameHeader, payload: Bytes) {
        let FrameHeader::Stream { id, status, headers, done } = header else {
            warn!(sandbox_id = %self.sandbox_id, "agent sent non-stream frame, dropping");
            return;
        };
        let mut pending = self.pending.lock().await;
        let Some(tx) = pending.get(&id) else {
            return;
        };
        let frame = StreamFrame { status, headers, done, payload };
        let done = frame.done;
        let _ = tx.send(frame).await;
        if done {
            pending.remove(&id);
        }
    }

    fn send_request(&self, header: FrameHeader, body: Bytes) -> Result<(), CoreError> {
        let frame = encode_frame(&header, &body);
        self.outbound
            .send(Message::Binary(frame))
            .map_err(|_| CoreError::ServiceUnavailable("tunnel closed".into()))
    }
}

/// Per-process registry mapping `sandbox_id -> Tunnel`, per §4.7.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<Uuid, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn is_connected(&self, sandbox_id: Uuid) -> bool {
        self.tunnels.read().await.contains_key(&sandbox_id)
    }

    async fn insert(&self, tunnel: Arc<Tunnel>) {
        self.tunnels.write().await.insert(tunnel.sandbox_id, tunnel);
    }

    async fn remove(&self, sandbox_id: Uuid) {
        self.tunnels.write().await.remove(&sandbox_id);
    }

    /// Forces an active tunnel closed: notifies the agent with a `Close`
    /// frame and wakes the connection's read loop so it tears itself down
    /// without waiting on the socket to close first. A no-op if no tunnel is
    /// connected for this sandbox.
    pub async fn close(&self, sandbox_id: Uuid) {
        let Some(tunnel) = self.tunnels.read().await.get(&sandbox_id).cloned() else {
            return;
        };
        let _ = tunnel.outbound.send(Message::Close(None));
        tunnel.shutdown.notify_one();
    }

    /// Forwards an HTTP-shaped request through the sandbox's tunnel and
    /// collects the response. Returns `(status, headers, body)` once the
    /// agent's `stream` frames have been fully drained for this request.
    ///
    /// Follows the §4.7 demultiplexer contract: generate a request id,
    /// register a channel, encode and send the `request` frame, then read
    /// back frames until `done`, applying status/headers from the first one.
    /// The channel is deregistered on every exit path, including the
    /// deadline and an early drop of the returned receiver.
    pub async fn proxy_via_tunnel(
        &self,
        sandbox_id: Uuid,
        method: &str,
        path: &str,
        headers: HashMap<String, String>,
        body: Bytes,
    ) -> Result<(u16, HashMap<String, String>, mpsc::Receiver<Bytes>), CoreError> {
        let tunnel = self
            .tunnels
            .read()
            .await
            .get(&sandbox_id)
            .cloned()
            .ok_or_else(|| CoreError::ServiceUnavailable("agent tunnel not connected".into()))?;

        let request_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::channel::<StreamFrame>(16);
        tunnel.register(request_id.clone(), tx).await;

        let send_result = tunnel.send_request(
            FrameHeader::Request {
                id: request_id.clone(),
                method: method.to_string(),
                path: path.to_string(),
                headers,
            },
            body,
        );
        if let Err(e) = send_result {
            tunnel.deregister(&request_id).await;
            return Err(e);
        }

        let deadline = tokio::time::sleep(REQUEST_DEADLINE);
        tokio::pin!(deadline);
        let first = tokio::select! {
            frame = rx.recv() => frame,
            _ = &mut deadline => {
                tunnel.deregister(&request_id).await;
                return Err(CoreError::Timeout("tunnel response".into()));
            }
        };
        let Some(first) = first else {
            tunnel.deregister(&request_id).await;
            return Err(CoreError::ServiceUnavailable("tunnel closed mid-response".into()));
        };
        let status = first.status.unwrap_or(200);
        let response_headers = first.headers.clone().unwrap_or_default();

        // Stream remaining chunks (including this first one) into a channel
        // the HTTP body can drain independently of this function's caller.
        let (body_tx, body_rx) = mpsc::channel::<Bytes>(16);
        let tunnel_for_stream = tunnel.clone();
        let request_id_for_stream = request_id.clone();
        tokio::spawn(async move {
            let mut frame = Some(first);
            loop {
                let Some(current) = frame.take() else { break };
                if !current.payload.is_empty() && body_tx.send(current.payload).await.is_err() {
                    break;
                }
                if current.done {
                    break;
                }
                match tokio::time::timeout(REQUEST_DEADLINE, rx.recv()).await {
                    Ok(Some(next)) => frame = Some(next),
                    _ => break,
                }
            }
            tunnel_for_stream.deregister(&request_id_for_stream).await;
        });

        Ok((status, response_headers, body_rx))
    }

    /// Accepts a validated tunnel connection: runs the ping loop and the
    /// reader/demux loop until the socket closes, then flips the sandbox to
    /// `offline`.
    ///
    /// Returns an error (without touching the registry) if `token` does not
    /// match the sandbox's `tunnel_token`, per §4.7's accept-time check.
    pub async fn accept(
        self: &Arc<Self>,
        catalog: Arc<dyn SandboxCatalog>,
        sandbox_id: Uuid,
        token: &str,
        socket: tokio_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>,
    ) -> Result<(), CoreError> {
        if catalog.get_by_tunnel_token(sandbox_id, token).await.is_none() {
            return Err(CoreError::Unauthorized);
        }

        let (mut write, mut read) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let shutdown = Arc::new(tokio::sync::Notify::new());

        let tunnel = Arc::new(Tunnel {
            sandbox_id,
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            last_pong: Mutex::new(Instant::now()),
            shutdown: shutdown.clone(),
        });
        self.insert(tunnel.clone()).await;

        let _ = catalog.update_status(sandbox_id, SandboxStatus::Running).await;
        let _ = catalog.touch_heartbeat(sandbox_id).await;
        info!(sandbox_id = %sandbox_id, "tunnel connected");

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let ping_tunnel = tunnel.clone();
        let ping_shutdown = shutdown.clone();
        let ping_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                interval.tick().await;
                if ping_tunnel
                    .outbound
                    .send(Message::Ping(Vec::new()))
                    .is_err()
                {
                    break;
                }
                let elapsed = ping_tunnel.last_pong.lock().await.elapsed();
                if elapsed > PING_INTERVAL * 2 {
                    warn!(sandbox_id = %sandbox_id, "tunnel missed pings, closing");
                    ping_shutdown.notify_one();
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            match decode_frame(&data) {
                                Ok((header, payload)) => tunnel.dispatch(header, payload).await,
                                Err(e) => warn!(sandbox_id = %sandbox_id, error = %e, "malformed tunnel frame"),
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            *tunnel.last_pong.lock().await = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(sandbox_id = %sandbox_id, error = %e, "tunnel read error");
                            break;
                        }
                    }
                }
                _ = shutdown.notified() => break,
            }
        }

        ping_task.abort();
        writer.abort();
        self.remove(sandbox_id).await;
        let _ = catalog.update_status(sandbox_id, SandboxStatus::Offline).await;
        let _ = catalog.update_pod_address(sandbox_id, None).await;
        info!(sandbox_id = %sandbox_id, "tunnel disconnected, sandbox offline");
        Ok(())
    }
}

//! WebSocket signal server implementation

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};

use peerlink_core::{Config, ErrorCode, RelayError, SignalingMessage, TransportError};

use crate::coordinator::{AdmissionRequest, Coordinator, ShutdownReport};
use crate::http::{Request, Response};
use crate::transport::{self, ChannelEndpoint, Outbound, Transport};
use crate::SERVICE_NAME;

/// Largest request head we look at before dispatching
const MAX_HEAD_BYTES: usize = 4096;

/// Time a client has to send its request head
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Query parameters that are not peer metadata
const RESERVED_PARAMS: [&str; 3] = ["key", "id", "token"];

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Signal server state
pub struct SignalServer {
    config: Arc<Config>,
    coordinator: Arc<Coordinator>,
}

impl SignalServer {
    pub fn new(config: Config) -> Self {
        let coordinator = Arc::new(Coordinator::new(&config));
        Self {
            config: Arc::new(config),
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the configured address and serve until shutdown
    pub async fn serve(&self) -> io::Result<()> {
        let addr = SocketAddr::new(self.config.server.bind, self.config.server.port);
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown begins
    pub async fn serve_listener(&self, listener: TcpListener) -> io::Result<()> {
        info!(
            "Signal server listening on {} (socket path {})",
            listener.local_addr()?,
            self.config.socket_path()
        );

        let supervisor = self.coordinator.supervisor();
        tokio::spawn(supervisor.run(self.coordinator.shutdown_signal()));

        let mut shutdown = self.coordinator.shutdown_signal();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };

                    let config = self.config.clone();
                    let coordinator = self.coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, config, coordinator).await {
                            debug!("Connection error from {}: {:?}", peer_addr, e);
                        }
                    });
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }

        info!("Listener stopped");
        Ok(())
    }

    /// Drain all peers; see [`Coordinator::shutdown`]
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.coordinator.shutdown(grace).await
    }

    /// Get peer count (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.coordinator.registry().len()
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<Config>,
    coordinator: Arc<Coordinator>,
) -> ConnectionResult {
    let head = peek_request_head(&stream).await?;
    let Some(request) = Request::parse(&String::from_utf8_lossy(&head)) else {
        debug!("Unparseable request from {}", peer_addr);
        return Ok(());
    };

    if request.method == "GET" && request.path == config.socket_path() {
        return handle_socket(stream, peer_addr, request, config, coordinator).await;
    }

    // Consume the head we peeked at before answering
    let mut buf = vec![0u8; head.len()];
    stream.read_exact(&mut buf).await?;

    let response = handle_http_request(&request, &config, &coordinator);
    debug!("{} {} -> {}", request.method, request.path, response.status());
    stream.write_all(&response.to_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Wait until the full request head is buffered, without consuming it
async fn peek_request_head(stream: &TcpStream) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    let peek = async {
        loop {
            let n = stream.peek(&mut buf).await?;
            if n == 0 || n == buf.len() || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                return Ok::<usize, io::Error>(n);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    let n = timeout(HEAD_TIMEOUT, peek)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request head timeout"))??;
    buf.truncate(n);
    Ok(buf)
}

/// Answer health, info, and discovery requests
fn handle_http_request(request: &Request, config: &Config, coordinator: &Coordinator) -> Response {
    let origin = request.header("origin");
    if !config.origin_allowed(origin) {
        return Response::json(403, r#"{"error":"origin not allowed"}"#);
    }

    let response = match request.method.as_str() {
        "OPTIONS" => Response::empty(204),
        "GET" => route_http(&request.path, config, coordinator),
        _ => Response::json(405, r#"{"error":"method not allowed"}"#),
    };
    response.with_cors(origin)
}

fn route_http(path: &str, config: &Config, coordinator: &Coordinator) -> Response {
    let base = config.base_path();

    if path == "/health" {
        return health(coordinator);
    }
    if path == base || path.strip_prefix(base) == Some("/") {
        return Response::json(
            200,
            serde_json::json!({
                "name": SERVICE_NAME,
                "version": env!("CARGO_PKG_VERSION"),
                "description": "Signaling relay for peer-to-peer connection setup",
            })
            .to_string(),
        );
    }

    let segments: Option<Vec<&str>> = path
        .strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(|rest| rest.split('/').collect());

    match segments.as_deref() {
        Some([key, "id"]) => {
            if !coordinator.key_matches(key) {
                return unauthorized();
            }
            match coordinator.registry().id_generator().generate() {
                Ok(id) => Response::text(200, id),
                Err(e) => {
                    warn!("Id generation failed: {}", e);
                    Response::json(500, r#"{"error":"id generation failed"}"#)
                }
            }
        }
        Some([key, "peers"]) => {
            if !coordinator.key_matches(key) || !config.relay.allow_discovery {
                return unauthorized();
            }
            let ids = coordinator.registry().ids();
            Response::json(200, serde_json::Value::from(ids).to_string())
        }
        _ => Response::json(404, r#"{"error":"not found"}"#),
    }
}

fn health(coordinator: &Coordinator) -> Response {
    let status = coordinator.status();
    let (code, label) = if status.accepting {
        (200, "ok")
    } else {
        (503, "draining")
    };

    Response::json(
        code,
        serde_json::json!({
            "status": label,
            "service": SERVICE_NAME,
            "peers": status.peers,
            "maxPeers": status.max_peers,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
        .to_string(),
    )
}

fn unauthorized() -> Response {
    Response::json(401, r#"{"error":"invalid key"}"#)
}

/// Run one peer's WebSocket session from handshake to removal
async fn handle_socket(
    stream: TcpStream,
    peer_addr: SocketAddr,
    request: Request,
    config: Arc<Config>,
    coordinator: Arc<Coordinator>,
) -> ConnectionResult {
    let origin_ok = config.origin_allowed(request.header("origin"));
    let ws_stream = accept_hdr_async(
        stream,
        |_req: &HandshakeRequest, resp: HandshakeResponse| {
            if origin_ok {
                Ok(resp)
            } else {
                Err(reject(StatusCode::FORBIDDEN, "origin not allowed"))
            }
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let admission = admission_request(&request, peer_addr, &config);
    let (transport, endpoint) = transport::channel(config.relay.send_buffer);
    let transport: Arc<dyn Transport> = Arc::new(transport);

    let peer = match coordinator.admit(admission, transport.clone()) {
        Ok(peer) => peer,
        Err(e) => {
            let reply = match &e {
                RelayError::DuplicateId(id) => SignalingMessage::id_taken(id),
                other => SignalingMessage::error(ErrorCode::from(other), other.to_string()),
            };
            ws_sender.send(Message::Text(reply.to_json()?)).await?;
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        }
    };

    let id = peer.id;
    debug!("Peer {} connected from {}", id, peer_addr);

    let mut closing = endpoint.close_signal();
    let writer = tokio::spawn(write_loop(
        ws_sender,
        endpoint,
        id.clone(),
        transport.clone(),
        coordinator.clone(),
    ));

    loop {
        let frame = tokio::select! {
            biased;
            // Removed by the server: leave, expiry, or shutdown
            _ = closing.wait_for(|c| *c) => break,
            frame = ws_receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                Ok(msg) => {
                    // Errors were already reported to the peer and observers
                    let _ = coordinator.handle_inbound(&id, &transport, msg).await;
                }
                Err(e) => {
                    coordinator.registry().touch_owned(&id, &transport);
                    let reply =
                        SignalingMessage::error(ErrorCode::InvalidMessage, format!("Invalid JSON: {}", e));
                    if transport.try_send(reply).is_err() {
                        debug!("Dropping invalid-message reply to {}", id);
                    }
                }
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                coordinator.registry().touch_owned(&id, &transport);
            }
            Some(Ok(Message::Close(_))) | None => {
                coordinator.transport_closed(&id, &transport);
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                let err = TransportError::WebSocket(e.to_string());
                coordinator.transport_error(&id, &transport, err);
                break;
            }
        }
    }

    let _ = writer.await;
    debug!("Connection closed: {}", id);
    Ok(())
}

/// Drain the peer's transport into the socket
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut endpoint: ChannelEndpoint,
    id: String,
    transport: Arc<dyn Transport>,
    coordinator: Arc<Coordinator>,
) {
    loop {
        match endpoint.next().await {
            Outbound::Message(msg) => {
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Could not encode {} for {}: {}", msg.kind, id, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    let err = TransportError::WebSocket(e.to_string());
                    coordinator.transport_error(&id, &transport, err);
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

fn admission_request(request: &Request, peer_addr: SocketAddr, config: &Config) -> AdmissionRequest {
    let mut metadata: HashMap<String, String> = request
        .query
        .iter()
        .filter(|(name, _)| !RESERVED_PARAMS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let forwarded = request
        .header("x-forwarded-for")
        .filter(|_| config.server.proxied)
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());
    metadata.insert(
        "remote_addr".into(),
        forwarded.unwrap_or_else(|| peer_addr.ip().to_string()),
    );

    AdmissionRequest {
        key: request.query.get("key").cloned().unwrap_or_default(),
        id: request.query.get("id").filter(|id| !id.is_empty()).cloned(),
        metadata,
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

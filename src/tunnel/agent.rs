//! Agent side — outbound tunnel client.
//!
//! Spawned by `dockhand agent`. Maintains a persistent WebSocket to the
//! manager with exponential-backoff reconnect (with jitter, so a fleet of
//! agents does not redial in lockstep), answers heartbeats immediately, and
//! serves proxied traffic against the local API:
//!
//! - `request` frames become local HTTP calls, each in its own task so a
//!   slow call never blocks the read loop or heartbeat acks;
//! - `ws_start` frames open a local WebSocket and relay `ws_data` both ways,
//!   one task per direction per stream.
//!
//! The local API is a black box: the agent only knows its base URL. The
//! manager has already rewritten paths to the local addressing scheme.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use rand::Rng;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::message::{Headers, TunnelMessage, WsOpcode};
use super::registry::{StreamEvent, STREAM_QUEUE};
use crate::config::AgentConfig;
use crate::proxy::{append_wire_headers, is_hop_by_hop};

/// Bound on a single local HTTP call; the manager's proxy deadline is the
/// authoritative end-to-end bound, this one just reclaims the task.
const LOCAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared tunnel WS sink; every outbound frame is serialized through it.
type WsSink = Arc<
    Mutex<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            tokio_tungstenite::tungstenite::Message,
        >,
    >,
>;

type HttpClient = hyper_util::client::legacy::Client<
    hyper_util::client::legacy::connect::HttpConnector,
    Full<Bytes>,
>;

/// Local streams opened in response to `ws_start`, keyed by stream id.
type LocalStreams = Arc<Mutex<HashMap<String, mpsc::Sender<StreamEvent>>>>;

/// Spawn the agent tunnel task. Runs until the process exits.
pub fn spawn(config: AgentConfig, max_body_bytes: usize) -> tokio::task::JoinHandle<()> {
    tokio::spawn(agent_loop(config, max_body_bytes))
}

/// Main loop: connect, serve, reconnect with jittered exponential backoff.
async fn agent_loop(config: AgentConfig, max_body_bytes: usize) {
    let base = Duration::from_secs(config.reconnect_delay_secs);
    let max = Duration::from_secs(config.reconnect_max_delay_secs);
    let mut delay = base;

    loop {
        info!("Tunnel: connecting to manager at {}", config.manager_url);
        match connect_and_run(&config, max_body_bytes).await {
            Ok(()) => {
                info!("Tunnel: connection closed cleanly, reconnecting...");
                delay = base;
            }
            Err(err) => {
                warn!(
                    "Tunnel: connection error: {err}, reconnecting in ~{}s",
                    delay.as_secs()
                );
            }
        }
        tokio::time::sleep(jittered(delay)).await;
        delay = (delay * 2).min(max);
    }
}

/// ±20% jitter so reconnecting agents spread out.
fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
}

/// Decode one transport message from the manager. Every tunnel frame is a
/// JSON text message; a binary frame means the peer is not speaking this
/// protocol, and the connection must come down rather than resynchronize.
/// `Ok(None)` is transport housekeeping (ping/pong) with no frame to handle.
fn decode_frame(
    msg: &tokio_tungstenite::tungstenite::Message,
) -> Result<Option<TunnelMessage>, String> {
    match msg {
        tokio_tungstenite::tungstenite::Message::Text(text) => TunnelMessage::decode(text)
            .map(Some)
            .map_err(|err| format!("protocol error: {err}")),
        tokio_tungstenite::tungstenite::Message::Binary(_) => {
            Err("protocol error: unexpected binary frame".to_string())
        }
        _ => Ok(None),
    }
}

/// One connection attempt: dial, authenticate via query params, serve frames
/// until the transport drops or a protocol error forces a teardown.
async fn connect_and_run(
    config: &AgentConfig,
    max_body_bytes: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let url = format!(
        "{}?environment={}&token={}",
        config.manager_url, config.environment_id, config.token
    );

    let (ws_stream, _response) = tokio_tungstenite::connect_async(&url).await?;
    let (ws_sink, mut ws_stream) = ws_stream.split();
    let ws_sink: WsSink = Arc::new(Mutex::new(ws_sink));
    info!("Tunnel: connected to manager");

    let client: HttpClient = hyper_util::client::legacy::Client::builder(
        hyper_util::rt::TokioExecutor::new(),
    )
    .build_http();
    let streams: LocalStreams = Arc::new(Mutex::new(HashMap::new()));

    let result = loop {
        let Some(msg) = ws_stream.next().await else {
            break Ok(());
        };
        let msg = msg?;
        if let tokio_tungstenite::tungstenite::Message::Close(_) = msg {
            break Ok(());
        }
        match decode_frame(&msg) {
            Ok(Some(frame)) => {
                handle_manager_frame(config, &client, &ws_sink, &streams, max_body_bytes, frame)
                    .await;
            }
            Ok(None) => {}
            Err(err) => break Err(err.into()),
        }
    };

    // Force-close any local streams this connection was carrying.
    let mut streams = streams.lock().await;
    for (_, tx) in streams.drain() {
        let _ = tx.try_send(StreamEvent::Close {
            code: None,
            reason: Some("tunnel connection lost".to_string()),
        });
    }

    result
}

/// Route one decoded frame from the manager.
async fn handle_manager_frame(
    config: &AgentConfig,
    client: &HttpClient,
    ws_sink: &WsSink,
    streams: &LocalStreams,
    max_body_bytes: usize,
    frame: TunnelMessage,
) {
    match frame {
        // Answer before anything else; liveness must not queue behind work.
        TunnelMessage::Heartbeat => {
            send_frame(ws_sink, &TunnelMessage::HeartbeatAck).await;
        }
        TunnelMessage::Request {
            id,
            method,
            path,
            headers,
            body,
            remote_addr,
        } => {
            let client = client.clone();
            let sink = ws_sink.clone();
            let local_api = config.local_api.clone();
            tokio::spawn(async move {
                let response = execute_local_request(
                    &client,
                    &local_api,
                    &id,
                    &method,
                    &path,
                    headers,
                    body,
                    remote_addr,
                    max_body_bytes,
                )
                .await;
                send_frame(&sink, &response).await;
            });
        }
        TunnelMessage::WsStart {
            id,
            path,
            headers,
            protocol,
        } => {
            // Register before dialing: ws_data the manager sends while the
            // local connect is still in flight must queue on the stream
            // channel, not drop.
            let event_rx = open_stream(streams, id.clone()).await;
            let sink = ws_sink.clone();
            let streams = streams.clone();
            let local_api = config.local_api.clone();
            tokio::spawn(run_local_stream(
                sink, streams, event_rx, local_api, id, path, headers, protocol,
            ));
        }
        TunnelMessage::WsData {
            id,
            opcode,
            payload,
        } => {
            if !deliver_stream_event(streams, &id, StreamEvent::Data { opcode, payload }).await {
                debug!(stream = %id, "ws_data for unknown local stream (dropped)");
            }
        }
        TunnelMessage::WsClose { id, code, reason } => {
            let tx = streams.lock().await.remove(&id);
            if let Some(tx) = tx {
                let _ = tx.send(StreamEvent::Close { code, reason }).await;
            }
        }
        TunnelMessage::Response { .. } | TunnelMessage::HeartbeatAck => {
            debug!("Agent-only frame from manager (dropped)");
        }
    }
}

/// Register a stream channel under `id` and hand back its receiving end.
/// Called from the read loop as soon as `ws_start` is seen, before the local
/// target is dialed, so early frames for the stream queue in order.
async fn open_stream(streams: &LocalStreams, id: String) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(STREAM_QUEUE);
    streams.lock().await.insert(id, tx);
    rx
}

/// Deliver an event to an active local stream. Returns false when no stream
/// with that id exists (already closed or never opened).
async fn deliver_stream_event(streams: &LocalStreams, id: &str, event: StreamEvent) -> bool {
    let tx = streams.lock().await.get(id).cloned();
    match tx {
        Some(tx) => tx.send(event).await.is_ok(),
        None => false,
    }
}

/// Write one frame to the tunnel, best effort. A failed write surfaces as a
/// transport error in the read loop shortly after.
async fn send_frame(ws_sink: &WsSink, msg: &TunnelMessage) {
    let mut sink = ws_sink.lock().await;
    let _ = sink
        .send(tokio_tungstenite::tungstenite::Message::Text(
            msg.encode().into(),
        ))
        .await;
}

/// Synthesized `response` frame for failures on the agent leg. These are
/// tunnel-visible errors, distinct from upstream errors which pass through
/// with whatever status the local API returned.
fn error_response(id: &str, status: u16, message: &str, code: &str) -> TunnelMessage {
    TunnelMessage::Response {
        id: id.to_string(),
        status,
        headers: Headers::new(),
        body: serde_json::to_vec(&json!({"error": message, "code": code})).unwrap_or_default(),
        done: true,
    }
}

/// Execute a proxied request against the local API and frame the outcome.
#[allow(clippy::too_many_arguments)]
async fn execute_local_request(
    client: &HttpClient,
    local_api: &str,
    id: &str,
    method: &str,
    path: &str,
    headers: Headers,
    body: Vec<u8>,
    remote_addr: Option<String>,
    max_body_bytes: usize,
) -> TunnelMessage {
    let uri = format!("{local_api}{path}");
    let mut builder = hyper::Request::builder().method(method.as_bytes()).uri(&uri);
    match builder.method_ref() {
        Some(_) => {}
        None => return error_response(id, 502, "Invalid method in tunneled request", "BAD_FRAME"),
    }
    for (name, values) in &headers {
        if is_hop_by_hop(name) {
            continue;
        }
        for value in values {
            builder = builder.header(name, value);
        }
    }
    if let Some(addr) = remote_addr {
        builder = builder.header("x-forwarded-for", addr);
    }
    let request = match builder.body(Full::new(Bytes::from(body))) {
        Ok(request) => request,
        Err(err) => {
            return error_response(id, 502, &format!("Bad tunneled request: {err}"), "BAD_FRAME")
        }
    };

    let response =
        match tokio::time::timeout(LOCAL_REQUEST_TIMEOUT, client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return error_response(
                    id,
                    502,
                    &format!("Local API call failed: {err}"),
                    "LOCAL_CALL_FAILED",
                )
            }
            Err(_) => {
                return error_response(id, 504, "Local API call timed out", "LOCAL_TIMEOUT")
            }
        };

    let status = response.status().as_u16();
    let wire = crate::proxy::wire_headers(response.headers());
    let body = match Limited::new(response.into_body(), max_body_bytes)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(_) => {
            return error_response(
                id,
                502,
                "Local response body exceeded the tunnel body limit",
                "BODY_TOO_LARGE",
            )
        }
    };

    TunnelMessage::Response {
        id: id.to_string(),
        status,
        headers: wire,
        body,
        done: true,
    }
}

/// Dial the local WebSocket target for a `ws_start` and relay both ways
/// until either side closes or the tunnel dies. The stream is already
/// registered; on a failed dial the registration is removed and the manager
/// gets a `ws_close`.
#[allow(clippy::too_many_arguments)]
async fn run_local_stream(
    ws_sink: WsSink,
    streams: LocalStreams,
    mut event_rx: mpsc::Receiver<StreamEvent>,
    local_api: String,
    id: String,
    path: String,
    headers: Headers,
    protocol: Option<String>,
) {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    // ws:// against the same local API host the HTTP leg uses.
    let url = format!("{}{path}", local_api.replacen("http", "ws", 1));
    let request = match url.clone().into_client_request() {
        Ok(mut request) => {
            append_wire_headers(request.headers_mut(), &headers);
            if let Some(value) = protocol.as_ref().and_then(|p| p.parse().ok()) {
                request
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", value);
            }
            request
        }
        Err(err) => {
            warn!(stream = %id, %err, "Invalid local stream target");
            streams.lock().await.remove(&id);
            send_frame(
                &ws_sink,
                &TunnelMessage::WsClose {
                    id,
                    code: Some(1011),
                    reason: Some("invalid stream target".to_string()),
                },
            )
            .await;
            return;
        }
    };

    let local = match tokio_tungstenite::connect_async(request).await {
        Ok((socket, _)) => socket,
        Err(err) => {
            warn!(stream = %id, %err, "Local WebSocket target refused");
            streams.lock().await.remove(&id);
            send_frame(
                &ws_sink,
                &TunnelMessage::WsClose {
                    id,
                    code: Some(1011),
                    reason: Some(format!("local target unavailable: {err}")),
                },
            )
            .await;
            return;
        }
    };

    let (mut local_sink, mut local_stream) = local.split();
    debug!(stream = %id, %url, "Local stream open");

    // Tunnel → local target. Frames queued during the dial drain first.
    let mut to_local = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                StreamEvent::Data { opcode, payload } => {
                    let msg = match opcode {
                        WsOpcode::Text => tokio_tungstenite::tungstenite::Message::Text(
                            String::from_utf8_lossy(&payload).into_owned().into(),
                        ),
                        WsOpcode::Binary => {
                            tokio_tungstenite::tungstenite::Message::Binary(payload.into())
                        }
                    };
                    if local_sink.send(msg).await.is_err() {
                        return;
                    }
                }
                StreamEvent::Close { code, reason } => {
                    let frame = code.map(|code| {
                        tokio_tungstenite::tungstenite::protocol::CloseFrame {
                            code: code.into(),
                            reason: reason.unwrap_or_default().into(),
                        }
                    });
                    let _ = local_sink
                        .send(tokio_tungstenite::tungstenite::Message::Close(frame))
                        .await;
                    return;
                }
            }
        }
        let _ = local_sink
            .send(tokio_tungstenite::tungstenite::Message::Close(None))
            .await;
    });

    // Local target → tunnel. One local WS message = one ws_data frame.
    let mut to_tunnel = {
        let ws_sink = ws_sink.clone();
        let id = id.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = local_stream.next().await {
                let frame = match msg {
                    tokio_tungstenite::tungstenite::Message::Text(text) => TunnelMessage::WsData {
                        id: id.clone(),
                        opcode: WsOpcode::Text,
                        payload: text.as_bytes().to_vec(),
                    },
                    tokio_tungstenite::tungstenite::Message::Binary(data) => {
                        TunnelMessage::WsData {
                            id: id.clone(),
                            opcode: WsOpcode::Binary,
                            payload: data.to_vec(),
                        }
                    }
                    tokio_tungstenite::tungstenite::Message::Close(frame) => {
                        send_frame(
                            &ws_sink,
                            &TunnelMessage::WsClose {
                                id: id.clone(),
                                code: frame.as_ref().map(|f| f.code.into()),
                                reason: frame.map(|f| f.reason.to_string()),
                            },
                        )
                        .await;
                        return;
                    }
                    _ => continue,
                };
                send_frame(&ws_sink, &frame).await;
            }
        })
    };

    tokio::select! {
        _ = &mut to_local => to_tunnel.abort(),
        _ = &mut to_tunnel => to_local.abort(),
    }

    if streams.lock().await.remove(&id).is_some() {
        // Local side ended first: tell the manager. Duplicate closes for an
        // already-removed stream id are ignored on the other end.
        send_frame(
            &ws_sink,
            &TunnelMessage::WsClose {
                id: id.clone(),
                code: Some(1000),
                reason: None,
            },
        )
        .await;
    }
    debug!(stream = %id, "Local stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ws_data_during_stream_open_is_queued() {
        let streams: LocalStreams = Arc::new(Mutex::new(HashMap::new()));
        // The stream registers as soon as ws_start is seen; the local dial
        // has not completed yet.
        let mut event_rx = open_stream(&streams, "exec-1".to_string()).await;

        let delivered = deliver_stream_event(
            &streams,
            "exec-1",
            StreamEvent::Data {
                opcode: WsOpcode::Text,
                payload: b"stdin line".to_vec(),
            },
        )
        .await;
        assert!(delivered);

        match event_rx.recv().await {
            Some(StreamEvent::Data { payload, .. }) => assert_eq!(payload, b"stdin line"),
            other => panic!("expected queued data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ws_data_for_unknown_stream_is_not_delivered() {
        let streams: LocalStreams = Arc::new(Mutex::new(HashMap::new()));
        let delivered = deliver_stream_event(
            &streams,
            "never-opened",
            StreamEvent::Data {
                opcode: WsOpcode::Binary,
                payload: vec![1, 2, 3],
            },
        )
        .await;
        assert!(!delivered);
    }

    #[test]
    fn test_binary_transport_frame_is_protocol_error() {
        let err = decode_frame(&tokio_tungstenite::tungstenite::Message::Binary(
            vec![0u8, 1, 2].into(),
        ))
        .expect_err("binary frames are not part of the protocol");
        assert!(err.contains("binary"));
    }

    #[test]
    fn test_text_transport_frame_decodes() {
        let frame = decode_frame(&tokio_tungstenite::tungstenite::Message::Text(
            r#"{"type":"heartbeat"}"#.into(),
        ))
        .expect("decodes")
        .expect("carries a frame");
        assert_eq!(frame, TunnelMessage::Heartbeat);

        // Transport housekeeping carries no frame.
        let none = decode_frame(&tokio_tungstenite::tungstenite::Message::Pong(
            Vec::new().into(),
        ))
        .expect("not an error");
        assert!(none.is_none());
    }
}

//! Manager side of the tunnel — agent registration and frame dispatch.
//!
//! Agents dial in at `GET /api/tunnel/register?environment=<id>&token=<key>`
//! (query-param auth: no headers are available during a browser-style WS
//! upgrade). After the upgrade the connection gets:
//!
//! - a writer task draining the connection's outbound queue to the socket,
//!   which serializes all frame writes through one sink;
//! - a read loop decoding frames and demuxing them by type + id to the
//!   pending-request table or the stream table;
//! - a heartbeat monitor that probes the agent and evicts the connection
//!   after two consecutive missed acks.
//!
//! An undecodable frame is a protocol error and tears the connection down;
//! resynchronizing a framed stream past an unknown message is not safe.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use super::correlator::ProxiedResponse;
use super::message::TunnelMessage;
use super::registry::{Connection, ConnectionRegistry, StreamEvent, TunnelError};
use crate::AppState;

/// Query params for the agent registration WS.
#[derive(Deserialize)]
pub struct RegisterQuery {
    environment: String,
    token: String,
}

/// `GET /api/tunnel/register?environment=<id>&token=<agent token>` — agent
/// WS registration. The token is checked against the environment descriptor
/// before the upgrade completes.
pub async fn agent_register_ws(
    State(state): State<AppState>,
    Query(query): Query<RegisterQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(environment) = state.environments.get(&query.environment) else {
        return (StatusCode::NOT_FOUND, "Unknown environment").into_response();
    };
    if !environment.enabled {
        return (StatusCode::BAD_REQUEST, "Environment is disabled").into_response();
    }
    if !environment.is_edge() {
        return (StatusCode::BAD_REQUEST, "Environment is not an edge agent").into_response();
    }
    if !crate::auth::verify_agent_token(environment, &query.token) {
        return (StatusCode::FORBIDDEN, "Invalid agent token").into_response();
    }

    let environment_id = environment.id.clone();
    info!(environment = %environment_id, "Agent connecting...");

    ws.on_upgrade(move |socket| {
        let span = info_span!("tunnel_agent", environment = %environment_id);
        handle_agent_ws(socket, state, environment_id).instrument(span)
    })
}

/// Handle a registered agent's WebSocket connection until it dies.
async fn handle_agent_ws(
    socket: axum::extract::ws::WebSocket,
    state: AppState,
    environment_id: String,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (conn, mut outbound_rx) = Connection::new(environment_id.clone());
    // A fresh ack timestamp so the heartbeat monitor starts from "alive".
    conn.mark_heartbeat_ack();
    state.registry.register(conn.clone()).await;
    info!("Agent registered");

    // Single writer per connection: interleaved partial frames on the shared
    // transport would corrupt the stream.
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if ws_sink
                .send(axum::extract::ws::Message::Text(msg.encode().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let heartbeat = tokio::spawn(heartbeat_loop(
        state.registry.clone(),
        conn.clone(),
        Duration::from_secs(state.config.heartbeat.interval_secs),
        Duration::from_secs(state.config.heartbeat.ack_timeout_secs),
    ));

    let mut closed = conn.closed_signal();
    loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                msg
            }
            _ = closed.changed() => {
                info!("Connection handler stopping (superseded or evicted)");
                break;
            }
        };
        match msg {
            axum::extract::ws::Message::Text(text) => match TunnelMessage::decode(&text) {
                Ok(frame) => dispatch(&conn, frame).await,
                Err(err) => {
                    warn!(%err, "Protocol error, closing connection");
                    break;
                }
            },
            axum::extract::ws::Message::Binary(_) => {
                warn!("Unexpected binary frame, closing connection");
                break;
            }
            axum::extract::ws::Message::Close(_) => break,
            _ => {}
        }
    }

    state.registry.unregister(&environment_id, &conn).await;
    conn.shutdown(TunnelError::ConnectionLost);
    heartbeat.abort();
    writer.abort();
    info!("Agent disconnected");
}

/// Demux one inbound frame by type + id.
///
/// Frames that are valid but make no sense from an agent (`request`,
/// `ws_start`) and responses for timed-out or abandoned ids are logged and
/// dropped; only undecodable frames (handled by the caller) close the
/// connection.
pub(crate) async fn dispatch(conn: &Arc<Connection>, frame: TunnelMessage) {
    match frame {
        TunnelMessage::Response {
            id,
            status,
            headers,
            body,
            done: _,
        } => {
            if let Some(waiter) = conn.take_pending(&id) {
                let _ = waiter.send(Ok(ProxiedResponse {
                    status,
                    headers,
                    body,
                }));
            } else {
                warn!(request = %id, "Response for unknown or timed-out request (dropped)");
            }
        }
        // Answered immediately, ahead of any request processing.
        TunnelMessage::Heartbeat => {
            let _ = conn.send(TunnelMessage::HeartbeatAck).await;
        }
        TunnelMessage::HeartbeatAck => conn.mark_heartbeat_ack(),
        TunnelMessage::WsData {
            id,
            opcode,
            payload,
        } => {
            if let Some(tx) = conn.stream_sender(&id) {
                // Blocks only this connection's read loop when the stream's
                // client is slow; that is the backpressure contract.
                let _ = tx.send(StreamEvent::Data { opcode, payload }).await;
            } else {
                debug!(stream = %id, "ws_data for unknown stream (dropped)");
            }
        }
        TunnelMessage::WsClose { id, code, reason } => {
            if let Some(tx) = conn.stream_sender(&id) {
                let _ = tx.send(StreamEvent::Close { code, reason }).await;
            }
            conn.remove_stream(&id);
        }
        TunnelMessage::Request { id, .. } | TunnelMessage::WsStart { id, .. } => {
            warn!(frame = %id, "Agent sent a manager-only frame (dropped)");
        }
    }
}

/// Probe the agent at a fixed interval and evict the connection after two
/// consecutive missed acks. One missed ack followed by a timely one resets
/// the counter.
pub(crate) async fn heartbeat_loop(
    registry: Arc<ConnectionRegistry>,
    conn: Arc<Connection>,
    interval: Duration,
    ack_timeout: Duration,
) {
    let mut missed: u32 = 0;
    loop {
        tokio::time::sleep(interval).await;
        if conn.is_closed() {
            break;
        }
        let sent_at = conn.epoch_ms();
        if conn.send(TunnelMessage::Heartbeat).await.is_err() {
            break;
        }
        tokio::time::sleep(ack_timeout).await;
        if conn.last_heartbeat_ack_ms() >= sent_at {
            missed = 0;
        } else {
            missed += 1;
            debug!(environment = %conn.environment_id, missed, "Missed heartbeat ack");
            if missed >= 2 {
                warn!(environment = %conn.environment_id, "Evicting agent (heartbeat timeout)");
                registry.unregister(&conn.environment_id, &conn).await;
                conn.shutdown(TunnelError::ConnectionLost);
                break;
            }
        }
    }
}

/// `GET /api/tunnel/connections` — list live tunnel connections (admin).
pub async fn list_connections(State(state): State<AppState>) -> Json<Value> {
    let mut list: Vec<Value> = Vec::new();
    for conn in state.registry.all().await {
        #[allow(clippy::cast_possible_truncation)]
        let connected_ms = conn.connected_since.elapsed().as_millis() as u64;
        list.push(json!({
            "environment": conn.environment_id,
            "pending_requests": conn.pending_count(),
            "active_streams": conn.stream_count(),
            "last_heartbeat_ack_ms": conn.last_heartbeat_ack_ms(),
            "connected_since_ms": connected_ms,
        }));
    }
    Json(json!({"connections": list}))
}

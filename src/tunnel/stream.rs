//! Sub-stream multiplexer — manager side.
//!
//! Bridges one manager-facing WebSocket client (container logs, stats, exec)
//! to an agent-side target over the tunnel. The client socket and the tunnel
//! get one relay task per direction, so a slow client blocks only its own
//! stream; `ws_data` frames ride an ordered per-stream channel, so no
//! reordering can occur within a stream.
//!
//! Close handling: whichever side closes first — client socket, agent
//! `ws_close`, or the tunnel connection dying — the other side is closed
//! promptly, and duplicate closes are ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::message::{Headers, TunnelMessage, WsOpcode};
use super::registry::{Connection, StreamEvent, StreamHandle, STREAM_QUEUE};

/// Default close code used when a close is synthesized locally.
const CLOSE_NORMAL: u16 = 1000;

/// Run one multiplexed stream to completion: register it, send `ws_start`,
/// relay both directions, and tear everything down when either side ends.
pub async fn run_stream(
    conn: Arc<Connection>,
    socket: WebSocket,
    path: String,
    headers: Headers,
    protocol: Option<String>,
) {
    let id = uuid::Uuid::new_v4().to_string();
    let (event_tx, event_rx) = mpsc::channel(STREAM_QUEUE);
    conn.register_stream(id.clone(), StreamHandle::new(event_tx));

    let start = TunnelMessage::WsStart {
        id: id.clone(),
        path,
        headers,
        protocol,
    };
    if conn.send(start).await.is_err() {
        conn.remove_stream(&id);
        warn!(environment = %conn.environment_id, stream = %id, "Tunnel gone before ws_start");
        return;
    }

    let (client_sink, client_stream) = socket.split();
    // Set once the agent side already knows the stream is over — either it
    // initiated the close or it was told — so cleanup does not send a second
    // ws_close.
    let close_sent = Arc::new(AtomicBool::new(false));

    let mut to_client = tokio::spawn(relay_to_client(
        event_rx,
        client_sink,
        close_sent.clone(),
    ));
    let mut from_client = tokio::spawn(relay_from_client(
        conn.clone(),
        id.clone(),
        client_stream,
        close_sent.clone(),
    ));

    // Either direction ending ends the stream; the survivor is aborted.
    tokio::select! {
        _ = &mut to_client => from_client.abort(),
        _ = &mut from_client => to_client.abort(),
    }

    conn.remove_stream(&id);
    if !close_sent.swap(true, Ordering::SeqCst) && !conn.is_closed() {
        let _ = conn
            .send(TunnelMessage::WsClose {
                id: id.clone(),
                code: Some(CLOSE_NORMAL),
                reason: None,
            })
            .await;
    }
    debug!(environment = %conn.environment_id, stream = %id, "Stream closed");
}

/// Tunnel → client: deliver ordered stream events to the client socket.
/// Generic over the sink so the relay can be exercised without a socket.
async fn relay_to_client<S>(
    mut events: mpsc::Receiver<StreamEvent>,
    mut sink: S,
    close_sent: Arc<AtomicBool>,
) where
    S: Sink<Message> + Unpin,
{
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Data { opcode, payload } => {
                let msg = match opcode {
                    WsOpcode::Text => match String::from_utf8(payload) {
                        Ok(text) => Message::Text(text.into()),
                        // Should not happen for a conforming peer; keep the
                        // bytes intact rather than lossy-converting.
                        Err(err) => Message::Binary(err.into_bytes().into()),
                    },
                    WsOpcode::Binary => Message::Binary(payload.into()),
                };
                if sink.send(msg).await.is_err() {
                    return;
                }
            }
            StreamEvent::Close { code, reason } => {
                // The close came over the tunnel: the agent already knows,
                // no ws_close echo is owed.
                close_sent.store(true, Ordering::SeqCst);
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: code.unwrap_or(CLOSE_NORMAL),
                        reason: reason.unwrap_or_default().into(),
                    })))
                    .await;
                return;
            }
        }
    }
    // Channel gone (stream deregistered): close the client politely.
    let _ = sink.send(Message::Close(None)).await;
}

/// Client → tunnel: wrap each client WS message as one `ws_data` frame,
/// preserving message boundaries and text/binary framing.
async fn relay_from_client(
    conn: Arc<Connection>,
    id: String,
    mut stream: SplitStream<WebSocket>,
    close_sent: Arc<AtomicBool>,
) {
    while let Some(Ok(msg)) = stream.next().await {
        let frame = match msg {
            Message::Text(text) => TunnelMessage::WsData {
                id: id.clone(),
                opcode: WsOpcode::Text,
                payload: text.as_bytes().to_vec(),
            },
            Message::Binary(data) => TunnelMessage::WsData {
                id: id.clone(),
                opcode: WsOpcode::Binary,
                payload: data.to_vec(),
            },
            Message::Close(frame) => {
                close_sent.store(true, Ordering::SeqCst);
                let _ = conn
                    .send(TunnelMessage::WsClose {
                        id: id.clone(),
                        code: frame.as_ref().map(|f| f.code),
                        reason: frame.map(|f| f.reason.to_string()),
                    })
                    .await;
                return;
            }
            // Axum answers pings itself; pongs need no relay.
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if conn.send(frame).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as channel_mpsc;

    #[tokio::test]
    async fn test_tunnel_close_reaches_client_without_echo() {
        let (event_tx, event_rx) = mpsc::channel(STREAM_QUEUE);
        let (sink, mut client) = channel_mpsc::unbounded::<Message>();
        let close_sent = Arc::new(AtomicBool::new(false));

        event_tx
            .send(StreamEvent::Data {
                opcode: WsOpcode::Text,
                payload: b"log line".to_vec(),
            })
            .await
            .expect("queued");
        event_tx
            .send(StreamEvent::Close {
                code: Some(1000),
                reason: None,
            })
            .await
            .expect("queued");

        relay_to_client(event_rx, sink, close_sent.clone()).await;

        // Agent-initiated close: the flag suppresses the cleanup ws_close.
        assert!(close_sent.load(Ordering::SeqCst));
        match client.next().await {
            Some(Message::Text(text)) => assert_eq!(text.as_str(), "log line"),
            other => panic!("expected relayed text, got {other:?}"),
        }
        match client.next().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, 1000),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_channel_gone_closes_client_and_leaves_flag_clear() {
        let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(STREAM_QUEUE);
        let (sink, mut client) = channel_mpsc::unbounded::<Message>();
        let close_sent = Arc::new(AtomicBool::new(false));

        drop(event_tx); // stream deregistered without a close event
        relay_to_client(event_rx, sink, close_sent.clone()).await;

        // No close came over the tunnel, so cleanup still owes a ws_close.
        assert!(!close_sent.load(Ordering::SeqCst));
        match client.next().await {
            Some(Message::Close(None)) => {}
            other => panic!("expected bare close, got {other:?}"),
        }
    }
}

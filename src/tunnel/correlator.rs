//! Request/response correlation over the tunnel.
//!
//! [`proxy_request`] wraps one HTTP request in a `request` frame, parks the
//! caller on a oneshot until the matching `response` frame arrives, and maps
//! every failure mode to the HTTP error the original caller should see:
//!
//! - deadline elapsed → 504 (other in-flight requests are unaffected)
//! - connection lost or superseded mid-flight → 502
//! - no response ever (waiter dropped) → 502
//!
//! If the original caller disconnects first, the future is dropped at its
//! await point and a guard removes the pending entry immediately — a late
//! `response` for that id is then discarded by the dispatch loop.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use super::message::{Headers, TunnelMessage};
use super::registry::{Connection, TunnelError};

/// An HTTP request flattened for the wire, path already rewritten to the
/// agent's local addressing scheme and hop-by-hop headers stripped.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub remote_addr: Option<String>,
}

/// The agent's answer, relayed verbatim to the original caller (upstream
/// errors included — those are not tunnel-layer errors).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Handler-shaped error: status code plus JSON body.
pub type ProxyError = (StatusCode, Json<Value>);

fn bad_gateway(error: TunnelError) -> ProxyError {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({"error": error.message(), "code": error.code()})),
    )
}

/// Removes the pending entry when the wait ends for any reason. On the
/// success path the dispatcher has already claimed the entry, so the removal
/// degenerates to a no-op; on timeout or caller disconnect it is what keeps
/// the table from leaking.
struct PendingGuard {
    conn: Arc<Connection>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.conn.remove_pending(&self.id);
    }
}

/// Send `request` through `conn` and wait for the correlated response.
///
/// Exactly one of {response, timeout error, connection-lost error} is
/// returned; the pending entry is gone afterwards in every case.
pub async fn proxy_request(
    conn: &Arc<Connection>,
    request: ProxiedRequest,
    timeout: Duration,
) -> Result<ProxiedResponse, ProxyError> {
    let id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    conn.register_pending(id.clone(), tx);
    let _guard = PendingGuard {
        conn: conn.clone(),
        id: id.clone(),
    };

    let frame = TunnelMessage::Request {
        id,
        method: request.method,
        path: request.path,
        headers: request.headers,
        body: request.body,
        remote_addr: request.remote_addr,
    };
    if let Err(error) = conn.send(frame).await {
        return Err(bad_gateway(error));
    }

    tokio::select! {
        outcome = rx => match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(bad_gateway(error)),
            // Waiter dropped without a verdict: treat as a lost connection.
            Err(_) => Err(bad_gateway(TunnelError::ConnectionLost)),
        },
        () = tokio::time::sleep(timeout) => Err((
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({"error": "Agent did not respond in time", "code": "TIMEOUT"})),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ProxiedRequest {
        ProxiedRequest {
            method: "GET".to_string(),
            path: "/api/environments/0/containers".to_string(),
            headers: Headers::new(),
            body: Vec::new(),
            remote_addr: Some("198.51.100.7".to_string()),
        }
    }

    #[tokio::test]
    async fn test_response_is_delivered_to_caller() {
        let (conn, mut outbound) = Connection::new("env-1");

        let responder = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let frame = outbound.recv().await.expect("request frame");
                let TunnelMessage::Request { id, method, path, .. } = frame else {
                    panic!("expected request frame");
                };
                assert_eq!(method, "GET");
                assert_eq!(path, "/api/environments/0/containers");
                let waiter = conn.take_pending(&id).expect("pending entry");
                waiter
                    .send(Ok(ProxiedResponse {
                        status: 200,
                        headers: Headers::new(),
                        body: b"[]".to_vec(),
                    }))
                    .expect("caller waiting");
            })
        };

        let response = proxy_request(&conn, request(), Duration::from_secs(5))
            .await
            .expect("proxied response");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"[]");
        assert_eq!(conn.pending_count(), 0);
        responder.await.expect("responder task");
    }

    #[tokio::test]
    async fn test_timeout_returns_504_and_clears_entry() {
        let (conn, _outbound) = Connection::new("env-1");

        let err = proxy_request(&conn, request(), Duration::from_millis(50))
            .await
            .expect_err("no agent answers");
        assert_eq!(err.0, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_in_flight_request() {
        let (conn, mut outbound) = Connection::new("env-1");

        let killer = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let _ = outbound.recv().await;
                conn.shutdown(TunnelError::ConnectionLost);
            })
        };

        let err = proxy_request(&conn, request(), Duration::from_secs(5))
            .await
            .expect_err("connection died");
        assert_eq!(err.0, StatusCode::BAD_GATEWAY);
        assert_eq!(err.1["code"], "AGENT_DISCONNECTED");
        killer.await.expect("killer task");
    }

    #[tokio::test]
    async fn test_send_failure_is_immediate_502() {
        let (conn, outbound) = Connection::new("env-1");
        drop(outbound); // writer gone

        let err = proxy_request(&conn, request(), Duration::from_secs(5))
            .await
            .expect_err("cannot send");
        assert_eq!(err.0, StatusCode::BAD_GATEWAY);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_caller_abandons_pending_entry() {
        let (conn, _outbound) = Connection::new("env-1");

        let task = {
            let conn = conn.clone();
            tokio::spawn(
                async move { proxy_request(&conn, request(), Duration::from_secs(60)).await },
            )
        };
        // Let the request register, then simulate the HTTP client going away.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.pending_count(), 1);
        task.abort();
        let _ = task.await;
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_use_distinct_ids() {
        let (conn, mut outbound) = Connection::new("env-1");

        let a = tokio::spawn({
            let conn = conn.clone();
            async move { proxy_request(&conn, request(), Duration::from_secs(5)).await }
        });
        let b = tokio::spawn({
            let conn = conn.clone();
            async move { proxy_request(&conn, request(), Duration::from_secs(5)).await }
        });

        let first = outbound.recv().await.expect("first frame");
        let second = outbound.recv().await.expect("second frame");
        let first_id = first.id().expect("has id").to_string();
        let second_id = second.id().expect("has id").to_string();
        assert_ne!(first_id, second_id);

        // Resolve out of order: completion order is independent per id.
        for id in [second_id, first_id] {
            let waiter = conn.take_pending(&id).expect("pending entry");
            let _ = waiter.send(Ok(ProxiedResponse {
                status: 204,
                headers: Headers::new(),
                body: Vec::new(),
            }));
        }
        assert_eq!(a.await.expect("task a").expect("response a").status, 204);
        assert_eq!(b.await.expect("task b").expect("response b").status, 204);
        assert_eq!(conn.pending_count(), 0);
    }
}

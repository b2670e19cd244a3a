//! Environment proxy front-end.
//!
//! Middleware that intercepts `/api/environments/{id}/...` and routes the
//! request to the addressed environment:
//!
//! - id `"0"` (the local environment) passes through to the local routes
//!   untouched, as does every path outside the prefix;
//! - a directly reachable environment gets a streaming reverse-proxy call to
//!   its `api_url`;
//! - an edge environment goes through the agent tunnel — buffered
//!   request/response frames for HTTP, a multiplexed sub-stream for
//!   WebSocket upgrades.
//!
//! Before leaving the manager the path is rewritten to the local addressing
//! scheme (`{id}` becomes `0`), so the target never needs to know its own
//! public id. Client identity travels as a recomputed `X-Forwarded-For`;
//! the environment token is injected here and never taken from the caller.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ws::WebSocket;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use serde_json::json;
use tracing::{debug, warn};

use crate::environments::{Environment, LOCAL_ENVIRONMENT_ID};
use crate::state::AppState;
use crate::tunnel::correlator::{self, ProxiedRequest};
use crate::tunnel::message::Headers;
use crate::tunnel::stream;

/// Header carrying the environment token on direct outbound legs.
pub const AGENT_TOKEN_HEADER: &str = "x-dockhand-agent-token";

/// Hop-by-hop headers (RFC 9110 §7.6.1) never forwarded through the proxy.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers the proxy always recomputes or injects itself; caller-supplied
/// values are dropped so they cannot be spoofed through the tunnel.
fn is_proxy_owned(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == "host"
        || name == AGENT_TOKEN_HEADER
        || name.starts_with("x-forwarded-")
        || name.starts_with("sec-websocket-")
}

/// Flatten a header map for the wire, dropping hop-by-hop and proxy-owned
/// entries. Non-UTF-8 header values are skipped.
pub fn wire_headers(headers: &HeaderMap) -> Headers {
    let mut wire = Headers::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) || is_proxy_owned(name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            wire.entry(name.as_str().to_string())
                .or_insert_with(Vec::new)
                .push(value.to_string());
        }
    }
    wire
}

/// Append wire headers onto an outgoing header map, preserving multi-valued
/// headers. Hop-by-hop and proxy-owned entries are skipped even if a peer
/// smuggled them into a frame; unparseable names or values are dropped.
pub fn append_wire_headers(target: &mut HeaderMap, wire: &Headers) {
    for (name, values) in wire {
        if is_hop_by_hop(name) || is_proxy_owned(name) {
            continue;
        }
        let Ok(header) = name.parse::<axum::http::HeaderName>() else {
            continue;
        };
        for value in values {
            if let Ok(value) = value.parse() {
                target.append(header.clone(), value);
            }
        }
    }
}

/// Split `/api/environments/{id}/...` into `(id, rest)`, where `rest` keeps
/// its leading slash. Returns `None` for paths outside the prefix and for
/// the bare collection path (which is a local admin route, not a proxy
/// target).
fn split_environment_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/api/environments/")?;
    let slash = rest.find('/')?;
    let (id, rest) = rest.split_at(slash);
    if id.is_empty() {
        return None;
    }
    Some((id, rest))
}

fn proxy_error(status: StatusCode, message: &str, code: &str) -> Response {
    (status, Json(json!({"error": message, "code": code}))).into_response()
}

fn wants_websocket(headers: &HeaderMap) -> bool {
    headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Routing middleware; installed in front of the whole API router.
pub async fn environment_proxy(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let Some((id, rest)) = split_environment_path(req.uri().path()) else {
        return next.run(req).await;
    };
    if id == LOCAL_ENVIRONMENT_ID {
        return next.run(req).await;
    }

    let Some(environment) = state.environments.get(id).cloned() else {
        return proxy_error(
            StatusCode::NOT_FOUND,
            "Unknown environment",
            "UNKNOWN_ENVIRONMENT",
        );
    };
    if !environment.enabled {
        return proxy_error(
            StatusCode::BAD_REQUEST,
            "Environment is disabled",
            "ENVIRONMENT_DISABLED",
        );
    }

    // Everything past this point addresses the target as the local
    // environment.
    let local_path = match req.uri().query() {
        Some(query) => format!("/api/environments/{LOCAL_ENVIRONMENT_ID}{rest}?{query}"),
        None => format!("/api/environments/{LOCAL_ENVIRONMENT_ID}{rest}"),
    };

    if environment.is_edge() {
        proxy_via_tunnel(state, environment, local_path, addr, req).await
    } else {
        proxy_direct(state, environment, local_path, addr, req).await
    }
}

/// Edge environment: route through the agent tunnel.
async fn proxy_via_tunnel(
    state: AppState,
    environment: Environment,
    local_path: String,
    addr: SocketAddr,
    req: Request,
) -> Response {
    let Some(conn) = state.registry.lookup(&environment.id).await else {
        return proxy_error(
            StatusCode::BAD_GATEWAY,
            "Agent is not connected",
            "AGENT_DISCONNECTED",
        );
    };

    if wants_websocket(req.headers()) {
        let headers = wire_headers(req.headers());
        let protocol = req
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let (mut parts, _body) = req.into_parts();
        let mut upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(upgrade) => upgrade,
            Err(err) => return err.into_response(),
        };
        if let Some(ref protocol) = protocol {
            upgrade = upgrade.protocols([protocol.clone()]);
        }
        return upgrade.on_upgrade(move |socket| {
            stream::run_stream(conn, socket, local_path, headers, protocol)
        });
    }

    let timeout = std::time::Duration::from_secs(state.config.proxy.timeout_secs);
    let method = req.method().to_string();
    let headers = wire_headers(req.headers());
    let body = match buffer_body(req.into_body(), state.config.proxy.max_body_bytes).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let proxied = ProxiedRequest {
        method,
        path: local_path,
        headers,
        body,
        remote_addr: Some(addr.ip().to_string()),
    };

    match correlator::proxy_request(&conn, proxied, timeout).await {
        Ok(response) => {
            let mut builder = Response::builder().status(response.status);
            for (name, values) in &response.headers {
                if is_hop_by_hop(name) {
                    continue;
                }
                for value in values {
                    builder = builder.header(name, value);
                }
            }
            builder
                .body(Body::from(response.body))
                .unwrap_or_else(|err| {
                    warn!(%err, "Unrepresentable tunneled response");
                    proxy_error(
                        StatusCode::BAD_GATEWAY,
                        "Agent returned an unrepresentable response",
                        "BAD_FRAME",
                    )
                })
        }
        Err((status, body)) => (status, body).into_response(),
    }
}

/// Directly reachable environment: streaming reverse proxy to its `api_url`.
async fn proxy_direct(
    state: AppState,
    environment: Environment,
    local_path: String,
    addr: SocketAddr,
    req: Request,
) -> Response {
    let api_url = environment.api_url.clone().unwrap_or_default();

    if wants_websocket(req.headers()) {
        return proxy_direct_ws(state, environment, api_url, local_path, req).await;
    }

    let method = req.method().clone();
    let original_host = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let wire = wire_headers(req.headers());
    let body = match buffer_body(req.into_body(), state.config.proxy.max_body_bytes).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let uri = format!("{api_url}{local_path}");
    let mut builder = hyper::Request::builder().method(method).uri(&uri);
    for (name, values) in &wire {
        for value in values {
            builder = builder.header(name, value);
        }
    }
    builder = builder.header("x-forwarded-for", addr.ip().to_string());
    if let Some(host) = original_host {
        builder = builder.header("x-forwarded-host", host);
    }
    builder = builder.header(AGENT_TOKEN_HEADER, &environment.token);
    let request = match builder.body(Full::new(Bytes::from(body))) {
        Ok(request) => request,
        Err(err) => {
            warn!(%err, environment = %environment.id, "Failed to build upstream request");
            return proxy_error(
                StatusCode::BAD_GATEWAY,
                "Failed to build upstream request",
                "UPSTREAM_FAILED",
            );
        }
    };

    let timeout = std::time::Duration::from_secs(state.config.proxy.timeout_secs);
    let response = match tokio::time::timeout(timeout, state.http_client.request(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            warn!(%err, environment = %environment.id, "Upstream call failed");
            return proxy_error(
                StatusCode::BAD_GATEWAY,
                "Environment API is unreachable",
                "UPSTREAM_FAILED",
            );
        }
        Err(_) => {
            return proxy_error(
                StatusCode::GATEWAY_TIMEOUT,
                "Environment API did not respond in time",
                "TIMEOUT",
            )
        }
    };

    let (parts, body) = response.into_parts();
    let mut builder = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    // Response bodies stream; only request bodies are buffered.
    builder.body(Body::new(body)).unwrap_or_else(|err| {
        warn!(%err, "Unrepresentable upstream response");
        proxy_error(
            StatusCode::BAD_GATEWAY,
            "Environment returned an unrepresentable response",
            "UPSTREAM_FAILED",
        )
    })
}

/// WebSocket to a directly reachable environment: upgrade the client, dial
/// the environment, relay one task per direction.
async fn proxy_direct_ws(
    state: AppState,
    environment: Environment,
    api_url: String,
    local_path: String,
    req: Request,
) -> Response {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let protocol = req
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let wire = wire_headers(req.headers());

    let (mut parts, _body) = req.into_parts();
    let mut upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => upgrade,
        Err(err) => return err.into_response(),
    };
    if let Some(ref protocol) = protocol {
        upgrade = upgrade.protocols([protocol.clone()]);
    }

    upgrade.on_upgrade(move |client| async move {
        let url = format!("{}{local_path}", api_url.replacen("http", "ws", 1));
        let target = match url.clone().into_client_request() {
            Ok(mut target) => {
                append_wire_headers(target.headers_mut(), &wire);
                if let Ok(token) = environment.token.parse() {
                    target.headers_mut().insert(AGENT_TOKEN_HEADER, token);
                }
                if let Some(value) = protocol.and_then(|p| p.parse().ok()) {
                    target.headers_mut().insert("Sec-WebSocket-Protocol", value);
                }
                target
            }
            Err(err) => {
                warn!(%err, %url, "Invalid upstream WebSocket target");
                return;
            }
        };

        let upstream = match tokio_tungstenite::connect_async(target).await {
            Ok((upstream, _)) => upstream,
            Err(err) => {
                warn!(%err, %url, "Upstream WebSocket refused");
                return;
            }
        };
        debug!(environment = %environment.id, %url, "Direct WebSocket open");
        relay_direct_ws(client, upstream).await;
    })
}

/// Bidirectional relay between an accepted client socket and an upstream
/// tungstenite socket.
async fn relay_direct_ws(
    client: WebSocket,
    upstream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    use axum::extract::ws::{CloseFrame, Message};
    use tokio_tungstenite::tungstenite::Message as TsMessage;

    let (mut client_sink, mut client_stream) = client.split();
    let (mut upstream_sink, mut upstream_stream) = upstream.split();

    let mut to_upstream = tokio::spawn(async move {
        while let Some(Ok(msg)) = client_stream.next().await {
            let msg = match msg {
                Message::Text(text) => TsMessage::Text(text.as_str().into()),
                Message::Binary(data) => TsMessage::Binary(data),
                Message::Close(frame) => {
                    let _ = upstream_sink
                        .send(TsMessage::Close(frame.map(|f| {
                            tokio_tungstenite::tungstenite::protocol::CloseFrame {
                                code: f.code.into(),
                                reason: f.reason.as_str().into(),
                            }
                        })))
                        .await;
                    return;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if upstream_sink.send(msg).await.is_err() {
                return;
            }
        }
        let _ = upstream_sink.send(TsMessage::Close(None)).await;
    });

    let mut to_client = tokio::spawn(async move {
        while let Some(Ok(msg)) = upstream_stream.next().await {
            let msg = match msg {
                TsMessage::Text(text) => Message::Text(text.as_str().into()),
                TsMessage::Binary(data) => Message::Binary(data),
                TsMessage::Close(frame) => {
                    let _ = client_sink
                        .send(Message::Close(frame.map(|f| CloseFrame {
                            code: f.code.into(),
                            reason: f.reason.as_str().into(),
                        })))
                        .await;
                    return;
                }
                _ => continue,
            };
            if client_sink.send(msg).await.is_err() {
                return;
            }
        }
        let _ = client_sink.send(Message::Close(None)).await;
    });

    tokio::select! {
        _ = &mut to_upstream => to_client.abort(),
        _ = &mut to_client => to_upstream.abort(),
    }
}

/// Buffer a request body up to the configured cap.
async fn buffer_body(body: Body, max_bytes: usize) -> Result<Vec<u8>, Response> {
    match Limited::new(body, max_bytes).collect().await {
        Ok(collected) => Ok(collected.to_bytes().to_vec()),
        Err(_) => Err(proxy_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body too large",
            "BODY_TOO_LARGE",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_environment_path() {
        assert_eq!(
            split_environment_path("/api/environments/env-1/containers"),
            Some(("env-1", "/containers"))
        );
        assert_eq!(
            split_environment_path("/api/environments/0/containers/abc/logs"),
            Some(("0", "/containers/abc/logs"))
        );
        assert_eq!(split_environment_path("/api/environments"), None);
        assert_eq!(split_environment_path("/api/environments/"), None);
        assert_eq!(split_environment_path("/api/environments/env-1"), None);
        assert_eq!(split_environment_path("/api/health"), None);
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("Upgrade"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("authorization"));
    }

    #[test]
    fn test_wire_headers_strip_proxy_owned() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        headers.insert("host", "manager.example.com".parse().unwrap());
        headers.insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
        headers.insert(AGENT_TOKEN_HEADER, "forged".parse().unwrap());
        headers.insert("connection", "upgrade".parse().unwrap());
        headers.append("accept", "text/html".parse().unwrap());
        headers.append("accept", "application/json".parse().unwrap());

        let wire = wire_headers(&headers);
        assert_eq!(
            wire.get("content-type").map(Vec::as_slice),
            Some(&["application/json".to_string()][..])
        );
        assert_eq!(wire.get("accept").map(Vec::len), Some(2));
        assert!(wire.contains_key("authorization"));
        assert!(!wire.contains_key("host"));
        assert!(!wire.contains_key("x-forwarded-for"));
        assert!(!wire.contains_key(AGENT_TOKEN_HEADER));
        assert!(!wire.contains_key("connection"));
    }

    #[test]
    fn test_append_wire_headers_preserves_multi_values() {
        let mut wire = Headers::new();
        wire.insert(
            "accept".to_string(),
            vec!["text/html".to_string(), "application/json".to_string()],
        );
        wire.insert("cookie".to_string(), vec!["a=1".to_string(), "b=2".to_string()]);
        wire.insert("connection".to_string(), vec!["upgrade".to_string()]);

        let mut target = HeaderMap::new();
        append_wire_headers(&mut target, &wire);

        assert_eq!(target.get_all("accept").iter().count(), 2);
        assert_eq!(target.get_all("cookie").iter().count(), 2);
        assert!(target.get("connection").is_none());
    }

    #[tokio::test]
    async fn test_edge_environment_without_agent_is_immediate_502() {
        use crate::config::Config;

        let config = Config {
            server: Default::default(),
            auth: Default::default(),
            proxy: Default::default(),
            heartbeat: Default::default(),
            logging: Default::default(),
            environments: vec![Environment {
                id: "env-1".to_string(),
                name: "rack 1".to_string(),
                api_url: None,
                token: "secret".to_string(),
                enabled: true,
            }],
            agent: None,
        };
        let state = AppState::new(config);
        let environment = state.environments.get("env-1").cloned().expect("configured");
        let req: Request = axum::http::Request::builder()
            .uri("/api/environments/env-1/containers")
            .body(Body::empty())
            .expect("request");
        let addr: SocketAddr = "203.0.113.9:4711".parse().expect("addr");

        // No registered connection: the answer must come back without
        // waiting out any proxy deadline.
        let response = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            proxy_via_tunnel(
                state,
                environment,
                "/api/environments/0/containers".to_string(),
                addr,
                req,
            ),
        )
        .await
        .expect("immediate answer");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(body["code"], "AGENT_DISCONNECTED");
    }
}

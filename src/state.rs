//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use http_body_util::Full;
use hyper::body::Bytes;

use crate::config::Config;
use crate::environments::EnvironmentStore;
use crate::tunnel::registry::ConnectionRegistry;

/// Shared HTTP client used for direct environment proxying.
pub type HttpClient = hyper_util::client::legacy::Client<
    hyper_util::client::legacy::connect::HttpConnector,
    Full<Bytes>,
>;

/// Shared application state for the dockhand manager.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Configured remote environments, keyed by id.
    pub environments: Arc<EnvironmentStore>,
    /// Live agent tunnel connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Client for directly reachable environment APIs.
    pub http_client: HttpClient,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let environments = EnvironmentStore::new(config.environments.clone());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            environments: Arc::new(environments),
            registry: Arc::new(ConnectionRegistry::new()),
            http_client: hyper_util::client::legacy::Client::builder(
                hyper_util::rt::TokioExecutor::new(),
            )
            .build_http(),
        }
    }
}

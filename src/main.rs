#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # dockhand
//!
//! Multi-environment Docker management service. One dockhand instance
//! manages its local environment and any number of remote ones; remote
//! environments are reached either directly over HTTP or through a reverse
//! tunnel dialed out by a `dockhand agent` running next to them.
//!
//! ## Subcommands
//!
//! - `dockhand serve` (default) — run the manager HTTP/WS server
//! - `dockhand agent` — run the edge agent: dial out to a manager and serve
//!   proxied traffic against the local API
//!
//! ## API surface
//!
//! | Method | Path                              | Auth      | Description                      |
//! |--------|-----------------------------------|-----------|----------------------------------|
//! | GET    | `/api/health`                     | No        | Liveness probe                   |
//! | GET    | `/api/environments`               | Yes       | Environment directory + status   |
//! | GET    | `/api/tunnel/connections`         | Yes       | Connected agents (admin)         |
//! | GET    | `/api/tunnel/register`            | `?token=` | Agent WS registration            |
//! | ANY    | `/api/environments/{id}/...`      | varies    | Proxied to the environment       |
//!
//! Proxied paths keep the auth semantics of the target's local API; the
//! proxy itself only injects the environment token and forwarding headers.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, router setup, graceful shutdown
//! auth.rs          — Bearer token middleware, constant-time comparison
//! config.rs        — TOML + env-var configuration
//! environments.rs  — configured environment directory
//! proxy.rs         — /api/environments/{id}/... routing front-end
//! routes.rs        — local REST endpoints (health, environment listing)
//! tunnel/
//!   mod.rs         — reverse tunnel module root
//!   message.rs     — JSON frame envelope (TunnelMessage)
//!   registry.rs    — per-connection state, pending/stream tables, registry
//!   correlator.rs  — request/response correlation with timeouts
//!   stream.rs      — manager-side WebSocket sub-stream relay
//!   manager.rs     — agent registration, frame dispatch, heartbeat monitor
//!   agent.rs       — outbound WS client, reconnect, local request execution
//! ```

use std::net::SocketAddr;

use axum::{middleware, routing::get, Extension, Router};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use dockhand::{auth, proxy, routes, tunnel, ApiKey, AppState, Config};

/// Multi-environment Docker management service.
#[derive(Parser)]
#[command(name = "dockhand", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the manager HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the edge agent: connect outbound to a manager.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Agent { config }) => run_agent(config.as_deref()).await,
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    info!("dockhand v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set DOCKHAND_API_KEY or update config");
    }

    let state = AppState::new(config);
    let edge = state.environments.all().filter(|e| e.is_edge()).count();
    info!(
        "{} environment(s) configured, {} reachable via agent tunnel",
        state.environments.len(),
        edge
    );

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health));

    let authed_routes = Router::new()
        .route("/api/environments", get(routes::list_environments))
        .route(
            "/api/tunnel/connections",
            get(tunnel::manager::list_connections),
        )
        .layer(middleware::from_fn(auth::require_api_key));

    let tunnel_routes = Router::new().route(
        "/api/tunnel/register",
        get(tunnel::manager::agent_register_ws),
    );

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(tunnel_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            proxy::environment_proxy,
        ))
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");

    info!("Shutting down...");
    for conn in state.registry.all().await {
        conn.shutdown(tunnel::registry::TunnelError::ConnectionLost);
    }
    info!("Goodbye");
}

async fn run_agent(config_path: Option<&str>) {
    let config = Config::load(config_path);
    init_tracing(&config);

    let Some(agent_config) = config.agent.clone() else {
        eprintln!("dockhand agent requires an [agent] section in the config file");
        std::process::exit(1);
    };

    info!("dockhand agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Environment {} -> {}",
        agent_config.environment_id, agent_config.manager_url
    );

    let tunnel_task = tunnel::agent::spawn(agent_config, config.proxy.max_body_bytes);

    shutdown_signal().await;
    info!("Shutting down...");
    tunnel_task.abort();
    info!("Goodbye");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

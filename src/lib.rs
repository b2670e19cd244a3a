#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! dockhand library — building blocks of the environment manager and its
//! edge agent.
//!
//! - `tunnel` — reverse tunnel: frame codec, registry, correlator,
//!   sub-streams, manager and agent endpoints
//! - `proxy` — `/api/environments/{id}/...` routing front-end
//! - `environments` — configured environment directory
//! - `auth` — API key authentication middleware
//! - `config` — TOML + env-var configuration

pub mod auth;
pub mod config;
pub mod environments;
pub mod proxy;
pub mod routes;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use environments::{Environment, EnvironmentStore};
pub use state::AppState;
pub use tunnel::registry::ConnectionRegistry;

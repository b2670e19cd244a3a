//! Remote environment directory.
//!
//! Every environment the proxy can route to is declared in config. Id `"0"`
//! is reserved for the local environment and never appears here: requests
//! addressed to it bypass the proxy entirely.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Id of the built-in local environment.
pub const LOCAL_ENVIRONMENT_ID: &str = "0";

/// One configured remote environment.
///
/// `api_url` decides the transport: set, the manager calls the environment's
/// API directly; unset, the environment is an edge environment reachable only
/// through an agent tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub api_url: Option<String>,
    /// Shared secret the agent registers with (edge), or that the manager
    /// presents on the outbound leg (direct).
    pub token: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Environment {
    /// Edge environments have no directly reachable API.
    pub fn is_edge(&self) -> bool {
        self.api_url.is_none()
    }
}

/// Lookup table over configured environments, keyed by id.
#[derive(Debug, Default)]
pub struct EnvironmentStore {
    environments: HashMap<String, Environment>,
}

impl EnvironmentStore {
    pub fn new(environments: Vec<Environment>) -> Self {
        Self {
            environments: environments
                .into_iter()
                .map(|env| (env.id.clone(), env))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Environment> {
        self.environments.get(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Environment> {
        self.environments.values()
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(id: &str) -> Environment {
        Environment {
            id: id.to_string(),
            name: format!("edge {id}"),
            api_url: None,
            token: "secret".to_string(),
            enabled: true,
        }
    }

    #[test]
    fn test_edge_is_api_url_absence() {
        let mut env = edge("env-1");
        assert!(env.is_edge());
        env.api_url = Some("http://10.0.0.5:8080".to_string());
        assert!(!env.is_edge());
    }

    #[test]
    fn test_store_lookup() {
        let store = EnvironmentStore::new(vec![edge("env-1"), edge("env-2")]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("env-2").map(|e| e.name.as_str()), Some("edge env-2"));
        assert!(store.get("env-9").is_none());
        assert!(store.get(LOCAL_ENVIRONMENT_ID).is_none());
    }

    #[test]
    fn test_enabled_defaults_true_in_config() {
        let env: Environment = toml::from_str(
            r#"
            id = "env-1"
            name = "rack 1"
            token = "secret"
            "#,
        )
        .expect("parses");
        assert!(env.enabled);
        assert!(env.is_edge());
    }
}

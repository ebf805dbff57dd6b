//! Operator process configuration.
//!
//! Everything here comes from the environment of the operator pod. Tuning
//! for a single database lives in the VerticaDB spec instead.

use thiserror::Error;
use tracing::warn;

pub const DEFAULT_HEALTH_PORT: u16 = 8080;
pub const DEFAULT_LEASE_NAME: &str = "vertica-operator-leader";
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings of the operator process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Identity used for the leader lease.
    pub pod_name: String,
    /// Namespace holding the leader lease.
    pub pod_namespace: String,
    /// Only watch this namespace. `None` watches the whole cluster.
    pub watch_namespace: Option<String>,
    pub health_port: u16,
    pub lease_name: String,
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the config reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let pod_name = non_empty("POD_NAME").unwrap_or_else(|| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        });
        let pod_namespace = non_empty("POD_NAMESPACE").unwrap_or_else(|| {
            warn!("POD_NAMESPACE not set, using '{}'", DEFAULT_NAMESPACE);
            DEFAULT_NAMESPACE.to_string()
        });
        let health_port = match non_empty("HEALTH_PORT") {
            None => DEFAULT_HEALTH_PORT,
            Some(v) => v.trim().parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                var: "HEALTH_PORT",
                value: v.clone(),
                reason: e.to_string(),
            })?,
        };

        Ok(Self {
            pod_name,
            pod_namespace,
            watch_namespace: non_empty("WATCH_NAMESPACE"),
            health_port,
            lease_name: non_empty("LEASE_NAME").unwrap_or_else(|| DEFAULT_LEASE_NAME.to_string()),
        })
    }
}

//! Gateway configuration: defaults -> YAML -> `AUTHZD__` environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind_host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_owned(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Backend executable spawned per tenant.
    pub backend_binary: PathBuf,

    /// Extra arguments appended after `--tenant`/`--port`.
    pub backend_args: Vec<String>,

    /// Inclusive port range handed out to backends.
    pub port_range_start: u16,
    pub port_range_end: u16,

    /// Connection string template passed to backends; `{TenantId}` is
    /// substituted by the backend itself.
    pub base_connection_string: String,

    /// How long to wait for a freshly spawned backend to report healthy.
    pub startup_timeout_secs: u64,
    pub startup_poll_interval_ms: u64,

    /// Periodic health probe cadence and how many consecutive failures
    /// tear a backend down.
    pub probe_interval_secs: u64,
    pub probe_failure_threshold: u32,

    /// Grace period between SIGTERM and force kill.
    pub stop_grace_secs: u64,

    /// Spawn backends with `--mock` (in-memory stores). Test setups only.
    pub mock_backends: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backend_binary: PathBuf::from("authzd-backend"),
            backend_args: Vec::new(),
            port_range_start: 50_100,
            port_range_end: 50_199,
            base_connection_string: "authzd-{TenantId}.db".to_owned(),
            startup_timeout_secs: 30,
            startup_poll_interval_ms: 1_000,
            probe_interval_secs: 5,
            probe_failure_threshold: 3,
            stop_grace_secs: 5,
            mock_backends: false,
        }
    }
}

impl SupervisorConfig {
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    #[must_use]
    pub fn startup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.startup_poll_interval_ms)
    }

    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterConfig {
    pub connect_timeout_secs: u64,
    pub rpc_timeout_secs: u64,
    /// Default deadline attached to commands when the client sends none.
    pub default_deadline_ms: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            rpc_timeout_secs: 30,
            default_deadline_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub supervisor: SupervisorConfig,
    pub router: RouterConfig,
}

impl GatewayConfig {
    /// Load layered configuration.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be parsed or a
    /// value has the wrong shape.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("AUTHZD__").split("__"))
            .extract()
            .context("invalid gateway configuration")
    }

    /// Render the effective configuration for `--print-config`.
    ///
    /// # Errors
    /// Serialization errors only.
    pub fn to_pretty(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("failed to render configuration")
    }
}

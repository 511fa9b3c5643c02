//! Backend configuration.
//!
//! Layered: defaults -> YAML file -> `AUTHZD__`-prefixed environment.
//! The tenant id and port come from the process invocation contract
//! (`--tenant`/`--port` or `TENANT_ID`/`GRPC_PORT`) and override whatever
//! the file says.

use std::path::Path;

use anyhow::Context;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use authz_engine::EngineConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Host the gRPC listener binds to. Backends are reached only by the
    /// local gateway.
    pub bind_host: String,
    pub port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_owned(),
            port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite DSN or file path; `{TenantId}` is substituted with the
    /// tenant id at startup.
    pub connection_string: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: "authzd-{TenantId}.db".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

impl BackendConfig {
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
            .context("invalid backend configuration")
    }

    /// Render the effective configuration for `--print-config`.
    ///
    /// # Errors
    /// Serialization errors only.
    pub fn to_pretty(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("failed to render configuration")
    }
}

/// Substitute the `{TenantId}` placeholder in a connection string.
#[must_use]
pub fn render_connection_string(template: &str, tenant: &str) -> String {
    template.replace("{TenantId}", tenant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_loadable() {
        let cfg = BackendConfig::load(None).unwrap();
        assert_eq!(cfg.server.bind_host, "127.0.0.1");
        assert_eq!(cfg.engine.channel_capacity, 10_000);
    }

    #[test]
    fn tenant_placeholder_is_substituted() {
        assert_eq!(
            render_connection_string("sqlite://data/{TenantId}.db", "t1"),
            "sqlite://data/t1.db"
        );
        assert_eq!(render_connection_string("plain.db", "t1"), "plain.db");
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authzd.yaml");
        std::fs::write(
            &path,
            "server:\n  bind_host: 0.0.0.0\nengine:\n  channel_capacity: 64\n",
        )
        .unwrap();

        let cfg = BackendConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.server.bind_host, "0.0.0.0");
        assert_eq!(cfg.engine.channel_capacity, 64);
        // untouched defaults survive
        assert_eq!(cfg.engine.persist_retries, 3);
    }
}

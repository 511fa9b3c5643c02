//! gRPC client transport configuration and connection helpers.
//!
//! This module only configures the transport (timeouts, keepalive). RPC
//! retries live in [`crate::retry`] and failure isolation in
//! [`crate::breaker`].

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::Instrument;

/// Transport configuration for channels to tenant backends.
#[derive(Debug, Clone)]
pub struct GrpcClientConfig {
    /// Timeout for establishing the initial connection.
    pub connect_timeout: Duration,

    /// Timeout for individual RPC calls, applied at the transport level.
    pub rpc_timeout: Duration,

    /// Service name for logging and tracing.
    pub service_name: &'static str,
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            service_name: "authzd_backend",
        }
    }
}

impl GrpcClientConfig {
    /// Create a new configuration with the given service name.
    #[must_use]
    pub fn new(service_name: &'static str) -> Self {
        Self {
            service_name,
            ..Default::default()
        }
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the RPC timeout.
    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}

/// Build a tonic `Endpoint` with timeouts and keepalive settings.
fn build_endpoint(
    uri: String,
    cfg: &GrpcClientConfig,
) -> Result<Endpoint, tonic::transport::Error> {
    let endpoint = Endpoint::from_shared(uri)?
        .connect_timeout(cfg.connect_timeout)
        .timeout(cfg.rpc_timeout)
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);

    Ok(endpoint)
}

/// Connect to a backend with the configured transport stack.
///
/// Does not retry; callers that need connection retries wrap this with
/// their own policy (the supervisor's startup poll effectively is one).
///
/// # Errors
/// Returns an error when the URI is invalid or the connection cannot be
/// established within the connect timeout.
pub async fn connect_with_stack<TClient>(
    uri: impl Into<String>,
    cfg: &GrpcClientConfig,
    ctor: impl FnOnce(Channel) -> TClient,
) -> anyhow::Result<TClient> {
    let uri_string = uri.into();
    let span = tracing::debug_span!(
        "grpc_connect",
        service = cfg.service_name,
        uri = %uri_string
    );

    async move {
        let endpoint = build_endpoint(uri_string, cfg)?;
        let channel = endpoint.connect().await?;
        tracing::debug!(service = cfg.service_name, "gRPC client connected");
        Ok(ctor(channel))
    }
    .instrument(span)
    .await
}

/// Build a lazily-connecting channel: the connection is established on the
/// first RPC. Used by the router so a shared channel can be created while
/// the backend is still starting.
///
/// # Errors
/// Returns an error for an invalid URI.
pub fn lazy_channel(uri: impl Into<String>, cfg: &GrpcClientConfig) -> anyhow::Result<Channel> {
    let endpoint = build_endpoint(uri.into(), cfg)?;
    Ok(endpoint.connect_lazy())
}

/// Simple connection helper with default configuration.
///
/// # Errors
/// See [`connect_with_stack`].
pub async fn connect<TClient>(
    uri: impl Into<String>,
    service_name: &'static str,
    ctor: impl FnOnce(Channel) -> TClient,
) -> anyhow::Result<TClient> {
    let cfg = GrpcClientConfig::new(service_name);
    connect_with_stack(uri, &cfg, ctor).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = GrpcClientConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(30));
    }

    #[test]
    fn config_builder() {
        let cfg = GrpcClientConfig::new("test_service")
            .with_connect_timeout(Duration::from_secs(5))
            .with_rpc_timeout(Duration::from_secs(15));
        assert_eq!(cfg.service_name, "test_service");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(15));
    }

    #[test]
    fn build_endpoint_rejects_empty_uri() {
        let cfg = GrpcClientConfig::default();
        assert!(build_endpoint(String::new(), &cfg).is_err());
        assert!(build_endpoint("http://127.0.0.1:50051".to_owned(), &cfg).is_ok());
    }
}

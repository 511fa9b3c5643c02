//! Tenant router: maps a resolved tenant id to a live backend channel and
//! forwards commands.
//!
//! One shared lazily-connecting channel exists per backend endpoint;
//! concurrent requests multiplex over it. Transient transport failures are
//! retried per policy, and a per-endpoint circuit breaker keeps the
//! gateway from hammering a backend that keeps failing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tonic::transport::Channel;

use authz_engine::domain::command::Command;
use authzd_proto::pb::CommandRequest;
use authzd_proto::{CommandServiceClient, WireOutcome, decode_outcome, encode_command};
use authzd_transport::breaker::{BreakerConfig, CircuitBreaker};
use authzd_transport::client::{GrpcClientConfig, lazy_channel};
use authzd_transport::retry::{RetryConfig, call_with_retry};

use crate::config::RouterConfig;
use crate::error::GatewayError;
use crate::supervisor::Supervisor;

pub mod tenant;

pub struct TenantRouter {
    supervisor: Arc<Supervisor>,
    channels: DashMap<String, CommandServiceClient<Channel>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    retry: Arc<RetryConfig>,
    client_cfg: GrpcClientConfig,
    default_deadline_ms: u32,
}

impl TenantRouter {
    #[must_use]
    pub fn new(supervisor: Arc<Supervisor>, cfg: &RouterConfig) -> Self {
        let client_cfg = GrpcClientConfig::new("authzd_backend")
            .with_connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .with_rpc_timeout(Duration::from_secs(cfg.rpc_timeout_secs));
        Self {
            supervisor,
            channels: DashMap::new(),
            breakers: DashMap::new(),
            retry: Arc::new(RetryConfig::default()),
            client_cfg,
            default_deadline_ms: cfg.default_deadline_ms,
        }
    }

    fn breaker_for(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        Arc::clone(
            &self
                .breakers
                .entry(endpoint.to_owned())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(BreakerConfig::default()))),
        )
    }

    fn client_for(&self, endpoint: &str) -> Result<CommandServiceClient<Channel>, GatewayError> {
        if let Some(client) = self.channels.get(endpoint) {
            return Ok(client.clone());
        }
        let channel = lazy_channel(endpoint, &self.client_cfg)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let client = CommandServiceClient::new(channel);
        self.channels.insert(endpoint.to_owned(), client.clone());
        Ok(client)
    }

    /// Forward one command to the tenant's backend and decode the result.
    ///
    /// # Errors
    /// Supervisor failures, circuit-open rejections, exhausted transport
    /// retries, or the domain error the backend answered with.
    pub async fn execute(
        &self,
        tenant: &str,
        command: &Command,
        actor: Option<String>,
        deadline_ms: Option<u32>,
    ) -> Result<WireOutcome, GatewayError> {
        let endpoint = self.supervisor.ensure_running(tenant).await?;
        let breaker = self.breaker_for(&endpoint);
        if !breaker.allow() {
            return Err(GatewayError::CircuitOpen);
        }

        let mut client = self.client_for(&endpoint)?;
        let (command_type, command_data) = encode_command(command);
        let deadline_millis = deadline_ms.unwrap_or(self.default_deadline_ms);
        let request = CommandRequest {
            command_type: command_type.to_owned(),
            command_data,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            deadline_millis,
        };

        let rpc_deadline = Duration::from_millis(u64::from(deadline_millis));
        let result = call_with_retry(
            &mut client,
            Arc::clone(&self.retry),
            request,
            async |c, req| {
                let mut request = tonic::Request::new(req);
                request.set_timeout(rpc_deadline);
                if let Some(actor) = actor.clone() {
                    match actor.parse() {
                        Ok(value) => {
                            request.metadata_mut().insert("x-actor-id", value);
                        }
                        Err(_) => {
                            tracing::debug!("dropping non-ascii actor id from metadata");
                        }
                    }
                }
                c.execute_command(request).await.map(|r| r.into_inner())
            },
            "authzd.execute_command",
        )
        .await;

        match result {
            Err(status) => {
                breaker.on_failure();
                // Drop the cached channel so the next request reconnects.
                self.channels.remove(&endpoint);
                Err(GatewayError::Transport(status))
            }
            Ok(response) => {
                breaker.on_success();
                if response.success {
                    decode_outcome(command_type, &response.result_data)
                        .map_err(|e| GatewayError::Decode(e.to_string()))
                } else {
                    Err(GatewayError::Backend {
                        kind: response.error_kind,
                        message: response.error_message,
                    })
                }
            }
        }
    }

    /// Probe the tenant backend's health endpoint, starting the backend if
    /// needed.
    ///
    /// # Errors
    /// Supervisor or transport failures.
    pub async fn health(
        &self,
        tenant: &str,
    ) -> Result<authzd_proto::pb::HealthResponse, GatewayError> {
        let endpoint = self.supervisor.ensure_running(tenant).await?;
        let mut client = self.client_for(&endpoint)?;
        client
            .health_check(authzd_proto::pb::HealthRequest {})
            .await
            .map(tonic::Response::into_inner)
            .map_err(GatewayError::Transport)
    }
}

//! The inbound gRPC surface of a tenant backend.
//!
//! Handlers only decode, enqueue into the command channel and await their
//! reply handle; the single-writer loop does everything else. Domain
//! failures travel in-band as `error_kind`/`error_message` on the
//! response, not as gRPC statuses — a gRPC status here means the
//! transport or the process is unhealthy, which is what the gateway's
//! retry policy keys off.

use std::time::{Duration, Instant};

use tonic::{Request, Response, Status};
use tracing::Instrument;

use authz_engine::domain::command::Command;
use authz_engine::engine::channel::SubmitMeta;
use authz_engine::engine::processor::EngineHandle;
use authzd_proto::pb::{CommandRequest, CommandResponse, HealthRequest, HealthResponse};
use authzd_proto::{CommandService, decode_command, encode_outcome};

/// Metadata key carrying the acting user for audit records.
const ACTOR_METADATA_KEY: &str = "x-actor-id";

pub struct CommandRpc {
    tenant: String,
    handle: EngineHandle,
}

impl CommandRpc {
    #[must_use]
    pub fn new(tenant: String, handle: EngineHandle) -> Self {
        Self { tenant, handle }
    }

    fn error_response(
        correlation_id: String,
        kind: &str,
        message: impl Into<String>,
    ) -> CommandResponse {
        CommandResponse {
            success: false,
            result_data: Vec::new(),
            error_kind: kind.to_owned(),
            error_message: message.into(),
            correlation_id,
        }
    }
}

#[tonic::async_trait]
impl CommandService for CommandRpc {
    async fn execute_command(
        &self,
        request: Request<CommandRequest>,
    ) -> Result<Response<CommandResponse>, Status> {
        let actor = request
            .metadata()
            .get(ACTOR_METADATA_KEY)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let req = request.into_inner();
        let correlation_id = req.correlation_id.clone();

        let command: Command = match decode_command(&req.command_type, &req.command_data) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(
                    tenant = %self.tenant,
                    command_type = %req.command_type,
                    error = %e,
                    "rejected malformed command"
                );
                return Ok(Response::new(Self::error_response(
                    correlation_id,
                    "InvalidArgument",
                    e.to_string(),
                )));
            }
        };

        let deadline = (req.deadline_millis > 0)
            .then(|| Instant::now() + Duration::from_millis(u64::from(req.deadline_millis)));
        let meta = SubmitMeta {
            actor,
            correlation_id: correlation_id.clone(),
            payload: req.command_data,
            deadline,
        };

        let span = tracing::debug_span!(
            "execute_command",
            tenant = %self.tenant,
            command = command.kind(),
            correlation_id = %correlation_id
        );
        let result = self.handle.sender.submit(command, meta).instrument(span).await;

        let response = match result {
            Ok(outcome) => CommandResponse {
                success: true,
                result_data: encode_outcome(&outcome),
                error_kind: String::new(),
                error_message: String::new(),
                correlation_id,
            },
            Err(e) => Self::error_response(correlation_id, e.wire_kind(), e.to_string()),
        };
        Ok(Response::new(response))
    }

    async fn health_check(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let snapshot = self.handle.metrics.snapshot();
        Ok(Response::new(HealthResponse {
            healthy: snapshot.healthy,
            uptime_seconds: snapshot.uptime_seconds,
            commands_processed: snapshot.commands_processed,
            persistence_degraded: snapshot.persistence_degraded,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authz_engine::config::EngineConfig;
    use authz_engine::domain::graph::TenantGraph;
    use authz_engine::engine::processor::spawn;
    use authz_engine::persistence::MemoryStore;
    use authzd_proto::pb;
    use authzd_proto::{WireOutcome, decode_outcome, encode_command};
    use tokio_util::sync::CancellationToken;

    fn rpc() -> (CommandRpc, tokio::task::JoinHandle<TenantGraph>) {
        let cfg = EngineConfig {
            persist_backoff_ms: 1,
            ..EngineConfig::default()
        };
        let (handle, join) = spawn(
            TenantGraph::new(),
            MemoryStore::new(),
            &cfg,
            CancellationToken::new(),
            0,
        );
        (CommandRpc::new("t1".to_owned(), handle), join)
    }

    fn request_for(command: &Command) -> Request<CommandRequest> {
        let (command_type, command_data) = encode_command(command);
        Request::new(CommandRequest {
            command_type: command_type.to_owned(),
            command_data,
            correlation_id: "corr-1".to_owned(),
            deadline_millis: 0,
        })
    }

    #[tokio::test]
    async fn executes_commands_and_echoes_correlation_id() {
        let (rpc, _join) = rpc();
        let response = rpc
            .execute_command(request_for(&Command::CreateUser {
                name: "alice".to_owned(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(response.success);
        assert_eq!(response.correlation_id, "corr-1");
        let WireOutcome::EntityId(result) =
            decode_outcome("create_user", &response.result_data).unwrap()
        else {
            panic!("expected entity id result");
        };
        assert_eq!(result.id, 1);
    }

    #[tokio::test]
    async fn domain_errors_travel_in_band() {
        let (rpc, _join) = rpc();
        let response = rpc
            .execute_command(request_for(&Command::DeleteEntity { entity_id: 404 }))
            .await
            .unwrap()
            .into_inner();

        assert!(!response.success);
        assert_eq!(response.error_kind, "NotFound");
        assert!(!response.error_message.is_empty());
    }

    #[tokio::test]
    async fn malformed_payload_is_invalid_argument() {
        let (rpc, _join) = rpc();
        let response = rpc
            .execute_command(Request::new(CommandRequest {
                command_type: "no_such_command".to_owned(),
                command_data: vec![0xff, 0xff],
                correlation_id: "corr-2".to_owned(),
                deadline_millis: 0,
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(!response.success);
        assert_eq!(response.error_kind, "InvalidArgument");
        assert_eq!(response.correlation_id, "corr-2");
    }

    #[tokio::test]
    async fn health_check_reflects_engine_metrics() {
        let (rpc, _join) = rpc();
        rpc.execute_command(request_for(&Command::CreateUser {
            name: "alice".to_owned(),
        }))
        .await
        .unwrap();

        let health = rpc
            .health_check(Request::new(pb::HealthRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(health.healthy);
        assert!(health.commands_processed >= 1);
        assert!(!health.persistence_degraded);
    }
}

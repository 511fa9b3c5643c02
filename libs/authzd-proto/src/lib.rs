//! Wire contract between the gateway and tenant backends.
//!
//! This crate carries the generated protobuf/gRPC types for the command
//! transport plus the codec that maps them to and from the engine's domain
//! types. Commands travel as a `command_type` discriminator plus a
//! prost-encoded per-variant payload; results come back the same way.

mod codec;

// Generated protobuf types for CommandService
pub mod pb {
    tonic::include_proto!("authzd.v1");
}

// Re-export common types for CommandService
pub use pb::command_service_client::CommandServiceClient;
pub use pb::command_service_server::{CommandService, CommandServiceServer};
pub use pb::{CommandRequest, CommandResponse, HealthRequest, HealthResponse};

pub use codec::{
    DecodeError, WireOutcome, decode_command, decode_outcome, encode_command, encode_outcome,
};

/// Service name constant for CommandService
pub const COMMAND_SERVICE_NAME: &str =
    <CommandServiceServer<()> as tonic::server::NamedService>::NAME;

//! Per-tenant authorization engine.
//!
//! One instance of this engine owns a single tenant's authorization graph:
//! entities (users, groups, roles), their hierarchy edges, and the
//! permissions attached to them. All mutations and queries flow through a
//! bounded command channel into a single-writer loop, so the graph itself
//! needs no interior locking.
//!
//! The crate is split into:
//! - [`domain`] — the graph store, denormalized views, URI pattern matching
//!   and the hierarchical permission resolver;
//! - [`engine`] — the command channel and the single-writer processor;
//! - [`hydration`] — loading a tenant snapshot from durable storage at
//!   process start;
//! - [`persistence`] — the write-behind store contract with SQLite and
//!   in-memory implementations.

pub mod config;
pub mod domain;
pub mod engine;
pub mod hydration;
pub mod persistence;

pub use config::EngineConfig;
pub use domain::command::{Command, CommandOutcome};
pub use domain::error::DomainError;
pub use domain::graph::TenantGraph;
pub use engine::channel::{CommandSender, Envelope, SubmitMeta};
pub use engine::processor::{CommandProcessor, EngineHandle, EngineMetrics};

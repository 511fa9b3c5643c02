//! Durable storage contract and the write-behind wrapper.
//!
//! The engine is authoritative in memory; storage is best-effort
//! write-behind. A failed write never fails the originating command: it is
//! retried with backoff, logged, and counted into a sliding failure window
//! that drives the `persistence_degraded` health flag. On hydration the
//! same store is read synchronously and failures there are fatal.

pub mod memory;
pub mod sqlite;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::domain::model::{
    Entity, EntityId, EntityKind, Permission, PermissionId, Polarity, Scheme, Verb,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage-facing projection of an entity (edges live in their own table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRow {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: String,
    pub metadata: BTreeMap<String, String>,
}

impl From<&Entity> for EntityRow {
    fn from(entity: &Entity) -> Self {
        Self {
            id: entity.id,
            kind: entity.kind,
            name: entity.name.clone(),
            metadata: entity.metadata.clone(),
        }
    }
}

/// Storage-facing projection of a permission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRow {
    pub id: PermissionId,
    pub entity_id: EntityId,
    pub uri: String,
    pub verb: Verb,
    pub polarity: Polarity,
    pub scheme: Scheme,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&Permission> for PermissionRow {
    fn from(p: &Permission) -> Self {
        Self {
            id: p.id,
            entity_id: p.entity_id,
            uri: p.uri.clone(),
            verb: p.verb,
            polarity: p.polarity,
            scheme: p.scheme,
            expires_at: p.expires_at,
        }
    }
}

impl From<PermissionRow> for Permission {
    fn from(row: PermissionRow) -> Self {
        Self {
            id: row.id,
            entity_id: row.entity_id,
            uri: row.uri,
            verb: row.verb,
            polarity: row.polarity,
            scheme: row.scheme,
            expires_at: row.expires_at,
        }
    }
}

/// Everything hydration needs to rebuild a tenant graph.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub entities: Vec<EntityRow>,
    /// `(parent_id, child_id)` pairs.
    pub edges: Vec<(EntityId, EntityId)>,
    pub permissions: Vec<PermissionRow>,
}

/// One row-level effect of a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOp {
    UpsertEntity(EntityRow),
    DeleteEntity(EntityId),
    InsertEdge {
        parent_id: EntityId,
        child_id: EntityId,
    },
    DeleteEdge {
        parent_id: EntityId,
        child_id: EntityId,
    },
    UpsertPermission(PermissionRow),
    DeletePermission(PermissionId),
}

/// The row-level effects of one committed command, idempotent by
/// `change_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub change_id: u64,
    pub ops: Vec<PersistOp>,
}

/// One audit log entry, appended in command-application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub actor: Option<String>,
    pub command_type: String,
    pub payload: Vec<u8>,
    pub result_kind: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt store: {0}")]
    Corrupt(String),
}

/// The per-tenant durable store contract.
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Load the whole tenant graph. Used once, during hydration.
    async fn load_snapshot(&self) -> Result<Snapshot, StoreError>;

    /// Highest change/audit sequence previously written, or 0. The engine
    /// resumes its sequence counter above this after a restart so change
    /// ids stay unique and the audit log stays monotonic.
    async fn last_sequence(&self) -> Result<u64, StoreError>;

    /// Apply the row-level effects of one committed command. Must be
    /// idempotent by `record.change_id`.
    async fn persist_mutation(&self, record: &ChangeRecord) -> Result<(), StoreError>;

    /// Append one audit record.
    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: TenantStore + ?Sized> TenantStore for Arc<S> {
    async fn load_snapshot(&self) -> Result<Snapshot, StoreError> {
        (**self).load_snapshot().await
    }

    async fn last_sequence(&self) -> Result<u64, StoreError> {
        (**self).last_sequence().await
    }

    async fn persist_mutation(&self, record: &ChangeRecord) -> Result<(), StoreError> {
        (**self).persist_mutation(record).await
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        (**self).append_audit(record).await
    }
}

/// Sliding window of persistence attempt outcomes.
struct FailureWindow {
    events: VecDeque<(Instant, bool)>,
    width: Duration,
}

impl FailureWindow {
    fn new(width: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            width,
        }
    }

    fn record(&mut self, now: Instant, ok: bool) {
        self.events.push_back((now, ok));
        while let Some((at, _)) = self.events.front() {
            if now.duration_since(*at) > self.width {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.events.is_empty() {
            return 0.0;
        }
        let failures = self.events.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.events.len() as f64
    }
}

/// Write-behind wrapper: retries with exponential backoff, tracks the
/// failure rate, and flips the shared degradation flag past the threshold.
pub struct WriteBehind<S> {
    store: S,
    retries: u32,
    base_backoff: Duration,
    threshold: f64,
    window: parking_lot::Mutex<FailureWindow>,
    degraded: Arc<AtomicBool>,
}

impl<S: TenantStore> WriteBehind<S> {
    pub fn new(store: S, cfg: &EngineConfig, degraded: Arc<AtomicBool>) -> Self {
        Self {
            store,
            retries: cfg.persist_retries,
            base_backoff: Duration::from_millis(cfg.persist_backoff_ms),
            threshold: cfg.degraded_threshold,
            window: parking_lot::Mutex::new(FailureWindow::new(Duration::from_secs(
                cfg.degraded_window_secs,
            ))),
            degraded,
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    fn note(&self, ok: bool) {
        let rate = {
            let mut window = self.window.lock();
            window.record(Instant::now(), ok);
            window.failure_rate()
        };
        self.degraded.store(rate > self.threshold, Ordering::Relaxed);
    }

    /// Write one change record, retrying on failure. Returns whether the
    /// write eventually succeeded; the caller never propagates a failure
    /// to the client.
    pub async fn persist(&self, record: &ChangeRecord) -> bool {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.store.persist_mutation(record).await {
                Ok(()) => {
                    self.note(true);
                    return true;
                }
                Err(e) if attempt <= self.retries => {
                    let backoff = self.base_backoff * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        change_id = record.change_id,
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "persist failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    tracing::error!(
                        change_id = record.change_id,
                        attempt,
                        error = %e,
                        "persist failed, giving up"
                    );
                    self.note(false);
                    return false;
                }
            }
        }
    }

    /// Append one audit record; failures are counted but not retried (the
    /// next mutation's append does not depend on this one).
    pub async fn audit(&self, record: &AuditRecord) -> bool {
        match self.store.append_audit(record).await {
            Ok(()) => {
                self.note(true);
                true
            }
            Err(e) => {
                tracing::error!(seq = record.seq, error = %e, "audit append failed");
                self.note(false);
                false
            }
        }
    }
}

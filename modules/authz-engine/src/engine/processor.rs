//! The single-writer command processor.
//!
//! Exactly one processor task exists per tenant process; it is the only
//! code that touches the graph and its views. RPC handlers enqueue into
//! the channel and await their reply handle. After each successful
//! mutation the processor writes the change record and an audit record
//! through the write-behind store before dequeuing the next command, which
//! keeps persistence in command-application order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::domain::command::{
    BulkEntryOutcome, BulkOp, Command, CommandOutcome, EntityPage, HealthSnapshot, PermissionGrant,
};
use crate::domain::error::DomainError;
use crate::domain::graph::{PermissionSpec, TenantGraph};
use crate::domain::model::{EntityId, EntityKind, Permission, Polarity};
use crate::domain::resolver;
use crate::persistence::{
    AuditRecord, ChangeRecord, EntityRow, PermissionRow, PersistOp, TenantStore, WriteBehind,
};

use super::channel::{CommandSender, Envelope, command_channel};

/// Shared counters surfaced through `HealthCheck`.
#[derive(Debug)]
pub struct EngineMetrics {
    started_at: Instant,
    commands_processed: AtomicU64,
    degraded: Arc<AtomicBool>,
}

impl EngineMetrics {
    #[must_use]
    pub fn new(degraded: Arc<AtomicBool>) -> Self {
        Self {
            started_at: Instant::now(),
            commands_processed: AtomicU64::new(0),
            degraded,
        }
    }

    fn record_command(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            healthy: true,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            commands_processed: self.commands_processed.load(Ordering::Relaxed),
            persistence_degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}

/// What the RPC layer holds on to: the channel, the health counters and
/// the shutdown token.
#[derive(Clone)]
pub struct EngineHandle {
    pub sender: CommandSender,
    pub metrics: Arc<EngineMetrics>,
    pub cancel: CancellationToken,
}

enum UndoOp {
    /// Undo a grant by detaching the permission it created.
    Detach(u64),
    /// Undo a revoke by re-inserting the removed permission.
    Restore(Permission),
}

pub struct CommandProcessor<S: TenantStore> {
    graph: TenantGraph,
    store: WriteBehind<S>,
    metrics: Arc<EngineMetrics>,
    cancel: CancellationToken,
    rx: mpsc::Receiver<Envelope>,
    seq: u64,
}

/// Wire up a processor and spawn its task.
///
/// `initial_seq` is the store's last used sequence (see
/// [`TenantStore::last_sequence`]); change ids and audit sequence numbers
/// continue above it. The returned join handle yields the graph back when
/// the loop exits, which tests use to inspect final state.
pub fn spawn<S: TenantStore + 'static>(
    graph: TenantGraph,
    store: S,
    cfg: &EngineConfig,
    cancel: CancellationToken,
    initial_seq: u64,
) -> (EngineHandle, tokio::task::JoinHandle<TenantGraph>) {
    let degraded = Arc::new(AtomicBool::new(false));
    let store = WriteBehind::new(store, cfg, Arc::clone(&degraded));
    let metrics = Arc::new(EngineMetrics::new(degraded));
    let (sender, rx) = command_channel(cfg.channel_capacity);

    let processor = CommandProcessor {
        graph,
        store,
        metrics: Arc::clone(&metrics),
        cancel: cancel.clone(),
        rx,
        seq: initial_seq,
    };
    let handle = EngineHandle {
        sender,
        metrics,
        cancel,
    };
    (handle, tokio::spawn(processor.run()))
}

impl<S: TenantStore> CommandProcessor<S> {
    /// Run until the channel closes or the token is cancelled, then drain
    /// remaining envelopes with `Shutdown`.
    pub async fn run(mut self) -> TenantGraph {
        tracing::info!("command processor started");
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                maybe = self.rx.recv() => match maybe {
                    Some(envelope) => self.handle(envelope).await,
                    None => break,
                },
            }
        }

        self.rx.close();
        let mut drained: u64 = 0;
        while let Ok(envelope) = self.rx.try_recv() {
            let _ = envelope.reply.send(Err(DomainError::Shutdown));
            drained += 1;
        }
        if drained > 0 {
            tracing::info!(drained, "drained queued commands on shutdown");
        }
        tracing::info!("command processor stopped");
        self.graph
    }

    async fn handle(&mut self, envelope: Envelope) {
        let Envelope {
            command,
            meta,
            reply,
        } = envelope;

        // Deadline expired while queued: discard without executing.
        if meta.deadline.is_some_and(|d| Instant::now() > d) {
            let _ = reply.send(Err(DomainError::Cancelled));
            return;
        }

        let kind = command.kind();
        let shutdown = matches!(command, Command::Shutdown);
        let is_mutation = command.is_mutation();

        let result = self.apply(command);
        self.metrics.record_command();

        let outcome = match result {
            Ok((outcome, ops)) => {
                if is_mutation {
                    self.seq += 1;
                    let seq = self.seq;
                    if !ops.is_empty() {
                        self.store
                            .persist(&ChangeRecord {
                                change_id: seq,
                                ops,
                            })
                            .await;
                    }
                    self.store
                        .audit(&AuditRecord {
                            seq,
                            ts: Utc::now(),
                            actor: meta.actor,
                            command_type: kind.to_owned(),
                            payload: meta.payload,
                            result_kind: "Ok".to_owned(),
                        })
                        .await;
                }
                Ok(outcome)
            }
            Err(e) => {
                tracing::debug!(command = kind, error = %e, "command failed");
                Err(e)
            }
        };

        if reply.send(outcome).is_err() {
            // Caller went away (deadline fired gateway-side). The mutation
            // still happened; graph invariants cannot be rolled back
            // mid-command.
            tracing::debug!(command = kind, "reply handle dropped by caller");
        }

        if shutdown {
            self.cancel.cancel();
        }
    }

    fn expect_kind(&self, id: EntityId, kind: EntityKind) -> Result<(), DomainError> {
        let entity = self
            .graph
            .entity(id)
            .ok_or_else(|| DomainError::not_found_entity(id))?;
        if entity.kind != kind {
            return Err(DomainError::InvalidArgument(format!(
                "entity {id} is a {}, expected a {kind}",
                entity.kind
            )));
        }
        Ok(())
    }

    fn entity_row(&self, id: EntityId) -> Result<EntityRow, DomainError> {
        self.graph
            .entity(id)
            .map(EntityRow::from)
            .ok_or_else(|| DomainError::not_found_entity(id))
    }

    fn create_with_parent(
        &mut self,
        kind: EntityKind,
        name: &str,
        parent: Option<(EntityId, EntityKind)>,
    ) -> Result<(CommandOutcome, Vec<PersistOp>), DomainError> {
        if let Some((parent_id, parent_kind)) = parent {
            self.expect_kind(parent_id, parent_kind)?;
        }
        let id = self.graph.add_entity(kind, name)?;
        let mut ops = Vec::new();
        if let Some((parent_id, _)) = parent {
            if let Err(e) = self.graph.link(parent_id, id) {
                // Undo the creation; the entity has no other edges yet.
                let _ = self.graph.remove_entity(id);
                return Err(e);
            }
            ops.push(PersistOp::InsertEdge {
                parent_id,
                child_id: id,
            });
        }
        ops.insert(0, PersistOp::UpsertEntity(self.entity_row(id)?));
        Ok((CommandOutcome::EntityId(id), ops))
    }

    fn link_edge(
        &mut self,
        parent_id: EntityId,
        parent_kind: EntityKind,
        child_id: EntityId,
        child_kind: EntityKind,
    ) -> Result<(CommandOutcome, Vec<PersistOp>), DomainError> {
        self.expect_kind(parent_id, parent_kind)?;
        self.expect_kind(child_id, child_kind)?;
        self.graph.link(parent_id, child_id)?;
        Ok((
            CommandOutcome::Unit,
            vec![PersistOp::InsertEdge {
                parent_id,
                child_id,
            }],
        ))
    }

    fn unlink_edge(
        &mut self,
        parent_id: EntityId,
        parent_kind: EntityKind,
        child_id: EntityId,
        child_kind: EntityKind,
    ) -> Result<(CommandOutcome, Vec<PersistOp>), DomainError> {
        self.expect_kind(parent_id, parent_kind)?;
        self.expect_kind(child_id, child_kind)?;
        self.graph.unlink(parent_id, child_id)?;
        Ok((
            CommandOutcome::Unit,
            vec![PersistOp::DeleteEdge {
                parent_id,
                child_id,
            }],
        ))
    }

    fn attach(
        &mut self,
        grant: &PermissionGrant,
        polarity: Polarity,
    ) -> Result<(CommandOutcome, Vec<PersistOp>), DomainError> {
        let spec = PermissionSpec {
            uri: grant.uri.clone(),
            verb: grant.verb,
            polarity,
            scheme: grant.scheme,
            expires_at: grant.expires_at,
        };
        let id = self.graph.attach_permission(grant.entity_id, &spec)?;
        let permission = self
            .graph
            .permission(id)
            .ok_or_else(|| DomainError::Internal("attached permission vanished".to_owned()))?
            .clone();
        let ops = vec![PersistOp::UpsertPermission(PermissionRow::from(&permission))];
        Ok((CommandOutcome::Permission(permission), ops))
    }

    fn apply_bulk(
        &mut self,
        operations: &[BulkOp],
        transactional: bool,
        stop_on_first_error: bool,
    ) -> (CommandOutcome, Vec<PersistOp>) {
        let mut results: Vec<BulkEntryOutcome> = Vec::with_capacity(operations.len());
        let mut undo: Vec<UndoOp> = Vec::new();
        let mut ops: Vec<PersistOp> = Vec::new();
        let mut failed = false;

        for (index, op) in operations.iter().enumerate() {
            let index = index as u32;
            let result = match op {
                BulkOp::Grant(grant) | BulkOp::Deny(grant) => {
                    let polarity = if matches!(op, BulkOp::Grant(_)) {
                        Polarity::Grant
                    } else {
                        Polarity::Deny
                    };
                    let spec = PermissionSpec {
                        uri: grant.uri.clone(),
                        verb: grant.verb,
                        polarity,
                        scheme: grant.scheme,
                        expires_at: grant.expires_at,
                    };
                    let before = self.graph.permissions().len();
                    match self.graph.attach_permission(grant.entity_id, &spec) {
                        Ok(id) => {
                            let created = self.graph.permissions().len() > before;
                            if created {
                                undo.push(UndoOp::Detach(id));
                                if let Some(p) = self.graph.permission(id) {
                                    ops.push(PersistOp::UpsertPermission(PermissionRow::from(p)));
                                }
                            }
                            Ok(Some(id))
                        }
                        Err(e) => Err(e),
                    }
                }
                BulkOp::Revoke { permission_id } => {
                    match self.graph.detach_permission(*permission_id) {
                        Ok(permission) => {
                            ops.push(PersistOp::DeletePermission(permission.id));
                            undo.push(UndoOp::Restore(permission));
                            Ok(None)
                        }
                        Err(e) => Err(e),
                    }
                }
            };

            let ok = result.is_ok();
            results.push(BulkEntryOutcome { index, result });
            if !ok {
                failed = true;
                if stop_on_first_error {
                    break;
                }
            }
        }

        if transactional && failed {
            // Revert the staged change log in reverse order.
            for op in undo.into_iter().rev() {
                match op {
                    UndoOp::Detach(id) => {
                        let _ = self.graph.detach_permission(id);
                    }
                    UndoOp::Restore(permission) => {
                        if let Err(e) = self.graph.attach_hydrated(permission) {
                            tracing::error!(error = %e, "bulk rollback failed to restore permission");
                        }
                    }
                }
            }
            ops.clear();
        }

        (CommandOutcome::Bulk(results), ops)
    }

    fn list_entities(
        &self,
        kind: EntityKind,
        page: u32,
        page_size: u32,
    ) -> Result<CommandOutcome, DomainError> {
        if page_size == 0 || page_size > 1_000 {
            return Err(DomainError::InvalidArgument(
                "page_size must be between 1 and 1000".to_owned(),
            ));
        }
        let partition = self.graph.views().partition(kind);
        let total = partition.len() as u64;
        let skip = page as usize * page_size as usize;
        let entities = partition
            .iter()
            .skip(skip)
            .take(page_size as usize)
            .filter_map(|id| self.graph.entity(*id).cloned())
            .collect();
        Ok(CommandOutcome::EntityPage(EntityPage {
            entities,
            page,
            page_size,
            total,
        }))
    }

    fn apply(
        &mut self,
        command: Command,
    ) -> Result<(CommandOutcome, Vec<PersistOp>), DomainError> {
        match command {
            Command::CreateUser { name } => self.create_with_parent(EntityKind::User, &name, None),
            Command::CreateGroup {
                name,
                parent_group_id,
            } => self.create_with_parent(
                EntityKind::Group,
                &name,
                parent_group_id.map(|id| (id, EntityKind::Group)),
            ),
            Command::CreateRole { name, group_id } => self.create_with_parent(
                EntityKind::Role,
                &name,
                group_id.map(|id| (id, EntityKind::Group)),
            ),
            Command::UpdateEntityName { entity_id, name } => {
                self.graph.update_name(entity_id, &name)?;
                let row = self.entity_row(entity_id)?;
                Ok((CommandOutcome::Unit, vec![PersistOp::UpsertEntity(row)]))
            }
            Command::DeleteEntity { entity_id } => {
                let report = self.graph.remove_entity(entity_id)?;
                let mut ops = Vec::with_capacity(report.edges.len() + report.permissions.len() + 1);
                for (parent_id, child_id) in report.edges {
                    ops.push(PersistOp::DeleteEdge {
                        parent_id,
                        child_id,
                    });
                }
                for permission in report.permissions {
                    ops.push(PersistOp::DeletePermission(permission.id));
                }
                ops.push(PersistOp::DeleteEntity(entity_id));
                Ok((CommandOutcome::Unit, ops))
            }
            Command::AddUserToGroup { user_id, group_id } => {
                self.link_edge(group_id, EntityKind::Group, user_id, EntityKind::User)
            }
            Command::RemoveUserFromGroup { user_id, group_id } => {
                self.unlink_edge(group_id, EntityKind::Group, user_id, EntityKind::User)
            }
            Command::AddGroupToGroup {
                child_id,
                parent_id,
            } => self.link_edge(parent_id, EntityKind::Group, child_id, EntityKind::Group),
            Command::RemoveGroupFromGroup {
                child_id,
                parent_id,
            } => self.unlink_edge(parent_id, EntityKind::Group, child_id, EntityKind::Group),
            Command::AssignUserToRole { user_id, role_id } => {
                self.link_edge(role_id, EntityKind::Role, user_id, EntityKind::User)
            }
            Command::UnassignUserFromRole { user_id, role_id } => {
                self.unlink_edge(role_id, EntityKind::Role, user_id, EntityKind::User)
            }
            Command::AddRoleToGroup { role_id, group_id } => {
                self.link_edge(group_id, EntityKind::Group, role_id, EntityKind::Role)
            }
            Command::RemoveRoleFromGroup { role_id, group_id } => {
                self.unlink_edge(group_id, EntityKind::Group, role_id, EntityKind::Role)
            }
            Command::GrantPermission(grant) => self.attach(&grant, Polarity::Grant),
            Command::DenyPermission(grant) => self.attach(&grant, Polarity::Deny),
            Command::RevokePermission { permission_id } => {
                let permission = self.graph.detach_permission(permission_id)?;
                Ok((
                    CommandOutcome::Unit,
                    vec![PersistOp::DeletePermission(permission.id)],
                ))
            }
            Command::BulkPermissionUpdate {
                operations,
                transactional,
                stop_on_first_error,
            } => Ok(self.apply_bulk(&operations, transactional, stop_on_first_error)),

            Command::GetEntity { entity_id } => {
                let entity = self
                    .graph
                    .entity(entity_id)
                    .ok_or_else(|| DomainError::not_found_entity(entity_id))?
                    .clone();
                Ok((CommandOutcome::Entity(entity), vec![]))
            }
            Command::ListEntities {
                kind,
                page,
                page_size,
            } => Ok((self.list_entities(kind, page, page_size)?, vec![])),
            Command::ListEntityPermissions { entity_id } => {
                let entity = self
                    .graph
                    .entity(entity_id)
                    .ok_or_else(|| DomainError::not_found_entity(entity_id))?;
                let permissions = entity
                    .permissions
                    .iter()
                    .filter_map(|pid| self.graph.permission(*pid).cloned())
                    .collect();
                Ok((CommandOutcome::Permissions(permissions), vec![]))
            }
            Command::EvaluatePermission {
                entity_id,
                uri,
                verb,
            } => {
                let evaluation =
                    resolver::evaluate(&self.graph, entity_id, &uri, verb, Utc::now())?;
                Ok((CommandOutcome::Evaluation(evaluation), vec![]))
            }
            Command::GetEffectivePermissions { entity_id } => {
                let effective =
                    resolver::effective_permissions(&self.graph, entity_id, Utc::now())?;
                Ok((CommandOutcome::Effective(effective), vec![]))
            }
            Command::ListResourcePermissions { uri } => {
                let permissions = self
                    .graph
                    .views()
                    .resource(&uri)
                    .map(|record| {
                        record
                            .permission_ids
                            .iter()
                            .filter_map(|pid| self.graph.permission(*pid).cloned())
                            .collect()
                    })
                    .unwrap_or_default();
                Ok((CommandOutcome::Permissions(permissions), vec![]))
            }

            Command::HealthCheck => Ok((CommandOutcome::Health(self.metrics.snapshot()), vec![])),
            Command::Shutdown => Ok((CommandOutcome::Unit, vec![])),
        }
    }
}

//! End-to-end tests of the single-writer loop: channel in, graph
//! mutation, write-behind out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use authz_engine::config::EngineConfig;
use authz_engine::domain::command::{BulkOp, Command, CommandOutcome, PermissionGrant};
use authz_engine::domain::error::DomainError;
use authz_engine::domain::model::{EntityId, EntityKind, Scheme, Verb};
use authz_engine::domain::resolver::Decision;
use authz_engine::engine::channel::SubmitMeta;
use authz_engine::engine::processor::{EngineHandle, spawn};
use authz_engine::domain::graph::TenantGraph;
use authz_engine::hydration;
use authz_engine::persistence::MemoryStore;

struct Harness {
    handle: EngineHandle,
    store: Arc<MemoryStore>,
    join: tokio::task::JoinHandle<TenantGraph>,
}

fn start() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let cfg = EngineConfig {
        persist_backoff_ms: 1,
        ..EngineConfig::default()
    };
    let (handle, join) = spawn(
        TenantGraph::new(),
        Arc::clone(&store),
        &cfg,
        CancellationToken::new(),
        0,
    );
    Harness {
        handle,
        store,
        join,
    }
}

impl Harness {
    async fn submit(&self, command: Command) -> Result<CommandOutcome, DomainError> {
        self.handle.sender.submit(command, SubmitMeta::default()).await
    }

    async fn submit_ok(&self, command: Command) -> CommandOutcome {
        self.submit(command).await.expect("command should succeed")
    }

    async fn create(&self, command: Command) -> EntityId {
        match self.submit_ok(command).await {
            CommandOutcome::EntityId(id) => id,
            other => panic!("expected EntityId outcome, got {other:?}"),
        }
    }

    async fn shutdown(self) -> TenantGraph {
        self.handle.cancel.cancel();
        self.join.await.expect("processor task should not panic")
    }
}

fn grant(entity_id: EntityId, uri: &str, verb: Verb) -> PermissionGrant {
    PermissionGrant {
        entity_id,
        uri: uri.to_owned(),
        verb,
        scheme: Scheme::Explicit,
        expires_at: None,
    }
}

#[tokio::test]
async fn grant_then_evaluate_allows_through_group() {
    let h = start();
    let user = h.create(Command::CreateUser { name: "u".to_owned() }).await;
    let group = h
        .create(Command::CreateGroup {
            name: "g".to_owned(),
            parent_group_id: None,
        })
        .await;
    h.submit_ok(Command::AddUserToGroup { user_id: user, group_id: group })
        .await;
    h.submit_ok(Command::GrantPermission(grant(group, "/api/orders", Verb::Get)))
        .await;

    let outcome = h
        .submit_ok(Command::EvaluatePermission {
            entity_id: user,
            uri: "/api/orders".to_owned(),
            verb: Verb::Get,
        })
        .await;
    let CommandOutcome::Evaluation(eval) = outcome else {
        panic!("expected evaluation outcome");
    };
    assert_eq!(eval.decision, Decision::Allowed);
    assert_eq!(eval.trace.len(), 1);
    assert_eq!(eval.trace[0].entity_id, group);
    assert_eq!(eval.trace[0].distance, 1);

    h.shutdown().await;
}

#[tokio::test]
async fn closer_deny_wins_at_equal_specificity() {
    let h = start();
    let user = h.create(Command::CreateUser { name: "u".to_owned() }).await;
    let group = h
        .create(Command::CreateGroup {
            name: "g".to_owned(),
            parent_group_id: None,
        })
        .await;
    h.submit_ok(Command::AddUserToGroup { user_id: user, group_id: group })
        .await;
    h.submit_ok(Command::GrantPermission(grant(group, "/api/orders", Verb::Get)))
        .await;
    h.submit_ok(Command::DenyPermission(grant(user, "/api/orders", Verb::Get)))
        .await;

    let CommandOutcome::Evaluation(eval) = h
        .submit_ok(Command::EvaluatePermission {
            entity_id: user,
            uri: "/api/orders".to_owned(),
            verb: Verb::Get,
        })
        .await
    else {
        panic!("expected evaluation outcome");
    };
    assert_eq!(eval.decision, Decision::Denied);

    h.shutdown().await;
}

#[tokio::test]
async fn specific_grant_beats_broad_ancestor_deny() {
    let h = start();
    let user = h.create(Command::CreateUser { name: "u".to_owned() }).await;
    let group = h
        .create(Command::CreateGroup {
            name: "g".to_owned(),
            parent_group_id: None,
        })
        .await;
    h.submit_ok(Command::AddUserToGroup { user_id: user, group_id: group })
        .await;
    h.submit_ok(Command::DenyPermission(grant(group, "/api/**", Verb::Get)))
        .await;
    h.submit_ok(Command::GrantPermission(grant(user, "/api/orders", Verb::Get)))
        .await;

    let CommandOutcome::Evaluation(eval) = h
        .submit_ok(Command::EvaluatePermission {
            entity_id: user,
            uri: "/api/orders".to_owned(),
            verb: Verb::Get,
        })
        .await
    else {
        panic!("expected evaluation outcome");
    };
    assert_eq!(eval.decision, Decision::Allowed);

    h.shutdown().await;
}

#[tokio::test]
async fn group_cycle_is_rejected_and_graph_unchanged() {
    let h = start();
    let g1 = h
        .create(Command::CreateGroup { name: "g1".to_owned(), parent_group_id: None })
        .await;
    let g2 = h
        .create(Command::CreateGroup { name: "g2".to_owned(), parent_group_id: None })
        .await;
    let g3 = h
        .create(Command::CreateGroup { name: "g3".to_owned(), parent_group_id: None })
        .await;
    h.submit_ok(Command::AddGroupToGroup { child_id: g2, parent_id: g1 })
        .await;
    h.submit_ok(Command::AddGroupToGroup { child_id: g3, parent_id: g2 })
        .await;

    let err = h
        .submit(Command::AddGroupToGroup { child_id: g1, parent_id: g3 })
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::CyclicHierarchy { .. }));

    let CommandOutcome::Entity(entity) = h.submit_ok(Command::GetEntity { entity_id: g3 }).await
    else {
        panic!("expected entity outcome");
    };
    assert!(entity.children.is_empty());
    assert_eq!(entity.parents.iter().copied().collect::<Vec<_>>(), vec![g2]);

    h.shutdown().await;
}

#[tokio::test]
async fn transactional_bulk_rolls_back_everything() {
    let h = start();
    let group = h
        .create(Command::CreateGroup { name: "g".to_owned(), parent_group_id: None })
        .await;

    let CommandOutcome::Bulk(results) = h
        .submit_ok(Command::BulkPermissionUpdate {
            operations: vec![
                BulkOp::Grant(grant(group, "/api/a", Verb::Get)),
                BulkOp::Grant(grant(group, "/api/b", Verb::Get)),
                BulkOp::Grant(grant(9999, "/api/c", Verb::Get)),
            ],
            transactional: true,
            stop_on_first_error: false,
        })
        .await
    else {
        panic!("expected bulk outcome");
    };

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].index, 0);
    assert!(results[0].result.is_ok());
    assert!(results[1].result.is_ok());
    assert_eq!(results[2].index, 2);
    assert!(matches!(results[2].result, Err(DomainError::NotFound(_))));

    let CommandOutcome::Permissions(perms) = h
        .submit_ok(Command::ListEntityPermissions { entity_id: group })
        .await
    else {
        panic!("expected permissions outcome");
    };
    assert!(perms.is_empty(), "rollback must leave no permissions behind");

    // Nothing of the rolled-back bulk may reach the store either.
    let store = Arc::clone(&h.store);
    h.shutdown().await;
    assert_eq!(store.permission_count(), 0);
}

#[tokio::test]
async fn bulk_stop_on_first_error_short_circuits() {
    let h = start();
    let group = h
        .create(Command::CreateGroup { name: "g".to_owned(), parent_group_id: None })
        .await;

    let CommandOutcome::Bulk(results) = h
        .submit_ok(Command::BulkPermissionUpdate {
            operations: vec![
                BulkOp::Revoke { permission_id: 555 },
                BulkOp::Grant(grant(group, "/api/a", Verb::Get)),
            ],
            transactional: false,
            stop_on_first_error: true,
        })
        .await
    else {
        panic!("expected bulk outcome");
    };
    assert_eq!(results.len(), 1, "second op must not run");
    assert!(results[0].result.is_err());

    h.shutdown().await;
}

#[tokio::test]
async fn mutations_reach_the_store_in_order() {
    let h = start();
    let user = h.create(Command::CreateUser { name: "u".to_owned() }).await;
    let group = h
        .create(Command::CreateGroup { name: "g".to_owned(), parent_group_id: None })
        .await;
    h.submit_ok(Command::AddUserToGroup { user_id: user, group_id: group })
        .await;
    h.submit_ok(Command::GrantPermission(grant(group, "/api/orders", Verb::Get)))
        .await;

    let store = Arc::clone(&h.store);
    assert_eq!(store.entity_count(), 2);
    assert_eq!(store.edge_count(), 1);
    assert_eq!(store.permission_count(), 1);

    let audits = store.audit_records();
    assert_eq!(audits.len(), 4);
    let kinds: Vec<&str> = audits.iter().map(|a| a.command_type.as_str()).collect();
    assert_eq!(
        kinds,
        vec!["create_user", "create_group", "add_user_to_group", "grant_permission"]
    );
    let seqs: Vec<u64> = audits.iter().map(|a| a.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);

    h.shutdown().await;
}

#[tokio::test]
async fn store_state_survives_rehydration() {
    let h = start();
    let user = h.create(Command::CreateUser { name: "u".to_owned() }).await;
    let group = h
        .create(Command::CreateGroup { name: "g".to_owned(), parent_group_id: None })
        .await;
    h.submit_ok(Command::AddUserToGroup { user_id: user, group_id: group })
        .await;
    h.submit_ok(Command::GrantPermission(grant(group, "/api/orders", Verb::Get)))
        .await;

    let store = Arc::clone(&h.store);
    let live = h.shutdown().await;

    let (rehydrated, last_seq) = hydration::hydrate(&store).await.unwrap();
    assert_eq!(last_seq, 4);
    assert_eq!(rehydrated.entities().len(), live.entities().len());
    assert_eq!(rehydrated.permissions().len(), live.permissions().len());
    assert_eq!(rehydrated.next_id(), live.next_id());
    rehydrated.check_invariants().unwrap();
}

#[tokio::test]
async fn expired_deadline_is_cancelled_not_executed() {
    let h = start();
    let meta = SubmitMeta {
        deadline: Some(Instant::now() - Duration::from_millis(10)),
        ..SubmitMeta::default()
    };
    let err = h
        .handle
        .sender
        .submit(Command::CreateUser { name: "ghost".to_owned() }, meta)
        .await
        .unwrap_err();
    assert_eq!(err, DomainError::Cancelled);

    // The command must not have executed.
    let CommandOutcome::EntityPage(page) = h
        .submit_ok(Command::ListEntities {
            kind: EntityKind::User,
            page: 0,
            page_size: 10,
        })
        .await
    else {
        panic!("expected page outcome");
    };
    assert_eq!(page.total, 0);

    h.shutdown().await;
}

#[tokio::test]
async fn shutdown_command_stops_the_loop() {
    let h = start();
    h.submit_ok(Command::Shutdown).await;

    // The loop is gone; later submissions fail with Shutdown.
    let err = h.submit(Command::HealthCheck).await.unwrap_err();
    assert_eq!(err, DomainError::Shutdown);

    h.join.await.unwrap();
}

#[tokio::test]
async fn health_check_reports_progress_and_degradation() {
    let h = start();
    h.create(Command::CreateUser { name: "u".to_owned() }).await;

    let CommandOutcome::Health(health) = h.submit_ok(Command::HealthCheck).await else {
        panic!("expected health outcome");
    };
    assert!(health.healthy);
    assert!(health.commands_processed >= 1);
    assert!(!health.persistence_degraded);

    h.shutdown().await;
}

#[tokio::test]
async fn persistence_failures_degrade_but_do_not_fail_commands() {
    let store = Arc::new(MemoryStore::new());
    let cfg = EngineConfig {
        persist_retries: 0,
        persist_backoff_ms: 1,
        ..EngineConfig::default()
    };
    let (handle, join) = spawn(
        TenantGraph::new(),
        Arc::clone(&store),
        &cfg,
        CancellationToken::new(),
        0,
    );

    store.inject_failures(u32::MAX);
    let outcome = handle
        .sender
        .submit(
            Command::CreateUser { name: "u".to_owned() },
            SubmitMeta::default(),
        )
        .await;
    assert!(outcome.is_ok(), "write-behind failure must not fail the command");

    let CommandOutcome::Health(health) = handle
        .sender
        .submit(Command::HealthCheck, SubmitMeta::default())
        .await
        .unwrap()
    else {
        panic!("expected health outcome");
    };
    assert!(health.persistence_degraded);

    handle.cancel.cancel();
    join.await.unwrap();
}

#[tokio::test]
async fn grant_revoke_roundtrip_clears_every_view() {
    let h = start();
    let group = h
        .create(Command::CreateGroup { name: "g".to_owned(), parent_group_id: None })
        .await;
    let CommandOutcome::Permission(permission) = h
        .submit_ok(Command::GrantPermission(grant(group, "/api/orders", Verb::Get)))
        .await
    else {
        panic!("expected permission outcome");
    };

    h.submit_ok(Command::RevokePermission { permission_id: permission.id })
        .await;

    let CommandOutcome::Permissions(by_resource) = h
        .submit_ok(Command::ListResourcePermissions { uri: "/api/orders".to_owned() })
        .await
    else {
        panic!("expected permissions outcome");
    };
    assert!(by_resource.is_empty());

    let store = Arc::clone(&h.store);
    let graph = h.shutdown().await;
    assert!(graph.permission(permission.id).is_none());
    assert_eq!(store.permission_count(), 0);
}

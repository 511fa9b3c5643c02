//! SQLite implementation of the tenant store contract.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};

use super::{
    AuditRecord, ChangeRecord, EntityRow, PermissionRow, PersistOp, Snapshot, StoreError,
    TenantStore,
};
use crate::domain::model::{EntityKind, Polarity, Scheme, Verb};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS entities (
        id INTEGER PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE TABLE IF NOT EXISTS edges (
        parent_id INTEGER NOT NULL,
        child_id INTEGER NOT NULL,
        PRIMARY KEY (parent_id, child_id)
    )",
    "CREATE TABLE IF NOT EXISTS permissions (
        id INTEGER PRIMARY KEY,
        entity_id INTEGER NOT NULL,
        uri TEXT NOT NULL,
        verb TEXT NOT NULL,
        polarity TEXT NOT NULL,
        scheme TEXT NOT NULL,
        expires_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS audit_log (
        seq INTEGER PRIMARY KEY,
        ts TEXT NOT NULL,
        actor TEXT,
        command_type TEXT NOT NULL,
        payload BLOB NOT NULL,
        result_kind TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS applied_changes (change_id INTEGER PRIMARY KEY)",
];

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

fn to_db_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::Corrupt(format!("id {id} out of range")))
}

fn from_db_id(id: i64) -> Result<u64, StoreError> {
    u64::try_from(id).map_err(|_| StoreError::Corrupt(format!("negative id {id}")))
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

/// A single-file SQLite store for one tenant.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the store at `dsn`, which may be a
    /// `sqlite:` DSN or a bare file path.
    ///
    /// # Errors
    /// `Unavailable` when the database cannot be opened or the schema
    /// cannot be created.
    pub async fn open(dsn: &str) -> Result<Self, StoreError> {
        let options = if dsn.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(dsn)?
        } else {
            SqliteConnectOptions::new().filename(dsn)
        }
        .create_if_missing(true);

        // A single connection keeps writes serialized the same way the
        // engine serializes commands.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    fn entity_from_row(row: &SqliteRow) -> Result<EntityRow, StoreError> {
        let id = from_db_id(row.try_get::<i64, _>("id")?)?;
        let kind_raw: String = row.try_get("kind")?;
        let kind = EntityKind::from_str(&kind_raw).map_err(StoreError::Corrupt)?;
        let name: String = row.try_get("name")?;
        let metadata_raw: String = row.try_get("metadata")?;
        let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_raw)
            .map_err(|e| StoreError::Corrupt(format!("bad metadata for entity {id}: {e}")))?;
        Ok(EntityRow {
            id,
            kind,
            name,
            metadata,
        })
    }

    fn permission_from_row(row: &SqliteRow) -> Result<PermissionRow, StoreError> {
        let id = from_db_id(row.try_get::<i64, _>("id")?)?;
        let entity_id = from_db_id(row.try_get::<i64, _>("entity_id")?)?;
        let verb_raw: String = row.try_get("verb")?;
        let polarity_raw: String = row.try_get("polarity")?;
        let scheme_raw: String = row.try_get("scheme")?;
        let expires_raw: Option<String> = row.try_get("expires_at")?;
        Ok(PermissionRow {
            id,
            entity_id,
            uri: row.try_get("uri")?,
            verb: Verb::from_str(&verb_raw).map_err(StoreError::Corrupt)?,
            polarity: Polarity::from_str(&polarity_raw).map_err(StoreError::Corrupt)?,
            scheme: Scheme::from_str(&scheme_raw).map_err(StoreError::Corrupt)?,
            expires_at: expires_raw.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[async_trait]
impl TenantStore for SqliteStore {
    async fn load_snapshot(&self) -> Result<Snapshot, StoreError> {
        let mut snapshot = Snapshot::default();

        let rows = sqlx::query("SELECT id, kind, name, metadata FROM entities ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            snapshot.entities.push(Self::entity_from_row(row)?);
        }

        let rows = sqlx::query("SELECT parent_id, child_id FROM edges ORDER BY parent_id, child_id")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let parent = from_db_id(row.try_get::<i64, _>("parent_id")?)?;
            let child = from_db_id(row.try_get::<i64, _>("child_id")?)?;
            snapshot.edges.push((parent, child));
        }

        let rows = sqlx::query(
            "SELECT id, entity_id, uri, verb, polarity, scheme, expires_at \
             FROM permissions ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            snapshot.permissions.push(Self::permission_from_row(row)?);
        }

        Ok(snapshot)
    }

    async fn last_sequence(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT MAX(seq) AS top FROM (
                 SELECT MAX(change_id) AS seq FROM applied_changes
                 UNION ALL
                 SELECT MAX(seq) AS seq FROM audit_log
             )",
        )
        .fetch_one(&self.pool)
        .await?;
        let top: Option<i64> = row.try_get("top")?;
        top.map_or(Ok(0), from_db_id)
    }

    async fn persist_mutation(&self, record: &ChangeRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query("INSERT OR IGNORE INTO applied_changes (change_id) VALUES (?)")
            .bind(to_db_id(record.change_id)?)
            .execute(&mut *tx)
            .await?;
        if marked.rows_affected() == 0 {
            // Already applied; nothing to do.
            tx.commit().await?;
            return Ok(());
        }

        for op in &record.ops {
            match op {
                PersistOp::UpsertEntity(row) => {
                    let metadata = serde_json::to_string(&row.metadata)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                    sqlx::query(
                        "INSERT INTO entities (id, kind, name, metadata) VALUES (?, ?, ?, ?) \
                         ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, \
                         name = excluded.name, metadata = excluded.metadata",
                    )
                    .bind(to_db_id(row.id)?)
                    .bind(row.kind.as_str())
                    .bind(&row.name)
                    .bind(metadata)
                    .execute(&mut *tx)
                    .await?;
                }
                PersistOp::DeleteEntity(id) => {
                    sqlx::query("DELETE FROM entities WHERE id = ?")
                        .bind(to_db_id(*id)?)
                        .execute(&mut *tx)
                        .await?;
                }
                PersistOp::InsertEdge {
                    parent_id,
                    child_id,
                } => {
                    sqlx::query("INSERT OR IGNORE INTO edges (parent_id, child_id) VALUES (?, ?)")
                        .bind(to_db_id(*parent_id)?)
                        .bind(to_db_id(*child_id)?)
                        .execute(&mut *tx)
                        .await?;
                }
                PersistOp::DeleteEdge {
                    parent_id,
                    child_id,
                } => {
                    sqlx::query("DELETE FROM edges WHERE parent_id = ? AND child_id = ?")
                        .bind(to_db_id(*parent_id)?)
                        .bind(to_db_id(*child_id)?)
                        .execute(&mut *tx)
                        .await?;
                }
                PersistOp::UpsertPermission(row) => {
                    sqlx::query(
                        "INSERT INTO permissions \
                         (id, entity_id, uri, verb, polarity, scheme, expires_at) \
                         VALUES (?, ?, ?, ?, ?, ?, ?) \
                         ON CONFLICT(id) DO UPDATE SET entity_id = excluded.entity_id, \
                         uri = excluded.uri, verb = excluded.verb, \
                         polarity = excluded.polarity, scheme = excluded.scheme, \
                         expires_at = excluded.expires_at",
                    )
                    .bind(to_db_id(row.id)?)
                    .bind(to_db_id(row.entity_id)?)
                    .bind(&row.uri)
                    .bind(row.verb.as_str())
                    .bind(row.polarity.as_str())
                    .bind(row.scheme.as_str())
                    .bind(row.expires_at.map(|t| t.to_rfc3339()))
                    .execute(&mut *tx)
                    .await?;
                }
                PersistOp::DeletePermission(id) => {
                    sqlx::query("DELETE FROM permissions WHERE id = ?")
                        .bind(to_db_id(*id)?)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_log (seq, ts, actor, command_type, payload, result_kind) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(to_db_id(record.seq)?)
        .bind(record.ts.to_rfc3339())
        .bind(record.actor.as_deref())
        .bind(&record.command_type)
        .bind(&record.payload)
        .bind(&record.result_kind)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenant.db");
        let store = SqliteStore::open(path.to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    fn entity_row(id: u64, kind: EntityKind, name: &str) -> EntityRow {
        EntityRow {
            id,
            kind,
            name: name.to_owned(),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn schema_roundtrip() {
        let (_dir, store) = temp_store().await;
        store
            .persist_mutation(&ChangeRecord {
                change_id: 1,
                ops: vec![
                    PersistOp::UpsertEntity(entity_row(1, EntityKind::User, "alice")),
                    PersistOp::UpsertEntity(entity_row(2, EntityKind::Group, "staff")),
                    PersistOp::InsertEdge {
                        parent_id: 2,
                        child_id: 1,
                    },
                    PersistOp::UpsertPermission(PermissionRow {
                        id: 3,
                        entity_id: 2,
                        uri: "/api/orders".to_owned(),
                        verb: Verb::Get,
                        polarity: Polarity::Grant,
                        scheme: Scheme::Explicit,
                        expires_at: None,
                    }),
                ],
            })
            .await
            .unwrap();

        let snapshot = store.load_snapshot().await.unwrap();
        assert_eq!(snapshot.entities.len(), 2);
        assert_eq!(snapshot.edges, vec![(2, 1)]);
        assert_eq!(snapshot.permissions.len(), 1);
        assert_eq!(snapshot.permissions[0].uri, "/api/orders");
    }

    #[tokio::test]
    async fn replayed_change_is_ignored() {
        let (_dir, store) = temp_store().await;
        let record = ChangeRecord {
            change_id: 5,
            ops: vec![PersistOp::UpsertEntity(entity_row(
                1,
                EntityKind::User,
                "alice",
            ))],
        };
        store.persist_mutation(&record).await.unwrap();
        store
            .persist_mutation(&ChangeRecord {
                change_id: 6,
                ops: vec![PersistOp::DeleteEntity(1)],
            })
            .await
            .unwrap();
        store.persist_mutation(&record).await.unwrap();

        let snapshot = store.load_snapshot().await.unwrap();
        assert!(snapshot.entities.is_empty());
    }

    #[tokio::test]
    async fn expiry_survives_roundtrip() {
        let (_dir, store) = temp_store().await;
        let expires = Utc::now() + chrono::Duration::hours(1);
        store
            .persist_mutation(&ChangeRecord {
                change_id: 1,
                ops: vec![
                    PersistOp::UpsertEntity(entity_row(1, EntityKind::Group, "staff")),
                    PersistOp::UpsertPermission(PermissionRow {
                        id: 2,
                        entity_id: 1,
                        uri: "/api/**".to_owned(),
                        verb: Verb::Any,
                        polarity: Polarity::Deny,
                        scheme: Scheme::Explicit,
                        expires_at: Some(expires),
                    }),
                ],
            })
            .await
            .unwrap();

        let snapshot = store.load_snapshot().await.unwrap();
        let loaded = snapshot.permissions[0].expires_at.unwrap();
        assert_eq!(loaded.timestamp(), expires.timestamp());
    }

    #[tokio::test]
    async fn audit_appends_in_order() {
        let (_dir, store) = temp_store().await;
        for seq in 1..=3u64 {
            store
                .append_audit(&AuditRecord {
                    seq,
                    ts: Utc::now(),
                    actor: None,
                    command_type: "create_user".to_owned(),
                    payload: vec![1, 2, 3],
                    result_kind: "ok".to_owned(),
                })
                .await
                .unwrap();
        }
        // Duplicate seq violates the primary key.
        let dup = store
            .append_audit(&AuditRecord {
                seq: 2,
                ts: Utc::now(),
                actor: None,
                command_type: "create_user".to_owned(),
                payload: vec![],
                result_kind: "ok".to_owned(),
            })
            .await;
        assert!(dup.is_err());
    }
}

//! Durable entity store backed by SQLite.
//!
//! # Responsibility
//! - Own the single connection to the database file and serialize access to it.
//! - Provide fetch-by-storage-name-and-predicate and existence primitives.
//! - Apply a context's pending changes in one atomic transaction.
//! - Broadcast a [`ChangeSet`] to observers after every successful commit.
//!
//! # Invariants
//! - Every commit runs inside one `IMMEDIATE` transaction; a failure rolls
//!   back all of it.
//! - Updates only apply when the stored row version equals the expected one.
//! - Observers run after the connection and observer locks are released.
//!
//! Contexts are the only writers; callers never hand rows to the store directly.

mod change_set;

pub use change_set::{ChangeSet, ChangedEntity};

use crate::config::{StoreConfig, StoreLocation};
use crate::context::PersistentContext;
use crate::db::migrations::{current_user_version, latest_version};
use crate::db::{open_with_config, DbError};
use crate::model::entity::{ContextId, EntityId, EntityRecord};
use crate::predicate::Predicate;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

type CommitObserver = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

/// Errors surfaced by the store, contexts and repositories.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Required table is missing.
    MissingRequiredTable(&'static str),
    /// Required column is missing from expected table.
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    /// Row changed or vanished since this context last saw it.
    Conflict { id: EntityId },
    /// Instance belongs to another context.
    ForeignInstance {
        id: EntityId,
        owner: ContextId,
        context: ContextId,
    },
    /// Instance is staged for deletion in this context.
    DeletedInstance(EntityId),
    /// Instance fields were changed after insert or save without being saved again.
    UnsavedChanges(EntityId),
    /// Persisted data cannot be converted into the requested entity type.
    InvalidData(String),
    Serialization(serde_json::Error),
    /// A thread panicked while holding the connection lock.
    LockPoisoned,
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "store requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => write!(f, "store requires table `{table}`"),
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "store requires column `{column}` in table `{table}`"
            ),
            Self::Conflict { id } => {
                write!(f, "entity {id} was changed or removed by another commit")
            }
            Self::ForeignInstance { id, owner, context } => write!(
                f,
                "entity {id} belongs to {owner} and cannot be written through {context}"
            ),
            Self::DeletedInstance(id) => write!(f, "entity {id} is pending deletion"),
            Self::UnsavedChanges(id) => {
                write!(f, "entity {id} has field changes that were never saved")
            }
            Self::InvalidData(message) => write!(f, "invalid entity data: {message}"),
            Self::Serialization(err) => write!(f, "entity serialization failed: {err}"),
            Self::LockPoisoned => write!(f, "store connection lock is poisoned"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Pending writes of one context, borrowed for the duration of a commit.
pub(crate) struct PendingChanges<'a> {
    pub origin: ContextId,
    pub inserts: Vec<&'a EntityRecord>,
    /// Record plus the row version the context expects to overwrite.
    pub updates: Vec<(&'a EntityRecord, i64)>,
    pub deletes: Vec<(EntityId, &'a str)>,
}

/// File-backed (or in-memory) entity store shared by many contexts.
pub struct Store {
    conn: Mutex<Connection>,
    location: StoreLocation,
    sequence: AtomicU64,
    next_context: AtomicU64,
    observers: RwLock<Vec<CommitObserver>>,
}

impl Store {
    /// Opens (creating if needed) and migrates the store described by `config`.
    pub fn open(config: &StoreConfig) -> StoreResult<Arc<Self>> {
        let conn = open_with_config(config)?;
        Self::from_connection(conn, config.location.clone())
    }

    pub fn open_in_memory() -> StoreResult<Arc<Self>> {
        Self::open(&StoreConfig::in_memory())
    }

    /// Wraps an already migrated connection.
    ///
    /// # Errors
    /// - Rejects connections whose schema version or tables do not match.
    pub fn from_connection(conn: Connection, location: StoreLocation) -> StoreResult<Arc<Self>> {
        ensure_store_connection_ready(&conn)?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            location,
            sequence: AtomicU64::new(0),
            next_context: AtomicU64::new(1),
            observers: RwLock::new(Vec::new()),
        }))
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Sequence number of the most recent successful commit, `0` if none.
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Creates a new, empty persistent context bound to this store.
    pub fn new_context(self: &Arc<Self>) -> PersistentContext {
        PersistentContext::new(Arc::clone(self))
    }

    /// Registers a callback invoked with every successful commit's change set.
    ///
    /// Observers run on the committing thread with no store lock held, so they may
    /// commit other contexts or register further observers.
    pub fn on_commit(&self, observer: impl Fn(&ChangeSet) + Send + Sync + 'static) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    /// Returns every committed record in `storage_name` matching `predicate`.
    pub fn fetch(
        &self,
        storage_name: &str,
        predicate: Option<&Predicate>,
    ) -> StoreResult<Vec<EntityRecord>> {
        let mut records = Vec::new();
        self.scan(storage_name, predicate, |record| {
            records.push(record);
            ControlFlow::Continue(())
        })?;
        Ok(records)
    }

    /// Returns whether any committed record matches; stops at the first match.
    pub fn exists(&self, storage_name: &str, predicate: Option<&Predicate>) -> StoreResult<bool> {
        let mut found = false;
        self.scan(storage_name, predicate, |_| {
            found = true;
            ControlFlow::Break(())
        })?;
        Ok(found)
    }

    /// Committed row counts per storage name, sorted by name.
    pub fn collection_counts(&self) -> StoreResult<Vec<(String, u64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT entity_name, COUNT(*)
             FROM entities
             GROUP BY entity_name
             ORDER BY entity_name ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next()? {
            counts.push((row.get(0)?, row.get::<_, i64>(1)?.max(0) as u64));
        }
        Ok(counts)
    }

    pub(crate) fn allocate_context_id(&self) -> ContextId {
        ContextId(self.next_context.fetch_add(1, Ordering::SeqCst))
    }

    /// Streams committed records of `storage_name` matching `predicate` in
    /// insertion order until `visit` breaks.
    ///
    /// `visit` runs under the connection lock and must not call back into the store.
    pub(crate) fn scan(
        &self,
        storage_name: &str,
        predicate: Option<&Predicate>,
        mut visit: impl FnMut(EntityRecord) -> ControlFlow<()>,
    ) -> StoreResult<()> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, entity_name, version, fields
             FROM entities
             WHERE entity_name = ?1
             ORDER BY rowid ASC;",
        )?;
        let mut rows = stmt.query([storage_name])?;
        while let Some(row) = rows.next()? {
            let record = parse_entity_row(row)?;
            if predicate.map_or(true, |predicate| predicate.evaluate(&record.fields))
                && visit(record).is_break()
            {
                break;
            }
        }
        Ok(())
    }

    /// Applies `changes` atomically and broadcasts the resulting change set.
    pub(crate) fn commit(&self, changes: &PendingChanges<'_>) -> StoreResult<ChangeSet> {
        let mut change_set = ChangeSet {
            origin: Some(changes.origin),
            ..ChangeSet::default()
        };

        {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            for record in &changes.inserts {
                tx.execute(
                    "INSERT INTO entities (id, entity_name, fields, version)
                     VALUES (?1, ?2, ?3, 1);",
                    params![
                        record.id.to_string(),
                        record.storage_name.as_str(),
                        serde_json::to_string(&record.fields)?,
                    ],
                )?;
                change_set.inserted.push(ChangedEntity {
                    id: record.id,
                    storage_name: record.storage_name.clone(),
                    version: 1,
                });
            }

            for (record, expected_version) in &changes.updates {
                let changed = tx.execute(
                    "UPDATE entities
                     SET
                        fields = ?1,
                        version = version + 1,
                        updated_at = (strftime('%s', 'now') * 1000)
                     WHERE id = ?2
                       AND entity_name = ?3
                       AND version = ?4;",
                    params![
                        serde_json::to_string(&record.fields)?,
                        record.id.to_string(),
                        record.storage_name.as_str(),
                        expected_version,
                    ],
                )?;
                if changed == 0 {
                    return Err(StoreError::Conflict { id: record.id });
                }
                change_set.updated.push(ChangedEntity {
                    id: record.id,
                    storage_name: record.storage_name.clone(),
                    version: expected_version + 1,
                });
            }

            for (id, storage_name) in &changes.deletes {
                let changed = tx.execute(
                    "DELETE FROM entities WHERE id = ?1 AND entity_name = ?2;",
                    params![id.to_string(), storage_name],
                )?;
                // Already gone: deletion is idempotent.
                if changed > 0 {
                    change_set.deleted.push(ChangedEntity {
                        id: *id,
                        storage_name: storage_name.to_string(),
                        version: 0,
                    });
                }
            }

            tx.commit()?;
            change_set.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        }

        self.notify(&change_set);
        Ok(change_set)
    }

    fn notify(&self, change_set: &ChangeSet) {
        let observers: Vec<CommitObserver> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            observer(change_set);
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

fn parse_entity_row(row: &Row<'_>) -> StoreResult<EntityRecord> {
    let id_text: String = row.get("id")?;
    let id = Uuid::parse_str(&id_text).map_err(|_| {
        StoreError::InvalidData(format!("invalid uuid value `{id_text}` in entities.id"))
    })?;

    let fields_text: String = row.get("fields")?;
    let fields: serde_json::Value = serde_json::from_str(&fields_text).map_err(|err| {
        StoreError::InvalidData(format!("invalid json in entities.fields for {id}: {err}"))
    })?;
    if !fields.is_object() {
        return Err(StoreError::InvalidData(format!(
            "entities.fields for {id} is not a json object"
        )));
    }

    Ok(EntityRecord {
        id,
        storage_name: row.get("entity_name")?,
        version: row.get("version")?,
        fields,
    })
}

fn ensure_store_connection_ready(conn: &Connection) -> StoreResult<()> {
    let expected_version = latest_version();
    let actual_version = current_user_version(conn)?;
    if actual_version != expected_version {
        return Err(StoreError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    if !table_exists(conn, "entities")? {
        return Err(StoreError::MissingRequiredTable("entities"));
    }

    for column in [
        "id",
        "entity_name",
        "fields",
        "version",
        "created_at",
        "updated_at",
    ] {
        if !table_has_column(conn, "entities", column)? {
            return Err(StoreError::MissingRequiredColumn {
                table: "entities",
                column,
            });
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> StoreResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(1)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}

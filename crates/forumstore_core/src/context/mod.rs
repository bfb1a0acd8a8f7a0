//! Persistent contexts: units of work over a shared store.
//!
//! # Responsibility
//! - Track pending inserts, modifications and deletions until commit.
//! - Merge pending state into reads so a context sees its own changes.
//! - Hand pending state to the store as one atomic commit.
//!
//! # Invariants
//! - A failed commit leaves every pending set untouched.
//! - Commit refuses to run while a watched instance has unsaved field changes.
//! - `discard` never touches the store.
//! - Pending state never leaks to other contexts before a successful commit.
//! - A context is single-writer; concurrency comes from using many contexts.

mod fetch;

pub use fetch::{FetchRequest, SortDescriptor};

use crate::model::entity::{ContextId, EntityDescriptor, EntityId, EntityRecord};
use crate::store::{ChangeSet, PendingChanges, Store, StoreError, StoreResult};
use log::{debug, error, info};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
struct Staged {
    seq: u64,
    record: EntityRecord,
}

/// Unit-of-work boundary scoping pending entity mutations.
pub struct PersistentContext {
    id: ContextId,
    store: Arc<Store>,
    inserted: HashMap<EntityId, Staged>,
    /// Staged updates; `record.version` holds the version expected in the store.
    updated: HashMap<EntityId, Staged>,
    deleted: HashMap<EntityId, String>,
    /// Last committed version this context knows for each entity it wrote or merged.
    known_versions: HashMap<EntityId, i64>,
    /// Unsaved-change marks of instances handed out by inserts and saves.
    watched: HashMap<EntityId, Arc<AtomicBool>>,
    next_seq: u64,
}

impl PersistentContext {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            id: store.allocate_context_id(),
            store,
            inserted: HashMap::new(),
            updated: HashMap::new(),
            deleted: HashMap::new(),
            known_versions: HashMap::new(),
            watched: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn has_changes(&self) -> bool {
        !(self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty())
    }

    /// Number of pending `(inserts, updates, deletes)`.
    pub fn pending_counts(&self) -> (usize, usize, usize) {
        (self.inserted.len(), self.updated.len(), self.deleted.len())
    }

    pub fn is_pending_delete(&self, id: EntityId) -> bool {
        self.deleted.contains_key(&id)
    }

    /// Allocates a new entity of `descriptor`'s collection and stages its insert.
    ///
    /// The returned record has a fresh identity and empty fields.
    pub fn insert(&mut self, descriptor: &EntityDescriptor) -> &mut EntityRecord {
        let record = EntityRecord::blank(descriptor);
        let seq = self.bump_seq();
        &mut self
            .inserted
            .entry(record.id)
            .or_insert(Staged { seq, record })
            .record
    }

    /// Stages new field values for an entity.
    ///
    /// # Errors
    /// - `DeletedInstance` when the entity is staged for deletion here.
    /// - `InvalidData` when the entity was never committed and is not a pending insert.
    pub fn update(&mut self, record: EntityRecord) -> StoreResult<()> {
        if self.deleted.contains_key(&record.id) {
            return Err(StoreError::DeletedInstance(record.id));
        }
        if let Some(staged) = self.inserted.get_mut(&record.id) {
            staged.record.fields = record.fields;
            return Ok(());
        }

        let known = self.known_versions.get(&record.id).copied();
        if record.is_new() && known.is_none() {
            return Err(StoreError::InvalidData(format!(
                "entity {} is neither committed nor pending insert",
                record.id
            )));
        }

        // A re-fetched record can be newer than what this context last committed or merged.
        let expected_version = known.map_or(record.version, |known| known.max(record.version));
        let seq = match self.updated.get(&record.id) {
            Some(staged) => staged.seq,
            None => self.bump_seq(),
        };
        self.updated.insert(
            record.id,
            Staged {
                seq,
                record: EntityRecord {
                    version: expected_version,
                    ..record
                },
            },
        );
        Ok(())
    }

    /// Tracks the unsaved-change mark of a typed instance written through this context.
    pub(crate) fn watch(&mut self, id: EntityId, unsaved: Arc<AtomicBool>) {
        self.watched.insert(id, unsaved);
    }

    /// Stages deletion of one entity. Deleting a pending insert forgets it.
    pub fn delete(&mut self, id: EntityId, storage_name: &str) {
        self.watched.remove(&id);
        if self.inserted.remove(&id).is_some() {
            return;
        }
        self.updated.remove(&id);
        self.deleted
            .entry(id)
            .or_insert_with(|| storage_name.to_string());
    }

    /// Runs `request` against the store merged with this context's pending changes.
    pub fn execute(&self, request: &FetchRequest) -> StoreResult<Vec<EntityRecord>> {
        let early_limit = if request.is_sorted() {
            None
        } else {
            request.fetch_limit()
        };

        let mut records = Vec::new();
        if early_limit != Some(0) {
            self.store
                .scan(request.storage_name(), request.predicate(), |record| {
                    if self.shadows(record.id) {
                        return ControlFlow::Continue(());
                    }
                    records.push(record);
                    if early_limit.is_some_and(|limit| records.len() >= limit) {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                })?;
        }

        records.extend(self.pending_matches(request).cloned());
        Ok(request.finish(records))
    }

    /// Returns whether `request` matches anything; stops at the first match.
    pub fn exists(&self, request: &FetchRequest) -> StoreResult<bool> {
        if self.pending_matches(request).next().is_some() {
            return Ok(true);
        }

        let mut found = false;
        self.store
            .scan(request.storage_name(), request.predicate(), |record| {
                if self.shadows(record.id) {
                    return ControlFlow::Continue(());
                }
                found = true;
                ControlFlow::Break(())
            })?;
        Ok(found)
    }

    /// Applies every pending change to the store in one transaction.
    ///
    /// # Errors
    /// - `UnsavedChanges` when an inserted or saved instance was edited and not saved again.
    /// - Store failures and version conflicts.
    ///
    /// Pending state is kept on every error, for retry or discard.
    pub fn commit(&mut self) -> StoreResult<ChangeSet> {
        if let Some(id) = self.first_unsaved() {
            error!(
                "event=context_commit module=context status=error context={} error_code=unsaved_changes entity={}",
                self.id, id
            );
            return Err(StoreError::UnsavedChanges(id));
        }

        if !self.has_changes() {
            debug!(
                "event=context_commit module=context status=skipped context={} reason=no_changes",
                self.id
            );
            return Ok(ChangeSet {
                origin: Some(self.id),
                ..ChangeSet::default()
            });
        }

        let started_at = Instant::now();
        let (inserts, updates, deletes) = self.pending_counts();
        let result = {
            let changes = PendingChanges {
                origin: self.id,
                inserts: ordered(&self.inserted),
                updates: ordered(&self.updated)
                    .into_iter()
                    .map(|record| (record, record.version))
                    .collect(),
                deletes: self
                    .deleted
                    .iter()
                    .map(|(id, storage_name)| (*id, storage_name.as_str()))
                    .collect(),
            };
            self.store.commit(&changes)
        };

        match result {
            Ok(change_set) => {
                for change in change_set.inserted.iter().chain(&change_set.updated) {
                    self.known_versions.insert(change.id, change.version);
                }
                for id in self.deleted.keys() {
                    self.known_versions.remove(id);
                }
                self.clear_pending();
                self.watched.retain(|_, unsaved| Arc::strong_count(unsaved) > 1);
                info!(
                    "event=context_commit module=context status=ok context={} sequence={} inserted={} updated={} deleted={} duration_ms={}",
                    self.id,
                    change_set.sequence,
                    inserts,
                    updates,
                    deletes,
                    started_at.elapsed().as_millis()
                );
                Ok(change_set)
            }
            Err(err) => {
                error!(
                    "event=context_commit module=context status=error context={} inserted={} updated={} deleted={} duration_ms={} error={}",
                    self.id,
                    inserts,
                    updates,
                    deletes,
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    /// Drops all pending state without touching the store.
    pub fn discard(&mut self) {
        let (inserts, updates, deletes) = self.pending_counts();
        self.clear_pending();
        self.watched.clear();
        info!(
            "event=context_discard module=context status=ok context={} inserted={} updated={} deleted={}",
            self.id, inserts, updates, deletes
        );
    }

    /// Folds another context's committed changes into this one.
    ///
    /// Known versions are refreshed for rows the other context wrote, so later
    /// saves from here overwrite them instead of conflicting. Pending changes that
    /// target rows the other context deleted are dropped.
    ///
    /// Returns the number of pending changes dropped.
    pub fn merge_changes(&mut self, change_set: &ChangeSet) -> usize {
        if change_set.origin == Some(self.id) {
            return 0;
        }

        for change in change_set.inserted.iter().chain(&change_set.updated) {
            self.known_versions.insert(change.id, change.version);
            if let Some(staged) = self.updated.get_mut(&change.id) {
                staged.record.version = change.version;
            }
        }

        let mut dropped = 0;
        for change in &change_set.deleted {
            self.known_versions.remove(&change.id);
            self.watched.remove(&change.id);
            if self.updated.remove(&change.id).is_some() {
                dropped += 1;
            }
            if self.deleted.remove(&change.id).is_some() {
                dropped += 1;
            }
        }

        debug!(
            "event=context_merge module=context status=ok context={} sequence={} changes={} dropped={}",
            self.id,
            change_set.sequence,
            change_set.len(),
            dropped
        );
        dropped
    }

    fn first_unsaved(&self) -> Option<EntityId> {
        self.watched
            .iter()
            .find(|(_, unsaved)| unsaved.load(AtomicOrdering::Acquire))
            .map(|(id, _)| *id)
    }

    /// Store rows replaced or hidden by pending state.
    fn shadows(&self, id: EntityId) -> bool {
        self.updated.contains_key(&id) || self.deleted.contains_key(&id)
    }

    /// Pending updates then pending inserts accepted by `request`, each in staging order.
    fn pending_matches<'a>(
        &'a self,
        request: &'a FetchRequest,
    ) -> impl Iterator<Item = &'a EntityRecord> + 'a {
        ordered(&self.updated)
            .into_iter()
            .chain(ordered(&self.inserted))
            .filter(move |record| request.accepts(record))
    }

    fn clear_pending(&mut self) {
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

impl Drop for PersistentContext {
    fn drop(&mut self) {
        if self.has_changes() {
            let (inserts, updates, deletes) = self.pending_counts();
            debug!(
                "event=context_drop module=context status=discarded context={} inserted={} updated={} deleted={}",
                self.id, inserts, updates, deletes
            );
        }
    }
}

fn ordered(staged: &HashMap<EntityId, Staged>) -> Vec<&EntityRecord> {
    let mut entries: Vec<&Staged> = staged.values().collect();
    entries.sort_by_key(|entry| entry.seq);
    entries.into_iter().map(|entry| &entry.record).collect()
}

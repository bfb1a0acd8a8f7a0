//! Generic typed repository over persistent contexts.
//!
//! # Responsibility
//! - Provide insert/fetch/exists/delete APIs for one entity type.
//! - Convert between typed `Managed<T>` instances and stored records.
//!
//! # Invariants
//! - Every operation takes its context explicitly; no ambient context exists.
//! - Store errors are returned unchanged, never retried or swallowed.
//! - Writes reject instances that belong to another context.

use crate::context::{FetchRequest, PersistentContext};
use crate::model::entity::{Entity, EntityDescriptor, EntityRecord, Managed};
use crate::predicate::Predicate;
use crate::store::{StoreError, StoreResult};
use log::{info, warn};
use serde_json::Value as JsonValue;
use std::marker::PhantomData;

/// Typed CRUD-over-predicate access to entities of type `T`.
pub struct Repository<T> {
    descriptor: EntityDescriptor,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Repository<T> {
    pub fn new() -> Self {
        Self {
            descriptor: T::descriptor(),
            _marker: PhantomData,
        }
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    /// Starts a fetch request against this repository's collection.
    pub fn request(&self) -> FetchRequest {
        FetchRequest::new(self.descriptor.storage_name())
    }

    /// Inserts a new instance holding `T::default()`.
    ///
    /// Populate the fields and stage them with [`Repository::save`] before commit;
    /// committing with unsaved edits fails with `StoreError::UnsavedChanges`.
    pub fn insert(&self, ctx: &mut PersistentContext) -> Managed<T> {
        let context_id = ctx.id();
        let record = ctx.insert(&self.descriptor);
        let value = T::default();
        match encode_fields(&value) {
            Ok(fields) => record.fields = fields,
            Err(err) => warn!(
                "event=repo_insert module=repo status=degraded entity={} error={}",
                self.descriptor.type_name(),
                err
            ),
        }
        let instance = Managed::new(record.id, record.version, context_id, value);
        ctx.watch(instance.id(), instance.unsaved_flag());
        instance
    }

    /// Inserts a new instance holding `value`.
    pub fn insert_with(&self, ctx: &mut PersistentContext, value: T) -> StoreResult<Managed<T>> {
        let fields = encode_fields(&value)?;
        let context_id = ctx.id();
        let record = ctx.insert(&self.descriptor);
        record.fields = fields;
        let instance = Managed::new(record.id, record.version, context_id, value);
        ctx.watch(instance.id(), instance.unsaved_flag());
        Ok(instance)
    }

    /// Stages the current field values of `instance`.
    ///
    /// Later edits to `instance` must be saved again before the next commit.
    pub fn save(&self, ctx: &mut PersistentContext, instance: &Managed<T>) -> StoreResult<()> {
        self.ensure_owned(ctx, instance)?;
        ctx.update(EntityRecord {
            id: instance.id(),
            storage_name: self.descriptor.storage_name().to_string(),
            version: instance.version(),
            fields: encode_fields(&**instance)?,
        })?;
        instance.mark_saved();
        ctx.watch(instance.id(), instance.unsaved_flag());
        Ok(())
    }

    /// Stages deletion of `instance`.
    pub fn delete(&self, ctx: &mut PersistentContext, instance: &Managed<T>) -> StoreResult<()> {
        self.ensure_owned(ctx, instance)?;
        ctx.delete(instance.id(), self.descriptor.storage_name());
        Ok(())
    }

    /// Fetches every instance reachable from `ctx`, in store-defined order.
    pub fn fetch_all(&self, ctx: &PersistentContext) -> StoreResult<Vec<Managed<T>>> {
        self.execute(ctx, &self.request())
    }

    /// Fetches every instance matching `predicate`; no match yields an empty vector.
    pub fn fetch_all_matching(
        &self,
        ctx: &PersistentContext,
        predicate: &Predicate,
    ) -> StoreResult<Vec<Managed<T>>> {
        self.execute(ctx, &self.request().filter(predicate.clone()))
    }

    /// Returns whether at least one instance matches, without materializing matches.
    pub fn any(&self, ctx: &PersistentContext, predicate: &Predicate) -> StoreResult<bool> {
        ctx.exists(&self.request().filter(predicate.clone()))
    }

    /// Returns one matching instance. Which one is unspecified when several match.
    pub fn fetch_arbitrary(
        &self,
        ctx: &PersistentContext,
        predicate: &Predicate,
    ) -> StoreResult<Option<Managed<T>>> {
        let request = self.request().filter(predicate.clone()).limit(1);
        Ok(self.execute(ctx, &request)?.into_iter().next())
    }

    /// Stages deletion of every matching instance. Does not commit.
    pub fn delete_all(&self, ctx: &mut PersistentContext, predicate: &Predicate) -> StoreResult<()> {
        let request = self.request().filter(predicate.clone());
        let matches = ctx.execute(&request)?;
        for record in &matches {
            ctx.delete(record.id, &record.storage_name);
        }
        info!(
            "event=repo_delete_all module=repo status=ok entity={} context={} staged={}",
            self.descriptor.type_name(),
            ctx.id(),
            matches.len()
        );
        Ok(())
    }

    /// Counts instances reachable from `ctx`, optionally filtered.
    pub fn count(
        &self,
        ctx: &PersistentContext,
        predicate: Option<&Predicate>,
    ) -> StoreResult<usize> {
        let request = match predicate {
            Some(predicate) => self.request().filter(predicate.clone()),
            None => self.request(),
        };
        Ok(ctx.execute(&request)?.len())
    }

    /// Runs an arbitrary request and decodes the results as `T`.
    pub fn execute(
        &self,
        ctx: &PersistentContext,
        request: &FetchRequest,
    ) -> StoreResult<Vec<Managed<T>>> {
        ctx.execute(request)?
            .into_iter()
            .map(|record| self.decode(ctx, record))
            .collect()
    }

    fn decode(&self, ctx: &PersistentContext, record: EntityRecord) -> StoreResult<Managed<T>> {
        let id = record.id;
        let value = serde_json::from_value::<T>(record.fields).map_err(|err| {
            StoreError::InvalidData(format!(
                "cannot decode {} entity {id}: {err}",
                self.descriptor.type_name()
            ))
        })?;
        Ok(Managed::new(id, record.version, ctx.id(), value))
    }

    fn ensure_owned(&self, ctx: &PersistentContext, instance: &Managed<T>) -> StoreResult<()> {
        if instance.context_id() != ctx.id() {
            return Err(StoreError::ForeignInstance {
                id: instance.id(),
                owner: instance.context_id(),
                context: ctx.id(),
            });
        }
        Ok(())
    }
}

impl<T: Entity> Default for Repository<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_fields<T: Entity>(value: &T) -> StoreResult<JsonValue> {
    let fields = serde_json::to_value(value)?;
    if !fields.is_object() {
        return Err(StoreError::InvalidData(format!(
            "{} must serialize to a json object",
            T::TYPE_NAME
        )));
    }
    Ok(fields)
}

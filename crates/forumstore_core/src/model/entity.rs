//! Entity descriptors, stored records and typed managed instances.
//!
//! # Responsibility
//! - Bind each persisted Rust type to exactly one storage-level name.
//! - Define the untyped record shape that contexts and the store exchange.
//! - Wrap decoded records into typed instances owned by one context.
//!
//! # Invariants
//! - `id` is assigned on insertion and never reused for another entity.
//! - `version == 0` means the entity has never been committed.
//! - A `Managed<T>` remembers the context that produced it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::fmt::{Display, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use uuid::Uuid;

/// Stable identity of a stored entity.
pub type EntityId = Uuid;

/// Identifier of one live persistent context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub(crate) u64);

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Static metadata binding an entity type to its storage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityDescriptor {
    type_name: &'static str,
    storage_name: &'static str,
}

impl EntityDescriptor {
    /// Creates a descriptor whose storage name is the type name itself.
    pub const fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            storage_name: type_name,
        }
    }

    /// Overrides the storage-level collection name.
    pub const fn with_storage_name(self, storage_name: &'static str) -> Self {
        Self {
            type_name: self.type_name,
            storage_name,
        }
    }

    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub const fn storage_name(&self) -> &'static str {
        self.storage_name
    }
}

/// A persistable record type.
///
/// Implementors are plain serde structs that serialize to a JSON object; each
/// top-level field becomes addressable by predicates.
///
/// ```
/// use forumstore_core::{Entity, EntityDescriptor};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct Thread {
///     thread_id: String,
///     title: String,
/// }
///
/// impl Entity for Thread {
///     const TYPE_NAME: &'static str = "Thread";
///
///     fn descriptor() -> EntityDescriptor {
///         EntityDescriptor::new(Self::TYPE_NAME).with_storage_name("threads")
///     }
/// }
///
/// assert_eq!(forumstore_core::name_for::<Thread>(), "threads");
/// ```
pub trait Entity: Serialize + DeserializeOwned + Default {
    /// Semantic type identifier, supplied once per type.
    const TYPE_NAME: &'static str;

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new(Self::TYPE_NAME)
    }
}

/// Resolves the storage collection name for an entity type.
pub fn name_for<T: Entity>() -> &'static str {
    T::descriptor().storage_name()
}

/// Untyped stored form of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: EntityId,
    pub storage_name: String,
    /// Last committed version seen for this row, `0` before first commit.
    pub version: i64,
    /// JSON object holding the entity fields.
    pub fields: JsonValue,
}

impl EntityRecord {
    pub(crate) fn blank(descriptor: &EntityDescriptor) -> Self {
        Self {
            id: Uuid::new_v4(),
            storage_name: descriptor.storage_name().to_string(),
            version: 0,
            fields: JsonValue::Object(Map::new()),
        }
    }

    /// Whether this record has never been committed.
    pub fn is_new(&self) -> bool {
        self.version == 0
    }
}

/// Typed entity instance registered with one persistent context.
///
/// Mutable access marks the instance as changed until the next
/// [`crate::Repository::save`]. Clones share that mark.
#[derive(Debug, Clone)]
pub struct Managed<T> {
    id: EntityId,
    version: i64,
    context_id: ContextId,
    value: T,
    unsaved: Arc<AtomicBool>,
}

impl<T> Managed<T> {
    pub(crate) fn new(id: EntityId, version: i64, context_id: ContextId, value: T) -> Self {
        Self {
            id,
            version,
            context_id,
            value,
            unsaved: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Context this instance was inserted into or fetched from.
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Whether fields were mutably accessed since the instance was created or last saved.
    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved.load(AtomicOrdering::Acquire)
    }

    pub fn into_inner(self) -> T {
        self.value
    }

    pub(crate) fn unsaved_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.unsaved)
    }

    pub(crate) fn mark_saved(&self) {
        self.unsaved.store(false, AtomicOrdering::Release);
    }
}

impl<T: PartialEq> PartialEq for Managed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.version == other.version
            && self.context_id == other.context_id
            && self.value == other.value
    }
}

impl<T> Deref for Managed<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> DerefMut for Managed<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.unsaved.store(true, AtomicOrdering::Release);
        &mut self.value
    }
}

//! Fetch requests: target collection, filter, ordering and limit.

use crate::model::entity::EntityRecord;
use crate::predicate::{KeyPath, Predicate, PredicateResult};
use crate::model::value::Value;
use std::cmp::Ordering;

/// Ordering applied to fetch results by one key path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
    key: KeyPath,
    ascending: bool,
}

impl SortDescriptor {
    pub fn ascending(path: &str) -> PredicateResult<Self> {
        Ok(Self {
            key: KeyPath::parse(path)?,
            ascending: true,
        })
    }

    pub fn descending(path: &str) -> PredicateResult<Self> {
        Ok(Self {
            key: KeyPath::parse(path)?,
            ascending: false,
        })
    }

    fn compare(&self, left: &EntityRecord, right: &EntityRecord) -> Ordering {
        let left = self.key.resolve(&left.fields).unwrap_or(Value::Null);
        let right = self.key.resolve(&right.fields).unwrap_or(Value::Null);
        let ordering = left.sort_cmp(&right);
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

/// Read against one storage collection.
///
/// Without sort descriptors the result order is store-defined.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    storage_name: String,
    predicate: Option<Predicate>,
    sort: Vec<SortDescriptor>,
    limit: Option<usize>,
}

impl FetchRequest {
    pub fn new(storage_name: impl Into<String>) -> Self {
        Self {
            storage_name: storage_name.into(),
            predicate: None,
            sort: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn sort_by(mut self, descriptor: SortDescriptor) -> Self {
        self.sort.push(descriptor);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn storage_name(&self) -> &str {
        &self.storage_name
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    pub fn fetch_limit(&self) -> Option<usize> {
        self.limit
    }

    pub(crate) fn is_sorted(&self) -> bool {
        !self.sort.is_empty()
    }

    /// Whether `record` belongs to this request's collection and passes its filter.
    pub(crate) fn accepts(&self, record: &EntityRecord) -> bool {
        record.storage_name == self.storage_name
            && self
                .predicate
                .as_ref()
                .map_or(true, |predicate| predicate.evaluate(&record.fields))
    }

    pub(crate) fn finish(&self, mut records: Vec<EntityRecord>) -> Vec<EntityRecord> {
        if self.is_sorted() {
            records.sort_by(|left, right| {
                self.sort
                    .iter()
                    .map(|descriptor| descriptor.compare(left, right))
                    .find(|ordering| ordering.is_ne())
                    .unwrap_or(Ordering::Equal)
            });
        }
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
        records
    }
}

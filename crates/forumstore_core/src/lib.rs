//! Core entity store for ForumStore.
//!
//! Typed repositories over a SQLite-backed store, with transactional
//! persistent contexts, predicate filtering and commit change broadcasting.
//!
//! ```
//! use forumstore_core::{predicate, Entity, Repository, Store};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct Thread {
//!     title: String,
//!     replies: i64,
//! }
//!
//! impl Entity for Thread {
//!     const TYPE_NAME: &'static str = "Thread";
//! }
//!
//! let store = Store::open_in_memory()?;
//! let mut ctx = store.new_context();
//! let threads = Repository::<Thread>::new();
//!
//! let mut thread = threads.insert(&mut ctx);
//! thread.title = "welcome".to_string();
//! threads.save(&mut ctx, &thread)?;
//! ctx.commit()?;
//!
//! let quiet = predicate!("replies == %d", 0)?;
//! assert_eq!(threads.fetch_all_matching(&ctx, &quiet)?.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod logging;
pub mod model;
pub mod predicate;
pub mod repo;
pub mod store;

pub use config::{StoreConfig, StoreLocation};
pub use context::{FetchRequest, PersistentContext, SortDescriptor};
pub use db::{DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::entity::{
    name_for, ContextId, Entity, EntityDescriptor, EntityId, EntityRecord, Managed,
};
pub use model::value::{Ordinal, Value};
pub use predicate::{
    Comparison, ComparisonOp, InvalidPredicateError, KeyExpr, KeyPath, Predicate,
    PredicateResult,
};
pub use repo::entity_repo::Repository;
pub use store::{ChangeSet, ChangedEntity, Store, StoreError, StoreResult};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}

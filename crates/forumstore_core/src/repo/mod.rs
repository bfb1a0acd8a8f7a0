//! Repository layer over persistent contexts.
//!
//! # Responsibility
//! - Offer typed, use-case oriented data access for every entity type.
//! - Keep context bookkeeping and store details out of caller code.
//!
//! # Invariants
//! - Repositories hold no context and no lock; callers pass the context in.
//! - "Not found" is an empty vector or `None`, never an error.

pub mod entity_repo;

//! Entity metadata and value model.
//!
//! # Responsibility
//! - Describe how Rust types map onto stored collections.
//! - Define operand values and comparison semantics used by predicates.
//!
//! # Invariants
//! - Every entity is identified by a stable `EntityId`.
//! - Entity payloads are JSON objects; predicates address their fields.

pub mod entity;
pub mod value;

//! Domain model for documented entities and their history.
//!
//! # Responsibility
//! - Define changes, snapshots, live entities and the schemas they follow.
//! - Keep record validation next to the record shapes.
//!
//! # Invariants
//! - Every record is identified by a stable UUID.
//! - Deletion is represented by soft-delete timestamps, never hard delete.

pub mod change;
pub mod entity;
pub mod schema;
pub mod snapshot;
pub mod value;

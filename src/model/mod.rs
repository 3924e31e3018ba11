//! In-memory entity model: fields, relations, entities.

pub mod entity;
pub mod field;
pub mod relation;

pub use entity::{Entity, JunctionSide};
pub use field::{Field, FieldPatch, FieldType};
pub use relation::{ManyReference, Reference, Relation};

/// Bookkeeping columns maintained by the runtime; never diffed.
pub const BOOKKEEPING_FIELDS: &[&str] = &["createdAt", "updatedAt"];

pub fn is_bookkeeping(name: &str) -> bool {
    BOOKKEEPING_FIELDS.contains(&name)
}

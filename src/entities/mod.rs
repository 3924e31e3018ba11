//! Entity Manager: the model side of synchronization.

mod edits;
mod handlers;
mod manager;
mod queries;

pub use manager::EntityManager;

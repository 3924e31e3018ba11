//! Architect Sync: declarative entity definitions kept in sync with a relational schema.
//!
//! The model (entities, fields, relations) is diffed against the live catalog of a
//! PostgreSQL, MySQL or SQLite database; every difference is a reversible action that can
//! be applied to either side and is recorded in an undo/redo log.

pub mod config;
pub mod dialect;
pub mod diff;
pub mod entities;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod history;
pub mod model;
pub mod response;
pub mod routes;
pub mod state;
pub mod store;
pub mod sync;

pub use config::{validate_entities, SyncConfig};
pub use dialect::{connect, ensure_database_exists, Dialect, DialectKind, MysqlDialect, PostgresDialect, SqliteDialect};
pub use diff::{compare, Action, Diff, DiffItem, DiffType};
pub use entities::EntityManager;
pub use error::{AppError, ConfigError};
pub use history::{ActionHandler, ApplyOptions, History, HistoryDocument, Scope};
pub use model::{Entity, Field, FieldPatch, FieldType, Relation};
pub use response::{success_many, success_one_ok};
pub use routes::{common_routes, common_routes_with_ready, sync_routes};
pub use state::AppState;
pub use store::{EntityStore, HistoryStore, JsonDirStore, JsonFileStore, NoopStore};
pub use sync::Synchronizer;

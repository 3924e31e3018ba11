//! Synchronizer: ties the entity model, the live database and the history log together.

use crate::config::SyncConfig;
use crate::dialect::{connect, Dialect};
use crate::diff::{compare, Action, Diff, DiffItem};
use crate::entities::EntityManager;
use crate::error::AppError;
use crate::history::{ApplyOptions, History, Scope};
use crate::store::{JsonDirStore, JsonFileStore};
use std::sync::Arc;

pub struct Synchronizer {
    entities: EntityManager,
    history: History<EntityManager>,
}

impl Synchronizer {
    /// Wires every entity, relation and query handler into `history`.
    pub fn new(entities: EntityManager, mut history: History<EntityManager>) -> Self {
        EntityManager::register_handlers(&mut history);
        EntityManager::register_query_handlers(&mut history);
        Synchronizer { entities, history }
    }

    /// Connect to the configured database and restore the persisted model and log.
    pub async fn open(config: &SyncConfig) -> Result<Self, AppError> {
        let dialect = connect(config).await?;
        let entities = EntityManager::load(Arc::new(JsonDirStore::new(config.entities_dir())))?.with_dialect(dialect);
        let history = History::load(Arc::new(JsonFileStore::new(config.history_path())))?;
        Ok(Synchronizer::new(entities, history))
    }

    pub fn entities(&self) -> &EntityManager {
        &self.entities
    }

    pub fn history(&self) -> &History<EntityManager> {
        &self.history
    }

    pub fn dialect(&self) -> Result<&Arc<dyn Dialect>, AppError> {
        self.entities
            .dialect()
            .ok_or_else(|| AppError::Validation("no database is attached".into()))
    }

    /// Introspect the database and compare it with the model.
    pub async fn diff(&self) -> Result<Diff, AppError> {
        let db = self.dialect()?;
        let catalog = db.introspect().await?;
        compare(db.kind(), self.entities.entities(), &catalog)
    }

    /// Bring the model to the database: every `redo`, model only.
    pub async fn entities_from_database(&mut self, diff: &Diff) -> Result<Vec<Action>, AppError> {
        self.entities_from_database_with(diff, false).await
    }

    /// As [`entities_from_database`](Self::entities_from_database); `record` makes the
    /// whole sync undoable.
    pub async fn entities_from_database_with(&mut self, diff: &Diff, record: bool) -> Result<Vec<Action>, AppError> {
        tracing::info!(items = diff.len(), record, "syncing entities from database");
        let opts = ApplyOptions::scoped(Scope::Model).with_record(record);
        self.history.apply(&mut self.entities, diff.forward(), opts).await
    }

    /// Bring the database to the model: every `undo`, database only.
    pub async fn database_from_entities(&mut self, diff: &Diff) -> Result<Vec<Action>, AppError> {
        self.database_from_entities_with(diff, false).await
    }

    pub async fn database_from_entities_with(&mut self, diff: &Diff, record: bool) -> Result<Vec<Action>, AppError> {
        tracing::info!(items = diff.len(), record, "syncing database from entities");
        let opts = ApplyOptions::scoped(Scope::Database).with_record(record);
        self.history.revert(&mut self.entities, diff.backward(), opts).await
    }

    /// Execute an interactive edit (see the `EntityManager::plan_*` builders) and log it.
    pub async fn edit(&mut self, item: DiffItem, opts: ApplyOptions) -> Result<Action, AppError> {
        self.history.record(&mut self.entities, item, opts).await
    }

    pub async fn undo(&mut self, opts: ApplyOptions) -> Result<Option<Action>, AppError> {
        self.history.undo(&mut self.entities, opts).await
    }

    pub async fn redo(&mut self, opts: ApplyOptions) -> Result<Option<Action>, AppError> {
        self.history.redo(&mut self.entities, opts).await
    }
}

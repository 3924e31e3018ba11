//! Reversible action log: undo/redo stacks plus bulk apply/revert of diff sets.
//!
//! The log knows nothing about entities. Each [`DiffType`] is wired to an
//! [`ActionHandler`] at startup; the handler executes the action against the target
//! (and, depending on [`Scope`], the database).

use crate::diff::{Action, DiffItem, DiffType};
use crate::error::AppError;
use crate::store::HistoryStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Which side an action touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Model,
    Database,
    Both,
}

impl Scope {
    pub fn model(&self) -> bool {
        matches!(self, Scope::Model | Scope::Both)
    }

    pub fn database(&self) -> bool {
        matches!(self, Scope::Database | Scope::Both)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplyOptions {
    pub scope: Scope,
    /// Save the stacks through the history store after the operation.
    pub persist: bool,
    /// Make a bulk apply/revert itself undoable.
    pub record: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        ApplyOptions {
            scope: Scope::Both,
            persist: true,
            record: false,
        }
    }
}

impl ApplyOptions {
    pub fn scoped(scope: Scope) -> Self {
        ApplyOptions {
            scope,
            ..Default::default()
        }
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }
}

/// Executes one action kind against `T`.
#[async_trait]
pub trait ActionHandler<T: Send>: Send + Sync {
    async fn execute(&self, target: &mut T, action: &Action, opts: ApplyOptions) -> Result<(), AppError>;
}

/// Persisted form of the stacks.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryDocument {
    #[serde(default)]
    pub undo: Vec<DiffItem>,
    #[serde(default)]
    pub redo: Vec<DiffItem>,
    /// Set when the log writes the document.
    #[serde(default, rename = "savedAt", skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Undo,
    Redo,
}

impl Direction {
    fn name(&self) -> &'static str {
        match self {
            Direction::Undo => "revert",
            Direction::Redo => "apply",
        }
    }
}

pub struct History<T> {
    undo: Vec<DiffItem>,
    redo: Vec<DiffItem>,
    handlers: HashMap<DiffType, Arc<dyn ActionHandler<T>>>,
    store: Arc<dyn HistoryStore>,
}

impl<T: Send> History<T> {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        History {
            undo: Vec::new(),
            redo: Vec::new(),
            handlers: HashMap::new(),
            store,
        }
    }

    /// Restore both stacks from the store.
    pub fn load(store: Arc<dyn HistoryStore>) -> Result<Self, AppError> {
        let doc = store.load()?;
        tracing::debug!(undo = doc.undo.len(), redo = doc.redo.len(), "history loaded");
        let mut history = History::new(store);
        history.undo = doc.undo;
        history.redo = doc.redo;
        Ok(history)
    }

    pub fn register<H>(&mut self, kind: DiffType, handler: H)
    where
        H: ActionHandler<T> + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
    }

    pub fn is_registered(&self, kind: DiffType) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn undo_stack(&self) -> &[DiffItem] {
        &self.undo
    }

    pub fn redo_stack(&self) -> &[DiffItem] {
        &self.redo
    }

    pub fn document(&self) -> HistoryDocument {
        HistoryDocument {
            undo: self.undo.clone(),
            redo: self.redo.clone(),
            saved_at: None,
        }
    }

    fn persist(&self) -> Result<(), AppError> {
        let doc = HistoryDocument {
            saved_at: Some(Utc::now()),
            ..self.document()
        };
        self.store.save(&doc)
    }

    /// Append an already executed change. A fresh edit invalidates the redo stack.
    pub fn push(&mut self, item: DiffItem) -> Result<(), AppError> {
        self.undo.push(item);
        self.redo.clear();
        self.persist()
    }

    pub fn clear(&mut self) -> Result<(), AppError> {
        self.undo.clear();
        self.redo.clear();
        self.persist()
    }

    async fn execute(&self, target: &mut T, action: &Action, opts: ApplyOptions) -> Result<(), AppError> {
        let handler = self
            .handlers
            .get(&action.kind)
            .cloned()
            .ok_or_else(|| AppError::Validation(format!("no handler registered for {}", action.kind)))?;
        tracing::debug!(kind = %action.kind, table = %action.table, scope = ?opts.scope, "executing action");
        handler.execute(target, action, opts).await
    }

    /// Execute an interactive edit and push it.
    pub async fn record(&mut self, target: &mut T, item: DiffItem, opts: ApplyOptions) -> Result<Action, AppError> {
        self.execute(target, &item.redo, opts).await?;
        let action = item.redo.clone();
        self.undo.push(item);
        self.redo.clear();
        if opts.persist {
            self.persist()?;
        }
        Ok(action)
    }

    /// Move the top item to the other stack and execute its side. The item stays moved
    /// when execution fails.
    async fn step(&mut self, target: &mut T, direction: Direction, opts: ApplyOptions) -> Result<Option<DiffItem>, AppError> {
        let popped = match direction {
            Direction::Undo => self.undo.pop(),
            Direction::Redo => self.redo.pop(),
        };
        let Some(item) = popped else {
            return Ok(None);
        };
        let action = match direction {
            Direction::Undo => {
                self.redo.push(item.clone());
                &item.undo
            }
            Direction::Redo => {
                self.undo.push(item.clone());
                &item.redo
            }
        };
        self.execute(target, action, opts).await?;
        Ok(Some(item))
    }

    /// Undo the latest change. `None` when there is nothing to undo.
    pub async fn undo(&mut self, target: &mut T, opts: ApplyOptions) -> Result<Option<Action>, AppError> {
        let result = self.step(target, Direction::Undo, opts).await;
        if opts.persist {
            self.persist()?;
        }
        Ok(result?.map(|item| item.undo))
    }

    /// Redo the latest undone change. `None` when there is nothing to redo.
    pub async fn redo(&mut self, target: &mut T, opts: ApplyOptions) -> Result<Option<Action>, AppError> {
        let result = self.step(target, Direction::Redo, opts).await;
        if opts.persist {
            self.persist()?;
        }
        Ok(result?.map(|item| item.redo))
    }

    /// Execute the `undo` side of every item, last item first, without touching the
    /// existing stacks.
    pub async fn revert(&mut self, target: &mut T, items: Vec<DiffItem>, opts: ApplyOptions) -> Result<Vec<Action>, AppError> {
        self.bulk(target, items, Direction::Undo, opts).await
    }

    /// Execute the `redo` side of every item in order, without touching the existing stacks.
    pub async fn apply(&mut self, target: &mut T, items: Vec<DiffItem>, opts: ApplyOptions) -> Result<Vec<Action>, AppError> {
        self.bulk(target, items, Direction::Redo, opts).await
    }

    async fn bulk(
        &mut self,
        target: &mut T,
        mut items: Vec<DiffItem>,
        direction: Direction,
        opts: ApplyOptions,
    ) -> Result<Vec<Action>, AppError> {
        let total = items.len();
        tracing::info!(items = total, direction = direction.name(), scope = ?opts.scope, "bulk start");
        let saved_undo = std::mem::take(&mut self.undo);
        let saved_redo = std::mem::take(&mut self.redo);
        match direction {
            Direction::Undo => self.undo = items,
            Direction::Redo => {
                items.reverse();
                self.redo = items;
            }
        }

        let inner = opts.with_persist(false);
        let mut done: Vec<DiffItem> = Vec::new();
        let mut failure = None;
        loop {
            match self.step(target, direction, inner).await {
                Ok(Some(item)) => done.push(item),
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.undo = saved_undo;
        self.redo = saved_redo;
        let executed: Vec<Action> = done
            .iter()
            .map(|item| match direction {
                Direction::Undo => item.undo.clone(),
                Direction::Redo => item.redo.clone(),
            })
            .collect();
        if opts.record && !done.is_empty() {
            for item in done {
                self.undo.push(match direction {
                    Direction::Undo => item.inverted(),
                    Direction::Redo => item,
                });
            }
            self.redo.clear();
        }
        if opts.persist {
            if let Err(e) = self.persist() {
                if failure.is_none() {
                    return Err(e);
                }
                tracing::warn!(error = %e, "history save failed after bulk abort");
            }
        }

        if let Some(e) = failure {
            tracing::warn!(
                executed = executed.len(),
                remaining = total - executed.len(),
                direction = direction.name(),
                error = %e,
                "bulk aborted"
            );
            return Err(e);
        }
        tracing::info!(executed = executed.len(), direction = direction.name(), "bulk done");
        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NoopStore;
    use serde_json::json;
    use std::sync::Mutex;

    /// Toy target: a number and the order in which actions ran.
    #[derive(Default)]
    struct Counter {
        value: i64,
        log: Vec<i64>,
    }

    struct AddHandler;

    #[async_trait]
    impl ActionHandler<Counter> for AddHandler {
        async fn execute(&self, target: &mut Counter, action: &Action, _opts: ApplyOptions) -> Result<(), AppError> {
            let by = action.payload["by"].as_i64().unwrap_or(0);
            if action.payload["fail"].as_bool().unwrap_or(false) {
                return Err(AppError::Validation("refused".into()));
            }
            target.value += by;
            target.log.push(by);
            Ok(())
        }
    }

    fn add(by: i64) -> DiffItem {
        DiffItem::new(
            Action::new(DiffType::AddField, "t", json!({ "by": by })),
            Action::new(DiffType::AddField, "t", json!({ "by": -by })),
        )
    }

    fn failing() -> DiffItem {
        DiffItem::new(
            Action::new(DiffType::AddField, "t", json!({ "fail": true })),
            Action::new(DiffType::AddField, "t", json!({ "fail": true })),
        )
    }

    fn history() -> History<Counter> {
        let mut h = History::new(Arc::new(NoopStore));
        h.register(DiffType::AddField, AddHandler);
        h
    }

    #[derive(Default)]
    struct RecordingStore(Mutex<Vec<HistoryDocument>>);

    impl HistoryStore for RecordingStore {
        fn load(&self) -> Result<HistoryDocument, AppError> {
            Ok(HistoryDocument::default())
        }

        fn save(&self, doc: &HistoryDocument) -> Result<(), AppError> {
            self.0.lock().map_err(|_| AppError::Conflict("poisoned".into()))?.push(doc.clone());
            Ok(())
        }
    }

    /// Loads an empty log and refuses every save.
    struct ReadOnlyStore;

    impl HistoryStore for ReadOnlyStore {
        fn load(&self) -> Result<HistoryDocument, AppError> {
            Ok(HistoryDocument::default())
        }

        fn save(&self, _doc: &HistoryDocument) -> Result<(), AppError> {
            Err(AppError::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only")))
        }
    }

    #[tokio::test]
    async fn undo_redo_symmetry() {
        let mut h = history();
        let mut c = Counter::default();
        for by in [1, 2, 3] {
            h.record(&mut c, add(by), ApplyOptions::default()).await.unwrap();
        }
        assert_eq!(c.value, 6);
        for _ in 0..3 {
            h.undo(&mut c, ApplyOptions::default()).await.unwrap();
        }
        assert_eq!(c.value, 0);
        assert!(h.undo_stack().is_empty());
        assert_eq!(h.redo_stack().len(), 3);
        for _ in 0..3 {
            h.redo(&mut c, ApplyOptions::default()).await.unwrap();
        }
        assert_eq!(c.value, 6);
        assert!(h.redo_stack().is_empty());
        assert_eq!(h.undo_stack().len(), 3);
    }

    #[tokio::test]
    async fn empty_stacks_resolve_to_none() {
        let mut h = history();
        let mut c = Counter::default();
        assert_eq!(h.undo(&mut c, ApplyOptions::default()).await.unwrap(), None);
        assert_eq!(h.redo(&mut c, ApplyOptions::default()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn fresh_edit_clears_redo() {
        let mut h = history();
        let mut c = Counter::default();
        h.record(&mut c, add(1), ApplyOptions::default()).await.unwrap();
        h.undo(&mut c, ApplyOptions::default()).await.unwrap();
        assert_eq!(h.redo_stack().len(), 1);
        h.record(&mut c, add(5), ApplyOptions::default()).await.unwrap();
        assert!(h.redo_stack().is_empty());
    }

    #[tokio::test]
    async fn apply_runs_in_order_and_revert_backwards() {
        let mut h = history();
        let mut c = Counter::default();
        h.record(&mut c, add(100), ApplyOptions::default()).await.unwrap();

        let executed = h.apply(&mut c, vec![add(1), add(2), add(3)], ApplyOptions::default()).await.unwrap();
        assert_eq!(executed.len(), 3);
        assert_eq!(c.log, vec![100, 1, 2, 3]);

        h.revert(&mut c, vec![add(1), add(2), add(3)], ApplyOptions::default()).await.unwrap();
        assert_eq!(c.log, vec![100, 1, 2, 3, -3, -2, -1]);
        // Bulk operations leave the interactive history alone.
        assert_eq!(h.undo_stack(), &[add(100)]);
        assert!(h.redo_stack().is_empty());
    }

    #[tokio::test]
    async fn failed_bulk_aborts_and_restores_stacks() {
        let mut h = history();
        let mut c = Counter::default();
        h.record(&mut c, add(10), ApplyOptions::default()).await.unwrap();
        let err = h
            .apply(&mut c, vec![add(1), failing(), add(3)], ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(c.log, vec![10, 1]);
        assert_eq!(h.undo_stack(), &[add(10)]);
    }

    #[tokio::test]
    async fn aborted_bulk_reports_the_handler_error_over_a_failed_save() {
        let mut h: History<Counter> = History::new(Arc::new(ReadOnlyStore));
        h.register(DiffType::AddField, AddHandler);
        let mut c = Counter::default();
        let err = h
            .apply(&mut c, vec![add(1), failing()], ApplyOptions::default().with_record(true))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(c.log, vec![1]);
        assert_eq!(h.undo_stack(), &[add(1)]);

        let err = h.apply(&mut c, vec![add(2)], ApplyOptions::default()).await.unwrap_err();
        assert!(matches!(err, AppError::Io(_)));
        assert_eq!(c.log, vec![1, 2]);
    }

    #[tokio::test]
    async fn recorded_revert_is_undoable() {
        let mut h = history();
        let mut c = Counter::default();
        h.revert(&mut c, vec![add(4)], ApplyOptions::default().with_record(true))
            .await
            .unwrap();
        assert_eq!(c.value, -4);
        h.undo(&mut c, ApplyOptions::default()).await.unwrap();
        assert_eq!(c.value, 0);
    }

    #[tokio::test]
    async fn failed_undo_still_moves_and_persists() {
        let store = Arc::new(RecordingStore::default());
        let mut h: History<Counter> = History::new(store.clone());
        h.register(DiffType::AddField, AddHandler);
        h.push(failing()).unwrap();
        let mut c = Counter::default();
        assert!(h.undo(&mut c, ApplyOptions::default()).await.is_err());
        assert!(h.undo_stack().is_empty());
        assert_eq!(h.redo_stack().len(), 1);
        let saved = store.0.lock().unwrap();
        assert_eq!(saved.last().map(|d| d.redo.len()), Some(1));
        assert!(saved.iter().all(|d| d.saved_at.is_some()));
    }

    #[tokio::test]
    async fn unregistered_kind_is_rejected() {
        let mut h = history();
        let mut c = Counter::default();
        let item = DiffItem::new(Action::delete_field("t", "x"), Action::delete_field("t", "x"));
        assert!(h.record(&mut c, item, ApplyOptions::default()).await.is_err());
        assert!(h.undo_stack().is_empty());
    }
}

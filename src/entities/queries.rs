//! ADD_QUERY / DELETE_QUERY. Query definitions are opaque to the sync engine and live
//! only in the model.

use super::EntityManager;
use crate::diff::{Action, DiffType, QueryPayload};
use crate::error::AppError;
use crate::history::{ActionHandler, ApplyOptions, History};
use async_trait::async_trait;
use serde::Deserialize;

pub(crate) fn register(history: &mut History<EntityManager>) {
    history.register(DiffType::AddQuery, AddQuery);
    history.register(DiffType::DeleteQuery, DeleteQuery);
}

#[derive(Deserialize)]
struct QueryId {
    id: String,
}

struct AddQuery;

#[async_trait]
impl ActionHandler<EntityManager> for AddQuery {
    async fn execute(&self, m: &mut EntityManager, action: &Action, opts: ApplyOptions) -> Result<(), AppError> {
        if !opts.scope.model() {
            return Ok(());
        }
        let p: QueryPayload = action.payload()?;
        let entity = m.entity_mut(&action.table)?;
        if entity.queries.contains_key(&p.id) {
            return Err(AppError::Conflict(format!("query '{}' already exists on '{}'", p.id, action.table)));
        }
        entity.queries.insert(p.id, p.query);
        m.save(&action.table)
    }
}

struct DeleteQuery;

#[async_trait]
impl ActionHandler<EntityManager> for DeleteQuery {
    async fn execute(&self, m: &mut EntityManager, action: &Action, opts: ApplyOptions) -> Result<(), AppError> {
        if !opts.scope.model() {
            return Ok(());
        }
        let p: QueryId = action.payload()?;
        m.entity_mut(&action.table)?
            .queries
            .remove(&p.id)
            .ok_or_else(|| AppError::not_found("query", format!("{}.{}", action.table, p.id)))?;
        m.save(&action.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffItem;
    use crate::history::Scope;
    use crate::model::Entity;
    use crate::store::NoopStore;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn queries_are_model_only_and_invert() {
        let mut m = EntityManager::new(Arc::new(NoopStore));
        m.insert(Entity::new("users")).unwrap();
        let mut h = History::new(Arc::new(NoopStore));
        EntityManager::register_query_handlers(&mut h);

        let def = json!({ "filter": { "active": true } });
        let item = DiffItem::new(
            Action::add_query("users", "active", def.clone()).unwrap(),
            Action::delete_query("users", "active"),
        );
        // Database scope never touches queries.
        h.record(&mut m, item.clone(), ApplyOptions::scoped(Scope::Database)).await.unwrap();
        assert!(m.entity("users").unwrap().queries.is_empty());

        h.record(&mut m, item, ApplyOptions::scoped(Scope::Model)).await.unwrap();
        assert_eq!(m.entity("users").unwrap().queries.get("active"), Some(&def));
        h.undo(&mut m, ApplyOptions::scoped(Scope::Model)).await.unwrap();
        assert!(m.entity("users").unwrap().queries.is_empty());

        let missing = DiffItem::new(Action::delete_query("users", "nope"), Action::delete_query("users", "nope"));
        let err = h.record(&mut m, missing, ApplyOptions::scoped(Scope::Model)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}

//! Interactive edits: each `plan_*` builds a [`DiffItem`] from the current model whose
//! `undo` exactly reverses its `redo`. Nothing is executed here; pass the item to
//! `History::record`.

use super::EntityManager;
use crate::diff::{Action, DiffItem, RelationPayload};
use crate::error::AppError;
use crate::model::field::validate_identifier;
use crate::model::{Entity, Field, FieldPatch, Relation};
use serde_json::Value;

impl EntityManager {
    pub fn plan_create_entity(&self, entity: Entity) -> Result<DiffItem, AppError> {
        entity.validate()?;
        if self.get(&entity.name).is_some() {
            return Err(AppError::Conflict(format!("entity '{}' already exists", entity.name)));
        }
        Ok(DiffItem::new(
            Action::create_entity(&entity)?,
            Action::delete_entity(&entity.name),
        ))
    }

    pub fn plan_delete_entity(&self, name: &str) -> Result<DiffItem, AppError> {
        let entity = self.entity(name)?;
        Ok(DiffItem::new(Action::delete_entity(name), Action::create_entity(entity)?))
    }

    pub fn plan_rename_entity(&self, from: &str, to: &str) -> Result<DiffItem, AppError> {
        self.entity(from)?;
        validate_identifier("entity", to)?;
        if self.get(to).is_some() {
            return Err(AppError::Conflict(format!("entity '{}' already exists", to)));
        }
        Ok(DiffItem::new(Action::rename_entity(from, to), Action::rename_entity(to, from)))
    }

    pub fn plan_add_field(&self, entity: &str, field: Field, position: Option<usize>) -> Result<DiffItem, AppError> {
        field.validate()?;
        self.entity(entity)?.validate_insert(&field, position)?;
        let name = field.name.clone();
        Ok(DiffItem::new(
            Action::add_field(entity, field, position)?,
            Action::delete_field(entity, name),
        ))
    }

    /// Change `name` into `target`. A primary key flip also pins `required` and `unique`
    /// so the column ends up exactly as described on every engine.
    pub fn plan_change_field(&self, entity: &str, name: &str, target: Field) -> Result<DiffItem, AppError> {
        let owner = self.entity(entity)?;
        let current = owner
            .field(name)
            .ok_or_else(|| AppError::not_found("field", format!("{}.{}", entity, name)))?;
        target.validate()?;
        let mut redo = FieldPatch::between(current, &target);
        let mut undo = FieldPatch::between(&target, current);
        if redo.is_empty() {
            return Err(AppError::Validation(format!("field '{}.{}' is unchanged", entity, name)));
        }
        if redo.primary.is_some() {
            redo.required = Some(target.required);
            undo.required = Some(current.required);
            redo.unique = Some(target.unique);
            undo.unique = Some(current.unique);
        }
        owner.validate_patch(name, &redo)?;
        Ok(DiffItem::new(
            Action::change_field(entity, name, redo)?,
            Action::change_field(entity, &target.name, undo)?,
        ))
    }

    pub fn plan_delete_field(&self, entity: &str, name: &str) -> Result<DiffItem, AppError> {
        let e = self.entity(entity)?;
        let position = e
            .field_index(name)
            .ok_or_else(|| AppError::not_found("field", format!("{}.{}", entity, name)))?;
        if e.belongs_to(name).is_some() {
            return Err(AppError::Validation(format!(
                "field '{}.{}' carries a relation; delete the relation instead",
                entity, name
            )));
        }
        Ok(DiffItem::new(
            Action::delete_field(entity, name),
            Action::add_field(entity, e.fields[position].clone(), Some(position))?,
        ))
    }

    /// `field` is the column for a belongsTo relation; `None` derives it from the referenced field.
    pub fn plan_add_relation(&self, entity: &str, relation: Relation, field: Option<Field>) -> Result<DiffItem, AppError> {
        if self.entity(entity)?.relation(&relation).is_some() {
            return Err(AppError::Conflict(format!(
                "{} relation already exists on '{}'",
                relation.kind(),
                entity
            )));
        }
        Ok(DiffItem::new(
            Action::add_relation(entity, relation.clone(), field, None)?,
            Action::delete_relation(entity, relation)?,
        ))
    }

    pub fn plan_delete_relation(&self, entity: &str, relation: &Relation) -> Result<DiffItem, AppError> {
        let e = self.entity(entity)?;
        let index = e
            .relations
            .iter()
            .position(|r| r.same_key(relation))
            .ok_or_else(|| AppError::not_found(relation.kind(), entity))?;
        let existing = e.relations[index].clone();
        let (field, position) = match existing.local_field() {
            Some(fk) => (e.field(fk).cloned(), e.field_index(fk)),
            None => (None, None),
        };
        Ok(DiffItem::new(
            Action::delete_relation(entity, existing.clone())?,
            Action::restore_relation(
                entity,
                RelationPayload {
                    relation: existing,
                    field,
                    position,
                    index: Some(index),
                },
            )?,
        ))
    }

    pub fn plan_add_query(&self, entity: &str, id: &str, query: Value) -> Result<DiffItem, AppError> {
        if self.entity(entity)?.queries.contains_key(id) {
            return Err(AppError::Conflict(format!("query '{}' already exists on '{}'", id, entity)));
        }
        Ok(DiffItem::new(
            Action::add_query(entity, id, query)?,
            Action::delete_query(entity, id),
        ))
    }

    pub fn plan_delete_query(&self, entity: &str, id: &str) -> Result<DiffItem, AppError> {
        let query = self
            .entity(entity)?
            .queries
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::not_found("query", format!("{}.{}", entity, id)))?;
        Ok(DiffItem::new(
            Action::delete_query(entity, id),
            Action::add_query(entity, id, query)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ApplyOptions, History, Scope};
    use crate::model::FieldType;
    use crate::store::NoopStore;
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (EntityManager, History<EntityManager>) {
        let mut m = EntityManager::new(Arc::new(NoopStore));
        m.insert(
            Entity::new("users")
                .with_field(Field::new("id", FieldType::Number).primary().auto_increment())
                .with_field(Field::new("code", FieldType::Text).required()),
        )
        .unwrap();
        m.insert(Entity::new("teams").with_field(Field::new("id", FieldType::Number).primary().auto_increment()))
            .unwrap();
        let mut h = History::new(Arc::new(NoopStore));
        EntityManager::register_handlers(&mut h);
        EntityManager::register_query_handlers(&mut h);
        (m, h)
    }

    #[tokio::test]
    async fn planned_edits_undo_to_the_starting_model() {
        let (mut m, mut h) = setup();
        let opts = ApplyOptions::scoped(Scope::Model);
        let start = m.entities().clone();

        let item = m.plan_add_field("users", Field::new("nickname", FieldType::Text), Some(1)).unwrap();
        h.record(&mut m, item, opts).await.unwrap();
        let item = m
            .plan_change_field("users", "code", Field::new("handle", FieldType::Text).primary())
            .unwrap();
        h.record(&mut m, item, opts).await.unwrap();
        let item = m
            .plan_add_relation("users", Relation::belongs_to("team_id", "teams", "id"), None)
            .unwrap();
        h.record(&mut m, item, opts).await.unwrap();
        let item = m.plan_add_query("users", "all", json!({})).unwrap();
        h.record(&mut m, item, opts).await.unwrap();
        let item = m.plan_rename_entity("teams", "squads").unwrap();
        h.record(&mut m, item, opts).await.unwrap();

        let users = m.entity("users").unwrap();
        assert_eq!(users.field("team_id").map(|f| f.field_type), Some(FieldType::Number));
        assert!(users.field("handle").unwrap().primary);
        assert_eq!(users.relations[0].target_entity(), "squads");

        while h.undo(&mut m, opts).await.unwrap().is_some() {}
        assert_eq!(m.entities(), &start);
    }

    #[tokio::test]
    async fn deleting_a_relation_restores_field_and_order() {
        let (mut m, mut h) = setup();
        let opts = ApplyOptions::scoped(Scope::Model);
        for fk in ["team_id", "lead_id"] {
            let item = m.plan_add_relation("users", Relation::belongs_to(fk, "teams", "id"), None).unwrap();
            h.record(&mut m, item, opts).await.unwrap();
        }
        let before = m.entities().clone();
        let item = m
            .plan_delete_relation("users", &Relation::belongs_to("team_id", "teams", "id"))
            .unwrap();
        h.record(&mut m, item, opts).await.unwrap();
        assert!(m.entity("users").unwrap().field("team_id").is_none());
        h.undo(&mut m, opts).await.unwrap();
        assert_eq!(m.entities(), &before);
    }

    #[test]
    fn plans_reject_invalid_edits() {
        let (m, _) = setup();
        assert!(matches!(m.plan_rename_entity("users", "teams"), Err(AppError::Conflict(_))));
        assert!(matches!(m.plan_delete_field("users", "nope"), Err(AppError::NotFound(_))));
        assert!(matches!(
            m.plan_change_field("users", "code", Field::new("code", FieldType::Text).required()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn plans_keep_a_single_auto_increment() {
        let (m, _) = setup();
        let seq = Field::new("seq", FieldType::Number).primary().auto_increment();
        assert!(matches!(m.plan_add_field("users", seq.clone(), None), Err(AppError::Validation(_))));
        assert!(matches!(
            m.plan_change_field("users", "code", Field::new("code", FieldType::Number).primary().auto_increment()),
            Err(AppError::Validation(_))
        ));
        assert!(m.plan_add_field("teams", Field::new("name", FieldType::Text), None).is_ok());
        assert_eq!(m.entity("users").unwrap().fields.len(), 2);
    }
}

//! Reversible actions and the structured diff between the entity model and the live catalog.
//!
//! Every [`DiffItem`] pairs a `redo` action with its exact inverse `undo`. Items produced by
//! [`compare`] are oriented so that `redo` brings the model to the catalog and `undo` brings
//! the catalog to the model.

pub mod compare;

pub use compare::compare;

use crate::error::AppError;
use crate::model::{Entity, Field, FieldPatch, Relation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiffType {
    CreateEntity,
    RenameEntity,
    DeleteEntity,
    AddField,
    ChangeField,
    DeleteField,
    AddRelation,
    DeleteRelation,
    AddQuery,
    DeleteQuery,
}

impl DiffType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffType::CreateEntity => "CREATE_ENTITY",
            DiffType::RenameEntity => "RENAME_ENTITY",
            DiffType::DeleteEntity => "DELETE_ENTITY",
            DiffType::AddField => "ADD_FIELD",
            DiffType::ChangeField => "CHANGE_FIELD",
            DiffType::DeleteField => "DELETE_FIELD",
            DiffType::AddRelation => "ADD_RELATION",
            DiffType::DeleteRelation => "DELETE_RELATION",
            DiffType::AddQuery => "ADD_QUERY",
            DiffType::DeleteQuery => "DELETE_QUERY",
        }
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ADD_FIELD payload. `position` is the index in the entity's field list; `None` appends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddFieldPayload {
    pub field: Field,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeFieldPayload {
    pub name: String,
    pub changes: FieldPatch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamePayload {
    pub name: String,
}

/// ADD_RELATION / DELETE_RELATION payload. For belongsTo additions `field` carries the
/// column materialized for the foreign key and `position` its place in the field list;
/// `index` is the relation's place in the relation list (`None` appends).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationPayload {
    pub relation: Relation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub query: Value,
}

/// One structural operation on a single entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: DiffType,
    pub table: String,
    #[serde(default)]
    pub payload: Value,
}

impl Action {
    pub fn new(kind: DiffType, table: impl Into<String>, payload: Value) -> Self {
        Action {
            kind,
            table: table.into(),
            payload,
        }
    }

    pub fn create_entity(entity: &Entity) -> Result<Self, AppError> {
        Ok(Action::new(DiffType::CreateEntity, &entity.name, serde_json::to_value(entity)?))
    }

    pub fn delete_entity(name: impl Into<String>) -> Self {
        Action::new(DiffType::DeleteEntity, name, json!({}))
    }

    pub fn rename_entity(from: impl Into<String>, to: impl Into<String>) -> Self {
        Action::new(DiffType::RenameEntity, from, json!({ "name": to.into() }))
    }

    pub fn add_field(table: impl Into<String>, field: Field, position: Option<usize>) -> Result<Self, AppError> {
        let payload = serde_json::to_value(AddFieldPayload { field, position })?;
        Ok(Action::new(DiffType::AddField, table, payload))
    }

    pub fn change_field(table: impl Into<String>, name: impl Into<String>, changes: FieldPatch) -> Result<Self, AppError> {
        let payload = serde_json::to_value(ChangeFieldPayload {
            name: name.into(),
            changes,
        })?;
        Ok(Action::new(DiffType::ChangeField, table, payload))
    }

    pub fn delete_field(table: impl Into<String>, name: impl Into<String>) -> Self {
        Action::new(DiffType::DeleteField, table, json!({ "name": name.into() }))
    }

    pub fn add_relation(
        table: impl Into<String>,
        relation: Relation,
        field: Option<Field>,
        position: Option<usize>,
    ) -> Result<Self, AppError> {
        Action::restore_relation(
            table,
            RelationPayload {
                relation,
                field,
                position,
                index: None,
            },
        )
    }

    /// ADD_RELATION that puts the relation (and its field) back where it was.
    pub fn restore_relation(table: impl Into<String>, payload: RelationPayload) -> Result<Self, AppError> {
        Ok(Action::new(DiffType::AddRelation, table, serde_json::to_value(payload)?))
    }

    pub fn delete_relation(table: impl Into<String>, relation: Relation) -> Result<Self, AppError> {
        let payload = serde_json::to_value(RelationPayload {
            relation,
            field: None,
            position: None,
            index: None,
        })?;
        Ok(Action::new(DiffType::DeleteRelation, table, payload))
    }

    pub fn add_query(table: impl Into<String>, id: impl Into<String>, query: Value) -> Result<Self, AppError> {
        let payload = serde_json::to_value(QueryPayload { id: id.into(), query })?;
        Ok(Action::new(DiffType::AddQuery, table, payload))
    }

    pub fn delete_query(table: impl Into<String>, id: impl Into<String>) -> Self {
        Action::new(DiffType::DeleteQuery, table, json!({ "id": id.into() }))
    }

    /// Decode the payload into its typed form.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, AppError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            AppError::Validation(format!("{} payload for '{}': {}", self.kind, self.table, e))
        })
    }
}

/// A paired, inverse operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiffItem {
    pub redo: Action,
    pub undo: Action,
}

impl DiffItem {
    pub fn new(redo: Action, undo: Action) -> Self {
        DiffItem { redo, undo }
    }

    /// The same change seen from the other side.
    pub fn inverted(self) -> Self {
        DiffItem {
            redo: self.undo,
            undo: self.redo,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub entities: Vec<DiffItem>,
    pub fields: Vec<DiffItem>,
    pub relations: Vec<DiffItem>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.fields.is_empty() && self.relations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.fields.len() + self.relations.len()
    }

    fn relations_where(&self, redo_kind: DiffType) -> impl Iterator<Item = &DiffItem> {
        self.relations.iter().filter(move |d| d.redo.kind == redo_kind)
    }

    /// Items in `redo` execution order, for `History::apply`: relation removals, fields,
    /// entities, relation additions.
    pub fn forward(&self) -> Vec<DiffItem> {
        self.relations_where(DiffType::DeleteRelation)
            .chain(self.fields.iter())
            .chain(self.entities.iter())
            .chain(self.relations_where(DiffType::AddRelation))
            .cloned()
            .collect()
    }

    /// Items for `History::revert`, which pops from the end. The `undo` sides then run as:
    /// relation removals, fields, entities (drops then creates), relation additions.
    pub fn backward(&self) -> Vec<DiffItem> {
        let mut items: Vec<DiffItem> = self
            .relations_where(DiffType::AddRelation)
            .chain(self.fields.iter())
            .chain(self.entities.iter())
            .chain(self.relations_where(DiffType::DeleteRelation))
            .cloned()
            .collect();
        items.reverse();
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;

    #[test]
    fn diff_type_wire_names() {
        assert_eq!(serde_json::to_value(DiffType::AddField).unwrap(), json!("ADD_FIELD"));
        let t: DiffType = serde_json::from_value(json!("DELETE_RELATION")).unwrap();
        assert_eq!(t, DiffType::DeleteRelation);
        assert_eq!(DiffType::CreateEntity.to_string(), "CREATE_ENTITY");
    }

    #[test]
    fn typed_payloads_decode() {
        let a = Action::add_field("User", Field::new("nickname", FieldType::Text), Some(2)).unwrap();
        let p: AddFieldPayload = a.payload().unwrap();
        assert_eq!(p.position, Some(2));
        assert_eq!(p.field.name, "nickname");

        let bad = Action::new(DiffType::AddField, "User", json!({ "name": "x" }));
        assert!(matches!(bad.payload::<AddFieldPayload>(), Err(AppError::Validation(_))));
    }

    #[test]
    fn backward_runs_relation_removals_first() {
        let rel = Relation::belongs_to("owner_id", "User", "id");
        let added = DiffItem::new(
            Action::add_relation("Post", rel.clone(), None, None).unwrap(),
            Action::delete_relation("Post", rel.clone()).unwrap(),
        );
        let removed = added.clone().inverted();
        let field = DiffItem::new(Action::delete_field("Post", "title"), Action::delete_field("Post", "title"));
        let diff = Diff {
            entities: vec![],
            fields: vec![field.clone()],
            relations: vec![added.clone(), removed.clone()],
        };
        assert_eq!(diff.forward(), vec![removed.clone(), field.clone(), added.clone()]);
        // revert pops from the end: DB removal (undo of an addition) runs first.
        let mut backward = diff.backward();
        assert_eq!(backward.pop(), Some(added));
        assert_eq!(backward.pop(), Some(field));
        assert_eq!(backward.pop(), Some(removed));
    }
}

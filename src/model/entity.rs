//! Entity: one table's structure (ordered fields, relations, queries).

use super::field::{validate_identifier, Field, FieldPatch};
use super::relation::Relation;
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// One side of an inferred junction entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JunctionSide {
    pub entity: String,
    #[serde(rename = "as")]
    pub alias: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    /// Query definitions keyed by id. Opaque to the sync engine.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub queries: BTreeMap<String, Value>,
    /// Present when the entity stands for a junction table between two entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_relation: Option<[JunctionSide; 2]>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Entity {
            name: name.into(),
            fields: Vec::new(),
            relations: Vec::new(),
            queries: BTreeMap::new(),
            is_relation: None,
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn is_junction(&self) -> bool {
        self.is_relation.is_some()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn primary_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.primary)
    }

    pub fn belongs_to(&self, field: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.local_field() == Some(field))
    }

    pub fn relation(&self, relation: &Relation) -> Option<&Relation> {
        self.relations.iter().find(|r| r.same_key(relation))
    }

    /// Structural invariants of a single entity.
    pub fn validate(&self) -> Result<(), AppError> {
        validate_identifier("entity", &self.name)?;
        let mut names = HashSet::new();
        let mut auto_increments = 0;
        for f in &self.fields {
            f.validate()?;
            if !names.insert(f.name.as_str()) {
                return Err(AppError::Validation(format!(
                    "entity '{}': duplicate field '{}'",
                    self.name, f.name
                )));
            }
            if f.auto_increment {
                auto_increments += 1;
            }
        }
        if auto_increments > 1 {
            return Err(AppError::Validation(format!(
                "entity '{}': at most one autoIncrement field",
                self.name
            )));
        }
        for r in &self.relations {
            if let Some(fk) = r.local_field() {
                match self.field(fk) {
                    Some(f) if f.is_relation => {}
                    Some(_) => {
                        return Err(AppError::Validation(format!(
                            "entity '{}': relation field '{}' is not marked isRelation",
                            self.name, fk
                        )))
                    }
                    None => {
                        return Err(AppError::Validation(format!(
                            "entity '{}': relation field '{}' does not exist",
                            self.name, fk
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    /// Fails unless the entity would still be valid with `field` inserted.
    pub(crate) fn validate_insert(&self, field: &Field, position: Option<usize>) -> Result<(), AppError> {
        let mut next = self.clone();
        next.insert_field(field.clone(), position)?;
        next.validate()
    }

    /// Fails unless the entity would still be valid with `patch` applied to `name`.
    pub(crate) fn validate_patch(&self, name: &str, patch: &FieldPatch) -> Result<(), AppError> {
        let mut next = self.clone();
        next.patch_field(name, patch)?;
        next.validate()
    }

    pub(crate) fn insert_field(&mut self, field: Field, position: Option<usize>) -> Result<(), AppError> {
        if self.field(&field.name).is_some() {
            return Err(AppError::Conflict(format!(
                "field '{}' already exists on '{}'",
                field.name, self.name
            )));
        }
        let at = position.unwrap_or(self.fields.len()).min(self.fields.len());
        self.fields.insert(at, field);
        Ok(())
    }

    /// Removes a field, returning it and its former position.
    pub(crate) fn remove_field(&mut self, name: &str) -> Result<(Field, usize), AppError> {
        let idx = self
            .field_index(name)
            .ok_or_else(|| AppError::not_found("field", format!("{}.{}", self.name, name)))?;
        Ok((self.fields.remove(idx), idx))
    }

    pub(crate) fn patch_field(&mut self, name: &str, patch: &FieldPatch) -> Result<(), AppError> {
        if let Some(new_name) = &patch.name {
            if new_name != name && self.field(new_name).is_some() {
                return Err(AppError::Conflict(format!(
                    "field '{}' already exists on '{}'",
                    new_name, self.name
                )));
            }
        }
        let entity = self.name.clone();
        let field = self
            .fields
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| AppError::not_found("field", format!("{}.{}", entity, name)))?;
        patch.apply(field);
        // Keep belongsTo relations pointing at a renamed FK field.
        if let Some(new_name) = &patch.name {
            for r in &mut self.relations {
                if let Relation::BelongsTo { field, .. } = r {
                    if field == name {
                        *field = new_name.clone();
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn insert_relation(&mut self, relation: Relation, index: Option<usize>) -> Result<(), AppError> {
        if self.relation(&relation).is_some() {
            return Err(AppError::Conflict(format!(
                "{} relation already exists on '{}'",
                relation.kind(),
                self.name
            )));
        }
        let at = index.unwrap_or(self.relations.len()).min(self.relations.len());
        self.relations.insert(at, relation);
        Ok(())
    }

    /// Removes a relation, returning it and its former index.
    pub(crate) fn remove_relation(&mut self, relation: &Relation) -> Result<(Relation, usize), AppError> {
        let idx = self
            .relations
            .iter()
            .position(|r| r.same_key(relation))
            .ok_or_else(|| AppError::not_found(relation.kind(), &self.name))?;
        Ok((self.relations.remove(idx), idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldType;

    fn user() -> Entity {
        Entity::new("User")
            .with_field(Field::new("id", FieldType::Number).primary().auto_increment())
            .with_field(Field::new("email", FieldType::Text).unique().required())
    }

    #[test]
    fn valid_entity_passes() {
        assert!(user().validate().is_ok());
    }

    #[test]
    fn relation_field_must_be_marked() {
        let post = Entity::new("Post")
            .with_field(Field::new("id", FieldType::Number).primary())
            .with_field(Field::new("author_id", FieldType::Number))
            .with_relation(Relation::belongs_to("author_id", "User", "id"));
        assert!(post.validate().is_err());

        let mut fixed = post.clone();
        fixed.fields[1].is_relation = true;
        assert!(fixed.validate().is_ok());
    }

    #[test]
    fn two_auto_increments_rejected() {
        let e = user().with_field(Field::new("seq", FieldType::Number).primary().auto_increment());
        assert!(e.validate().is_err());
    }

    #[test]
    fn edits_are_checked_against_the_whole_entity() {
        let e = user();
        let seq = Field::new("seq", FieldType::Number).primary().auto_increment();
        assert!(matches!(e.validate_insert(&seq, None), Err(AppError::Validation(_))));
        assert!(e.validate_insert(&Field::new("nickname", FieldType::Text), Some(1)).is_ok());

        let counter = e.with_field(Field::new("counter", FieldType::Number));
        let patch = FieldPatch {
            primary: Some(true),
            auto_increment: Some(true),
            ..Default::default()
        };
        assert!(counter.fields[2].validate().is_ok());
        assert!(matches!(counter.validate_patch("counter", &patch), Err(AppError::Validation(_))));
        assert_eq!(counter.fields.len(), 3);
        assert!(!counter.fields[2].auto_increment);
    }

    #[test]
    fn insert_and_remove_keep_order() {
        let mut e = user();
        e.insert_field(Field::new("nickname", FieldType::Text), Some(1)).unwrap();
        let names: Vec<_> = e.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["id", "nickname", "email"]);

        let (removed, at) = e.remove_field("nickname").unwrap();
        assert_eq!(at, 1);
        e.insert_field(removed, Some(at)).unwrap();
        assert_eq!(e.fields[1].name, "nickname");
    }

    #[test]
    fn renaming_fk_field_follows_relation() {
        let mut post = Entity::new("Post")
            .with_field(Field::new("author_id", FieldType::Number).relation_field())
            .with_relation(Relation::belongs_to("author_id", "User", "id"));
        let patch = FieldPatch {
            name: Some("writer_id".into()),
            ..Default::default()
        };
        post.patch_field("author_id", &patch).unwrap();
        assert!(post.belongs_to("writer_id").is_some());
        assert!(post.validate().is_ok());
    }
}

//! Validation of persisted entity definitions: per-entity invariants plus referential
//! integrity across the set.

use crate::error::ConfigError;
use crate::model::{Entity, Relation};
use std::collections::BTreeMap;

pub fn validate_entities(entities: &BTreeMap<String, Entity>) -> Result<(), ConfigError> {
    for (key, entity) in entities {
        if key != &entity.name {
            return Err(ConfigError::Validation(format!(
                "entity stored as '{}' is named '{}'",
                key, entity.name
            )));
        }
        entity.validate().map_err(|e| ConfigError::Validation(e.to_string()))?;

        for relation in &entity.relations {
            let target = relation.target_entity();
            let Some(target_entity) = entities.get(target) else {
                return Err(ConfigError::MissingReference {
                    kind: "entity",
                    id: target.to_string(),
                });
            };
            match relation {
                Relation::BelongsTo { reference, .. } => {
                    if target_entity.field(&reference.field).is_none() {
                        return Err(ConfigError::MissingReference {
                            kind: "field",
                            id: format!("{}.{}", reference.entity, reference.field),
                        });
                    }
                }
                Relation::BelongsToMany { through, .. } => {
                    if entities.get(through).map(|e| !e.is_junction()).unwrap_or(false) {
                        return Err(ConfigError::Validation(format!(
                            "entity '{}': junction '{}' is declared as a plain entity",
                            entity.name, through
                        )));
                    }
                }
                Relation::HasMany { .. } => {}
            }
        }

        if let Some(sides) = &entity.is_relation {
            for side in sides {
                if !entities.contains_key(&side.entity) {
                    return Err(ConfigError::MissingReference {
                        kind: "entity",
                        id: side.entity.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FieldType};

    fn set(entities: Vec<Entity>) -> BTreeMap<String, Entity> {
        entities.into_iter().map(|e| (e.name.clone(), e)).collect()
    }

    fn user() -> Entity {
        Entity::new("users").with_field(Field::new("id", FieldType::Number).primary().auto_increment())
    }

    fn post(target: &str) -> Entity {
        Entity::new("posts")
            .with_field(Field::new("author_id", FieldType::Number).relation_field())
            .with_relation(Relation::belongs_to("author_id", target, "id"))
    }

    #[test]
    fn consistent_set_passes() {
        assert!(validate_entities(&set(vec![user(), post("users")])).is_ok());
    }

    #[test]
    fn dangling_reference_fails() {
        let err = validate_entities(&set(vec![user(), post("people")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingReference { kind: "entity", .. }));
    }

    #[test]
    fn invalid_entity_fails() {
        let bad = Entity::new("users").with_field(Field::new("bad name", FieldType::Text));
        assert!(matches!(validate_entities(&set(vec![bad])), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn plain_entity_cannot_be_a_junction() {
        let users = user().with_relation(Relation::belongs_to_many("groups", "user_id", "groups", "group_id"));
        let groups = Entity::new("groups").with_field(Field::new("id", FieldType::Number).primary());
        assert!(matches!(
            validate_entities(&set(vec![users, groups])),
            Err(ConfigError::Validation(_))
        ));
    }
}

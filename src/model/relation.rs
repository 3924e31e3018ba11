//! Relation: a structural link between two entities.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub entity: String,
    pub field: String,
}

/// Far side of a belongsToMany: the other entity and its column in the junction table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManyReference {
    pub entity: String,
    #[serde(rename = "as")]
    pub alias: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Relation {
    /// Local foreign key `field` pointing at `reference`.
    BelongsTo {
        field: String,
        reference: Reference,
        #[serde(default, rename = "onUpdate", skip_serializing_if = "Option::is_none")]
        on_update: Option<String>,
        #[serde(default, rename = "onDelete", skip_serializing_if = "Option::is_none")]
        on_delete: Option<String>,
    },
    /// Inverse side of a belongsTo declared on `reference.entity`. Model only.
    HasMany { reference: Reference },
    /// Many-to-many through junction table `through`; `alias` is this side's column.
    BelongsToMany {
        through: String,
        #[serde(rename = "as")]
        alias: String,
        reference: ManyReference,
    },
}

impl Relation {
    pub fn belongs_to(field: impl Into<String>, entity: impl Into<String>, target_field: impl Into<String>) -> Self {
        Relation::BelongsTo {
            field: field.into(),
            reference: Reference {
                entity: entity.into(),
                field: target_field.into(),
            },
            on_update: None,
            on_delete: None,
        }
    }

    pub fn belongs_to_many(
        through: impl Into<String>,
        alias: impl Into<String>,
        entity: impl Into<String>,
        other_alias: impl Into<String>,
    ) -> Self {
        Relation::BelongsToMany {
            through: through.into(),
            alias: alias.into(),
            reference: ManyReference {
                entity: entity.into(),
                alias: other_alias.into(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Relation::BelongsTo { .. } => "belongsTo",
            Relation::HasMany { .. } => "hasMany",
            Relation::BelongsToMany { .. } => "belongsToMany",
        }
    }

    /// Local FK field for belongsTo relations.
    pub fn local_field(&self) -> Option<&str> {
        match self {
            Relation::BelongsTo { field, .. } => Some(field),
            _ => None,
        }
    }

    pub fn target_entity(&self) -> &str {
        match self {
            Relation::BelongsTo { reference, .. } | Relation::HasMany { reference } => &reference.entity,
            Relation::BelongsToMany { reference, .. } => &reference.entity,
        }
    }

    pub fn through(&self) -> Option<&str> {
        match self {
            Relation::BelongsToMany { through, .. } => Some(through),
            _ => None,
        }
    }

    /// Two relations on the same entity with equal keys describe the same link.
    pub fn same_key(&self, other: &Relation) -> bool {
        match (self, other) {
            (Relation::BelongsTo { field: a, .. }, Relation::BelongsTo { field: b, .. }) => a == b,
            (Relation::HasMany { reference: a }, Relation::HasMany { reference: b }) => a == b,
            (
                Relation::BelongsToMany { through: t1, alias: a1, .. },
                Relation::BelongsToMany { through: t2, alias: a2, .. },
            ) => t1 == t2 && a1 == a2,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn belongs_to_many_uses_as_aliases() {
        let rel = Relation::belongs_to_many("user_group", "user_id", "Group", "group_id");
        assert_eq!(
            serde_json::to_value(&rel).unwrap(),
            json!({
                "type": "belongsToMany",
                "through": "user_group",
                "as": "user_id",
                "reference": { "entity": "Group", "as": "group_id" }
            })
        );
    }

    #[test]
    fn belongs_to_round_trips_actions() {
        let v = json!({
            "type": "belongsTo",
            "field": "author_id",
            "reference": { "entity": "User", "field": "id" },
            "onDelete": "CASCADE"
        });
        let rel: Relation = serde_json::from_value(v.clone()).unwrap();
        assert_eq!(rel.local_field(), Some("author_id"));
        assert_eq!(serde_json::to_value(&rel).unwrap(), v);
    }

    #[test]
    fn same_key_ignores_reference_target() {
        let a = Relation::belongs_to("owner_id", "User", "id");
        let b = Relation::belongs_to("owner_id", "Team", "id");
        assert!(a.same_key(&b));
        assert_ne!(a, b);
    }
}

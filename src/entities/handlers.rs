//! Action handlers for entities, fields and relations.
//!
//! Each handler validates against the model first, then runs the database side (when the
//! scope includes it), then mutates the model (when the scope includes it). A database
//! failure therefore leaves the model untouched.

use super::EntityManager;
use crate::diff::{Action, AddFieldPayload, ChangeFieldPayload, DiffType, NamePayload, RelationPayload};
use crate::dialect::{find_column, ColumnSpec, ConstraintSpec, Dialect, ForeignKeyRef};
use crate::error::AppError;
use crate::history::{ActionHandler, ApplyOptions, History};
use crate::model::field::validate_identifier;
use crate::model::{Entity, Field, FieldPatch, FieldType, JunctionSide, Relation};
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) fn register(history: &mut History<EntityManager>) {
    history.register(DiffType::CreateEntity, CreateEntity);
    history.register(DiffType::RenameEntity, RenameEntity);
    history.register(DiffType::DeleteEntity, DeleteEntity);
    history.register(DiffType::AddField, AddField);
    history.register(DiffType::ChangeField, ChangeField);
    history.register(DiffType::DeleteField, DeleteField);
    history.register(DiffType::AddRelation, AddRelation);
    history.register(DiffType::DeleteRelation, DeleteRelation);
}

/// Column definitions for a new table. belongsTo fields carry their foreign key inline.
fn table_columns(entity: &Entity) -> Vec<(String, ColumnSpec)> {
    entity
        .fields
        .iter()
        .map(|f| {
            let mut spec = ColumnSpec::from_field(f);
            if let Some(Relation::BelongsTo {
                reference,
                on_update,
                on_delete,
                ..
            }) = entity.belongs_to(&f.name)
            {
                spec = spec.with_reference(ForeignKeyRef {
                    table: reference.entity.clone(),
                    column: reference.field.clone(),
                    on_update: on_update.clone(),
                    on_delete: on_delete.clone(),
                });
            }
            (f.name.clone(), spec)
        })
        .collect()
}

/// Apply the column keys of a patch to a live column definition.
fn patched_spec(current: &ColumnSpec, patch: &FieldPatch) -> ColumnSpec {
    let mut spec = current.clone();
    if let Some(t) = patch.field_type {
        spec.field_type = t;
    }
    if let Some(v) = patch.primary {
        spec.primary = v;
    }
    if let Some(v) = patch.unique {
        spec.unique = v;
    }
    if let Some(v) = patch.required {
        spec.required = v;
    }
    if let Some(v) = patch.auto_increment {
        spec.auto_increment = v;
    }
    if let Some(v) = &patch.default_value {
        spec.default = if v.is_null() { None } else { Some(v.clone()) };
    }
    if patch.default == Some(false) {
        spec.default = None;
    }
    spec
}

fn check_table(action: &Action, name: &str) -> Result<(), AppError> {
    if action.table != name {
        return Err(AppError::Validation(format!(
            "{} targets '{}' but its payload names '{}'",
            action.kind, action.table, name
        )));
    }
    Ok(())
}

struct CreateEntity;

#[async_trait]
impl ActionHandler<EntityManager> for CreateEntity {
    async fn execute(&self, m: &mut EntityManager, action: &Action, opts: ApplyOptions) -> Result<(), AppError> {
        let entity: Entity = action.payload()?;
        check_table(action, &entity.name)?;
        entity.validate()?;
        if opts.scope.model() && m.get(&entity.name).is_some() {
            return Err(AppError::Conflict(format!("entity '{}' already exists", entity.name)));
        }
        if let Some(db) = m.database(opts)? {
            if !entity.is_junction() {
                db.create_table(&entity.name, &table_columns(&entity), &[]).await?;
            }
        }
        if opts.scope.model() {
            m.insert(entity)?;
        }
        Ok(())
    }
}

struct RenameEntity;

#[async_trait]
impl ActionHandler<EntityManager> for RenameEntity {
    async fn execute(&self, m: &mut EntityManager, action: &Action, opts: ApplyOptions) -> Result<(), AppError> {
        let p: NamePayload = action.payload()?;
        validate_identifier("entity", &p.name)?;
        if opts.scope.model() {
            m.entity(&action.table)?;
            if m.get(&p.name).is_some() {
                return Err(AppError::Conflict(format!("entity '{}' already exists", p.name)));
            }
        }
        if let Some(db) = m.database(opts)? {
            db.rename_table(&action.table, &p.name).await?;
        }
        if opts.scope.model() {
            m.rename(&action.table, &p.name)?;
        }
        Ok(())
    }
}

struct DeleteEntity;

#[async_trait]
impl ActionHandler<EntityManager> for DeleteEntity {
    async fn execute(&self, m: &mut EntityManager, action: &Action, opts: ApplyOptions) -> Result<(), AppError> {
        let junction = if opts.scope.model() {
            m.entity(&action.table)?.is_junction()
        } else {
            false
        };
        if let Some(db) = m.database(opts)? {
            if !junction {
                db.drop_table(&action.table).await?;
            }
        }
        if opts.scope.model() {
            m.remove(&action.table)?;
        }
        Ok(())
    }
}

struct AddField;

#[async_trait]
impl ActionHandler<EntityManager> for AddField {
    async fn execute(&self, m: &mut EntityManager, action: &Action, opts: ApplyOptions) -> Result<(), AppError> {
        let p: AddFieldPayload = action.payload()?;
        p.field.validate()?;
        if opts.scope.model() {
            m.entity(&action.table)?.validate_insert(&p.field, p.position)?;
        }
        if let Some(db) = m.database(opts)? {
            db.add_column(&action.table, &p.field.name, &ColumnSpec::from_field(&p.field))
                .await?;
        }
        if opts.scope.model() {
            m.entity_mut(&action.table)?.insert_field(p.field, p.position)?;
            m.save(&action.table)?;
        }
        Ok(())
    }
}

/// Rename first, then bring the column to the patched definition.
async fn change_column(db: &Arc<dyn Dialect>, table: &str, name: &str, patch: &FieldPatch) -> Result<(), AppError> {
    let live = find_column(db.describe_table(table).await?, table, name)?;
    let current = ColumnSpec::from_descriptor(db.kind(), table, &live)?;
    let target = patched_spec(&current, patch);
    let mut column = name;
    if let Some(new_name) = patch.name.as_deref().filter(|n| *n != name) {
        db.rename_column(table, name, new_name).await?;
        column = new_name;
    }
    if target != current {
        db.change_column(table, column, &target).await?;
    }
    Ok(())
}

struct ChangeField;

#[async_trait]
impl ActionHandler<EntityManager> for ChangeField {
    async fn execute(&self, m: &mut EntityManager, action: &Action, opts: ApplyOptions) -> Result<(), AppError> {
        let p: ChangeFieldPayload = action.payload()?;
        if opts.scope.model() {
            m.entity(&action.table)?.validate_patch(&p.name, &p.changes)?;
        }
        if let Some(db) = m.database(opts)? {
            if p.changes.touches_column() {
                change_column(&db, &action.table, &p.name, &p.changes).await?;
            }
        }
        if opts.scope.model() {
            m.entity_mut(&action.table)?.patch_field(&p.name, &p.changes)?;
            m.save(&action.table)?;
        }
        Ok(())
    }
}

struct DeleteField;

#[async_trait]
impl ActionHandler<EntityManager> for DeleteField {
    async fn execute(&self, m: &mut EntityManager, action: &Action, opts: ApplyOptions) -> Result<(), AppError> {
        let p: NamePayload = action.payload()?;
        if opts.scope.model() {
            let entity = m.entity(&action.table)?;
            if entity.field(&p.name).is_none() {
                return Err(AppError::not_found("field", format!("{}.{}", action.table, p.name)));
            }
            if entity.belongs_to(&p.name).is_some() {
                return Err(AppError::Validation(format!(
                    "field '{}.{}' carries a relation; delete the relation instead",
                    action.table, p.name
                )));
            }
        }
        if let Some(db) = m.database(opts)? {
            db.remove_column(&action.table, &p.name).await?;
        }
        if opts.scope.model() {
            m.entity_mut(&action.table)?.remove_field(&p.name)?;
            m.save(&action.table)?;
        }
        Ok(())
    }
}

/// The column a belongsTo relation materializes: the payload's field, or one typed like
/// the referenced field.
fn relation_field(m: &EntityManager, fk: &str, target: &str, target_field: &str, given: Option<Field>) -> Result<Field, AppError> {
    let mut field = match given {
        Some(f) => f,
        None => {
            let field_type = m
                .get(target)
                .and_then(|e| e.field(target_field))
                .map(|f| f.field_type)
                .unwrap_or(FieldType::Number);
            Field::new(fk, field_type)
        }
    };
    if field.name != fk {
        return Err(AppError::Validation(format!(
            "relation field '{}' does not match payload field '{}'",
            fk, field.name
        )));
    }
    // A foreign key column never auto-increments or acts as the key.
    field.is_relation = true;
    field.primary = false;
    field.auto_increment = false;
    field.validate()?;
    Ok(field)
}

/// Create the association table: one column per side referencing that side's primary key,
/// unique together.
async fn create_junction(
    m: &EntityManager,
    db: &Arc<dyn Dialect>,
    table: &str,
    through: &str,
    alias: &str,
    other: &str,
    other_alias: &str,
) -> Result<(), AppError> {
    let mut columns = Vec::with_capacity(2);
    for (entity, column) in [(table, alias), (other, other_alias)] {
        let (pk, field_type) = m.primary_key_of(entity, Some(db)).await?;
        let mut spec = ColumnSpec::from_field(&Field::new(column, field_type).required());
        spec.references = Some(ForeignKeyRef::new(entity, pk));
        columns.push((column.to_string(), spec));
    }
    let unique = ConstraintSpec::unique(
        vec![alias.to_string(), other_alias.to_string()],
        Some(format!("{}_{}_{}_key", through, alias, other_alias)),
    );
    tracing::info!(junction = %through, left = %table, right = %other, "creating junction table");
    db.create_table(through, &columns, &[unique]).await
}

struct AddRelation;

#[async_trait]
impl ActionHandler<EntityManager> for AddRelation {
    async fn execute(&self, m: &mut EntityManager, action: &Action, opts: ApplyOptions) -> Result<(), AppError> {
        let p: RelationPayload = action.payload()?;
        let table = action.table.as_str();
        if opts.scope.model() && m.entity(table)?.relation(&p.relation).is_some() {
            return Err(AppError::Conflict(format!(
                "{} relation already exists on '{}'",
                p.relation.kind(),
                table
            )));
        }
        let db = m.database(opts)?;
        match &p.relation {
            Relation::BelongsTo {
                field: fk,
                reference,
                on_update,
                on_delete,
            } => {
                let field = relation_field(m, fk, &reference.entity, &reference.field, p.field.clone())?;
                if opts.scope.model() && m.entity(table)?.field(fk).is_some() {
                    return Err(AppError::Conflict(format!("field '{}' already exists on '{}'", fk, table)));
                }
                if let Some(db) = &db {
                    let spec = ColumnSpec::from_field(&field).with_reference(ForeignKeyRef {
                        table: reference.entity.clone(),
                        column: reference.field.clone(),
                        on_update: on_update.clone(),
                        on_delete: on_delete.clone(),
                    });
                    db.add_column(table, fk, &spec).await?;
                }
                if opts.scope.model() {
                    let entity = m.entity_mut(table)?;
                    entity.insert_field(field, p.position)?;
                    entity.insert_relation(p.relation.clone(), p.index)?;
                    m.save(table)?;
                }
            }
            Relation::HasMany { .. } => {
                if opts.scope.model() {
                    m.entity_mut(table)?.insert_relation(p.relation.clone(), p.index)?;
                    m.save(table)?;
                }
            }
            Relation::BelongsToMany {
                through,
                alias,
                reference,
            } => {
                validate_identifier("junction", through)?;
                if let Some(db) = &db {
                    if !db.has_table(through).await? {
                        create_junction(m, db, table, through, alias, &reference.entity, &reference.alias).await?;
                    }
                }
                if opts.scope.model() {
                    m.entity_mut(table)?.insert_relation(p.relation.clone(), p.index)?;
                    m.ensure_junction(
                        through,
                        [
                            JunctionSide {
                                entity: table.to_string(),
                                alias: alias.clone(),
                            },
                            JunctionSide {
                                entity: reference.entity.clone(),
                                alias: reference.alias.clone(),
                            },
                        ],
                    )?;
                    m.save(table)?;
                }
            }
        }
        Ok(())
    }
}

struct DeleteRelation;

#[async_trait]
impl ActionHandler<EntityManager> for DeleteRelation {
    async fn execute(&self, m: &mut EntityManager, action: &Action, opts: ApplyOptions) -> Result<(), AppError> {
        let p: RelationPayload = action.payload()?;
        let table = action.table.as_str();
        if opts.scope.model() && m.entity(table)?.relation(&p.relation).is_none() {
            return Err(AppError::not_found(p.relation.kind(), table));
        }
        let db = m.database(opts)?;
        match &p.relation {
            Relation::BelongsTo { field: fk, .. } => {
                if let Some(db) = &db {
                    db.remove_column(table, fk).await?;
                }
                if opts.scope.model() {
                    let entity = m.entity_mut(table)?;
                    entity.remove_relation(&p.relation)?;
                    if entity.field(fk).is_some() {
                        entity.remove_field(fk)?;
                    }
                    m.save(table)?;
                }
            }
            Relation::HasMany { .. } => {
                if opts.scope.model() {
                    m.entity_mut(table)?.remove_relation(&p.relation)?;
                    m.save(table)?;
                }
            }
            Relation::BelongsToMany { through, .. } => {
                if let Some(db) = &db {
                    // Keep the table while another relation in the model still routes through it.
                    let others = m.junction_users(through).saturating_sub(usize::from(opts.scope.model()));
                    if others == 0 && db.has_table(through).await? {
                        tracing::info!(junction = %through, "dropping junction table");
                        db.drop_table(through).await?;
                    }
                }
                if opts.scope.model() {
                    m.entity_mut(table)?.remove_relation(&p.relation)?;
                    m.save(table)?;
                    m.release_junction(through)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqliteDialect;
    use crate::diff::DiffItem;
    use crate::history::Scope;
    use crate::store::NoopStore;
    use serde_json::json;

    fn user() -> Entity {
        Entity::new("users")
            .with_field(Field::new("id", FieldType::Number).primary().auto_increment())
            .with_field(Field::new("email", FieldType::Text).unique().required())
    }

    fn group() -> Entity {
        Entity::new("groups").with_field(Field::new("id", FieldType::Number).primary().auto_increment())
    }

    fn manager(entities: Vec<Entity>) -> (EntityManager, History<EntityManager>) {
        let mut m = EntityManager::new(Arc::new(NoopStore));
        for e in entities {
            m.insert(e).unwrap();
        }
        let mut h = History::new(Arc::new(NoopStore));
        EntityManager::register_handlers(&mut h);
        (m, h)
    }

    fn model_only() -> ApplyOptions {
        ApplyOptions::scoped(Scope::Model)
    }

    /// redo then undo leaves the model exactly as it was.
    async fn assert_inverse(entities: Vec<Entity>, item: DiffItem) {
        let (mut m, mut h) = manager(entities);
        let before = m.entities().clone();
        h.record(&mut m, item, model_only()).await.unwrap();
        assert_ne!(m.entities(), &before);
        h.undo(&mut m, model_only()).await.unwrap();
        assert_eq!(m.entities(), &before);
    }

    #[tokio::test]
    async fn field_actions_invert() {
        let nickname = Field::new("nickname", FieldType::Text);
        assert_inverse(
            vec![user()],
            DiffItem::new(
                Action::add_field("users", nickname.clone(), Some(1)).unwrap(),
                Action::delete_field("users", "nickname"),
            ),
        )
        .await;

        let patch = FieldPatch {
            name: Some("mail".into()),
            required: Some(false),
            ..Default::default()
        };
        let back = FieldPatch {
            name: Some("email".into()),
            required: Some(true),
            ..Default::default()
        };
        assert_inverse(
            vec![user()],
            DiffItem::new(
                Action::change_field("users", "email", patch).unwrap(),
                Action::change_field("users", "mail", back).unwrap(),
            ),
        )
        .await;
    }

    #[tokio::test]
    async fn second_auto_increment_is_rejected_before_any_change() {
        let (mut m, mut h) = manager(vec![user()]);
        let before = m.entities().clone();
        let seq = Field::new("seq", FieldType::Number).primary().auto_increment();
        let item = DiffItem::new(
            Action::add_field("users", seq, None).unwrap(),
            Action::delete_field("users", "seq"),
        );
        let err = h.record(&mut m, item, model_only()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let patch = FieldPatch {
            field_type: Some(FieldType::Number),
            primary: Some(true),
            auto_increment: Some(true),
            ..Default::default()
        };
        let back = FieldPatch {
            field_type: Some(FieldType::Text),
            primary: Some(false),
            auto_increment: Some(false),
            ..Default::default()
        };
        let item = DiffItem::new(
            Action::change_field("users", "email", patch).unwrap(),
            Action::change_field("users", "email", back).unwrap(),
        );
        let err = h.record(&mut m, item, model_only()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(m.entities(), &before);
    }

    #[tokio::test]
    async fn belongs_to_round_trip_restores_positions() {
        let post = Entity::new("posts")
            .with_field(Field::new("id", FieldType::Number).primary().auto_increment())
            .with_field(Field::new("author_id", FieldType::Number).relation_field())
            .with_field(Field::new("title", FieldType::Text))
            .with_relation(Relation::HasMany {
                reference: crate::model::Reference {
                    entity: "comments".into(),
                    field: "post_id".into(),
                },
            })
            .with_relation(Relation::belongs_to("author_id", "users", "id"));
        let rel = Relation::belongs_to("author_id", "users", "id");
        let restore = Action::restore_relation(
            "posts",
            RelationPayload {
                relation: rel.clone(),
                field: post.field("author_id").cloned(),
                position: Some(1),
                index: Some(1),
            },
        )
        .unwrap();
        assert_inverse(
            vec![user(), post],
            DiffItem::new(Action::delete_relation("posts", rel).unwrap(), restore),
        )
        .await;
    }

    #[tokio::test]
    async fn belongs_to_many_manages_junction_marker() {
        let (mut m, mut h) = manager(vec![user(), group()]);
        let ug = Relation::belongs_to_many("user_groups", "user_id", "groups", "group_id");
        let gu = Relation::belongs_to_many("user_groups", "group_id", "users", "user_id");
        for (table, rel) in [("users", &ug), ("groups", &gu)] {
            let item = DiffItem::new(
                Action::add_relation(table, rel.clone(), None, None).unwrap(),
                Action::delete_relation(table, rel.clone()).unwrap(),
            );
            h.record(&mut m, item, model_only()).await.unwrap();
        }
        let marker = m.entity("user_groups").unwrap();
        assert!(marker.is_junction());
        assert_eq!(marker.is_relation.as_ref().unwrap()[0].entity, "groups");

        h.undo(&mut m, model_only()).await.unwrap();
        assert!(m.get("user_groups").is_some());
        h.undo(&mut m, model_only()).await.unwrap();
        assert!(m.get("user_groups").is_none());
        assert!(m.entity("users").unwrap().relations.is_empty());
    }

    #[tokio::test]
    async fn rename_entity_follows_references() {
        let post = Entity::new("posts")
            .with_field(Field::new("author_id", FieldType::Number).relation_field())
            .with_relation(Relation::belongs_to("author_id", "users", "id"));
        let (mut m, mut h) = manager(vec![user(), post]);
        let item = DiffItem::new(Action::rename_entity("users", "people"), Action::rename_entity("people", "users"));
        h.record(&mut m, item, model_only()).await.unwrap();
        assert!(m.get("users").is_none());
        assert_eq!(m.entity("posts").unwrap().relations[0].target_entity(), "people");
        h.undo(&mut m, model_only()).await.unwrap();
        assert_eq!(m.entity("posts").unwrap().relations[0].target_entity(), "users");
    }

    #[tokio::test]
    async fn relation_field_cannot_be_deleted_as_a_field() {
        let post = Entity::new("posts")
            .with_field(Field::new("author_id", FieldType::Number).relation_field())
            .with_relation(Relation::belongs_to("author_id", "users", "id"));
        let (mut m, mut h) = manager(vec![user(), post]);
        let item = DiffItem::new(
            Action::delete_field("posts", "author_id"),
            Action::add_field("posts", Field::new("author_id", FieldType::Number), None).unwrap(),
        );
        let err = h.record(&mut m, item, model_only()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn database_scope_without_dialect_is_rejected() {
        let (mut m, mut h) = manager(vec![user()]);
        let item = DiffItem::new(Action::delete_entity("users"), Action::create_entity(&user()).unwrap());
        let err = h.record(&mut m, item, ApplyOptions::default()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(m.get("users").is_some());
    }

    #[tokio::test]
    async fn both_scopes_create_and_drop_tables() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db: Arc<dyn Dialect> = Arc::new(SqliteDialect::new(pool));
        let (m, mut h) = manager(vec![]);
        let mut m = m.with_dialect(db.clone());

        let with_default = user().with_field(Field::new("active", FieldType::Boolean).with_default(json!(true)));
        let item = DiffItem::new(Action::create_entity(&with_default).unwrap(), Action::delete_entity("users"));
        h.record(&mut m, item, ApplyOptions::default()).await.unwrap();
        assert!(db.has_table("users").await.unwrap());
        let columns = db.describe_table("users").await.unwrap();
        let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["id", "email", "active"]);

        h.undo(&mut m, ApplyOptions::default()).await.unwrap();
        assert!(!db.has_table("users").await.unwrap());
        assert!(m.get("users").is_none());
    }
}

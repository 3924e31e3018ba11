//! In-memory entity registry. All structural mutation goes through the action handlers
//! registered on a [`History`], so every change is captured in the log.

use super::{handlers, queries};
use crate::config::validate_entities;
use crate::dialect::Dialect;
use crate::error::AppError;
use crate::history::{ApplyOptions, History};
use crate::model::{Entity, FieldType, JunctionSide, Relation};
use crate::store::{EntityStore, NoopStore};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct EntityManager {
    entities: BTreeMap<String, Entity>,
    dialect: Option<Arc<dyn Dialect>>,
    store: Arc<dyn EntityStore>,
}

impl Default for EntityManager {
    fn default() -> Self {
        EntityManager::new(Arc::new(NoopStore))
    }
}

impl EntityManager {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        EntityManager {
            entities: BTreeMap::new(),
            dialect: None,
            store,
        }
    }

    /// Read every persisted definition and validate the set as a whole.
    pub fn load(store: Arc<dyn EntityStore>) -> Result<Self, AppError> {
        let entities: BTreeMap<String, Entity> = store
            .load_all()?
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();
        validate_entities(&entities)?;
        tracing::info!(count = entities.len(), "entities loaded");
        Ok(EntityManager {
            entities,
            dialect: None,
            store,
        })
    }

    pub fn with_dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialect = Some(dialect);
        self
    }

    pub fn entities(&self) -> &BTreeMap<String, Entity> {
        &self.entities
    }

    pub fn get(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    pub fn entity(&self, name: &str) -> Result<&Entity, AppError> {
        self.entities.get(name).ok_or_else(|| AppError::not_found("entity", name))
    }

    pub fn dialect(&self) -> Option<&Arc<dyn Dialect>> {
        self.dialect.as_ref()
    }

    /// Wire every entity, field and relation action kind.
    pub fn register_handlers(history: &mut History<EntityManager>) {
        handlers::register(history);
    }

    /// Wire ADD_QUERY / DELETE_QUERY.
    pub fn register_query_handlers(history: &mut History<EntityManager>) {
        queries::register(history);
    }

    /// The database to act on, when the scope includes it.
    pub(crate) fn database(&self, opts: ApplyOptions) -> Result<Option<Arc<dyn Dialect>>, AppError> {
        if !opts.scope.database() {
            return Ok(None);
        }
        self.dialect.clone().map(Some).ok_or_else(|| {
            AppError::Validation("database scope requested but no database is attached".into())
        })
    }

    pub(crate) fn entity_mut(&mut self, name: &str) -> Result<&mut Entity, AppError> {
        self.entities.get_mut(name).ok_or_else(|| AppError::not_found("entity", name))
    }

    /// Rewrite the persisted document of one entity.
    pub(crate) fn save(&self, name: &str) -> Result<(), AppError> {
        match self.entities.get(name) {
            Some(entity) => self.store.save(entity),
            None => self.store.remove(name),
        }
    }

    pub(crate) fn insert(&mut self, entity: Entity) -> Result<(), AppError> {
        if self.entities.contains_key(&entity.name) {
            return Err(AppError::Conflict(format!("entity '{}' already exists", entity.name)));
        }
        let name = entity.name.clone();
        self.entities.insert(name.clone(), entity);
        self.save(&name)
    }

    pub(crate) fn remove(&mut self, name: &str) -> Result<Entity, AppError> {
        let entity = self
            .entities
            .remove(name)
            .ok_or_else(|| AppError::not_found("entity", name))?;
        self.store.remove(name)?;
        Ok(entity)
    }

    /// Rename an entity and every reference to it.
    pub(crate) fn rename(&mut self, from: &str, to: &str) -> Result<(), AppError> {
        if from == to {
            return Ok(());
        }
        if self.entities.contains_key(to) {
            return Err(AppError::Conflict(format!("entity '{}' already exists", to)));
        }
        let mut entity = self
            .entities
            .remove(from)
            .ok_or_else(|| AppError::not_found("entity", from))?;
        entity.name = to.to_string();
        self.entities.insert(to.to_string(), entity);

        let mut touched = vec![to.to_string()];
        for (name, e) in self.entities.iter_mut() {
            let mut changed = false;
            for r in &mut e.relations {
                let target = match r {
                    Relation::BelongsTo { reference, .. } | Relation::HasMany { reference } => &mut reference.entity,
                    Relation::BelongsToMany { reference, .. } => &mut reference.entity,
                };
                if *target == from {
                    *target = to.to_string();
                    changed = true;
                }
            }
            if let Some(sides) = &mut e.is_relation {
                for side in sides.iter_mut().filter(|s| s.entity == from) {
                    side.entity = to.to_string();
                    changed = true;
                }
            }
            if changed && name != to {
                touched.push(name.clone());
            }
        }
        self.store.remove(from)?;
        for name in touched {
            self.save(&name)?;
        }
        Ok(())
    }

    /// Ensure the junction marker for `through` exists. Sides are kept sorted so the
    /// marker looks the same whichever side created it.
    pub(crate) fn ensure_junction(&mut self, through: &str, mut sides: [JunctionSide; 2]) -> Result<(), AppError> {
        if let Some(existing) = self.entities.get(through) {
            if existing.is_junction() {
                return Ok(());
            }
            return Err(AppError::Conflict(format!(
                "'{}' is a plain entity and cannot be used as a junction",
                through
            )));
        }
        sides.sort_by(|a, b| (&a.entity, &a.alias).cmp(&(&b.entity, &b.alias)));
        let mut marker = Entity::new(through);
        marker.is_relation = Some(sides);
        marker.validate()?;
        tracing::debug!(junction = %through, "junction marker created");
        self.insert(marker)
    }

    /// Number of belongsToMany relations routed through `through`.
    pub(crate) fn junction_users(&self, through: &str) -> usize {
        self.entities
            .values()
            .flat_map(|e| e.relations.iter())
            .filter(|r| r.through() == Some(through))
            .count()
    }

    /// Drop the junction marker once no relation goes through it.
    pub(crate) fn release_junction(&mut self, through: &str) -> Result<(), AppError> {
        let is_marker = self.entities.get(through).map(Entity::is_junction).unwrap_or(false);
        if is_marker && self.junction_users(through) == 0 {
            tracing::debug!(junction = %through, "junction marker removed");
            self.remove(through)?;
        }
        Ok(())
    }

    /// Primary key column and type of an entity: from the model when declared there,
    /// otherwise from the live table.
    pub(crate) async fn primary_key_of(
        &self,
        entity: &str,
        db: Option<&Arc<dyn Dialect>>,
    ) -> Result<(String, FieldType), AppError> {
        if let Some(e) = self.entities.get(entity) {
            let mut pk = e.primary_fields();
            if let (Some(f), None) = (pk.next(), pk.next()) {
                return Ok((f.name.clone(), f.field_type));
            }
        }
        if let Some(db) = db {
            let columns = db.describe_table(entity).await?;
            let keys: Vec<_> = columns.iter().filter(|c| c.primary_key).collect();
            if let [c] = keys.as_slice() {
                return Ok((c.name.clone(), c.field_type(db.kind(), entity)?));
            }
        }
        Err(AppError::Validation(format!(
            "entity '{}' needs a single-column primary key to take part in a many-to-many relation",
            entity
        )))
    }
}

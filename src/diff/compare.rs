//! Model vs. catalog comparison.
//!
//! Per model entity with a live table: relations are matched against foreign key columns,
//! plain fields against plain columns. Bookkeeping columns (`createdAt`, `updatedAt`) are
//! ignored on both sides. Tables that realize a many-to-many association are reported as
//! belongsToMany relations on the two referenced entities rather than as entities.

use super::{Action, Diff, DiffItem, RelationPayload};
use crate::dialect::types::{defaults_equal, parse_default};
use crate::dialect::{Catalog, ColumnDescriptor, DialectKind, ForeignKeyRef, Uniqueness};
use crate::error::AppError;
use crate::model::{is_bookkeeping, Entity, Field, FieldPatch, Reference, Relation};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// An association table: two foreign key columns, each naming one side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Junction {
    pub table: String,
    /// (column, referenced entity) per side.
    pub sides: [(String, String); 2],
}

impl Junction {
    /// The belongsToMany relation each side carries.
    pub fn relations(&self) -> [(String, Relation); 2] {
        let [(a_col, a_entity), (b_col, b_entity)] = &self.sides;
        [
            (a_entity.clone(), Relation::belongs_to_many(&self.table, a_col, b_entity, b_col)),
            (b_entity.clone(), Relation::belongs_to_many(&self.table, b_col, a_entity, a_col)),
        ]
    }
}

/// Detect the many-to-many pattern: exactly two foreign key columns that each carry a
/// uniqueness constraint (their own, a shared unique index, or the primary key), and
/// every other column can be left out of an insert (nullable, defaulted or
/// auto-incremented).
pub fn junction(table: &str, columns: &[ColumnDescriptor]) -> Option<Junction> {
    let cols: Vec<&ColumnDescriptor> = columns.iter().filter(|c| !is_bookkeeping(&c.name)).collect();
    let keyed: Vec<&ColumnDescriptor> = cols
        .iter()
        .copied()
        .filter(|c| c.fk.is_some() && (c.unique.is_unique() || c.primary_key))
        .collect();
    let [a, b] = keyed.as_slice() else {
        return None;
    };
    let others_optional = cols
        .iter()
        .filter(|c| c.name != a.name && c.name != b.name)
        .all(|c| c.allow_null || c.default_value.is_some() || (c.primary_key && c.auto_increment));
    if !others_optional {
        return None;
    }
    let side = |c: &ColumnDescriptor| (c.name.clone(), c.fk.as_ref().map(|f| f.table.clone()).unwrap_or_default());
    Some(Junction {
        table: table.to_string(),
        sides: [side(*a), side(*b)],
    })
}

/// The field a catalog column stands for.
pub fn catalog_field(kind: DialectKind, table: &str, column: &ColumnDescriptor) -> Result<Field, AppError> {
    let field_type = column.field_type(kind, table)?;
    let mut field = Field::new(&column.name, field_type);
    field.primary = column.primary_key;
    field.unique = column.unique == Uniqueness::Column && !column.primary_key;
    field.required = !column.allow_null && !column.primary_key;
    field.auto_increment = column.auto_increment;
    if !column.auto_increment {
        if let Some(v) = column.default_value.as_deref().and_then(|d| parse_default(field_type, d)) {
            field.default = true;
            field.default_value = Some(v);
        }
    }
    field.is_relation = column.fk.is_some();
    Ok(field)
}

fn catalog_relation(column: &ColumnDescriptor, fk: &ForeignKeyRef) -> Relation {
    Relation::BelongsTo {
        field: column.name.clone(),
        reference: Reference {
            entity: fk.table.clone(),
            field: fk.column.clone(),
        },
        on_update: fk.on_update.clone(),
        on_delete: fk.on_delete.clone(),
    }
}

fn same_action(a: &Option<String>, b: &Option<String>) -> bool {
    let norm = |v: &Option<String>| {
        v.as_deref()
            .map(str::to_uppercase)
            .filter(|s| s != "NO ACTION")
    };
    norm(a) == norm(b)
}

fn relation_matches(relation: &Relation, fk: &ForeignKeyRef) -> bool {
    match relation {
        Relation::BelongsTo {
            reference,
            on_update,
            on_delete,
            ..
        } => {
            reference.entity == fk.table
                && reference.field == fk.column
                && same_action(on_update, &fk.on_update)
                && same_action(on_delete, &fk.on_delete)
        }
        _ => false,
    }
}

/// Column semantics of a field: primary implies NOT NULL and uniqueness,
/// `default` without a value means no default.
fn normalized(field: &Field) -> Field {
    let mut n = field.clone();
    n.required = field.required || field.primary;
    n.unique = field.unique && !field.primary;
    let value = if field.default { field.default_value.clone() } else { None };
    n.default = value.is_some();
    n.default_value = value;
    n
}

/// Patches turning `model` into `catalog` (redo) and back (undo), restricted to
/// the column keys that differ. `None` when the column matches.
pub fn column_patches(model: &Field, catalog: &Field) -> Option<(FieldPatch, FieldPatch)> {
    let m = normalized(model);
    let c = normalized(catalog);
    let mut redo = FieldPatch::default();
    let mut undo = FieldPatch::default();

    if m.field_type != c.field_type {
        redo.field_type = Some(catalog.field_type);
        undo.field_type = Some(model.field_type);
    }
    if m.primary != c.primary {
        redo.primary = Some(catalog.primary);
        undo.primary = Some(model.primary);
    }
    if m.auto_increment != c.auto_increment {
        redo.auto_increment = Some(catalog.auto_increment);
        undo.auto_increment = Some(model.auto_increment);
    }
    if m.unique != c.unique {
        redo.unique = Some(c.unique);
        undo.unique = Some(model.unique);
    }
    if m.required != c.required {
        redo.required = Some(c.required);
        undo.required = Some(model.required);
    }
    if !defaults_equal(m.default_value.as_ref(), c.default_value.as_ref()) {
        if m.default != c.default || model.default != c.default {
            redo.default = Some(c.default);
            undo.default = Some(model.default);
        }
        redo.default_value = Some(c.default_value.clone().unwrap_or(Value::Null));
        undo.default_value = Some(model.default_value.clone().unwrap_or(Value::Null));
    }

    // A primary key change can flip the implied flags; pin them explicitly.
    let mut applied = model.clone();
    redo.apply(&mut applied);
    let applied = normalized(&applied);
    if applied.required != c.required {
        redo.required = Some(c.required);
        undo.required = Some(model.required);
    }
    if applied.unique != c.unique {
        redo.unique = Some(c.unique);
        undo.unique = Some(model.unique);
    }

    if redo.is_empty() {
        None
    } else {
        Some((redo, undo))
    }
}

/// Model field order while a batch runs, used to compute insert positions.
struct Layout(Vec<String>);

impl Layout {
    fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    fn remove(&mut self, name: &str) -> Option<usize> {
        let idx = self.0.iter().position(|n| n == name)?;
        self.0.remove(idx);
        Some(idx)
    }

    fn insert_after(&mut self, prev: Option<&str>, name: &str) -> usize {
        let idx = prev
            .and_then(|p| self.0.iter().position(|n| n == p))
            .map(|i| i + 1)
            .unwrap_or(0);
        self.0.insert(idx, name.to_string());
        idx
    }
}

#[derive(Default)]
struct TableDiff {
    relation_removals: Vec<DiffItem>,
    fields: Vec<DiffItem>,
    relation_additions: Vec<DiffItem>,
}

/// Relation removals for `entity`. Each undo carries the index the relation had when it
/// was removed, so replaying the undos backwards restores the original order.
fn relation_removals(
    entity: &Entity,
    columns: Option<&[&ColumnDescriptor]>,
    junction_live: &dyn Fn(&Relation) -> bool,
    layout: &mut Layout,
) -> Result<Vec<DiffItem>, AppError> {
    let name = entity.name.as_str();
    let mut out = Vec::new();
    for (i, rel) in entity.relations.iter().enumerate() {
        let (field, position) = match rel {
            Relation::BelongsTo { field: fk_field, .. } => {
                // Without a table the whole entity goes; its FKs travel with it.
                let Some(cols) = columns else {
                    continue;
                };
                let live = cols.iter().find(|c| &c.name == fk_field).and_then(|c| c.fk.as_ref());
                if matches!(live, Some(fk) if relation_matches(rel, fk)) {
                    continue;
                }
                (entity.field(fk_field).cloned(), layout.remove(fk_field))
            }
            Relation::BelongsToMany { .. } => {
                if junction_live(rel) {
                    continue;
                }
                (None, None)
            }
            Relation::HasMany { .. } => continue,
        };
        let index = i - out.len();
        out.push(DiffItem::new(
            Action::delete_relation(name, rel.clone())?,
            Action::restore_relation(
                name,
                RelationPayload {
                    relation: rel.clone(),
                    field,
                    position,
                    index: Some(index),
                },
            )?,
        ));
    }
    Ok(out)
}

fn compare_table(
    kind: DialectKind,
    entity: &Entity,
    columns: &[ColumnDescriptor],
    junction_live: &dyn Fn(&Relation) -> bool,
) -> Result<TableDiff, AppError> {
    let name = entity.name.as_str();
    let cols: Vec<&ColumnDescriptor> = columns.iter().filter(|c| !is_bookkeeping(&c.name)).collect();
    let column = |n: &str| cols.iter().copied().find(|c| c.name == n);
    let mut layout = Layout(entity.fields.iter().map(|f| f.name.clone()).collect());
    let mut out = TableDiff {
        relation_removals: relation_removals(entity, Some(cols.as_slice()), junction_live, &mut layout)?,
        ..Default::default()
    };

    // Plain fields: deletions in model order, then changes.
    let mut deletions = Vec::new();
    let mut changes = Vec::new();
    for f in &entity.fields {
        if is_bookkeeping(&f.name) || (f.is_relation && entity.belongs_to(&f.name).is_some()) {
            continue;
        }
        match column(&f.name) {
            Some(c) if c.fk.is_none() => {
                let live = catalog_field(kind, name, c)?;
                if let Some((redo, undo)) = column_patches(f, &live) {
                    changes.push(DiffItem::new(
                        Action::change_field(name, &f.name, redo)?,
                        Action::change_field(name, &f.name, undo)?,
                    ));
                }
            }
            // Missing column, or the column became a foreign key.
            _ => {
                let position = layout.remove(&f.name);
                deletions.push(DiffItem::new(
                    Action::delete_field(name, &f.name),
                    Action::add_field(name, f.clone(), position)?,
                ));
            }
        }
    }
    out.fields.extend(deletions);
    out.fields.extend(changes);

    // New plain columns, placed after the previous catalog column the model has.
    let mut prev: Option<&str> = None;
    for c in &cols {
        if layout.contains(&c.name) {
            prev = Some(c.name.as_str());
            continue;
        }
        if c.fk.is_some() {
            continue;
        }
        let field = catalog_field(kind, name, c)?;
        let position = layout.insert_after(prev, &c.name);
        out.fields.push(DiffItem::new(
            Action::add_field(name, field, Some(position))?,
            Action::delete_field(name, &c.name),
        ));
        prev = Some(c.name.as_str());
    }

    // New foreign key columns become belongsTo relations with their field.
    let mut prev: Option<&str> = None;
    for c in &cols {
        if layout.contains(&c.name) {
            prev = Some(c.name.as_str());
            continue;
        }
        let Some(fk) = &c.fk else {
            continue;
        };
        let rel = catalog_relation(c, fk);
        let field = catalog_field(kind, name, c)?;
        let position = layout.insert_after(prev, &c.name);
        out.relation_additions.push(DiffItem::new(
            Action::add_relation(name, rel.clone(), Some(field), Some(position))?,
            Action::delete_relation(name, rel)?,
        ));
        prev = Some(c.name.as_str());
    }
    Ok(out)
}

/// Entity built from a catalog table: every column becomes a field, foreign keys also
/// become belongsTo relations.
pub fn synthesize(kind: DialectKind, table: &str, columns: &[ColumnDescriptor]) -> Result<Entity, AppError> {
    let mut entity = Entity::new(table);
    for c in columns.iter().filter(|c| !is_bookkeeping(&c.name)) {
        entity.fields.push(catalog_field(kind, table, c)?);
        if let Some(fk) = &c.fk {
            entity.relations.push(catalog_relation(c, fk));
        }
    }
    Ok(entity)
}

/// Order `names` so that every name comes after the names it depends on.
fn parents_first<F>(names: &[String], deps: F) -> Vec<String>
where
    F: Fn(&str) -> Vec<String>,
{
    fn visit<F: Fn(&str) -> Vec<String>>(
        name: &str,
        set: &BTreeSet<&str>,
        deps: &F,
        seen: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        if !seen.insert(name.to_string()) {
            return;
        }
        for d in deps(name) {
            if set.contains(d.as_str()) {
                visit(&d, set, deps, seen, out);
            }
        }
        out.push(name.to_string());
    }
    let set: BTreeSet<&str> = names.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(names.len());
    for n in names {
        visit(n, &set, &deps, &mut seen, &mut out);
    }
    out
}

fn is_plain_entity(entities: &BTreeMap<String, Entity>, name: &str) -> bool {
    entities.get(name).map(|e| !e.is_junction()).unwrap_or(false)
}

/// Compare the model against a catalog snapshot.
pub fn compare(kind: DialectKind, entities: &BTreeMap<String, Entity>, catalog: &Catalog) -> Result<Diff, AppError> {
    let junctions: BTreeMap<&str, Junction> = catalog
        .iter()
        .filter(|(table, _)| !is_plain_entity(entities, table))
        .filter_map(|(table, cols)| junction(table, cols).map(|j| (table.as_str(), j)))
        .collect();

    let mut diff = Diff::default();
    let mut removals = Vec::new();
    let mut additions = Vec::new();
    let mut model_only = Vec::new();

    for (name, entity) in entities.iter().filter(|(_, e)| !e.is_junction()) {
        let junction_live = |rel: &Relation| {
            rel.through()
                .and_then(|t| junctions.get(t))
                .map(|j| j.relations().iter().any(|(e, r)| e == name && r == rel))
                .unwrap_or(false)
        };
        match catalog.get(name) {
            Some(columns) => {
                let table = compare_table(kind, entity, columns, &junction_live)?;
                removals.extend(table.relation_removals);
                diff.fields.extend(table.fields);
                additions.extend(table.relation_additions);
            }
            None => {
                let mut layout = Layout(Vec::new());
                removals.extend(relation_removals(entity, None, &junction_live, &mut layout)?);
                model_only.push(name.clone());
            }
        }
    }

    for j in junctions.values() {
        for (entity, rel) in j.relations() {
            let present = entities
                .get(&entity)
                .map(|e| e.relations.contains(&rel))
                .unwrap_or(false);
            if !present {
                additions.push(DiffItem::new(
                    Action::add_relation(&entity, rel.clone(), None, None)?,
                    Action::delete_relation(&entity, rel)?,
                ));
            }
        }
    }

    let catalog_only: Vec<String> = catalog
        .keys()
        .filter(|t| !is_plain_entity(entities, t) && !junctions.contains_key(t.as_str()))
        .cloned()
        .collect();

    // Entities in database execution order: drops children first, then creates parents first.
    let mut drops = parents_first(&catalog_only, |t| {
        catalog
            .get(t)
            .map(|cols| cols.iter().filter_map(|c| c.fk.as_ref().map(|f| f.table.clone())).collect())
            .unwrap_or_default()
    });
    drops.reverse();
    for table in drops {
        let columns = catalog.get(&table).map(Vec::as_slice).unwrap_or(&[]);
        let entity = synthesize(kind, &table, columns)?;
        diff.entities.push(DiffItem::new(
            Action::create_entity(&entity)?,
            Action::delete_entity(&table),
        ));
    }
    let creates = parents_first(&model_only, |n| {
        entities
            .get(n)
            .map(|e| e.relations.iter().filter(|r| r.local_field().is_some()).map(|r| r.target_entity().to_string()).collect())
            .unwrap_or_default()
    });
    for name in creates {
        let Some(entity) = entities.get(&name) else {
            continue;
        };
        // belongsToMany links travel as their own relation items.
        let mut payload = entity.clone();
        payload.relations.retain(|r| r.through().is_none());
        diff.entities.push(DiffItem::new(
            Action::delete_entity(&name),
            Action::create_entity(&payload)?,
        ));
    }

    diff.relations = removals;
    diff.relations.extend(additions);
    tracing::debug!(
        entities = diff.entities.len(),
        fields = diff.fields.len(),
        relations = diff.relations.len(),
        "computed diff"
    );
    Ok(diff)
}

//! SQLite dialect.
//!
//! SQLite only alters tables in place to add or rename columns. Every other column
//! change rebuilds the table: with foreign key enforcement suspended, the rows are copied
//! to a temporary table, the table is dropped and recreated with the new layout, the
//! rows are copied back and `PRAGMA foreign_key_check` must come back empty before commit.

use super::types::{cast_expression, render_default, sql_type, NOW};
use super::{
    ColumnDescriptor, ColumnSpec, ConstraintKind, ConstraintSpec, Dialect, DialectKind, DropConstraint, ForeignKeyRef,
    Uniqueness,
};
use crate::error::AppError;
use crate::model::FieldType;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use sqlx::{Connection, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;

const BACKUP_TABLE: &str = "_architect_rebuild";

/// Named table-level unique constraints as written in `CREATE TABLE`.
const NAMED_UNIQUE_PATTERN: &str = r#"(?i)CONSTRAINT\s+("(?:[^"]|"")+"|\w+)\s+UNIQUE\s*\(([^)]*)\)"#;

fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn unquoted(s: &str) -> String {
    let s = s.trim();
    match s.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => s.to_string(),
    }
}

/// Names of the `CONSTRAINT <name> UNIQUE (...)` clauses in a table definition, with
/// their columns. SQLite backs them with `sqlite_autoindex_*` indexes and keeps the
/// name only in this text.
fn named_unique_constraints(sql: &str) -> Result<Vec<(String, Vec<String>)>, AppError> {
    let re = Regex::new(NAMED_UNIQUE_PATTERN)
        .map_err(|_| AppError::Validation("invalid unique constraint pattern".into()))?;
    Ok(re
        .captures_iter(sql)
        .map(|c| (unquoted(&c[1]), c[2].split(',').map(unquoted).collect()))
        .collect())
}

fn fk_action(action: String) -> Option<String> {
    if action == "NO ACTION" {
        None
    } else {
        Some(action)
    }
}

struct IndexInfo {
    name: String,
    unique: bool,
    origin: String,
    columns: Vec<String>,
    sql: Option<String>,
}

/// Everything needed to recreate a table: columns in order, multi-column unique table
/// constraints (named or not) and explicitly created indexes, replayed from their SQL.
struct Layout {
    columns: Vec<(String, ColumnSpec)>,
    groups: Vec<(String, Vec<String>)>,
    indexes: Vec<IndexInfo>,
}

impl Layout {
    fn position(&self, table: &str, name: &str) -> Result<usize, AppError> {
        self.columns
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| AppError::not_found("column", format!("{}.{}", table, name)))
    }

    fn constraints(&self) -> Vec<ConstraintSpec> {
        self.groups
            .iter()
            .map(|(name, cols)| {
                let name = Some(name.clone()).filter(|n| !n.is_empty() && !n.starts_with("sqlite_autoindex_"));
                ConstraintSpec::unique(cols.clone(), name)
            })
            .collect()
    }

    fn has_unique(&self, fields: &[String]) -> bool {
        self.groups.iter().any(|(_, cols)| cols == fields)
            || self.indexes.iter().any(|i| i.unique && i.columns == fields)
    }

    /// Forget a multi-column unique constraint or unique index, by name or by a member column.
    fn drop_unique(&mut self, name: Option<&str>, field: Option<&str>) -> bool {
        let hit = |n: &str, cols: &[String]| match (name, field) {
            (Some(name), _) => n == name,
            (None, Some(field)) => cols.iter().any(|c| c == field),
            (None, None) => false,
        };
        if let Some(g) = self.groups.iter().position(|(n, cols)| hit(n.as_str(), cols.as_slice())) {
            self.groups.remove(g);
            return true;
        }
        if let Some(i) = self.indexes.iter().position(|i| i.unique && hit(i.name.as_str(), i.columns.as_slice())) {
            self.indexes.remove(i);
            return true;
        }
        false
    }

    /// Identity copy of every column currently in the layout.
    fn identity_copy(&self) -> Vec<(String, String)> {
        self.columns.iter().map(|(n, _)| (n.clone(), quoted(n))).collect()
    }
}

fn column_sql(name: &str, spec: &ColumnSpec, inline_primary: bool) -> String {
    let mut def = format!("{} {}", quoted(name), sql_type(DialectKind::Sqlite, spec.field_type, false));
    if inline_primary {
        def.push_str(" PRIMARY KEY");
        if spec.auto_increment && spec.field_type == FieldType::Number {
            def.push_str(" AUTOINCREMENT");
        }
    }
    if spec.not_null() && !spec.auto_increment {
        def.push_str(" NOT NULL");
    }
    if let (Some(v), false) = (&spec.default, spec.auto_increment) {
        def.push_str(" DEFAULT ");
        def.push_str(&render_default(DialectKind::Sqlite, spec.field_type, v));
    }
    if spec.unique && !spec.primary {
        def.push_str(" UNIQUE");
    }
    if let Some(r) = &spec.references {
        def.push_str(&format!(" REFERENCES {} ({}){}", quoted(&r.table), quoted(&r.column), r.actions_sql()));
    }
    def
}

fn table_sql(table: &str, columns: &[(String, ColumnSpec)], constraints: &[ConstraintSpec]) -> String {
    let mut pk: Vec<&str> = columns.iter().filter(|(_, s)| s.primary).map(|(n, _)| n.as_str()).collect();
    if pk.is_empty() {
        if let Some(c) = constraints.iter().find(|c| c.kind == ConstraintKind::Primary) {
            pk = c.fields.iter().map(String::as_str).collect();
        }
    }
    let mut defs: Vec<String> = columns
        .iter()
        .map(|(name, spec)| column_sql(name, spec, pk.len() == 1 && pk[0] == name.as_str()))
        .collect();
    if pk.len() > 1 {
        defs.push(format!("PRIMARY KEY ({})", pk.iter().map(|c| quoted(c)).collect::<Vec<_>>().join(", ")));
    }
    for c in constraints.iter().filter(|c| c.kind == ConstraintKind::Unique) {
        let cols = c.fields.iter().map(|f| quoted(f)).collect::<Vec<_>>().join(", ");
        match &c.name {
            Some(n) => defs.push(format!("CONSTRAINT {} UNIQUE ({})", quoted(n), cols)),
            None => defs.push(format!("UNIQUE ({})", cols)),
        }
    }
    format!("CREATE TABLE {} (\n  {}\n)", quoted(table), defs.join(",\n  "))
}

/// SQLite only auto-increments an `INTEGER PRIMARY KEY` column.
fn check_auto_increment(table: &str, name: &str, spec: &ColumnSpec) -> Result<(), AppError> {
    if spec.auto_increment && !(spec.primary && spec.field_type == FieldType::Number) {
        return Err(AppError::DialectUnsupported {
            dialect: DialectKind::Sqlite.name(),
            operation: format!("autoIncrement on {}.{} outside an integer primary key", table, name),
        });
    }
    Ok(())
}

fn is_now_default(spec: &ColumnSpec) -> bool {
    matches!(&spec.default, Some(Value::String(s)) if s.eq_ignore_ascii_case(NOW))
}

pub struct SqliteDialect {
    pool: SqlitePool,
}

impl SqliteDialect {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteDialect { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn exec(&self, sql: &str) -> Result<(), AppError> {
        tracing::debug!(sql = %sql, "ddl");
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn indexes(&self, table: &str) -> Result<Vec<IndexInfo>, AppError> {
        let list: Vec<(String, i64, String)> =
            sqlx::query_as(r#"SELECT name, "unique", origin FROM pragma_index_list(?1)"#)
                .bind(table)
                .fetch_all(&self.pool)
                .await?;
        let mut out = Vec::with_capacity(list.len());
        for (name, unique, origin) in list {
            let cols: Vec<(Option<String>,)> =
                sqlx::query_as("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
                    .bind(&name)
                    .fetch_all(&self.pool)
                    .await?;
            // Expression indexes report NULL column names.
            if cols.iter().any(|c| c.0.is_none()) {
                continue;
            }
            let sql: Option<(Option<String>,)> =
                sqlx::query_as("SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?1")
                    .bind(&name)
                    .fetch_optional(&self.pool)
                    .await?;
            out.push(IndexInfo {
                name,
                unique: unique != 0,
                origin,
                columns: cols.into_iter().filter_map(|c| c.0).collect(),
                sql: sql.and_then(|s| s.0),
            });
        }
        Ok(out)
    }

    async fn layout(&self, table: &str) -> Result<Layout, AppError> {
        let descriptors = self.describe_table(table).await?;
        if descriptors.is_empty() {
            return Err(AppError::not_found("table", table));
        }
        let mut columns = descriptors
            .iter()
            .map(|c| Ok((c.name.clone(), ColumnSpec::from_descriptor(DialectKind::Sqlite, table, c)?)))
            .collect::<Result<Vec<_>, AppError>>()?;
        let named = match self.table_definition(table).await? {
            Some(sql) => named_unique_constraints(&sql)?,
            None => Vec::new(),
        };
        let mut groups = Vec::new();
        let mut indexes = Vec::new();
        for index in self.indexes(table).await? {
            if index.origin == "c" && index.sql.is_some() {
                // The replayed index carries the uniqueness; do not inline it as well.
                if let ([only], true) = (index.columns.as_slice(), index.unique) {
                    if let Some((_, spec)) = columns.iter_mut().find(|(n, _)| n == only) {
                        spec.unique = false;
                    }
                }
                indexes.push(index);
            } else if index.unique && index.origin != "pk" && index.columns.len() > 1 {
                let name = named
                    .iter()
                    .find(|(_, cols)| cols == &index.columns)
                    .map(|(n, _)| n.clone())
                    .unwrap_or_default();
                groups.push((name, index.columns));
            }
        }
        Ok(Layout {
            columns,
            groups,
            indexes,
        })
    }

    /// Recreate `table` with `layout`, filling each target column from a select
    /// expression over the old rows.
    async fn rebuild(&self, table: &str, layout: &Layout, copy: &[(String, String)]) -> Result<(), AppError> {
        let backup = format!("temp.{}", quoted(BACKUP_TABLE));
        let mut statements = vec![
            format!("DROP TABLE IF EXISTS {}", backup),
            format!("CREATE TEMP TABLE {} AS SELECT * FROM {}", quoted(BACKUP_TABLE), quoted(table)),
            format!("DROP TABLE {}", quoted(table)),
            table_sql(table, &layout.columns, &layout.constraints()),
        ];
        if !copy.is_empty() {
            let targets = copy.iter().map(|(t, _)| quoted(t)).collect::<Vec<_>>().join(", ");
            let exprs = copy.iter().map(|(_, e)| e.as_str()).collect::<Vec<_>>().join(", ");
            statements.push(format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                quoted(table),
                targets,
                exprs,
                backup
            ));
        }
        statements.push(format!("DROP TABLE {}", backup));
        for index in &layout.indexes {
            let survives = index
                .columns
                .iter()
                .all(|c| layout.columns.iter().any(|(n, _)| n == c));
            if let (true, Some(sql)) = (survives, &index.sql) {
                statements.push(sql.clone());
            }
        }

        tracing::info!(table = %table, columns = layout.columns.len(), "rebuilding sqlite table");
        let mut conn = self.pool.acquire().await?;
        sqlx::query("PRAGMA foreign_keys = OFF").execute(&mut *conn).await?;
        let result = run_rebuild(&mut *conn, table, &statements).await;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
        result
    }

    /// The `CREATE TABLE` text SQLite keeps for `table`.
    async fn table_definition(&self, table: &str) -> Result<Option<String>, AppError> {
        let sql: Option<(Option<String>,)> =
            sqlx::query_as("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1")
                .bind(table)
                .fetch_optional(&self.pool)
                .await?;
        Ok(sql.and_then(|s| s.0))
    }

    async fn auto_increment_declared(&self, table: &str) -> Result<bool, AppError> {
        Ok(self
            .table_definition(table)
            .await?
            .map(|s| s.to_uppercase().contains("AUTOINCREMENT"))
            .unwrap_or(false))
    }

    async fn primary_column(&self, table: &str) -> Result<Option<String>, AppError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info(?1) WHERE pk = 1")
            .bind(table)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }
}

async fn run_rebuild(conn: &mut SqliteConnection, table: &str, statements: &[String]) -> Result<(), AppError> {
    let mut tx = conn.begin().await?;
    for sql in statements {
        tracing::debug!(sql = %sql, "ddl");
        sqlx::query(sql).execute(&mut *tx).await?;
    }
    let violations = sqlx::query("PRAGMA foreign_key_check").fetch_all(&mut *tx).await?;
    if !violations.is_empty() {
        tx.rollback().await?;
        return Err(AppError::Validation(format!(
            "rebuilding '{}' leaves {} foreign key violation(s)",
            table,
            violations.len()
        )));
    }
    tx.commit().await?;
    Ok(())
}

#[async_trait]
impl Dialect for SqliteDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Sqlite
    }

    fn quote_ident(&self, name: &str) -> String {
        quoted(name)
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").fetch_optional(&self.pool).await?;
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>, AppError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDescriptor>, AppError> {
        let rows: Vec<(String, String, i64, Option<String>, i64)> = sqlx::query_as(
            r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let single_pk = rows.iter().filter(|r| r.4 > 0).count() == 1;
        let autoincrement = single_pk && self.auto_increment_declared(table).await?;

        let mut columns: Vec<ColumnDescriptor> = rows
            .into_iter()
            .map(|(name, raw_type, notnull, default, pk)| {
                let auto_increment = autoincrement && pk > 0 && raw_type.eq_ignore_ascii_case("integer");
                ColumnDescriptor {
                    name,
                    raw_type,
                    allow_null: notnull == 0 && pk == 0,
                    primary_key: pk > 0,
                    unique: Uniqueness::None,
                    auto_increment,
                    default_value: default,
                    fk: None,
                }
            })
            .collect();

        for index in self.indexes(table).await? {
            if !index.unique || index.origin == "pk" {
                continue;
            }
            for col in columns.iter_mut().filter(|c| index.columns.contains(&c.name)) {
                if index.columns.len() == 1 {
                    col.unique = Uniqueness::Column;
                } else if col.unique == Uniqueness::None {
                    col.unique = Uniqueness::Group(index.name.clone());
                }
            }
        }

        let fks: Vec<(i64, String, String, Option<String>, String, String)> = sqlx::query_as(
            r#"SELECT id, "table", "from", "to", on_update, on_delete FROM pragma_foreign_key_list(?1)"#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        let mut per_id: BTreeMap<i64, usize> = BTreeMap::new();
        for fk in &fks {
            *per_id.entry(fk.0).or_default() += 1;
        }
        for (id, ref_table, from, to, on_update, on_delete) in fks {
            if per_id.get(&id) != Some(&1) {
                continue;
            }
            let ref_column = match to {
                Some(c) => c,
                None => match self.primary_column(&ref_table).await? {
                    Some(c) => c,
                    None => continue,
                },
            };
            if let Some(col) = columns.iter_mut().find(|c| c.name == from) {
                col.fk = Some(ForeignKeyRef {
                    table: ref_table,
                    column: ref_column,
                    on_update: fk_action(on_update),
                    on_delete: fk_action(on_delete),
                });
            }
        }
        Ok(columns)
    }

    async fn create_table(
        &self,
        table: &str,
        columns: &[(String, ColumnSpec)],
        constraints: &[ConstraintSpec],
    ) -> Result<(), AppError> {
        self.exec(&table_sql(table, columns, constraints)).await
    }

    async fn drop_table(&self, table: &str) -> Result<(), AppError> {
        self.exec(&format!("DROP TABLE {}", quoted(table))).await
    }

    async fn rename_table(&self, from: &str, to: &str) -> Result<(), AppError> {
        self.exec(&format!("ALTER TABLE {} RENAME TO {}", quoted(from), quoted(to))).await
    }

    async fn add_column(&self, table: &str, name: &str, spec: &ColumnSpec) -> Result<(), AppError> {
        check_auto_increment(table, name, spec)?;
        let native = !spec.primary
            && !spec.unique
            && !(spec.not_null() && spec.default.is_none())
            && !is_now_default(spec);
        if native {
            let sql = format!("ALTER TABLE {} ADD COLUMN {}", quoted(table), column_sql(name, spec, false));
            return self.exec(&sql).await;
        }
        let mut layout = self.layout(table).await?;
        if layout.columns.iter().any(|(n, _)| n == name) {
            return Err(AppError::Conflict(format!("column '{}.{}' already exists", table, name)));
        }
        let copy = layout.identity_copy();
        layout.columns.push((name.to_string(), spec.clone()));
        self.rebuild(table, &layout, &copy).await
    }

    async fn remove_column(&self, table: &str, name: &str) -> Result<(), AppError> {
        let mut layout = self.layout(table).await?;
        let idx = layout.position(table, name)?;
        layout.columns.remove(idx);
        layout.groups.retain(|(_, cols)| !cols.iter().any(|c| c == name));
        layout.indexes.retain(|i| !i.columns.iter().any(|c| c == name));
        let copy = layout.identity_copy();
        self.rebuild(table, &layout, &copy).await
    }

    async fn rename_column(&self, table: &str, from: &str, to: &str) -> Result<(), AppError> {
        self.exec(&format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            quoted(table),
            quoted(from),
            quoted(to)
        ))
        .await
    }

    async fn change_column(&self, table: &str, name: &str, spec: &ColumnSpec) -> Result<(), AppError> {
        check_auto_increment(table, name, spec)?;
        let mut layout = self.layout(table).await?;
        let idx = layout.position(table, name)?;
        let mut copy = layout.identity_copy();
        let from = layout.columns[idx].1.field_type;
        let mut expr = cast_expression(DialectKind::Sqlite, &quoted(name), from, spec.field_type)
            .unwrap_or_else(|| quoted(name));
        if let (true, Some(default)) = (spec.not_null(), &spec.default) {
            expr = format!(
                "COALESCE({}, {})",
                expr,
                render_default(DialectKind::Sqlite, spec.field_type, default)
            );
        }
        copy[idx].1 = expr;
        layout.columns[idx].1 = spec.clone();
        self.rebuild(table, &layout, &copy).await
    }

    async fn add_constraint(&self, table: &str, constraint: &ConstraintSpec) -> Result<(), AppError> {
        let mut layout = self.layout(table).await?;
        for f in &constraint.fields {
            layout.position(table, f)?;
        }
        match constraint.kind {
            ConstraintKind::Primary => {
                for (n, spec) in layout.columns.iter_mut() {
                    spec.primary = constraint.fields.contains(n);
                    if !spec.primary {
                        spec.auto_increment = false;
                    }
                }
            }
            ConstraintKind::Unique if constraint.fields.len() == 1 => {
                let idx = layout.position(table, &constraint.fields[0])?;
                layout.columns[idx].1.unique = true;
            }
            ConstraintKind::Unique => {
                if !layout.has_unique(&constraint.fields) {
                    let name = constraint.name.clone().unwrap_or_default();
                    layout.groups.push((name, constraint.fields.clone()));
                }
            }
        }
        let copy = layout.identity_copy();
        self.rebuild(table, &layout, &copy).await
    }

    async fn drop_constraint(&self, table: &str, constraint: &DropConstraint) -> Result<(), AppError> {
        let mut layout = self.layout(table).await?;
        match constraint.kind {
            ConstraintKind::Primary => {
                for (_, spec) in layout.columns.iter_mut() {
                    spec.primary = false;
                    spec.auto_increment = false;
                }
            }
            ConstraintKind::Unique => {
                let dropped = if let Some(name) = &constraint.name {
                    layout.drop_unique(Some(name.as_str()), None)
                } else if let Some(field) = &constraint.field {
                    let idx = layout.position(table, field)?;
                    if layout.columns[idx].1.unique {
                        layout.columns[idx].1.unique = false;
                        true
                    } else {
                        layout.drop_unique(None, Some(field.as_str()))
                    }
                } else {
                    false
                };
                if !dropped {
                    let what = constraint.name.clone().or_else(|| constraint.field.clone()).unwrap_or_default();
                    return Err(AppError::not_found("constraint", format!("{}.{}", table, what)));
                }
            }
        }
        let copy = layout.identity_copy();
        self.rebuild(table, &layout, &copy).await
    }

    async fn cast_column_type(
        &self,
        table: &str,
        column: &str,
        from: FieldType,
        to: FieldType,
    ) -> Result<bool, AppError> {
        let mut layout = self.layout(table).await?;
        let idx = layout.position(table, column)?;
        let mut copy = layout.identity_copy();
        let expr = cast_expression(DialectKind::Sqlite, &quoted(column), from, to);
        let converted = expr.is_some();
        if let Some(e) = expr {
            copy[idx].1 = e;
        }
        layout.columns[idx].1.field_type = to;
        self.rebuild(table, &layout, &copy).await?;
        Ok(converted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn dialect() -> SqliteDialect {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteDialect::new(pool)
    }

    fn col(field_type: FieldType) -> ColumnSpec {
        ColumnSpec {
            field_type,
            primary: false,
            unique: false,
            required: false,
            auto_increment: false,
            default: None,
            references: None,
        }
    }

    fn id() -> ColumnSpec {
        ColumnSpec {
            primary: true,
            auto_increment: true,
            ..col(FieldType::Number)
        }
    }

    #[test]
    fn create_sql_inlines_single_primary_key() {
        let sql = table_sql(
            "user",
            &[("id".into(), id()), ("email".into(), ColumnSpec { unique: true, ..col(FieldType::Text) })],
            &[],
        );
        assert!(sql.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("\"email\" TEXT UNIQUE"));
    }

    #[tokio::test]
    async fn describes_autoincrement_and_defaults() {
        let d = dialect().await;
        let mut status = col(FieldType::Text);
        status.default = Some(Value::String("active".into()));
        d.create_table("user", &[("id".into(), id()), ("status".into(), status)], &[])
            .await
            .unwrap();
        let cols = d.describe_table("user").await.unwrap();
        assert!(cols[0].primary_key && cols[0].auto_increment);
        assert_eq!(cols[1].default_value.as_deref(), Some("'active'"));
        assert!(d.describe_table("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_increment_needs_an_integer_key() {
        let d = dialect().await;
        d.create_table("t", &[("id".into(), id()), ("code".into(), col(FieldType::Text))], &[])
            .await
            .unwrap();
        let spec = ColumnSpec {
            auto_increment: true,
            ..col(FieldType::Text)
        };
        let err = d.change_column("t", "code", &spec).await.unwrap_err();
        assert!(matches!(err, AppError::DialectUnsupported { dialect: "sqlite", .. }));
        let names: Vec<_> = d.describe_table("t").await.unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["id", "code"]);
    }

    #[tokio::test]
    async fn remove_column_rebuilds_and_keeps_rows() {
        let d = dialect().await;
        d.create_table(
            "item",
            &[
                ("id".into(), id()),
                ("a".into(), col(FieldType::Text)),
                ("b".into(), col(FieldType::Text)),
            ],
            &[],
        )
        .await
        .unwrap();
        sqlx::query("INSERT INTO item (a, b) VALUES ('x', 'y')")
            .execute(d.pool())
            .await
            .unwrap();
        d.remove_column("item", "a").await.unwrap();
        let names: Vec<_> = d.describe_table("item").await.unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["id", "b"]);
        let (b,): (String,) = sqlx::query_as("SELECT b FROM item").fetch_one(d.pool()).await.unwrap();
        assert_eq!(b, "y");
    }

    #[tokio::test]
    async fn cast_text_to_number_nulls_garbage() {
        let d = dialect().await;
        d.create_table("t", &[("id".into(), id()), ("n".into(), col(FieldType::Text))], &[])
            .await
            .unwrap();
        sqlx::query("INSERT INTO t (n) VALUES ('12'), ('abc')")
            .execute(d.pool())
            .await
            .unwrap();
        assert!(d.cast_column_type("t", "n", FieldType::Text, FieldType::Number).await.unwrap());
        let rows: Vec<(Option<i64>,)> = sqlx::query_as("SELECT n FROM t ORDER BY id").fetch_all(d.pool()).await.unwrap();
        assert_eq!(rows, vec![(Some(12),), (None,)]);
        let cols = d.describe_table("t").await.unwrap();
        assert_eq!(cols[1].field_type(DialectKind::Sqlite, "t").unwrap(), FieldType::Number);
    }

    #[tokio::test]
    async fn rebuild_keeps_constraint_names_and_unique_indexes() {
        let d = dialect().await;
        d.create_table(
            "member",
            &[
                ("id".into(), id()),
                ("team".into(), col(FieldType::Number)),
                ("user".into(), col(FieldType::Number)),
                ("role".into(), col(FieldType::Text)),
                ("note".into(), col(FieldType::Text)),
            ],
            &[ConstraintSpec::unique(vec!["team".into(), "user".into()], Some("member_team_user_key".into()))],
        )
        .await
        .unwrap();
        d.exec(r#"CREATE UNIQUE INDEX "member_user_role_idx" ON "member" ("user", "role")"#)
            .await
            .unwrap();
        d.exec(r#"INSERT INTO "member" ("team", "user", "role", "note") VALUES (1, 2, 'owner', 'x')"#)
            .await
            .unwrap();

        d.remove_column("member", "note").await.unwrap();
        let definition = d.table_definition("member").await.unwrap().unwrap();
        assert!(definition.contains(r#"CONSTRAINT "member_team_user_key" UNIQUE ("team", "user")"#));
        assert!(!definition.contains("member_user_role_idx"));
        let index: Option<(String,)> = sqlx::query_as("SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?1")
            .bind("member_user_role_idx")
            .fetch_optional(d.pool())
            .await
            .unwrap();
        assert!(index.is_some());
        let dup = d
            .exec(r#"INSERT INTO "member" ("team", "user", "role") VALUES (3, 2, 'owner')"#)
            .await;
        assert!(dup.is_err());

        d.drop_constraint("member", &DropConstraint::by_name(ConstraintKind::Unique, "member_team_user_key"))
            .await
            .unwrap();
        let definition = d.table_definition("member").await.unwrap().unwrap();
        assert!(!definition.contains("member_team_user_key"));

        d.remove_column("member", "role").await.unwrap();
        let left: Vec<(String,)> = sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'member'")
            .fetch_all(d.pool())
            .await
            .unwrap();
        assert!(left.is_empty());
        let (rows,): (i64,) = sqlx::query_as(r#"SELECT COUNT(*) FROM "member""#)
            .fetch_one(d.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn reads_named_unique_constraints() {
        let sql = "CREATE TABLE \"t\" (\n  \"a\" INTEGER,\n  \"b\" INTEGER,\n  CONSTRAINT \"t_a_b_key\" UNIQUE (\"a\", \"b\"),\n  UNIQUE (\"b\", \"a\")\n)";
        let named = named_unique_constraints(sql).unwrap();
        assert_eq!(named, vec![("t_a_b_key".to_string(), vec!["a".to_string(), "b".to_string()])]);
    }

    #[tokio::test]
    async fn unique_groups_round_trip_through_constraints() {
        let d = dialect().await;
        d.create_table(
            "member",
            &[
                ("id".into(), id()),
                ("team".into(), col(FieldType::Number)),
                ("user".into(), col(FieldType::Number)),
            ],
            &[],
        )
        .await
        .unwrap();
        d.add_constraint("member", &ConstraintSpec::unique(vec!["team".into(), "user".into()], None))
            .await
            .unwrap();
        let cols = d.describe_table("member").await.unwrap();
        assert!(cols[1].unique.group().is_some());
        assert_eq!(cols[1].unique, cols[2].unique);

        d.drop_constraint("member", &DropConstraint::by_field(ConstraintKind::Unique, "user"))
            .await
            .unwrap();
        assert!(d.describe_table("member").await.unwrap().iter().all(|c| !c.unique.is_unique()));
    }
}

//! PostgreSQL dialect: information_schema / pg_catalog introspection and live ALTER TABLE.

use super::types::{cast_expression, defaults_equal, parse_default, render_default, sql_type};
use super::{
    find_column, ColumnDescriptor, ColumnSpec, ConstraintKind, ConstraintSpec, Dialect, DialectKind, DropConstraint,
    ForeignKeyRef, Uniqueness,
};
use crate::error::{AppError, ConfigError};
use crate::model::FieldType;
use async_trait::async_trait;
use sqlx::{ConnectOptions, PgPool};
use std::str::FromStr;

/// Quote identifier for PostgreSQL (safe: names come from validated definitions or the catalog).
fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

const COLUMNS_SQL: &str = r#"
    SELECT
        c.column_name::text,
        c.data_type::text,
        (c.is_nullable = 'YES') AS allow_null,
        c.column_default::text,
        (c.is_identity = 'YES') AS is_identity
    FROM information_schema.columns c
    WHERE c.table_schema = $1 AND c.table_name = $2
    ORDER BY c.ordinal_position
"#;

const KEYS_SQL: &str = r#"
    SELECT
        i.relname::text AS index_name,
        ix.indisprimary,
        array_agg(a.attname::text ORDER BY array_position(ix.indkey::int2[], a.attnum)) AS columns
    FROM pg_catalog.pg_index ix
    JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
    JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
    WHERE n.nspname = $1
      AND t.relname = $2
      AND (ix.indisunique OR ix.indisprimary)
    GROUP BY i.relname, ix.indisprimary
    ORDER BY i.relname
"#;

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT
        a.attname::text AS column_name,
        rt.relname::text AS ref_table,
        ra.attname::text AS ref_column,
        CASE c.confupdtype
            WHEN 'r' THEN 'RESTRICT'
            WHEN 'c' THEN 'CASCADE'
            WHEN 'n' THEN 'SET NULL'
            WHEN 'd' THEN 'SET DEFAULT'
            ELSE 'NO ACTION'
        END AS on_update,
        CASE c.confdeltype
            WHEN 'r' THEN 'RESTRICT'
            WHEN 'c' THEN 'CASCADE'
            WHEN 'n' THEN 'SET NULL'
            WHEN 'd' THEN 'SET DEFAULT'
            ELSE 'NO ACTION'
        END AS on_delete
    FROM pg_catalog.pg_constraint c
    JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_catalog.pg_class rt ON rt.oid = c.confrelid
    JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = c.conkey[1]
    JOIN pg_catalog.pg_attribute ra ON ra.attrelid = rt.oid AND ra.attnum = c.confkey[1]
    WHERE n.nspname = $1
      AND t.relname = $2
      AND c.contype = 'f'
      AND array_length(c.conkey, 1) = 1
"#;

const CONSTRAINT_BY_COLUMN_SQL: &str = r#"
    SELECT c.conname::text
    FROM pg_catalog.pg_constraint c
    JOIN pg_catalog.pg_class t ON t.oid = c.conrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(c.conkey)
    WHERE n.nspname = $1
      AND t.relname = $2
      AND c.contype::text = $3
      AND a.attname = $4
    ORDER BY array_length(c.conkey, 1)
    LIMIT 1
"#;

const UNIQUE_INDEX_BY_COLUMN_SQL: &str = r#"
    SELECT i.relname::text
    FROM pg_catalog.pg_index ix
    JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
    JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
    JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
    WHERE n.nspname = $1
      AND t.relname = $2
      AND ix.indisunique
      AND NOT ix.indisprimary
      AND a.attname = $3
    LIMIT 1
"#;

/// `NO ACTION` is the engine default; report it as unset.
fn fk_action(action: String) -> Option<String> {
    if action == "NO ACTION" {
        None
    } else {
        Some(action)
    }
}

pub struct PostgresDialect {
    pool: PgPool,
    schema: String,
}

impl PostgresDialect {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        PostgresDialect {
            pool,
            schema: schema.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quoted(&self.schema), quoted(table))
    }

    async fn exec(&self, sql: &str) -> Result<(), AppError> {
        tracing::debug!(sql = %sql, "ddl");
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    fn column_sql(&self, name: &str, spec: &ColumnSpec, inline_primary: bool) -> String {
        let mut def = format!("{} {}", quoted(name), sql_type(DialectKind::Postgres, spec.field_type, spec.auto_increment));
        if spec.primary && inline_primary {
            def.push_str(" PRIMARY KEY");
        } else if spec.not_null() {
            def.push_str(" NOT NULL");
        }
        if let (Some(v), false) = (&spec.default, spec.auto_increment) {
            def.push_str(" DEFAULT ");
            def.push_str(&render_default(DialectKind::Postgres, spec.field_type, v));
        }
        if spec.unique && !spec.primary {
            def.push_str(" UNIQUE");
        }
        if let Some(r) = &spec.references {
            def.push_str(&format!(" REFERENCES {} ({}){}", self.qualified(&r.table), quoted(&r.column), r.actions_sql()));
        }
        def
    }

    async fn constraint_name(&self, table: &str, contype: &str, column: &str) -> Result<Option<String>, AppError> {
        let name: Option<(String,)> = sqlx::query_as(CONSTRAINT_BY_COLUMN_SQL)
            .bind(&self.schema)
            .bind(table)
            .bind(contype)
            .bind(column)
            .fetch_optional(&self.pool)
            .await?;
        Ok(name.map(|n| n.0))
    }
}

#[async_trait]
impl Dialect for PostgresDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
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
            "SELECT table_name::text FROM information_schema.tables WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDescriptor>, AppError> {
        let rows: Vec<(String, String, bool, Option<String>, bool)> = sqlx::query_as(COLUMNS_SQL)
            .bind(&self.schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<(String, bool, Vec<String>)> = sqlx::query_as(KEYS_SQL)
            .bind(&self.schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;
        let fks: Vec<(String, String, String, String, String)> = sqlx::query_as(FOREIGN_KEYS_SQL)
            .bind(&self.schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        let mut columns: Vec<ColumnDescriptor> = rows
            .into_iter()
            .map(|(name, data_type, allow_null, default, is_identity)| {
                let serial = default
                    .as_deref()
                    .map(|d| d.starts_with("nextval("))
                    .unwrap_or(false);
                let auto_increment = is_identity || serial;
                ColumnDescriptor {
                    name,
                    raw_type: data_type,
                    allow_null,
                    primary_key: false,
                    unique: Uniqueness::None,
                    auto_increment,
                    default_value: if auto_increment { None } else { default },
                    fk: None,
                }
            })
            .collect();

        for (index_name, is_primary, cols) in &keys {
            for col in columns.iter_mut().filter(|c| cols.contains(&c.name)) {
                if *is_primary {
                    col.primary_key = true;
                } else if cols.len() == 1 {
                    col.unique = Uniqueness::Column;
                } else if col.unique == Uniqueness::None {
                    col.unique = Uniqueness::Group(index_name.clone());
                }
            }
        }
        for (column, ref_table, ref_column, on_update, on_delete) in fks {
            if let Some(col) = columns.iter_mut().find(|c| c.name == column) {
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
        let pk: Vec<&str> = columns.iter().filter(|(_, s)| s.primary).map(|(n, _)| n.as_str()).collect();
        let inline_primary = pk.len() == 1;
        let mut defs: Vec<String> = columns
            .iter()
            .map(|(name, spec)| self.column_sql(name, spec, inline_primary))
            .collect();
        if pk.len() > 1 {
            defs.push(format!("PRIMARY KEY ({})", pk.iter().map(|c| quoted(c)).collect::<Vec<_>>().join(", ")));
        }
        for c in constraints {
            let cols = c.fields.iter().map(|f| quoted(f)).collect::<Vec<_>>().join(", ");
            let prefix = c.name.as_deref().map(|n| format!("CONSTRAINT {} ", quoted(n))).unwrap_or_default();
            match c.kind {
                ConstraintKind::Unique => defs.push(format!("{}UNIQUE ({})", prefix, cols)),
                ConstraintKind::Primary if pk.is_empty() => defs.push(format!("{}PRIMARY KEY ({})", prefix, cols)),
                ConstraintKind::Primary => {}
            }
        }
        let sql = format!("CREATE TABLE {} (\n  {}\n)", self.qualified(table), defs.join(",\n  "));
        self.exec(&sql).await
    }

    async fn drop_table(&self, table: &str) -> Result<(), AppError> {
        self.exec(&format!("DROP TABLE {}", self.qualified(table))).await
    }

    async fn rename_table(&self, from: &str, to: &str) -> Result<(), AppError> {
        self.exec(&format!("ALTER TABLE {} RENAME TO {}", self.qualified(from), quoted(to)))
            .await
    }

    async fn add_column(&self, table: &str, name: &str, spec: &ColumnSpec) -> Result<(), AppError> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.qualified(table),
            self.column_sql(name, spec, true)
        );
        self.exec(&sql).await
    }

    async fn remove_column(&self, table: &str, name: &str) -> Result<(), AppError> {
        self.exec(&format!("ALTER TABLE {} DROP COLUMN {}", self.qualified(table), quoted(name)))
            .await
    }

    async fn rename_column(&self, table: &str, from: &str, to: &str) -> Result<(), AppError> {
        self.exec(&format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            self.qualified(table),
            quoted(from),
            quoted(to)
        ))
        .await
    }

    async fn change_column(&self, table: &str, name: &str, spec: &ColumnSpec) -> Result<(), AppError> {
        let current = find_column(self.describe_table(table).await?, table, name)?;
        let current_type = current.field_type(self.kind(), table)?;
        let t = self.qualified(table);
        let c = quoted(name);

        let type_changed = current_type != spec.field_type;
        if type_changed {
            if current.default_value.is_some() {
                self.exec(&format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", t, c)).await?;
            }
            self.cast_column_type(table, name, current_type, spec.field_type).await?;
        }

        if spec.auto_increment && !current.auto_increment {
            self.exec(&format!("ALTER TABLE {} ALTER COLUMN {} ADD GENERATED BY DEFAULT AS IDENTITY", t, c))
                .await?;
        } else if !spec.auto_increment && current.auto_increment {
            self.exec(&format!("ALTER TABLE {} ALTER COLUMN {} DROP IDENTITY IF EXISTS", t, c))
                .await?;
            self.exec(&format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", t, c)).await?;
        }

        if spec.primary && !current.primary_key {
            self.add_constraint(table, &ConstraintSpec::primary(vec![name.to_string()])).await?;
        } else if !spec.primary && current.primary_key {
            self.drop_constraint(table, &DropConstraint::by_field(ConstraintKind::Primary, name))
                .await?;
        }

        if spec.not_null() == current.allow_null {
            let action = if spec.not_null() { "SET NOT NULL" } else { "DROP NOT NULL" };
            self.exec(&format!("ALTER TABLE {} ALTER COLUMN {} {}", t, c, action)).await?;
        }

        if !spec.auto_increment {
            let current_default = if type_changed {
                None
            } else {
                current
                    .default_value
                    .as_deref()
                    .and_then(|d| parse_default(spec.field_type, d))
            };
            if !defaults_equal(current_default.as_ref(), spec.default.as_ref()) {
                let sql = match &spec.default {
                    Some(v) => format!(
                        "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                        t,
                        c,
                        render_default(DialectKind::Postgres, spec.field_type, v)
                    ),
                    None => format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", t, c),
                };
                self.exec(&sql).await?;
            }
        }

        let currently_unique = current.unique == Uniqueness::Column;
        let want_unique = spec.unique && !spec.primary;
        if want_unique && !currently_unique {
            let constraint = ConstraintSpec::unique(vec![name.to_string()], Some(format!("{}_{}_key", table, name)));
            self.add_constraint(table, &constraint).await?;
        } else if !want_unique && currently_unique {
            self.drop_constraint(table, &DropConstraint::by_field(ConstraintKind::Unique, name))
                .await?;
        }

        if spec.references != current.fk {
            if current.fk.is_some() {
                if let Some(fk_name) = self.constraint_name(table, "f", name).await? {
                    self.exec(&format!("ALTER TABLE {} DROP CONSTRAINT {}", t, quoted(&fk_name))).await?;
                }
            }
            if let Some(r) = &spec.references {
                self.exec(&format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}){}",
                    t,
                    quoted(&format!("{}_{}_fkey", table, name)),
                    c,
                    self.qualified(&r.table),
                    quoted(&r.column),
                    r.actions_sql()
                ))
                .await?;
            }
        }
        Ok(())
    }

    async fn add_constraint(&self, table: &str, constraint: &ConstraintSpec) -> Result<(), AppError> {
        let cols = constraint.fields.iter().map(|f| quoted(f)).collect::<Vec<_>>().join(", ");
        let prefix = constraint
            .name
            .as_deref()
            .map(|n| format!("CONSTRAINT {} ", quoted(n)))
            .unwrap_or_default();
        let kind = match constraint.kind {
            ConstraintKind::Primary => "PRIMARY KEY",
            ConstraintKind::Unique => "UNIQUE",
        };
        self.exec(&format!("ALTER TABLE {} ADD {}{} ({})", self.qualified(table), prefix, kind, cols))
            .await
    }

    async fn drop_constraint(&self, table: &str, constraint: &DropConstraint) -> Result<(), AppError> {
        let t = self.qualified(table);
        if let Some(name) = &constraint.name {
            return self.exec(&format!("ALTER TABLE {} DROP CONSTRAINT {}", t, quoted(name))).await;
        }
        let field = constraint
            .field
            .as_deref()
            .ok_or_else(|| AppError::Validation("drop constraint needs a name or a field".into()))?;
        let contype = match constraint.kind {
            ConstraintKind::Primary => "p",
            ConstraintKind::Unique => "u",
        };
        if let Some(name) = self.constraint_name(table, contype, field).await? {
            return self.exec(&format!("ALTER TABLE {} DROP CONSTRAINT {}", t, quoted(&name))).await;
        }
        // Unique indexes created outside of a constraint.
        if constraint.kind == ConstraintKind::Unique {
            let index: Option<(String,)> = sqlx::query_as(UNIQUE_INDEX_BY_COLUMN_SQL)
                .bind(&self.schema)
                .bind(table)
                .bind(field)
                .fetch_optional(&self.pool)
                .await?;
            if let Some((index,)) = index {
                return self
                    .exec(&format!("DROP INDEX {}.{}", quoted(&self.schema), quoted(&index)))
                    .await;
            }
        }
        Err(AppError::not_found("constraint", format!("{}.{}", table, field)))
    }

    async fn cast_column_type(
        &self,
        table: &str,
        column: &str,
        from: FieldType,
        to: FieldType,
    ) -> Result<bool, AppError> {
        let c = quoted(column);
        let Some(expr) = cast_expression(DialectKind::Postgres, &c, from, to) else {
            return Ok(false);
        };
        self.exec(&format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}",
            self.qualified(table),
            c,
            sql_type(DialectKind::Postgres, to, false),
            expr
        ))
        .await?;
        Ok(true)
    }
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), AppError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| ConfigError::UnsupportedUrl(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await?;
    if !exists.0 {
        tracing::info!(database = %db_name, "creating database");
        sqlx::query(&format!("CREATE DATABASE {}", quoted(&db_name)))
            .execute(&mut conn)
            .await?;
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), ConfigError> {
    let path_start = url
        .rfind('/')
        .ok_or_else(|| ConfigError::UnsupportedUrl("DATABASE_URL: no path".into()))?
        + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    let admin_url = format!("{}postgres", base);
    Ok((admin_url, db_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_url_targets_postgres_database() {
        let (admin, db) = parse_db_name_from_url("postgres://u:p@localhost:5432/app?sslmode=disable").unwrap();
        assert_eq!(admin, "postgres://u:p@localhost:5432/postgres");
        assert_eq!(db, "app");
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quoted("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn fk_no_action_is_unset() {
        assert_eq!(fk_action("NO ACTION".into()), None);
        assert_eq!(fk_action("CASCADE".into()), Some("CASCADE".into()));
    }
}

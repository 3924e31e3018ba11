//! MySQL dialect: information_schema introspection, MODIFY COLUMN, temp-column casts.
//!
//! MySQL DDL commits implicitly, so a failed multi-statement change is not rolled back.

use super::types::{cast_expression, defaults_equal, parse_default, render_default, sql_type};
use super::{
    find_column, ColumnDescriptor, ColumnSpec, ConstraintKind, ConstraintSpec, Dialect, DialectKind, DropConstraint,
    ForeignKeyRef, Uniqueness,
};
use crate::error::AppError;
use crate::model::FieldType;
use async_trait::async_trait;
use sqlx::MySqlPool;
use std::collections::BTreeMap;

fn quoted(s: &str) -> String {
    format!("`{}`", s.replace('`', "``"))
}

fn fk_action(action: String) -> Option<String> {
    if action == "NO ACTION" {
        None
    } else {
        Some(action)
    }
}

const COLUMNS_SQL: &str = r#"
    SELECT
        CAST(COLUMN_NAME AS CHAR),
        CAST(COLUMN_TYPE AS CHAR),
        CAST(IS_NULLABLE AS CHAR),
        CAST(COLUMN_DEFAULT AS CHAR),
        CAST(EXTRA AS CHAR)
    FROM information_schema.COLUMNS
    WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
    ORDER BY ORDINAL_POSITION
"#;

const KEYS_SQL: &str = r#"
    SELECT
        CAST(INDEX_NAME AS CHAR),
        CAST(COLUMN_NAME AS CHAR),
        CAST(NON_UNIQUE AS SIGNED)
    FROM information_schema.STATISTICS
    WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
    ORDER BY INDEX_NAME, SEQ_IN_INDEX
"#;

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT
        CAST(k.CONSTRAINT_NAME AS CHAR),
        CAST(k.COLUMN_NAME AS CHAR),
        CAST(k.REFERENCED_TABLE_NAME AS CHAR),
        CAST(k.REFERENCED_COLUMN_NAME AS CHAR),
        CAST(r.UPDATE_RULE AS CHAR),
        CAST(r.DELETE_RULE AS CHAR)
    FROM information_schema.KEY_COLUMN_USAGE k
    JOIN information_schema.REFERENTIAL_CONSTRAINTS r
      ON r.CONSTRAINT_SCHEMA = k.CONSTRAINT_SCHEMA AND r.CONSTRAINT_NAME = k.CONSTRAINT_NAME
    WHERE k.TABLE_SCHEMA = DATABASE()
      AND k.TABLE_NAME = ?
      AND k.REFERENCED_TABLE_NAME IS NOT NULL
"#;

type FkRow = (String, String, String, String, String, String);

pub struct MysqlDialect {
    pool: MySqlPool,
}

impl MysqlDialect {
    pub fn new(pool: MySqlPool) -> Self {
        MysqlDialect { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn exec(&self, sql: &str) -> Result<(), AppError> {
        tracing::debug!(sql = %sql, "ddl");
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Column definition without key clauses; keys are table-level in MySQL.
    fn column_sql(&self, name: &str, spec: &ColumnSpec) -> String {
        let mut def = format!("{} {}", quoted(name), sql_type(DialectKind::Mysql, spec.field_type, false));
        def.push_str(if spec.not_null() { " NOT NULL" } else { " NULL" });
        if spec.auto_increment {
            def.push_str(" AUTO_INCREMENT");
        } else if let Some(v) = &spec.default {
            def.push_str(" DEFAULT ");
            def.push_str(&render_default(DialectKind::Mysql, spec.field_type, v));
        }
        def
    }

    fn foreign_key_sql(&self, table: &str, column: &str, fk: &ForeignKeyRef) -> String {
        format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}){}",
            quoted(&format!("{}_{}_fk", table, column)),
            quoted(column),
            quoted(&fk.table),
            quoted(&fk.column),
            fk.actions_sql()
        )
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<FkRow>, AppError> {
        Ok(sqlx::query_as(FOREIGN_KEYS_SQL)
            .bind(table)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn drop_foreign_keys_on(&self, table: &str, column: &str) -> Result<(), AppError> {
        for (name, col, ..) in self.foreign_keys(table).await? {
            if col == column {
                self.exec(&format!("ALTER TABLE {} DROP FOREIGN KEY {}", quoted(table), quoted(&name)))
                    .await?;
            }
        }
        Ok(())
    }

    /// Unique indexes (excluding PRIMARY) with their ordered columns.
    async fn unique_indexes(&self, table: &str) -> Result<BTreeMap<String, Vec<String>>, AppError> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(KEYS_SQL).bind(table).fetch_all(&self.pool).await?;
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (index, column, non_unique) in rows {
            if non_unique == 0 && index != "PRIMARY" {
                out.entry(index).or_default().push(column);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Dialect for MysqlDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Mysql
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
            "SELECT CAST(TABLE_NAME AS CHAR) FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDescriptor>, AppError> {
        let rows: Vec<(String, String, String, Option<String>, String)> =
            sqlx::query_as(COLUMNS_SQL).bind(table).fetch_all(&self.pool).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<(String, String, i64)> = sqlx::query_as(KEYS_SQL).bind(table).fetch_all(&self.pool).await?;
        let mut indexes: BTreeMap<String, (bool, Vec<String>)> = BTreeMap::new();
        for (index, column, non_unique) in keys {
            let entry = indexes.entry(index).or_insert((non_unique == 0, Vec::new()));
            entry.1.push(column);
        }

        let mut columns: Vec<ColumnDescriptor> = rows
            .into_iter()
            .map(|(name, column_type, nullable, default, extra)| {
                let auto_increment = extra.to_lowercase().contains("auto_increment");
                ColumnDescriptor {
                    name,
                    raw_type: column_type,
                    allow_null: nullable == "YES",
                    primary_key: false,
                    unique: Uniqueness::None,
                    auto_increment,
                    default_value: default,
                    fk: None,
                }
            })
            .collect();

        for (index, (unique, cols)) in &indexes {
            if !unique {
                continue;
            }
            for col in columns.iter_mut().filter(|c| cols.contains(&c.name)) {
                if index == "PRIMARY" {
                    col.primary_key = true;
                } else if cols.len() == 1 {
                    col.unique = Uniqueness::Column;
                } else if col.unique == Uniqueness::None {
                    col.unique = Uniqueness::Group(index.clone());
                }
            }
        }

        let fks = self.foreign_keys(table).await?;
        let mut per_constraint: BTreeMap<&str, usize> = BTreeMap::new();
        for fk in &fks {
            *per_constraint.entry(fk.0.as_str()).or_default() += 1;
        }
        for (name, column, ref_table, ref_column, on_update, on_delete) in &fks {
            if per_constraint.get(name.as_str()) != Some(&1) {
                continue;
            }
            if let Some(col) = columns.iter_mut().find(|c| &c.name == column) {
                col.fk = Some(ForeignKeyRef {
                    table: ref_table.clone(),
                    column: ref_column.clone(),
                    on_update: fk_action(on_update.clone()),
                    on_delete: fk_action(on_delete.clone()),
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
        let mut defs: Vec<String> = columns.iter().map(|(n, s)| self.column_sql(n, s)).collect();
        let mut pk: Vec<&str> = columns.iter().filter(|(_, s)| s.primary).map(|(n, _)| n.as_str()).collect();
        if pk.is_empty() {
            if let Some(c) = constraints.iter().find(|c| c.kind == ConstraintKind::Primary) {
                pk = c.fields.iter().map(String::as_str).collect();
            }
        }
        if !pk.is_empty() {
            defs.push(format!("PRIMARY KEY ({})", pk.iter().map(|c| quoted(c)).collect::<Vec<_>>().join(", ")));
        }
        for (name, spec) in columns {
            if spec.unique && !spec.primary {
                defs.push(format!("UNIQUE KEY {} ({})", quoted(&format!("{}_{}_key", table, name)), quoted(name)));
            }
        }
        for c in constraints.iter().filter(|c| c.kind == ConstraintKind::Unique) {
            let cols = c.fields.iter().map(|f| quoted(f)).collect::<Vec<_>>().join(", ");
            match &c.name {
                Some(n) => defs.push(format!("UNIQUE KEY {} ({})", quoted(n), cols)),
                None => defs.push(format!("UNIQUE ({})", cols)),
            }
        }
        for (name, spec) in columns {
            if let Some(r) = &spec.references {
                defs.push(self.foreign_key_sql(table, name, r));
            }
        }
        let sql = format!("CREATE TABLE {} (\n  {}\n)", quoted(table), defs.join(",\n  "));
        self.exec(&sql).await
    }

    async fn drop_table(&self, table: &str) -> Result<(), AppError> {
        self.exec(&format!("DROP TABLE {}", quoted(table))).await
    }

    async fn rename_table(&self, from: &str, to: &str) -> Result<(), AppError> {
        self.exec(&format!("RENAME TABLE {} TO {}", quoted(from), quoted(to))).await
    }

    async fn add_column(&self, table: &str, name: &str, spec: &ColumnSpec) -> Result<(), AppError> {
        let mut def = self.column_sql(name, spec);
        if spec.primary {
            def.push_str(" PRIMARY KEY");
        } else if spec.unique {
            def.push_str(" UNIQUE");
        }
        self.exec(&format!("ALTER TABLE {} ADD COLUMN {}", quoted(table), def)).await?;
        if let Some(r) = &spec.references {
            self.exec(&format!("ALTER TABLE {} ADD {}", quoted(table), self.foreign_key_sql(table, name, r)))
                .await?;
        }
        Ok(())
    }

    async fn remove_column(&self, table: &str, name: &str) -> Result<(), AppError> {
        self.drop_foreign_keys_on(table, name).await?;
        self.exec(&format!("ALTER TABLE {} DROP COLUMN {}", quoted(table), quoted(name)))
            .await
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
        let mut current = find_column(self.describe_table(table).await?, table, name)?;
        let current_type = current.field_type(self.kind(), table)?;
        if current_type != spec.field_type
            && self.cast_column_type(table, name, current_type, spec.field_type).await?
        {
            // The column was recreated; keys on it are gone.
            current = find_column(self.describe_table(table).await?, table, name)?;
        }
        let t = quoted(table);

        if spec.primary && !current.primary_key {
            self.add_constraint(table, &ConstraintSpec::primary(vec![name.to_string()])).await?;
        }

        let needs_modify = current.field_type(self.kind(), table)? != spec.field_type
            || current.allow_null == spec.not_null()
            || current.auto_increment != spec.auto_increment
            || (!spec.auto_increment
                && !defaults_equal(
                    current
                        .default_value
                        .as_deref()
                        .and_then(|d| parse_default(spec.field_type, d))
                        .as_ref(),
                    spec.default.as_ref(),
                ));
        if needs_modify {
            self.exec(&format!("ALTER TABLE {} MODIFY COLUMN {}", t, self.column_sql(name, spec)))
                .await?;
        }

        if !spec.primary && current.primary_key {
            self.exec(&format!("ALTER TABLE {} DROP PRIMARY KEY", t)).await?;
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
            self.drop_foreign_keys_on(table, name).await?;
            if let Some(r) = &spec.references {
                self.exec(&format!("ALTER TABLE {} ADD {}", t, self.foreign_key_sql(table, name, r)))
                    .await?;
            }
        }
        Ok(())
    }

    async fn add_constraint(&self, table: &str, constraint: &ConstraintSpec) -> Result<(), AppError> {
        let cols = constraint.fields.iter().map(|f| quoted(f)).collect::<Vec<_>>().join(", ");
        let sql = match (constraint.kind, &constraint.name) {
            (ConstraintKind::Primary, _) => format!("ALTER TABLE {} ADD PRIMARY KEY ({})", quoted(table), cols),
            (ConstraintKind::Unique, Some(n)) => {
                format!("ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})", quoted(table), quoted(n), cols)
            }
            (ConstraintKind::Unique, None) => format!("ALTER TABLE {} ADD UNIQUE ({})", quoted(table), cols),
        };
        self.exec(&sql).await
    }

    async fn drop_constraint(&self, table: &str, constraint: &DropConstraint) -> Result<(), AppError> {
        let t = quoted(table);
        if constraint.kind == ConstraintKind::Primary {
            return self.exec(&format!("ALTER TABLE {} DROP PRIMARY KEY", t)).await;
        }
        if let Some(name) = &constraint.name {
            return self.exec(&format!("ALTER TABLE {} DROP INDEX {}", t, quoted(name))).await;
        }
        let field = constraint
            .field
            .as_deref()
            .ok_or_else(|| AppError::Validation("drop constraint needs a name or a field".into()))?;
        let indexes = self.unique_indexes(table).await?;
        // Prefer the single-column index over a group the column belongs to.
        let index = indexes
            .iter()
            .filter(|(_, cols)| cols.iter().any(|c| c == field))
            .min_by_key(|(_, cols)| cols.len())
            .map(|(name, _)| name.clone())
            .ok_or_else(|| AppError::not_found("constraint", format!("{}.{}", table, field)))?;
        self.exec(&format!("ALTER TABLE {} DROP INDEX {}", t, quoted(&index))).await
    }

    async fn cast_column_type(
        &self,
        table: &str,
        column: &str,
        from: FieldType,
        to: FieldType,
    ) -> Result<bool, AppError> {
        let Some(expr) = cast_expression(DialectKind::Mysql, &quoted(column), from, to) else {
            return Ok(false);
        };
        let t = quoted(table);
        let tmp = format!("{}__cast", column);
        self.exec(&format!(
            "ALTER TABLE {} ADD COLUMN {} {} NULL AFTER {}",
            t,
            quoted(&tmp),
            sql_type(DialectKind::Mysql, to, false),
            quoted(column)
        ))
        .await?;
        self.exec(&format!("UPDATE {} SET {} = {}", t, quoted(&tmp), expr)).await?;
        self.remove_column(table, column).await?;
        self.rename_column(table, &tmp, column).await?;
        Ok(true)
    }
}

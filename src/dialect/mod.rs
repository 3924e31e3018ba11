//! Dialect interface: catalog introspection and structural DDL per engine.
//!
//! - [`PostgresDialect`]: live ALTER for every column change
//! - [`MysqlDialect`]: MODIFY COLUMN, temp-column casts
//! - [`SqliteDialect`]: full table rebuild for alterations SQLite cannot ALTER

pub mod mysql;
pub mod postgres;
pub mod sqlite;
pub mod types;

pub use mysql::MysqlDialect;
pub use postgres::{ensure_database_exists, PostgresDialect};
pub use sqlite::SqliteDialect;

use crate::config::SyncConfig;
use crate::error::{AppError, ConfigError};
use crate::model::{Field, FieldType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    Postgres,
    Mysql,
    Sqlite,
}

impl DialectKind {
    pub fn name(&self) -> &'static str {
        match self {
            DialectKind::Postgres => "postgres",
            DialectKind::Mysql => "mysql",
            DialectKind::Sqlite => "sqlite",
        }
    }

    /// Engine from the database URL scheme.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let scheme = url.split(':').next().unwrap_or_default().to_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Ok(DialectKind::Postgres),
            "mysql" | "mariadb" => Ok(DialectKind::Mysql),
            "sqlite" => Ok(DialectKind::Sqlite),
            _ => Err(ConfigError::UnsupportedUrl(url.to_string())),
        }
    }
}

/// Uniqueness as reported by the catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Uniqueness {
    #[default]
    None,
    /// Single-column unique index or constraint.
    Column,
    /// Member of a multi-column unique index; all members share the identifier.
    Group(String),
}

impl Uniqueness {
    pub fn is_unique(&self) -> bool {
        !matches!(self, Uniqueness::None)
    }

    pub fn group(&self) -> Option<&str> {
        match self {
            Uniqueness::Group(g) => Some(g),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,
}

impl ForeignKeyRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        ForeignKeyRef {
            table: table.into(),
            column: column.into(),
            on_update: None,
            on_delete: None,
        }
    }

    pub(crate) fn actions_sql(&self) -> String {
        let mut out = String::new();
        if let Some(u) = &self.on_update {
            out.push_str(&format!(" ON UPDATE {}", u));
        }
        if let Some(d) = &self.on_delete {
            out.push_str(&format!(" ON DELETE {}", d));
        }
        out
    }
}

/// One live column as reported by introspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub name: String,
    pub raw_type: String,
    pub allow_null: bool,
    pub primary_key: bool,
    pub unique: Uniqueness,
    pub auto_increment: bool,
    /// Raw default expression as the engine reports it.
    pub default_value: Option<String>,
    pub fk: Option<ForeignKeyRef>,
}

impl ColumnDescriptor {
    pub fn field_type(&self, kind: DialectKind, table: &str) -> Result<FieldType, AppError> {
        types::field_type_of(kind, &self.raw_type).ok_or_else(|| AppError::UnknownType {
            table: table.to_string(),
            column: self.name.clone(),
            raw: self.raw_type.clone(),
        })
    }
}

/// Live catalog: table name to ordered columns.
pub type Catalog = BTreeMap<String, Vec<ColumnDescriptor>>;

/// Target definition of a column for DDL.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSpec {
    pub field_type: FieldType,
    pub primary: bool,
    pub unique: bool,
    pub required: bool,
    pub auto_increment: bool,
    pub default: Option<Value>,
    pub references: Option<ForeignKeyRef>,
}

impl ColumnSpec {
    pub fn from_field(field: &Field) -> Self {
        ColumnSpec {
            field_type: field.field_type,
            primary: field.primary,
            unique: field.unique,
            required: field.required,
            auto_increment: field.auto_increment,
            default: if field.default { field.default_value.clone() } else { None },
            references: None,
        }
    }

    pub fn from_descriptor(kind: DialectKind, table: &str, column: &ColumnDescriptor) -> Result<Self, AppError> {
        let field_type = column.field_type(kind, table)?;
        Ok(ColumnSpec {
            field_type,
            primary: column.primary_key,
            unique: column.unique == Uniqueness::Column,
            required: !column.allow_null,
            auto_increment: column.auto_increment,
            default: column
                .default_value
                .as_deref()
                .and_then(|d| types::parse_default(field_type, d)),
            references: column.fk.clone(),
        })
    }

    pub fn with_reference(mut self, reference: ForeignKeyRef) -> Self {
        self.references = Some(reference);
        self
    }

    pub fn not_null(&self) -> bool {
        self.required || self.primary
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintKind {
    Primary,
    Unique,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstraintSpec {
    pub kind: ConstraintKind,
    pub fields: Vec<String>,
    pub name: Option<String>,
}

impl ConstraintSpec {
    pub fn unique(fields: Vec<String>, name: Option<String>) -> Self {
        ConstraintSpec {
            kind: ConstraintKind::Unique,
            fields,
            name,
        }
    }

    pub fn primary(fields: Vec<String>) -> Self {
        ConstraintSpec {
            kind: ConstraintKind::Primary,
            fields,
            name: None,
        }
    }
}

/// Locates a constraint to drop: by name, or by one of its columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DropConstraint {
    pub kind: ConstraintKind,
    pub name: Option<String>,
    pub field: Option<String>,
}

impl DropConstraint {
    pub fn by_field(kind: ConstraintKind, field: impl Into<String>) -> Self {
        DropConstraint {
            kind,
            name: None,
            field: Some(field.into()),
        }
    }

    pub fn by_name(kind: ConstraintKind, name: impl Into<String>) -> Self {
        DropConstraint {
            kind,
            name: Some(name.into()),
            field: None,
        }
    }
}

/// Engine-specific catalog introspection and structural DDL.
///
/// Any statement failure is returned as-is; callers decide whether to abort a batch.
#[async_trait]
pub trait Dialect: Send + Sync {
    fn kind(&self) -> DialectKind;

    fn quote_ident(&self, name: &str) -> String;

    async fn ping(&self) -> Result<(), AppError>;

    async fn list_tables(&self) -> Result<Vec<String>, AppError>;

    /// Ordered columns of one table; empty when the table does not exist.
    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDescriptor>, AppError>;

    /// Full catalog snapshot. Template method over [`list_tables`](Dialect::list_tables)
    /// and [`describe_table`](Dialect::describe_table).
    async fn introspect(&self) -> Result<Catalog, AppError> {
        let mut catalog = Catalog::new();
        for table in self.list_tables().await? {
            let columns = self.describe_table(&table).await?;
            catalog.insert(table, columns);
        }
        tracing::debug!(tables = catalog.len(), dialect = self.kind().name(), "introspected catalog");
        Ok(catalog)
    }

    async fn has_table(&self, table: &str) -> Result<bool, AppError> {
        Ok(self.list_tables().await?.iter().any(|t| t == table))
    }

    async fn create_table(
        &self,
        table: &str,
        columns: &[(String, ColumnSpec)],
        constraints: &[ConstraintSpec],
    ) -> Result<(), AppError>;

    async fn drop_table(&self, table: &str) -> Result<(), AppError>;

    async fn rename_table(&self, from: &str, to: &str) -> Result<(), AppError>;

    async fn add_column(&self, table: &str, name: &str, spec: &ColumnSpec) -> Result<(), AppError>;

    async fn remove_column(&self, table: &str, name: &str) -> Result<(), AppError>;

    async fn rename_column(&self, table: &str, from: &str, to: &str) -> Result<(), AppError>;

    /// Bring an existing column to `spec` (type, nullability, default, primary, unique, reference).
    async fn change_column(&self, table: &str, name: &str, spec: &ColumnSpec) -> Result<(), AppError>;

    async fn add_constraint(&self, table: &str, constraint: &ConstraintSpec) -> Result<(), AppError>;

    async fn drop_constraint(&self, table: &str, constraint: &DropConstraint) -> Result<(), AppError>;

    /// Convert existing data of `column` from one field type to another.
    /// Returns whether a data conversion was performed (false when the engine relabels).
    async fn cast_column_type(
        &self,
        table: &str,
        column: &str,
        from: FieldType,
        to: FieldType,
    ) -> Result<bool, AppError>;
}

/// Find one column of a table or fail with NotFound.
pub(crate) fn find_column(columns: Vec<ColumnDescriptor>, table: &str, name: &str) -> Result<ColumnDescriptor, AppError> {
    columns
        .into_iter()
        .find(|c| c.name == name)
        .ok_or_else(|| AppError::not_found("column", format!("{}.{}", table, name)))
}

/// Open a pool for the configured database and wrap it in the matching dialect.
pub async fn connect(config: &SyncConfig) -> Result<Arc<dyn Dialect>, AppError> {
    let kind = DialectKind::from_url(&config.database_url)?;
    tracing::info!(dialect = kind.name(), "connecting");
    let dialect: Arc<dyn Dialect> = match kind {
        DialectKind::Postgres => {
            ensure_database_exists(&config.database_url).await?;
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&config.database_url)
                .await?;
            Arc::new(PostgresDialect::new(pool, config.schema.clone()))
        }
        DialectKind::Mysql => {
            let pool = sqlx::mysql::MySqlPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&config.database_url)
                .await?;
            Arc::new(MysqlDialect::new(pool))
        }
        DialectKind::Sqlite => {
            use std::str::FromStr;
            let opts = sqlx::sqlite::SqliteConnectOptions::from_str(&config.database_url)?
                .create_if_missing(true)
                .foreign_keys(true);
            // Every connection to an in-memory database sees its own database.
            let in_memory = config.database_url.contains(":memory:") || config.database_url.contains("mode=memory");
            let mut pool_options = sqlx::sqlite::SqlitePoolOptions::new();
            pool_options = if in_memory {
                pool_options.max_connections(1).idle_timeout(None).max_lifetime(None)
            } else {
                pool_options.max_connections(config.max_connections)
            };
            let pool = pool_options.connect_with(opts).await?;
            Arc::new(SqliteDialect::new(pool))
        }
    };
    Ok(dialect)
}

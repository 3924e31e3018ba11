//! Load [`SyncConfig`] from the process environment (after reading `.env`).

use crate::config::types::{SyncConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_SCHEMA};
use crate::error::ConfigError;
use crate::model::field::validate_identifier;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_SCHEMA: &str = "ARCHITECT_SCHEMA";
pub const ENV_PROJECT_DIR: &str = "ARCHITECT_PROJECT_DIR";
pub const ENV_MAX_CONNECTIONS: &str = "ARCHITECT_MAX_CONNECTIONS";

impl SyncConfig {
    /// `DATABASE_URL` is required; `ARCHITECT_SCHEMA`, `ARCHITECT_PROJECT_DIR` and
    /// `ARCHITECT_MAX_CONNECTIONS` are optional.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is not an error.
        let _ = dotenvy::dotenv();
        load_from(|key| std::env::var(key).ok())
    }
}

/// Build a config from any key lookup.
pub fn load_from<F>(lookup: F) -> Result<SyncConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let url = lookup(ENV_DATABASE_URL)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingEnv(ENV_DATABASE_URL))?;
    let mut config = SyncConfig::new(url)?;

    let schema = lookup(ENV_SCHEMA).unwrap_or_else(|| DEFAULT_SCHEMA.into());
    validate_identifier("schema", &schema).map_err(|e| ConfigError::Validation(e.to_string()))?;
    config.schema = schema;

    if let Some(dir) = lookup(ENV_PROJECT_DIR) {
        config.project_dir = dir.into();
    }
    config.max_connections = match lookup(ENV_MAX_CONNECTIONS) {
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ConfigError::Load(format!("{} must be a positive integer, got '{}'", ENV_MAX_CONNECTIONS, raw)))?,
        None => DEFAULT_MAX_CONNECTIONS,
    };
    tracing::debug!(
        dialect = config.dialect.name(),
        schema = %config.schema,
        project_dir = %config.project_dir.display(),
        "config loaded"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DialectKind;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply() {
        let c = load_from(env(&[(ENV_DATABASE_URL, "postgres://localhost/app")])).unwrap();
        assert_eq!(c.dialect, DialectKind::Postgres);
        assert_eq!(c.schema, "public");
        assert_eq!(c.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(c.history_path(), PathBuf::from("./history.json"));
    }

    #[test]
    fn overrides_and_errors() {
        let c = load_from(env(&[
            (ENV_DATABASE_URL, "sqlite::memory:"),
            (ENV_PROJECT_DIR, "/srv/app"),
            (ENV_MAX_CONNECTIONS, "2"),
        ]))
        .unwrap();
        assert_eq!(c.dialect, DialectKind::Sqlite);
        assert_eq!(c.entities_dir(), PathBuf::from("/srv/app/entities"));
        assert_eq!(c.max_connections, 2);

        assert!(matches!(load_from(env(&[])), Err(ConfigError::MissingEnv(ENV_DATABASE_URL))));
        assert!(matches!(
            load_from(env(&[(ENV_DATABASE_URL, "oracle://x")])),
            Err(ConfigError::UnsupportedUrl(_))
        ));
        assert!(matches!(
            load_from(env(&[(ENV_DATABASE_URL, "sqlite::memory:"), (ENV_MAX_CONNECTIONS, "0")])),
            Err(ConfigError::Load(_))
        ));
        assert!(matches!(
            load_from(env(&[(ENV_DATABASE_URL, "postgres://x/y"), (ENV_SCHEMA, "bad schema")])),
            Err(ConfigError::Validation(_))
        ));
    }
}

//! Document persistence: one JSON document per entity, one JSON document for the history log.
//!
//! Both stores are synchronous collaborators; documents are small and written whole.

use crate::error::{AppError, ConfigError};
use crate::history::HistoryDocument;
use crate::model::Entity;
use std::path::{Path, PathBuf};

pub trait EntityStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<Entity>, AppError>;
    fn save(&self, entity: &Entity) -> Result<(), AppError>;
    fn remove(&self, name: &str) -> Result<(), AppError>;
}

pub trait HistoryStore: Send + Sync {
    /// Missing document means empty stacks.
    fn load(&self) -> Result<HistoryDocument, AppError>;
    fn save(&self, doc: &HistoryDocument) -> Result<(), AppError>;
}

/// Keeps nothing. Used when the caller does not want documents on disk.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopStore;

impl EntityStore for NoopStore {
    fn load_all(&self) -> Result<Vec<Entity>, AppError> {
        Ok(Vec::new())
    }

    fn save(&self, _entity: &Entity) -> Result<(), AppError> {
        Ok(())
    }

    fn remove(&self, _name: &str) -> Result<(), AppError> {
        Ok(())
    }
}

impl HistoryStore for NoopStore {
    fn load(&self) -> Result<HistoryDocument, AppError> {
        Ok(HistoryDocument::default())
    }

    fn save(&self, _doc: &HistoryDocument) -> Result<(), AppError> {
        Ok(())
    }
}

fn load_error(path: &Path, e: impl std::fmt::Display) -> AppError {
    ConfigError::Load(format!("{}: {}", path.display(), e)).into()
}

/// Write to a sibling temp file, then rename over the target.
fn write_document(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// `<dir>/<Name>.json` per entity.
#[derive(Clone, Debug)]
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonDirStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

impl EntityStore for JsonDirStore {
    fn load_all(&self) -> Result<Vec<Entity>, AppError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|x| x == "json").unwrap_or(false))
            .collect();
        paths.sort();
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = std::fs::read(&path)?;
            let entity: Entity = serde_json::from_slice(&bytes).map_err(|e| load_error(&path, e))?;
            out.push(entity);
        }
        tracing::debug!(dir = %self.dir.display(), count = out.len(), "entity documents loaded");
        Ok(out)
    }

    fn save(&self, entity: &Entity) -> Result<(), AppError> {
        let bytes = serde_json::to_vec_pretty(entity)?;
        write_document(&self.path(&entity.name), &bytes)
    }

    fn remove(&self, name: &str) -> Result<(), AppError> {
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Single history document at a fixed path.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }
}

impl HistoryStore for JsonFileStore {
    fn load(&self) -> Result<HistoryDocument, AppError> {
        if !self.path.exists() {
            return Ok(HistoryDocument::default());
        }
        let bytes = std::fs::read(&self.path)?;
        serde_json::from_slice(&bytes).map_err(|e| load_error(&self.path, e))
    }

    fn save(&self, doc: &HistoryDocument) -> Result<(), AppError> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        write_document(&self.path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{Action, DiffItem};
    use crate::model::{Field, FieldType};

    #[test]
    fn entity_documents_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path().join("entities"));
        assert!(store.load_all().unwrap().is_empty());

        let user = Entity::new("User").with_field(Field::new("id", FieldType::Number).primary());
        store.save(&user).unwrap();
        store.save(&Entity::new("Group")).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1], user);

        store.remove("Group").unwrap();
        store.remove("Group").unwrap();
        assert_eq!(store.load_all().unwrap(), vec![user]);
    }

    #[test]
    fn malformed_document_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Broken.json"), b"{ not json").unwrap();
        let err = JsonDirStore::new(dir.path()).load_all().unwrap_err();
        assert!(matches!(err, AppError::Config(ConfigError::Load(_))));
    }

    #[test]
    fn history_document_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("history.json"));
        assert_eq!(store.load().unwrap(), HistoryDocument::default());

        let item = DiffItem::new(Action::delete_field("User", "nickname"), Action::delete_field("User", "x"));
        let doc = HistoryDocument {
            undo: vec![item],
            redo: vec![],
            saved_at: Some(chrono::Utc::now()),
        };
        store.save(&doc).unwrap();
        assert_eq!(store.load().unwrap(), doc);
    }
}

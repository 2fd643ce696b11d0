//! Durable key/value storage for state that must survive a restart.
//!
//! [`FileMemento`] keeps every entry in a single JSON object file. Writes go
//! to a temp file in the same directory and are renamed into place, so
//! readers never see partial writes.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum MementoError {
    #[error("Memento I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Memento JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Process-global key/value store.
#[async_trait]
pub trait Memento: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    /// All keys currently stored, sorted.
    fn keys(&self) -> Vec<String>;

    /// Store `value` under `key`. Storing `null` removes the key.
    async fn update(&self, key: &str, value: Value) -> Result<(), MementoError>;
}

/// Read `key` and deserialize it. Missing and malformed entries both yield
/// `None`.
pub fn get_typed<T: DeserializeOwned>(memento: &dyn Memento, key: &str) -> Option<T> {
    let value = memento.get(key)?;
    match serde_json::from_value(value) {
        Ok(typed) => Some(typed),
        Err(e) => {
            debug!("[memento] Ignoring malformed entry {}: {}", key, e);
            None
        }
    }
}

fn apply(entries: &mut Map<String, Value>, key: &str, value: Value) {
    if value.is_null() {
        entries.remove(key);
    } else {
        entries.insert(key.to_string(), value);
    }
}

fn sorted_keys(entries: &Map<String, Value>) -> Vec<String> {
    let mut keys: Vec<String> = entries.keys().cloned().collect();
    keys.sort();
    keys
}

/// Memento that lives only as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryMemento {
    entries: RwLock<Map<String, Value>>,
}

impl InMemoryMemento {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Memento for InMemoryMemento {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn keys(&self) -> Vec<String> {
        sorted_keys(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    async fn update(&self, key: &str, value: Value) -> Result<(), MementoError> {
        apply(
            &mut self.entries.write().unwrap_or_else(PoisonError::into_inner),
            key,
            value,
        );
        Ok(())
    }
}

/// Memento backed by a JSON file.
#[derive(Debug)]
pub struct FileMemento {
    path: PathBuf,
    entries: RwLock<Map<String, Value>>,
    /// Serializes file writes so they land in update order
    write_lock: tokio::sync::Mutex<()>,
}

impl FileMemento {
    /// Open the memento at `path`. A missing file is an empty memento; it is
    /// created on the first update.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, MementoError> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => Map::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(
            "[memento] Opened {} ({} entries)",
            path.display(),
            entries.len()
        );
        Ok(Self {
            path,
            entries: RwLock::new(entries),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, contents: String) -> Result<(), MementoError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!(".tmp.{}", uuid::Uuid::new_v4()));
        if let Err(e) = async {
            tokio::fs::write(&tmp, contents).await?;
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await
        {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Memento for FileMemento {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn keys(&self) -> Vec<String> {
        sorted_keys(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    async fn update(&self, key: &str, value: Value) -> Result<(), MementoError> {
        let _guard = self.write_lock.lock().await;
        let contents = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            apply(&mut entries, key, value);
            serde_json::to_string_pretty(&*entries)?
        };
        self.persist(contents).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[tokio::test]
    async fn test_in_memory_update_and_delete() {
        let memento = InMemoryMemento::new();
        assert!(memento.get("a").is_none());

        memento.update("b", json!(2)).await.unwrap();
        memento.update("a", json!(1)).await.unwrap();
        assert_eq!(memento.get("a"), Some(json!(1)));
        assert_eq!(memento.keys(), vec!["a".to_string(), "b".to_string()]);

        memento.update("a", Value::Null).await.unwrap();
        assert!(memento.get("a").is_none());
        assert_eq!(memento.keys(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_get_typed_ignores_malformed() {
        let memento = InMemoryMemento::new();
        memento.update("ok", json!({"x": 1, "y": 2})).await.unwrap();
        memento.update("bad", json!({"x": "one"})).await.unwrap();

        let memento: &dyn Memento = &memento;
        assert_eq!(get_typed::<Point>(memento, "ok"), Some(Point { x: 1, y: 2 }));
        assert_eq!(get_typed::<Point>(memento, "bad"), None);
        assert_eq!(get_typed::<Point>(memento, "missing"), None);
    }

    #[tokio::test]
    async fn test_file_memento_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("memento.json");

        let memento = FileMemento::open(&path).await.unwrap();
        assert!(memento.keys().is_empty());
        memento.update("LONG:file:///a.ipynb", json!({"x": 1, "y": 2})).await.unwrap();
        memento.update("other", json!("value")).await.unwrap();
        drop(memento);

        let reopened = FileMemento::open(&path).await.unwrap();
        assert_eq!(reopened.keys().len(), 2);
        assert_eq!(reopened.get("other"), Some(json!("value")));
        assert_eq!(
            get_typed::<Point>(&reopened, "LONG:file:///a.ipynb"),
            Some(Point { x: 1, y: 2 })
        );
    }

    #[tokio::test]
    async fn test_file_memento_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memento.json");
        let memento = FileMemento::open(&path).await.unwrap();

        for i in 0..5 {
            memento.update("k", json!(i)).await.unwrap();
        }

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["memento.json".to_string()]);

        let reopened = FileMemento::open(&path).await.unwrap();
        assert_eq!(reopened.get("k"), Some(json!(4)));
    }

    #[tokio::test]
    async fn test_file_memento_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memento.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            FileMemento::open(&path).await,
            Err(MementoError::Json(_))
        ));
    }
}

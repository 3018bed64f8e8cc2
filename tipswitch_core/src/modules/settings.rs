use crate::modules::error::SettingsError;
use crate::modules::ports::SettingsPort;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Flat JSON object on disk. `set` only touches memory; `save` writes the
/// whole object through a temp file and a rename.
pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonFileSettings {
    /// A missing file opens as an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => Map::new(),
            Ok(text) => match serde_json::from_str::<Value>(&text)? {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SettingsPort for JsonFileSettings {
    fn get(&self, key: &str) -> Option<Value> {
        match self.lock().get(key) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.clone()),
        }
    }

    fn set(&self, key: &str, value: Value) {
        self.lock().insert(key.to_string(), value);
    }

    fn save(&self) -> Result<(), SettingsError> {
        let payload = serde_json::to_string_pretty(&Value::Object(self.lock().clone()))?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        // Each save gets its own temp file so concurrent saves never share one.
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(payload.as_bytes())?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Settings that never touch disk.
#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<Map<String, Value>>,
}

impl SettingsPort for MemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        let g = self
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match g.get(key) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.clone()),
        }
    }

    fn set(&self, key: &str, value: Value) {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value);
    }

    fn save(&self) -> Result<(), SettingsError> {
        Ok(())
    }
}

//! The session cache, persisted across runs.

use std::fs;
use std::io;

use camino::Utf8Path;
use serde_json::{Map, Value};

/// Arbitrary JSON state shared between runs.
///
/// Collaborators use nested keys namespaced by their module name. The cache
/// is read once at startup and written once on clean exit; concurrent tool
/// invocations against the same build directory are unsupported.
#[derive(Debug, Default)]
pub struct Cache {
    root: Map<String, Value>,
}

impl Cache {
    /// Load from `path`. A missing file yields an empty cache; a corrupt
    /// file is discarded with a warning rather than failing the build.
    #[must_use]
    pub fn load(path: &Utf8Path) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "failed to read cache");
                String::new()
            }
        };
        if text.is_empty() {
            return Self::default();
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(root)) => Self { root },
            Ok(_) | Err(_) => {
                tracing::warn!(path = %path, "discarding corrupt cache file");
                Self::default()
            }
        }
    }

    /// Persist to `path`.
    ///
    /// # Errors
    ///
    /// Propagates I/O and serialisation errors.
    pub fn save(&self, path: &Utf8Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string(&Value::Object(self.root.clone()))?;
        fs::write(path, text)
    }

    /// Read a value from `namespace`.
    #[must_use]
    pub fn get(&self, namespace: &str, key: &str) -> Option<&Value> {
        self.root.get(namespace)?.as_object()?.get(key)
    }

    /// Write a value into `namespace`.
    pub fn set(&mut self, namespace: &str, key: &str, value: Value) {
        let entry = self
            .root
            .entry(namespace.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = entry {
            map.insert(key.to_owned(), value);
        } else {
            let mut map = Map::new();
            map.insert(key.to_owned(), value);
            *entry = Value::Object(map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn cache_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join(".cache.json")).expect("utf8");

        let mut cache = Cache::default();
        cache.set("ninja", "version", serde_json::json!("1.8.2"));
        cache.save(&path).expect("save");

        let loaded = Cache::load(&path);
        assert_eq!(
            loaded.get("ninja", "version"),
            Some(&serde_json::json!("1.8.2"))
        );
    }

    #[test]
    fn missing_cache_file_yields_empty_cache() {
        let cache = Cache::load(Utf8Path::new("/does/not/exist/.cache.json"));
        assert!(cache.get("ninja", "version").is_none());
    }
}

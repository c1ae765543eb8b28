//! On-disk value and resource stores.
//!
//! Each script gets its own isolated value namespace backed by a JSON file
//! named after its id. Resources are read from a cache directory filled by
//! whatever downloads `@require`/`@resource` dependencies.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::compiler::{declared_dependencies, Resource, ResourcesResolver, ValuesResolver};
use super::error::RuntimeResult;
use super::script::{Metadata, Script};
use super::ScriptId;

/// Per-script key/value storage in `<dir>/<script id>.json`.
#[derive(Debug, Clone)]
pub struct JsonValueStore {
    dir: PathBuf,
}

impl JsonValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, script_id: ScriptId) -> PathBuf {
        self.dir.join(format!("{}.json", script_id))
    }

    /// Stored values of a script. A script that never stored anything has
    /// an empty snapshot.
    pub fn load(&self, script_id: ScriptId) -> RuntimeResult<HashMap<String, Value>> {
        let path = self.path(script_id);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Replace a script's values on disk.
    pub fn save(&self, script_id: ScriptId, values: &HashMap<String, Value>) -> RuntimeResult<()> {
        fs::create_dir_all(&self.dir)?;
        let contents = serde_json::to_string_pretty(values)?;
        fs::write(self.path(script_id), contents)?;
        Ok(())
    }

    /// Set a single value.
    pub fn set(&self, script_id: ScriptId, key: &str, value: Value) -> RuntimeResult<()> {
        let mut values = self.load(script_id)?;
        values.insert(key.to_string(), value);
        self.save(script_id, &values)
    }

    /// Remove a key. Missing keys are ignored.
    pub fn remove(&self, script_id: ScriptId, key: &str) -> RuntimeResult<()> {
        let mut values = self.load(script_id)?;
        if values.remove(key).is_some() {
            self.save(script_id, &values)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ValuesResolver for JsonValueStore {
    async fn get_values(&self, script: &Script) -> anyhow::Result<HashMap<String, Value>> {
        let store = self.clone();
        let script_id = script.id;
        let values = tokio::task::spawn_blocking(move || store.load(script_id))
            .await
            .map_err(|e| anyhow::anyhow!("join error: {}", e))??;
        debug!(script_id = script.id, keys = values.len(), "Loaded script values");
        Ok(values)
    }
}

/// Pre-fetched dependencies, one file per URL.
#[derive(Debug, Clone)]
pub struct ResourceCache {
    dir: PathBuf,
}

impl ResourceCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a URL is cached under.
    pub fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(cache_file_name(url))
    }

    /// Store the content fetched for `url`.
    pub fn insert(&self, url: &str, content: &str) -> RuntimeResult<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_for(url), content)?;
        Ok(())
    }

    /// Whether every dependency a script declares is cached.
    pub fn has_all(&self, metadata: &Metadata) -> bool {
        declared_dependencies(metadata)
            .iter()
            .all(|(_, url)| self.path_for(url).is_file())
    }
}

#[async_trait]
impl ResourcesResolver for ResourceCache {
    async fn get_resources(
        &self,
        script: &Script,
        metadata: &Metadata,
    ) -> anyhow::Result<BTreeMap<String, Resource>> {
        let cache = self.clone();
        let dependencies = declared_dependencies(metadata);
        let resolved = tokio::task::spawn_blocking(move || cache.read_all(dependencies))
            .await
            .map_err(|e| anyhow::anyhow!("join error: {}", e))??;
        debug!(script_id = script.id, resources = resolved.len(), "Resolved resources");
        Ok(resolved)
    }
}

impl ResourceCache {
    fn read_all(
        &self,
        dependencies: Vec<(String, String)>,
    ) -> anyhow::Result<BTreeMap<String, Resource>> {
        let mut resolved = BTreeMap::new();
        for (key, url) in dependencies {
            let path = self.path_for(&url);
            let content = fs::read_to_string(&path).map_err(|e| {
                anyhow::anyhow!("{} ({}) is not cached at {}: {}", key, url, path.display(), e)
            })?;
            let content_type = content_type_for(&url).map(str::to_string);
            resolved.insert(key, Resource { url, content, content_type });
        }
        Ok(resolved)
    }
}

/// Longest file name kept in readable form.
const MAX_FILE_NAME: usize = 200;

/// Percent-encode a URL into a single file name.
///
/// Encoded output only ever has `%` before two uppercase hex digits, so the
/// `%h` marker of the hashed form for long URLs cannot collide with it.
fn cache_file_name(url: &str) -> String {
    let encoded = urlencoding::encode(url);
    if encoded.len() <= MAX_FILE_NAME {
        return encoded.into_owned();
    }
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    format!("{}%h{}", &encoded[..MAX_FILE_NAME - 66], digest)
}

fn content_type_for(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())?;
    match ext.as_str() {
        "js" => Some("application/javascript"),
        "css" => Some("text/css"),
        "json" => Some("application/json"),
        "html" | "htm" => Some("text/html"),
        "svg" => Some("image/svg+xml"),
        "txt" => Some("text/plain"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_value_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonValueStore::new(temp_dir.path().join("values"));

        assert!(store.load(1).unwrap().is_empty());

        store.set(1, "count", json!(3)).unwrap();
        store.set(1, "name", json!("x")).unwrap();
        store.set(2, "count", json!(9)).unwrap();

        let values = store.load(1).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["count"], json!(3));
        assert_eq!(store.load(2).unwrap()["count"], json!(9));

        store.remove(1, "name").unwrap();
        store.remove(1, "missing").unwrap();
        assert_eq!(store.load(1).unwrap().len(), 1);
    }

    #[test]
    fn test_value_store_rejects_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("5.json"), "{not json").unwrap();
        let store = JsonValueStore::new(temp_dir.path());
        assert!(store.load(5).is_err());
    }

    #[tokio::test]
    async fn test_value_store_as_resolver() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonValueStore::new(temp_dir.path());
        store.set(4, "seen", json!(true)).unwrap();

        let values = store.get_values(&Script::new(4, "a", "")).await.unwrap();
        assert_eq!(values["seen"], json!(true));
    }

    #[tokio::test]
    async fn test_resource_cache_resolves_declared() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResourceCache::new(temp_dir.path());
        cache.insert("https://cdn.test/lib.js", "lib();").unwrap();
        cache.insert("https://cdn.test/style.css?v=2", "body{}").unwrap();

        let script = Script::new(1, "a", "")
            .with_meta("require", ["https://cdn.test/lib.js"])
            .with_meta("resource", ["style https://cdn.test/style.css?v=2"]);
        assert!(cache.has_all(&script.metadata));

        let resolved = cache.get_resources(&script, &script.metadata).await.unwrap();
        let lib = &resolved["require:https://cdn.test/lib.js"];
        assert_eq!(lib.content, "lib();");
        assert_eq!(lib.content_type.as_deref(), Some("application/javascript"));
        assert_eq!(resolved["style"].content_type.as_deref(), Some("text/css"));
    }

    #[tokio::test]
    async fn test_resource_cache_missing_entry() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResourceCache::new(temp_dir.path());
        let script = Script::new(1, "a", "").with_meta("require", ["https://cdn.test/gone.js"]);

        assert!(!cache.has_all(&script.metadata));
        let err = cache.get_resources(&script, &script.metadata).await.unwrap_err();
        assert!(err.to_string().contains("gone.js"));
    }

    #[test]
    fn test_cache_file_name_is_flat() {
        assert_eq!(
            cache_file_name("https://cdn.test/a/b.js?x=1"),
            "https%3A%2F%2Fcdn.test%2Fa%2Fb.js%3Fx%3D1"
        );
        let long = format!("https://cdn.test/{}.js", "x".repeat(400));
        let name = cache_file_name(&long);
        assert_eq!(name.len(), MAX_FILE_NAME);
        assert_ne!(name, cache_file_name(&format!("{}?v=2", long)));
    }

    #[tokio::test]
    async fn test_similar_urls_do_not_share_a_file() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResourceCache::new(temp_dir.path());
        cache.insert("https://cdn.test/a/b.js", "nested();").unwrap();
        cache.insert("https://cdn.test/a_b.js", "flat();").unwrap();

        let script = Script::new(1, "a", "").with_meta("require", ["https://cdn.test/a/b.js"]);
        let resolved = cache.get_resources(&script, &script.metadata).await.unwrap();
        assert_eq!(resolved["require:https://cdn.test/a/b.js"].content, "nested();");
    }
}

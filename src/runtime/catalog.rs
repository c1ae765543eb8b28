//! Script catalog sources.
//!
//! A [`DirectoryCatalog`] is a directory of `*.user.js` files with an
//! optional `catalog.toml` that pins ids, status and overrides:
//!
//! ```toml
//! [[scripts]]
//! id = 1
//! file = "dark-mode.user.js"
//! enabled = false
//!
//! [scripts.overrides]
//! match = ["*://news.example.com/*"]
//! ```
//!
//! Files not listed get ids after the highest listed one, in file name order.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::error::{RuntimeError, RuntimeResult};
use super::header::parse_header;
use super::script::{first_value, Metadata, Script, ScriptKind, ScriptStatus};
use super::ScriptId;

/// Name of the optional catalog description file.
pub const CATALOG_FILE: &str = "catalog.toml";

const SCRIPT_SUFFIX: &str = ".user.js";

/// Enumerates every stored script.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_scripts(&self) -> RuntimeResult<Vec<Script>>;
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    scripts: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    id: ScriptId,
    file: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    overrides: Option<Metadata>,
}

fn default_enabled() -> bool {
    true
}

/// Catalog backed by a directory of userscript files.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    dir: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read the catalog synchronously.
    ///
    /// A missing directory is an empty catalog. Scripts with an unreadable
    /// file or a broken header are skipped with a warning.
    pub fn load(&self) -> RuntimeResult<Vec<Script>> {
        if !self.dir.exists() {
            debug!(dir = %self.dir.display(), "Catalog directory does not exist");
            return Ok(Vec::new());
        }

        let description = self.read_description()?;
        let mut scripts = Vec::new();
        let mut listed = HashSet::new();
        let mut ids = HashSet::new();

        for entry in &description.scripts {
            if !ids.insert(entry.id) {
                return Err(RuntimeError::Catalog(format!(
                    "script id {} is listed twice in {}",
                    entry.id, CATALOG_FILE
                )));
            }
            listed.insert(entry.file.clone());

            let Some(mut script) = self.load_file(entry.id, &self.dir.join(&entry.file)) else {
                continue;
            };
            if !entry.enabled {
                script.status = ScriptStatus::Disabled;
            }
            script.overrides = entry.overrides.clone();
            scripts.push(script);
        }

        let mut unlisted: Vec<String> = fs::read_dir(&self.dir)?
            .flatten()
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.ends_with(SCRIPT_SUFFIX) && !listed.contains(name))
            .collect();
        unlisted.sort();

        let mut next_id = ids.iter().max().map_or(1, |max| max + 1);
        for file in unlisted {
            if let Some(script) = self.load_file(next_id, &self.dir.join(&file)) {
                scripts.push(script);
                next_id += 1;
            }
        }

        scripts.sort_by_key(|s| s.id);
        debug!(dir = %self.dir.display(), scripts = scripts.len(), "Catalog loaded");
        Ok(scripts)
    }

    fn read_description(&self) -> RuntimeResult<CatalogFile> {
        let path = self.dir.join(CATALOG_FILE);
        if !path.exists() {
            return Ok(CatalogFile::default());
        }
        let content = fs::read_to_string(&path)?;
        toml::from_str(&content)
            .map_err(|e| RuntimeError::Catalog(format!("{}: {}", path.display(), e)))
    }

    fn load_file(&self, id: ScriptId, path: &Path) -> Option<Script> {
        match load_script(id, path) {
            Ok(script) => Some(script),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping script");
                None
            }
        }
    }
}

#[async_trait]
impl CatalogStore for DirectoryCatalog {
    async fn list_scripts(&self) -> RuntimeResult<Vec<Script>> {
        let catalog = self.clone();
        tokio::task::spawn_blocking(move || catalog.load())
            .await
            .map_err(|e| RuntimeError::Catalog(format!("join error: {}", e)))?
    }
}

/// Build a script record from a userscript file.
pub fn load_script(id: ScriptId, path: &Path) -> RuntimeResult<Script> {
    let code = fs::read_to_string(path)?;
    script_from_source(id, code)
}

/// Build a script record from userscript source text.
pub fn script_from_source(id: ScriptId, code: String) -> RuntimeResult<Script> {
    let metadata = parse_header(&code)?;
    let name = first_value(&metadata, "name").unwrap_or_default().to_string();
    Ok(Script {
        id,
        name,
        kind: ScriptKind::from_metadata(&metadata),
        status: ScriptStatus::Enabled,
        metadata,
        overrides: None,
        code,
    })
}

/// Catalog held in memory, mostly for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    scripts: BTreeMap<ScriptId, Script>,
}

impl MemoryCatalog {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: scripts.into_iter().map(|s| (s.id, s)).collect(),
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn list_scripts(&self) -> RuntimeResult<Vec<Script>> {
        Ok(self.scripts.values().cloned().collect())
    }
}

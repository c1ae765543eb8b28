//! Run resource compilation.
//!
//! A [`RunResource`] is everything needed to inject one load of a script:
//! merged metadata, the value snapshot, resolved resources, the grant map and
//! the wrapped code. Every compile mints a fresh `flag`, so two loads of the
//! same script never share a namespace in the page.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::error::{RuntimeError, RuntimeResult};
use super::script::{Metadata, Script};
use super::ScriptId;

/// A resolved external dependency (`@require` or `@resource`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Where the dependency was declared to come from.
    pub url: String,
    pub content: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Key under which a `@require` is stored in the resource map.
pub fn require_key(url: &str) -> String {
    format!("require:{}", url)
}

/// Dependencies declared by a script, as `(key, url)` pairs in declaration
/// order: every `@require` followed by every `@resource name url`.
pub fn declared_dependencies(metadata: &Metadata) -> Vec<(String, String)> {
    let mut deps = Vec::new();
    for url in metadata.get("require").into_iter().flatten() {
        deps.push((require_key(url), url.clone()));
    }
    for decl in metadata.get("resource").into_iter().flatten() {
        if let Some((name, url)) = decl.split_once(char::is_whitespace) {
            deps.push((name.to_string(), url.trim().to_string()));
        }
    }
    deps
}

/// Supplies the stored key/value snapshot of a script.
#[async_trait]
pub trait ValuesResolver: Send + Sync {
    async fn get_values(&self, script: &Script) -> anyhow::Result<HashMap<String, serde_json::Value>>;
}

/// Supplies the resolved dependencies of a script.
#[async_trait]
pub trait ResourcesResolver: Send + Sync {
    async fn get_resources(
        &self,
        script: &Script,
        metadata: &Metadata,
    ) -> anyhow::Result<BTreeMap<String, Resource>>;
}

/// The compiled, immutable artifact for one load of a script.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResource {
    script: Script,
    flag: String,
    metadata: Metadata,
    value: HashMap<String, serde_json::Value>,
    resource: BTreeMap<String, Resource>,
    grant_map: BTreeSet<String>,
    code: String,
}

impl RunResource {
    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn id(&self) -> ScriptId {
        self.script.id
    }

    /// Unique token of this load.
    pub fn flag(&self) -> &str {
        &self.flag
    }

    /// Metadata with per-installation overrides applied.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn value(&self) -> &HashMap<String, serde_json::Value> {
        &self.value
    }

    pub fn resource(&self) -> &BTreeMap<String, Resource> {
        &self.resource
    }

    pub fn grant_map(&self) -> &BTreeSet<String> {
        &self.grant_map
    }

    pub fn is_granted(&self, capability: &str) -> bool {
        self.grant_map.contains(capability)
    }

    /// Wrapped source, callable as `window[flag](context)`.
    pub fn code(&self) -> &str {
        &self.code
    }
}

impl AsRef<Script> for RunResource {
    fn as_ref(&self) -> &Script {
        &self.script
    }
}

/// Builds [`RunResource`]s from stored scripts.
#[derive(Clone)]
pub struct RunResourceCompiler {
    values: Arc<dyn ValuesResolver>,
    resources: Arc<dyn ResourcesResolver>,
}

impl RunResourceCompiler {
    pub fn new(values: Arc<dyn ValuesResolver>, resources: Arc<dyn ResourcesResolver>) -> Self {
        Self { values, resources }
    }

    /// Compile a script. The script itself is never modified.
    pub async fn compile(&self, script: &Script) -> RuntimeResult<RunResource> {
        let metadata = script.effective_metadata();

        let value = self
            .values
            .get_values(script)
            .await
            .map_err(|e| RuntimeError::ValueResolution {
                script_id: script.id,
                message: format!("{:#}", e),
            })?;

        let resource = self
            .resources
            .get_resources(script, &metadata)
            .await
            .map_err(|e| RuntimeError::ResourceResolution {
                script_id: script.id,
                message: format!("{:#}", e),
            })?;

        let flag = new_flag();
        let code = wrap_code(&flag, &script_body(script, &metadata, &resource));

        let grant_map = metadata
            .get("grant")
            .into_iter()
            .flatten()
            .filter(|g| !g.is_empty())
            .cloned()
            .collect();

        debug!(script_id = script.id, flag = %flag, "Compiled run resource");

        Ok(RunResource {
            script: script.clone(),
            flag,
            metadata,
            value,
            resource,
            grant_map,
            code,
        })
    }
}

/// Fresh namespace token for one load.
pub fn new_flag() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Required libraries in declaration order, then the script's own source.
fn script_body(script: &Script, metadata: &Metadata, resources: &BTreeMap<String, Resource>) -> String {
    let mut body = String::new();
    for url in metadata.get("require").into_iter().flatten() {
        if let Some(required) = resources.get(&require_key(url)) {
            body.push_str(&required.content);
            body.push('\n');
        }
    }
    body.push_str(&script.code);
    body
}

/// Wrap a body so it is installed under `flag` and receives its execution
/// context when called.
pub fn wrap_code(flag: &str, body: &str) -> String {
    format!("window['{}']=function(context){{\n{}\n}}", flag, body)
}

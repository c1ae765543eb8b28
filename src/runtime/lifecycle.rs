//! Script lifecycle state machine.
//!
//! Each script is `Unloaded`, `LoadedPage` (its patterns live in the page
//! index) or `LoadedBackground` (the sandbox runs it). Every transition is a
//! full rebuild: enabling an already loaded script recompiles it and replaces
//! all of its entries, disabling an unloaded script clears nothing twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::compiler::{RunResource, RunResourceCompiler};
use super::error::{RuntimeError, RuntimeResult};
use super::pattern::{PatternIndex, PatternResult};
use super::script::Script;
use super::transport::{with_timeout, InjectionTransport};
use super::ScriptId;

/// Index of loaded page scripts.
pub type PageIndex = PatternIndex<RunResource>;

/// Where a script currently lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScriptState {
    #[default]
    Unloaded,
    LoadedPage,
    LoadedBackground,
}

/// Outcome of loading the whole catalog at startup.
#[derive(Debug, Default)]
pub struct StartupReport {
    pub loaded: usize,
    pub failed: Vec<(ScriptId, RuntimeError)>,
}

/// Drives page index updates and background transport calls.
pub struct LifecycleController {
    compiler: RunResourceCompiler,
    transport: Arc<dyn InjectionTransport>,
    transport_timeout: Duration,
    states: HashMap<ScriptId, ScriptState>,
    background: HashMap<ScriptId, Arc<RunResource>>,
}

impl LifecycleController {
    pub fn new(
        compiler: RunResourceCompiler,
        transport: Arc<dyn InjectionTransport>,
        transport_timeout: Duration,
    ) -> Self {
        Self {
            compiler,
            transport,
            transport_timeout,
            states: HashMap::new(),
            background: HashMap::new(),
        }
    }

    pub fn state(&self, id: ScriptId) -> ScriptState {
        self.states.get(&id).copied().unwrap_or_default()
    }

    /// Resource a running background script was started with.
    pub fn background_resource(&self, id: ScriptId) -> Option<&Arc<RunResource>> {
        self.background.get(&id)
    }

    /// Load every script of the catalog. Failures are logged and reported,
    /// they never stop the remaining scripts from loading.
    pub async fn startup(&mut self, scripts: &[Script], index: &mut PageIndex) -> StartupReport {
        let mut report = StartupReport::default();
        for script in scripts {
            let result = if script.is_enabled() {
                self.enable(script, index).await
            } else if script.kind.is_page() {
                self.disable(script, index).await
            } else {
                continue;
            };
            match result {
                Ok(ScriptState::Unloaded) => {}
                Ok(_) => report.loaded += 1,
                Err(e) => {
                    warn!(script_id = script.id, error = %e, "Script failed to load at startup");
                    report.failed.push((script.id, e));
                }
            }
        }
        info!(
            loaded = report.loaded,
            failed = report.failed.len(),
            "Catalog loaded"
        );
        report
    }

    /// Upsert, enable and disable events: the script's status decides.
    pub async fn script_updated(
        &mut self,
        script: &Script,
        index: &mut PageIndex,
    ) -> RuntimeResult<ScriptState> {
        if script.is_enabled() {
            self.enable(script, index).await
        } else {
            self.disable(script, index).await
        }
    }

    /// Compile and load a script. On error the script keeps its prior state.
    pub async fn enable(
        &mut self,
        script: &Script,
        index: &mut PageIndex,
    ) -> RuntimeResult<ScriptState> {
        let resource = Arc::new(self.compiler.compile(script).await?);
        let prior = self.state(script.id);

        if script.kind.is_page() {
            if prior == ScriptState::LoadedBackground {
                self.stop_background(script.id).await?;
            }
            let skipped = load_page(index, &resource);
            self.states.insert(script.id, ScriptState::LoadedPage);
            info!(
                script_id = script.id,
                name = %script.name,
                skipped_patterns = skipped,
                "Page script loaded"
            );
            Ok(ScriptState::LoadedPage)
        } else {
            if prior == ScriptState::LoadedPage {
                clear_page(index, script.id);
                self.states.insert(script.id, ScriptState::Unloaded);
            }
            self.start_background(resource).await?;
            info!(script_id = script.id, name = %script.name, "Background script loaded");
            Ok(ScriptState::LoadedBackground)
        }
    }

    /// Unload a script.
    pub async fn disable(
        &mut self,
        script: &Script,
        index: &mut PageIndex,
    ) -> RuntimeResult<ScriptState> {
        match self.state(script.id) {
            ScriptState::LoadedBackground => {
                self.stop_background(script.id).await?;
                info!(script_id = script.id, "Background script unloaded");
            }
            ScriptState::LoadedPage | ScriptState::Unloaded => {
                clear_page(index, script.id);
                self.states.insert(script.id, ScriptState::Unloaded);
                info!(script_id = script.id, "Page script unloaded");
            }
        }
        Ok(ScriptState::Unloaded)
    }

    /// Unload a script and drop every trace of it from the index.
    ///
    /// A failing background stop is still reported, but only after the index
    /// has been cleaned up.
    pub async fn delete(
        &mut self,
        script: &Script,
        index: &mut PageIndex,
    ) -> RuntimeResult<ScriptState> {
        let stopped = if self.state(script.id) == ScriptState::LoadedBackground {
            self.stop_background(script.id).await
        } else {
            Ok(())
        };

        index.remove(script.id);

        stopped?;
        self.states.remove(&script.id);
        info!(script_id = script.id, "Script deleted");
        Ok(ScriptState::Unloaded)
    }

    async fn start_background(&mut self, resource: Arc<RunResource>) -> RuntimeResult<()> {
        let id = resource.id();
        with_timeout(self.transport_timeout, self.transport.enable(Arc::clone(&resource)))
            .await
            .map_err(|e| {
                error!(script_id = id, error = %e, "Background script failed to load");
                RuntimeError::BackgroundLoad {
                    script_id: id,
                    message: format!("{:#}", e),
                }
            })?;
        self.states.insert(id, ScriptState::LoadedBackground);
        self.background.insert(id, resource);
        Ok(())
    }

    async fn stop_background(&mut self, id: ScriptId) -> RuntimeResult<()> {
        with_timeout(self.transport_timeout, self.transport.disable(id))
            .await
            .map_err(|e| {
                error!(script_id = id, error = %e, "Background script failed to stop");
                RuntimeError::BackgroundUnload {
                    script_id: id,
                    message: format!("{:#}", e),
                }
            })?;
        self.states.insert(id, ScriptState::Unloaded);
        self.background.remove(&id);
        Ok(())
    }
}

type AddPattern = fn(&mut PageIndex, &str, &Arc<RunResource>) -> PatternResult<()>;

/// Replace a page script's entries with the ones its metadata declares.
/// Returns how many malformed patterns were skipped.
fn load_page(index: &mut PageIndex, resource: &Arc<RunResource>) -> usize {
    let id = resource.id();
    clear_page(index, id);

    let metadata = resource.metadata();
    let mut skipped = 0;
    let declared: [(&str, AddPattern); 3] = [
        ("match", PageIndex::add),
        ("include", PageIndex::add_include),
        ("exclude", PageIndex::exclude),
    ];
    for (key, add) in declared {
        for pattern in metadata.get(key).into_iter().flatten() {
            if let Err(e) = add(index, pattern, resource) {
                warn!(script_id = id, key, error = %e, "Skipping malformed pattern");
                skipped += 1;
            }
        }
    }
    skipped
}

fn clear_page(index: &mut PageIndex, id: ScriptId) {
    index.del(id);
    index.del_include(id);
    index.del_exclude(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::compiler::{Resource, ResourcesResolver, ValuesResolver};
    use crate::runtime::script::{Metadata, ScriptKind, ScriptStatus};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct NoValues;

    #[async_trait]
    impl ValuesResolver for NoValues {
        async fn get_values(
            &self,
            _script: &Script,
        ) -> anyhow::Result<HashMap<String, serde_json::Value>> {
            Ok(HashMap::new())
        }
    }

    #[derive(Default)]
    struct ToggleResources {
        fail: AtomicBool,
    }

    #[async_trait]
    impl ResourcesResolver for ToggleResources {
        async fn get_resources(
            &self,
            _script: &Script,
            _metadata: &Metadata,
        ) -> anyhow::Result<BTreeMap<String, Resource>> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("resource host unreachable");
            }
            Ok(BTreeMap::new())
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl InjectionTransport for RecordingTransport {
        async fn enable(&self, resource: Arc<RunResource>) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("enable:{}", resource.id()));
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("sandbox crashed");
            }
            Ok(())
        }

        async fn disable(&self, script_id: ScriptId) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("disable:{}", script_id));
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("sandbox crashed");
            }
            Ok(())
        }
    }

    struct Fixture {
        controller: LifecycleController,
        index: PageIndex,
        resources: Arc<ToggleResources>,
        transport: Arc<RecordingTransport>,
    }

    fn fixture() -> Fixture {
        let resources = Arc::new(ToggleResources::default());
        let transport = Arc::new(RecordingTransport::default());
        let compiler = RunResourceCompiler::new(Arc::new(NoValues), resources.clone());
        Fixture {
            controller: LifecycleController::new(
                compiler,
                transport.clone(),
                Duration::from_secs(1),
            ),
            index: PageIndex::new(),
            resources,
            transport,
        }
    }

    fn page_script(id: ScriptId) -> Script {
        Script::new(id, format!("page-{}", id), "run();")
            .with_meta("match", ["*://example.com/*"])
            .with_meta("exclude", ["*://example.com/admin/*"])
    }

    fn background_script(id: ScriptId) -> Script {
        Script::new(id, format!("bg-{}", id), "tick();").with_kind(ScriptKind::Background)
    }

    #[tokio::test]
    async fn test_enable_page_script_indexes_patterns() {
        let mut f = fixture();
        let script = page_script(1);

        let state = f.controller.enable(&script, &mut f.index).await.unwrap();
        assert_eq!(state, ScriptState::LoadedPage);
        assert_eq!(f.index.query("https://example.com/a").len(), 1);
        assert!(f.index.query("https://example.com/admin/x").is_empty());
        assert!(f.transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_pattern_is_skipped() {
        let mut f = fixture();
        let script = page_script(1).with_meta("match", ["not a pattern", "*://example.org/*"]);

        f.controller.enable(&script, &mut f.index).await.unwrap();
        assert_eq!(f.index.query("https://example.org/").len(), 1);
    }

    #[tokio::test]
    async fn test_enable_twice_rebuilds_with_new_flag() {
        let mut f = fixture();
        let script = page_script(1);

        f.controller.enable(&script, &mut f.index).await.unwrap();
        let first = f.index.query("https://example.com/")[0].flag().to_string();
        f.controller.enable(&script, &mut f.index).await.unwrap();
        let found = f.index.query("https://example.com/");

        assert_eq!(found.len(), 1);
        assert_ne!(found[0].flag(), first);
    }

    #[tokio::test]
    async fn test_disable_is_idempotent() {
        let mut f = fixture();
        let script = page_script(1);

        f.controller.enable(&script, &mut f.index).await.unwrap();
        let disabled = script.clone().with_status(ScriptStatus::Disabled);
        for _ in 0..2 {
            let state = f.controller.script_updated(&disabled, &mut f.index).await.unwrap();
            assert_eq!(state, ScriptState::Unloaded);
            assert!(f.index.query("https://example.com/").is_empty());
        }
    }

    #[tokio::test]
    async fn test_disable_then_enable_applies_both() {
        let mut f = fixture();
        let script = page_script(1);
        let disabled = script.clone().with_status(ScriptStatus::Disabled);

        f.controller.script_updated(&script, &mut f.index).await.unwrap();
        f.controller.script_updated(&disabled, &mut f.index).await.unwrap();
        f.controller.script_updated(&script, &mut f.index).await.unwrap();

        assert_eq!(f.controller.state(1), ScriptState::LoadedPage);
        assert_eq!(f.index.query("https://example.com/").len(), 1);
    }

    #[tokio::test]
    async fn test_resolution_failure_keeps_prior_state() {
        let mut f = fixture();
        let script = page_script(1);
        f.controller.enable(&script, &mut f.index).await.unwrap();
        let before = f.index.query("https://example.com/")[0].flag().to_string();

        f.resources.fail.store(true, Ordering::SeqCst);
        let edited = script.clone().with_meta("match", ["*://example.org/*"]);
        let err = f.controller.enable(&edited, &mut f.index).await.unwrap_err();

        assert!(matches!(err, RuntimeError::ResourceResolution { script_id: 1, .. }));
        assert_eq!(f.controller.state(1), ScriptState::LoadedPage);
        assert_eq!(f.index.query("https://example.com/")[0].flag(), before);
        assert!(f.index.query("https://example.org/").is_empty());
    }

    #[tokio::test]
    async fn test_background_lifecycle() {
        let mut f = fixture();
        let script = background_script(2);

        let state = f.controller.enable(&script, &mut f.index).await.unwrap();
        assert_eq!(state, ScriptState::LoadedBackground);
        assert!(f.controller.background_resource(2).is_some());
        assert!(f.index.is_empty());

        let disabled = script.clone().with_status(ScriptStatus::Disabled);
        f.controller.script_updated(&disabled, &mut f.index).await.unwrap();
        assert_eq!(f.controller.state(2), ScriptState::Unloaded);

        // Already unloaded: no second transport call
        f.controller.script_updated(&disabled, &mut f.index).await.unwrap();
        assert_eq!(
            *f.transport.calls.lock().unwrap(),
            vec!["enable:2".to_string(), "disable:2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_background_load_failure() {
        let mut f = fixture();
        f.transport.fail.store(true, Ordering::SeqCst);

        let err = f.controller.enable(&background_script(2), &mut f.index).await.unwrap_err();
        assert!(matches!(err, RuntimeError::BackgroundLoad { script_id: 2, .. }));
        assert_eq!(f.controller.state(2), ScriptState::Unloaded);
    }

    #[tokio::test]
    async fn test_background_unload_failure_keeps_state() {
        let mut f = fixture();
        let script = background_script(2);
        f.controller.enable(&script, &mut f.index).await.unwrap();

        f.transport.fail.store(true, Ordering::SeqCst);
        let err = f.controller.disable(&script, &mut f.index).await.unwrap_err();
        assert!(matches!(err, RuntimeError::BackgroundUnload { script_id: 2, .. }));
        assert_eq!(f.controller.state(2), ScriptState::LoadedBackground);
    }

    #[tokio::test]
    async fn test_delete_background_disables_first() {
        let mut f = fixture();
        let script = background_script(2);
        f.controller.enable(&script, &mut f.index).await.unwrap();

        f.controller.delete(&script, &mut f.index).await.unwrap();
        assert_eq!(f.controller.state(2), ScriptState::Unloaded);
        assert_eq!(
            f.transport.calls.lock().unwrap().last().map(String::as_str),
            Some("disable:2")
        );
    }

    #[tokio::test]
    async fn test_delete_page_script_clears_index() {
        let mut f = fixture();
        let script = page_script(1);
        f.controller.enable(&script, &mut f.index).await.unwrap();

        f.controller.delete(&script, &mut f.index).await.unwrap();
        assert!(f.index.query("https://example.com/").is_empty());
        assert!(!f.index.contains(1));
    }

    #[tokio::test]
    async fn test_kind_change_tears_down_old_side() {
        let mut f = fixture();
        let script = page_script(3);
        f.controller.enable(&script, &mut f.index).await.unwrap();

        let as_background = script.clone().with_kind(ScriptKind::Background);
        f.controller.enable(&as_background, &mut f.index).await.unwrap();
        assert!(f.index.query("https://example.com/").is_empty());
        assert_eq!(f.controller.state(3), ScriptState::LoadedBackground);

        f.controller.enable(&script, &mut f.index).await.unwrap();
        assert_eq!(f.controller.state(3), ScriptState::LoadedPage);
        assert_eq!(
            *f.transport.calls.lock().unwrap(),
            vec!["enable:3".to_string(), "disable:3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_startup_loads_catalog() {
        let mut f = fixture();
        let scripts = vec![
            page_script(1),
            page_script(2).with_status(ScriptStatus::Disabled),
            background_script(3),
            background_script(4).with_status(ScriptStatus::Disabled),
        ];

        let report = f.controller.startup(&scripts, &mut f.index).await;
        assert_eq!(report.loaded, 2);
        assert!(report.failed.is_empty());
        assert_eq!(f.index.query("https://example.com/").len(), 1);
        assert_eq!(*f.transport.calls.lock().unwrap(), vec!["enable:3".to_string()]);
    }
}

//! Page-load handling: which scripts get injected, in which order and when.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::compiler::RunResource;
use super::lifecycle::PageIndex;
use super::menu::{MenuRegistry, ScriptMenu};
use super::script::{first_value, Metadata};
use super::{FrameId, TabId};

/// Frame id of a tab's top-level document.
pub const TOP_FRAME: FrameId = 0;

/// A navigation reported by the page/tab event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageLoad {
    pub url: String,
    pub tab_id: TabId,
    #[serde(default)]
    pub frame_id: FrameId,
    /// Origin of the notification, when the event source provides one.
    #[serde(default)]
    pub sender: Option<String>,
}

/// When an instruction runs relative to document parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAt {
    DocumentStart,
    DocumentEnd,
    #[default]
    DocumentIdle,
}

impl RunAt {
    /// Timing declared by a script's `@run-at`; unknown values run at idle.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        match first_value(metadata, "run-at") {
            Some("document-start" | "document-body" | "document-menu") => RunAt::DocumentStart,
            Some("document-end") => RunAt::DocumentEnd,
            _ => RunAt::DocumentIdle,
        }
    }
}

/// One unit of code for the injection sink to materialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionInstruction {
    pub code: String,
    pub run_at: RunAt,
}

/// Materializes instructions into a page or frame.
pub trait InjectionSink: Send + Sync {
    fn inject(&self, tab_id: TabId, frame_id: FrameId, instructions: &[InjectionInstruction]);
}

/// Shows the per-tab script counter.
pub trait BadgePublisher: Send + Sync {
    fn publish(&self, tab_id: TabId, count: u32);
}

/// Turns page loads into injection instructions and badge updates.
pub struct InjectionDispatcher {
    bootstrap: String,
    sink: Arc<dyn InjectionSink>,
    badge: Arc<dyn BadgePublisher>,
    counts: HashMap<TabId, u32>,
}

impl InjectionDispatcher {
    /// `runtime_source` is the in-page runtime; it is wrapped so that it
    /// receives `runtime_flag` as its namespace.
    pub fn new(
        runtime_source: &str,
        runtime_flag: &str,
        sink: Arc<dyn InjectionSink>,
        badge: Arc<dyn BadgePublisher>,
    ) -> Self {
        Self {
            bootstrap: format!(
                "(function (ScriptFlag) {{\n{}\n}})('{}')",
                runtime_source, runtime_flag
            ),
            sink,
            badge,
            counts: HashMap::new(),
        }
    }

    pub fn bootstrap_code(&self) -> &str {
        &self.bootstrap
    }

    /// Scripts that should run in the given frame, in index order.
    pub fn select(&self, load: &PageLoad, index: &PageIndex) -> Vec<Arc<RunResource>> {
        index
            .query(&load.url)
            .into_iter()
            .filter(|res| res.script().is_enabled())
            .filter(|res| load.frame_id == TOP_FRAME || !res.metadata().contains_key("noframes"))
            .collect()
    }

    /// Handle a page load. Returns the instructions sent to the sink, empty
    /// when nothing applies (in which case neither sink nor badge is touched).
    pub fn on_page_load(&mut self, load: &PageLoad, index: &PageIndex) -> Vec<InjectionInstruction> {
        let selected = self.select(load, index);
        if selected.is_empty() {
            debug!(url = %load.url, tab_id = load.tab_id, frame_id = load.frame_id, "No scripts for page");
            return Vec::new();
        }

        let mut instructions = Vec::with_capacity(selected.len() + 1);
        instructions.push(InjectionInstruction {
            code: self.bootstrap.clone(),
            run_at: RunAt::DocumentStart,
        });
        instructions.extend(selected.iter().map(|res| InjectionInstruction {
            code: res.code().to_string(),
            run_at: RunAt::from_metadata(res.metadata()),
        }));

        self.sink.inject(load.tab_id, load.frame_id, &instructions);

        let count = self.counts.entry(load.tab_id).or_insert(0);
        *count = count.saturating_add(u32::try_from(selected.len()).unwrap_or(u32::MAX));
        self.badge.publish(load.tab_id, *count);

        info!(
            url = %load.url,
            tab_id = load.tab_id,
            frame_id = load.frame_id,
            sender = load.sender.as_deref().unwrap_or("-"),
            scripts = selected.len(),
            badge = *count,
            "Injected scripts"
        );
        instructions
    }

    /// Current badge count of a tab.
    pub fn badge_count(&self, tab_id: TabId) -> u32 {
        self.counts.get(&tab_id).copied().unwrap_or(0)
    }

    /// Clear the counter, e.g. when the tab starts a new top-level navigation.
    pub fn reset_badge(&mut self, tab_id: TabId) {
        if self.counts.remove(&tab_id).is_some() {
            self.badge.publish(tab_id, 0);
        }
    }

    /// Forget a closed tab.
    pub fn remove_tab(&mut self, tab_id: TabId) {
        self.counts.remove(&tab_id);
    }
}

/// Scripts matching `url` together with the menu commands they registered
/// in `tab_id`. Read-only.
pub fn query_page_scripts(
    url: &str,
    tab_id: TabId,
    index: &PageIndex,
    menus: &MenuRegistry,
) -> Vec<ScriptMenu> {
    index
        .query(url)
        .into_iter()
        .map(|res| {
            let script = res.script();
            ScriptMenu {
                id: script.id,
                name: script.name.clone(),
                enabled: script.is_enabled(),
                menus: menus.commands(tab_id, script.id),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::compiler::{Resource, ResourcesResolver, RunResourceCompiler, ValuesResolver};
    use crate::runtime::menu::{MenuChannel, MenuPublisher, MenuRegistration, Requester};
    use crate::runtime::script::Script;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct Empty;

    #[async_trait]
    impl ValuesResolver for Empty {
        async fn get_values(
            &self,
            _script: &Script,
        ) -> anyhow::Result<HashMap<String, serde_json::Value>> {
            Ok(HashMap::new())
        }
    }

    #[async_trait]
    impl ResourcesResolver for Empty {
        async fn get_resources(
            &self,
            _script: &Script,
            _metadata: &Metadata,
        ) -> anyhow::Result<BTreeMap<String, Resource>> {
            Ok(BTreeMap::new())
        }
    }

    #[derive(Default)]
    struct Recorder {
        injected: Mutex<Vec<(TabId, FrameId, usize)>>,
        badges: Mutex<Vec<(TabId, u32)>>,
    }

    impl InjectionSink for Recorder {
        fn inject(&self, tab_id: TabId, frame_id: FrameId, instructions: &[InjectionInstruction]) {
            self.injected
                .lock()
                .unwrap()
                .push((tab_id, frame_id, instructions.len()));
        }
    }

    impl BadgePublisher for Recorder {
        fn publish(&self, tab_id: TabId, count: u32) {
            self.badges.lock().unwrap().push((tab_id, count));
        }
    }

    struct NoMenus;

    impl MenuPublisher for NoMenus {
        fn publish(&self, _tab_id: TabId, _menus: &[ScriptMenu]) {}
    }

    struct Channel;

    impl MenuChannel for Channel {
        fn flag(&self) -> &str {
            "chan"
        }

        fn close(&self) {}
    }

    async fn load(index: &mut PageIndex, script: Script) {
        let compiler = RunResourceCompiler::new(Arc::new(Empty), Arc::new(Empty));
        let resource = Arc::new(compiler.compile(&script).await.unwrap());
        for pattern in &resource.metadata()["match"] {
            index.add(pattern, &resource).unwrap();
        }
    }

    fn dispatcher(recorder: &Arc<Recorder>) -> InjectionDispatcher {
        InjectionDispatcher::new("setup();", "rtflag", recorder.clone(), recorder.clone())
    }

    fn page(url: &str, tab_id: TabId, frame_id: FrameId) -> PageLoad {
        PageLoad {
            url: url.to_string(),
            tab_id,
            frame_id,
            sender: None,
        }
    }

    #[test]
    fn test_run_at_mapping() {
        let cases = [
            (Some("document-start"), RunAt::DocumentStart),
            (Some("document-body"), RunAt::DocumentStart),
            (Some("document-menu"), RunAt::DocumentStart),
            (Some("document-end"), RunAt::DocumentEnd),
            (Some("document-idle"), RunAt::DocumentIdle),
            (Some("whenever"), RunAt::DocumentIdle),
            (None, RunAt::DocumentIdle),
        ];
        for (declared, expected) in cases {
            let mut meta = Metadata::new();
            if let Some(value) = declared {
                meta.insert("run-at".to_string(), vec![value.to_string()]);
            }
            assert_eq!(RunAt::from_metadata(&meta), expected, "{:?}", declared);
        }
    }

    #[test]
    fn test_bootstrap_wraps_runtime() {
        let recorder = Arc::new(Recorder::default());
        let d = dispatcher(&recorder);
        assert_eq!(d.bootstrap_code(), "(function (ScriptFlag) {\nsetup();\n})('rtflag')");
    }

    #[tokio::test]
    async fn test_noframes_script_skipped_in_subframe() {
        let mut index = PageIndex::new();
        load(
            &mut index,
            Script::new(1, "top only", "a();")
                .with_meta("match", ["*://example.com/*"])
                .with_meta("noframes", [""]),
        )
        .await;
        load(
            &mut index,
            Script::new(2, "everywhere", "b();")
                .with_meta("match", ["*://example.com/*"])
                .with_meta("run-at", ["document-end"]),
        )
        .await;

        let recorder = Arc::new(Recorder::default());
        let mut d = dispatcher(&recorder);

        let sub = d.on_page_load(&page("https://example.com/frame", 3, 5), &index);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub[0].run_at, RunAt::DocumentStart);
        assert!(sub[1].code.contains("b();"));
        assert_eq!(sub[1].run_at, RunAt::DocumentEnd);

        let top = d.on_page_load(&page("https://example.com/", 3, TOP_FRAME), &index);
        assert_eq!(top.len(), 3);
        assert!(top[1].code.contains("a();"));
        assert!(top[2].code.contains("b();"));
    }

    #[tokio::test]
    async fn test_badge_is_additive() {
        let mut index = PageIndex::new();
        load(
            &mut index,
            Script::new(1, "one", "").with_meta("match", ["*://example.com/*"]),
        )
        .await;
        load(
            &mut index,
            Script::new(2, "two", "").with_meta("match", ["*://example.com/*"]),
        )
        .await;
        load(
            &mut index,
            Script::new(3, "three", "").with_meta("match", ["*://*.example.com/*"]),
        )
        .await;

        let recorder = Arc::new(Recorder::default());
        let mut d = dispatcher(&recorder);

        // Only the `*.example.com` script matches the subdomain
        d.on_page_load(&page("https://cdn.example.com/", 7, 1), &index);
        d.on_page_load(&page("https://cdn.example.com/", 7, 2), &index);
        assert_eq!(d.badge_count(7), 2);
        d.on_page_load(&page("https://example.com/", 7, 0), &index);
        assert_eq!(d.badge_count(7), 5);

        assert_eq!(*recorder.badges.lock().unwrap(), vec![(7, 1), (7, 2), (7, 5)]);

        d.reset_badge(7);
        assert_eq!(d.badge_count(7), 0);
        assert_eq!(recorder.badges.lock().unwrap().last(), Some(&(7, 0)));
    }

    #[tokio::test]
    async fn test_badge_saturates() {
        let mut index = PageIndex::new();
        load(
            &mut index,
            Script::new(1, "one", "").with_meta("match", ["*://example.com/*"]),
        )
        .await;

        let recorder = Arc::new(Recorder::default());
        let mut d = dispatcher(&recorder);
        d.counts.insert(4, u32::MAX);
        d.on_page_load(&page("https://example.com/", 4, 0), &index);
        assert_eq!(d.badge_count(4), u32::MAX);
    }

    #[tokio::test]
    async fn test_no_match_has_no_side_effects() {
        let mut index = PageIndex::new();
        load(
            &mut index,
            Script::new(1, "one", "").with_meta("match", ["*://example.com/*"]),
        )
        .await;

        let recorder = Arc::new(Recorder::default());
        let mut d = dispatcher(&recorder);
        assert!(d.on_page_load(&page("https://other.test/", 1, 0), &index).is_empty());
        assert!(recorder.injected.lock().unwrap().is_empty());
        assert!(recorder.badges.lock().unwrap().is_empty());
        assert_eq!(d.badge_count(1), 0);
    }

    #[tokio::test]
    async fn test_query_page_scripts_includes_menus() {
        let mut index = PageIndex::new();
        load(
            &mut index,
            Script::new(1, "one", "").with_meta("match", ["*://example.com/*"]),
        )
        .await;
        load(
            &mut index,
            Script::new(2, "two", "").with_meta("match", ["*://example.com/*"]),
        )
        .await;

        let mut menus = MenuRegistry::new(Arc::new(NoMenus));
        menus.register(MenuRegistration {
            tab_id: Some(4),
            script_id: 2,
            command_id: 1,
            label: "Toggle".to_string(),
            access_key: "t".to_string(),
            requester: Requester::default(),
            channel: Arc::new(Channel),
        });

        let found = query_page_scripts("https://example.com/", 4, &index, &menus);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "one");
        assert!(found[0].menus.is_empty());
        assert_eq!(found[1].menus[0].name, "Toggle");
        assert!(found.iter().all(|s| s.enabled));

        // Other tabs see no commands
        assert!(query_page_scripts("https://example.com/", 5, &index, &menus)[1]
            .menus
            .is_empty());
    }
}

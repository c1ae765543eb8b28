//! Script host - owns all runtime state.
//!
//! The ScriptHost is responsible for:
//! - Loading the catalog at startup
//! - Applying catalog and menu events to the index and registry
//! - Answering page loads with injection instructions
//! - Keeping per-tab state in step with tab activation and removal
//!
//! When spawned, it runs on a single tokio task fed by an unbounded channel,
//! so every message is handled to completion in arrival order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::catalog::CatalogStore;
use super::compiler::{ResourcesResolver, RunResourceCompiler, ValuesResolver};
use super::dispatcher::{
    query_page_scripts, BadgePublisher, InjectionDispatcher, InjectionInstruction, InjectionSink,
    PageLoad,
};
use super::error::{RuntimeError, RuntimeResult};
use super::events::{EventBus, RuntimeEvent};
use super::lifecycle::{LifecycleController, PageIndex, StartupReport};
use super::menu::{MenuPublisher, MenuRegistry, ScriptMenu};
use super::transport::InjectionTransport;
use super::TabId;

/// Tunables of the script host.
#[derive(Debug, Clone)]
pub struct ScriptHostConfig {
    /// Upper bound for one background enable/disable call.
    pub transport_timeout: Duration,

    /// In-page runtime injected ahead of the scripts.
    pub runtime_source: String,

    /// Namespace the in-page runtime is started with.
    pub runtime_flag: String,
}

impl Default for ScriptHostConfig {
    fn default() -> Self {
        Self {
            transport_timeout: Duration::from_secs(10),
            runtime_source: String::new(),
            runtime_flag: super::compiler::new_flag(),
        }
    }
}

/// External collaborators the host talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub values: Arc<dyn ValuesResolver>,
    pub resources: Arc<dyn ResourcesResolver>,
    pub transport: Arc<dyn InjectionTransport>,
    pub sink: Arc<dyn InjectionSink>,
    pub badge: Arc<dyn BadgePublisher>,
    pub menus: Arc<dyn MenuPublisher>,
}

/// The runtime core: pattern index, menu registry, lifecycle and dispatch.
pub struct ScriptHost {
    index: PageIndex,
    menus: MenuRegistry,
    lifecycle: LifecycleController,
    dispatcher: InjectionDispatcher,
}

impl ScriptHost {
    pub fn new(config: ScriptHostConfig, collaborators: Collaborators) -> Self {
        let compiler = RunResourceCompiler::new(collaborators.values, collaborators.resources);
        Self {
            index: PageIndex::new(),
            menus: MenuRegistry::new(collaborators.menus),
            lifecycle: LifecycleController::new(
                compiler,
                collaborators.transport,
                config.transport_timeout,
            ),
            dispatcher: InjectionDispatcher::new(
                &config.runtime_source,
                &config.runtime_flag,
                collaborators.sink,
                collaborators.badge,
            ),
        }
    }

    /// Load every script of the catalog.
    pub async fn start(&mut self, catalog: &dyn CatalogStore) -> RuntimeResult<StartupReport> {
        let scripts = catalog.list_scripts().await?;
        for script in &scripts {
            self.menus
                .describe_script(script.id, &script.name, script.is_enabled());
        }
        Ok(self.lifecycle.startup(&scripts, &mut self.index).await)
    }

    /// Apply one catalog or menu event.
    pub async fn handle_event(&mut self, event: &RuntimeEvent) -> RuntimeResult<()> {
        debug!(kind = ?event.kind(), "Handling event");
        match event {
            RuntimeEvent::Upsert(script)
            | RuntimeEvent::Enable(script)
            | RuntimeEvent::Disable(script) => {
                self.menus
                    .describe_script(script.id, &script.name, script.is_enabled());
                self.lifecycle
                    .script_updated(script, &mut self.index)
                    .await
                    .map(|_| ())
            }
            RuntimeEvent::Delete(script) => {
                let result = self.lifecycle.delete(script, &mut self.index).await;
                self.menus.remove_script(script.id);
                result.map(|_| ())
            }
            RuntimeEvent::RegisterMenu(registration) => {
                self.menus.register(registration.clone());
                Ok(())
            }
            RuntimeEvent::UnregisterMenu {
                tab_id,
                script_id,
                command_id,
            } => {
                self.menus.unregister(*tab_id, *script_id, *command_id);
                Ok(())
            }
        }
    }

    pub fn page_load(&mut self, load: &PageLoad) -> Vec<InjectionInstruction> {
        self.dispatcher.on_page_load(load, &self.index)
    }

    pub fn tab_activated(&self, tab_id: TabId) {
        self.menus.on_tab_activated(tab_id);
    }

    /// Forget everything kept for a closed tab.
    pub fn tab_removed(&mut self, tab_id: TabId) {
        self.menus.remove_tab(tab_id);
        self.dispatcher.remove_tab(tab_id);
    }

    pub fn reset_badge(&mut self, tab_id: TabId) {
        self.dispatcher.reset_badge(tab_id);
    }

    pub fn query_page_scripts(&self, url: &str, tab_id: TabId) -> Vec<ScriptMenu> {
        query_page_scripts(url, tab_id, &self.index, &self.menus)
    }

    pub fn index(&self) -> &PageIndex {
        &self.index
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn dispatcher(&self) -> &InjectionDispatcher {
        &self.dispatcher
    }

    /// Move the host onto its own task.
    pub fn spawn(self) -> ScriptHostHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(host_loop(self, rx));
        ScriptHostHandle {
            tx,
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        }
    }
}

/// Message types for communicating with a spawned host.
#[derive(Debug)]
enum HostMessage {
    Event {
        event: RuntimeEvent,
        reply: Option<oneshot::Sender<RuntimeResult<()>>>,
    },
    PageLoad {
        load: PageLoad,
        reply: oneshot::Sender<Vec<InjectionInstruction>>,
    },
    QueryPageScripts {
        url: String,
        tab_id: TabId,
        reply: oneshot::Sender<Vec<ScriptMenu>>,
    },
    TabActivated(TabId),
    TabRemoved(TabId),
    ResetBadge(TabId),
    Shutdown,
}

/// Main loop of a spawned host.
async fn host_loop(mut host: ScriptHost, mut rx: mpsc::UnboundedReceiver<HostMessage>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            HostMessage::Event { event, reply } => {
                let result = host.handle_event(&event).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            warn!(kind = ?event.kind(), error = %e, "Event failed");
                        }
                    }
                }
            }
            HostMessage::PageLoad { load, reply } => {
                let _ = reply.send(host.page_load(&load));
            }
            HostMessage::QueryPageScripts { url, tab_id, reply } => {
                let _ = reply.send(host.query_page_scripts(&url, tab_id));
            }
            HostMessage::TabActivated(tab_id) => host.tab_activated(tab_id),
            HostMessage::TabRemoved(tab_id) => host.tab_removed(tab_id),
            HostMessage::ResetBadge(tab_id) => host.reset_badge(tab_id),
            HostMessage::Shutdown => break,
        }
    }
    info!("Script host stopped");
}

/// Cloneable handle to a spawned [`ScriptHost`].
#[derive(Clone)]
pub struct ScriptHostHandle {
    tx: mpsc::UnboundedSender<HostMessage>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for ScriptHostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHostHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl ScriptHostHandle {
    fn send(&self, msg: HostMessage) -> RuntimeResult<()> {
        self.tx.send(msg).map_err(|_| RuntimeError::HostStopped)
    }

    /// Queue an event without waiting for it; failures are logged by the host.
    pub fn dispatch(&self, event: RuntimeEvent) -> RuntimeResult<()> {
        self.send(HostMessage::Event { event, reply: None })
    }

    /// Apply an event and wait for its outcome.
    pub async fn apply(&self, event: RuntimeEvent) -> RuntimeResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HostMessage::Event {
            event,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| RuntimeError::HostStopped)?
    }

    pub async fn page_load(&self, load: PageLoad) -> RuntimeResult<Vec<InjectionInstruction>> {
        let (reply, rx) = oneshot::channel();
        self.send(HostMessage::PageLoad { load, reply })?;
        rx.await.map_err(|_| RuntimeError::HostStopped)
    }

    pub async fn query_page_scripts(
        &self,
        url: &str,
        tab_id: TabId,
    ) -> RuntimeResult<Vec<ScriptMenu>> {
        let (reply, rx) = oneshot::channel();
        self.send(HostMessage::QueryPageScripts {
            url: url.to_string(),
            tab_id,
            reply,
        })?;
        rx.await.map_err(|_| RuntimeError::HostStopped)
    }

    pub fn tab_activated(&self, tab_id: TabId) -> RuntimeResult<()> {
        self.send(HostMessage::TabActivated(tab_id))
    }

    pub fn tab_removed(&self, tab_id: TabId) -> RuntimeResult<()> {
        self.send(HostMessage::TabRemoved(tab_id))
    }

    pub fn reset_badge(&self, tab_id: TabId) -> RuntimeResult<()> {
        self.send(HostMessage::ResetBadge(tab_id))
    }

    /// Forward every event published on `bus` to the host, in publish order.
    pub fn attach(&self, bus: &mut EventBus) {
        let handle = self.clone();
        bus.subscribe_all(move |event| {
            if handle.dispatch(event.clone()).is_err() {
                warn!(kind = ?event.kind(), "Dropping event, script host stopped");
            }
        });
    }

    /// Stop the host after the messages already queued and wait for it.
    pub async fn shutdown(&self) -> RuntimeResult<()> {
        let _ = self.tx.send(HostMessage::Shutdown);
        let task = self
            .task
            .lock()
            .map_err(|_| RuntimeError::HostStopped)?
            .take();
        if let Some(task) = task {
            task.await.map_err(|_| RuntimeError::HostStopped)?;
        }
        Ok(())
    }
}

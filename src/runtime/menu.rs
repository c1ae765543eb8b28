//! Per-tab registry of script menu commands.
//!
//! Scripts register commands from inside a page; each registration holds a
//! reply channel back to the requesting frame. Within one (tab, script)
//! scope command ids are unique: the first registration wins and duplicates
//! get their channel closed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::{FrameId, ScriptId, TabId};

/// Identifier a script assigns to one of its menu commands.
pub type MenuCommandId = u64;

/// Reply channel to the frame that registered a command.
pub trait MenuChannel: Send + Sync {
    /// Identifier of the channel, reported to menu surfaces so a click can be
    /// routed back.
    fn flag(&self) -> &str;

    /// Close the channel; the requester sees its registration rejected.
    fn close(&self);
}

/// Renders or forwards the menu state of a tab.
pub trait MenuPublisher: Send + Sync {
    fn publish(&self, tab_id: TabId, menus: &[ScriptMenu]);
}

/// Who asked for a registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    pub tab_id: Option<TabId>,
    pub frame_id: FrameId,
    pub url: Option<String>,
}

/// A request to add a menu command.
#[derive(Clone)]
pub struct MenuRegistration {
    /// `None` for requests coming from background scripts.
    pub tab_id: Option<TabId>,
    pub script_id: ScriptId,
    pub command_id: MenuCommandId,
    pub label: String,
    pub access_key: String,
    pub requester: Requester,
    pub channel: Arc<dyn MenuChannel>,
}

impl fmt::Debug for MenuRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MenuRegistration")
            .field("tab_id", &self.tab_id)
            .field("script_id", &self.script_id)
            .field("command_id", &self.command_id)
            .field("label", &self.label)
            .field("channel", &self.channel.flag())
            .finish()
    }
}

/// A stored command.
#[derive(Clone)]
struct MenuEntry {
    command_id: MenuCommandId,
    label: String,
    access_key: String,
    requester: Requester,
    channel: Arc<dyn MenuChannel>,
}

impl MenuEntry {
    fn to_command(&self) -> MenuCommand {
        MenuCommand {
            id: self.command_id,
            name: self.label.clone(),
            access_key: self.access_key.clone(),
            sender: self.requester.clone(),
            channel_flag: self.channel.flag().to_string(),
        }
    }
}

/// A command as shown to menu surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuCommand {
    pub id: MenuCommandId,
    pub name: String,
    pub access_key: String,
    pub sender: Requester,
    pub channel_flag: String,
}

/// One script's entry in a menu snapshot or page-scripts query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptMenu {
    pub id: ScriptId,
    pub name: String,
    pub enabled: bool,
    pub menus: Vec<MenuCommand>,
}

#[derive(Debug, Clone, Default)]
struct ScriptLabel {
    name: String,
    enabled: bool,
}

/// Tab -> script -> commands, in registration order at both levels.
pub struct MenuRegistry {
    tabs: HashMap<TabId, Vec<(ScriptId, Vec<MenuEntry>)>>,
    labels: HashMap<ScriptId, ScriptLabel>,
    publisher: Arc<dyn MenuPublisher>,
}

impl MenuRegistry {
    pub fn new(publisher: Arc<dyn MenuPublisher>) -> Self {
        Self {
            tabs: HashMap::new(),
            labels: HashMap::new(),
            publisher,
        }
    }

    /// Record the name and state shown next to a script's commands.
    pub fn describe_script(&mut self, script_id: ScriptId, name: &str, enabled: bool) {
        self.labels.insert(
            script_id,
            ScriptLabel {
                name: name.to_string(),
                enabled,
            },
        );
    }

    /// Add a command. Returns `false` when the registration was dropped.
    pub fn register(&mut self, registration: MenuRegistration) -> bool {
        let Some(tab_id) = registration.tab_id else {
            debug!(
                script_id = registration.script_id,
                "Ignoring menu registration without a tab"
            );
            return false;
        };

        let scripts = self.tabs.entry(tab_id).or_default();
        let position = match scripts.iter().position(|(id, _)| *id == registration.script_id) {
            Some(position) => position,
            None => {
                scripts.push((registration.script_id, Vec::new()));
                scripts.len() - 1
            }
        };
        let entries = &mut scripts[position].1;

        if entries
            .iter()
            .any(|e| e.command_id == registration.command_id)
        {
            debug!(
                tab_id,
                script_id = registration.script_id,
                command_id = registration.command_id,
                "Duplicate menu command, closing channel"
            );
            registration.channel.close();
            return false;
        }

        entries.push(MenuEntry {
            command_id: registration.command_id,
            label: registration.label,
            access_key: registration.access_key,
            requester: registration.requester,
            channel: registration.channel,
        });
        self.publish(tab_id);
        true
    }

    /// Remove a command if present.
    pub fn unregister(&mut self, tab_id: TabId, script_id: ScriptId, command_id: MenuCommandId) {
        if let Some(scripts) = self.tabs.get_mut(&tab_id) {
            if let Some(position) = scripts.iter().position(|(id, _)| *id == script_id) {
                let entries = &mut scripts[position].1;
                entries.retain(|e| e.command_id != command_id);
                if entries.is_empty() {
                    scripts.remove(position);
                }
            }
            if scripts.is_empty() {
                self.tabs.remove(&tab_id);
            }
        }
        self.publish(tab_id);
    }

    /// Refresh menus when the user switches to `tab_id`.
    pub fn on_tab_activated(&self, tab_id: TabId) {
        self.publish(tab_id);
    }

    /// Forget everything registered in a closed or navigated-away tab.
    pub fn remove_tab(&mut self, tab_id: TabId) {
        if self.tabs.remove(&tab_id).is_some() {
            self.publish(tab_id);
        }
    }

    /// Forget a deleted script across all tabs.
    pub fn remove_script(&mut self, script_id: ScriptId) {
        self.labels.remove(&script_id);

        let mut touched = Vec::new();
        self.tabs.retain(|tab_id, scripts| {
            let before = scripts.len();
            scripts.retain(|(id, _)| *id != script_id);
            if scripts.len() != before {
                touched.push(*tab_id);
            }
            !scripts.is_empty()
        });
        for tab_id in touched {
            self.publish(tab_id);
        }
    }

    /// Commands a script registered in a tab.
    pub fn commands(&self, tab_id: TabId, script_id: ScriptId) -> Vec<MenuCommand> {
        self.tabs
            .get(&tab_id)
            .and_then(|scripts| scripts.iter().find(|(id, _)| *id == script_id))
            .map(|(_, entries)| entries.iter().map(MenuEntry::to_command).collect())
            .unwrap_or_default()
    }

    /// Current menu state of a tab.
    pub fn snapshot(&self, tab_id: TabId) -> Vec<ScriptMenu> {
        let Some(scripts) = self.tabs.get(&tab_id) else {
            return Vec::new();
        };
        scripts
            .iter()
            .map(|(script_id, entries)| {
                let label = self.labels.get(script_id).cloned().unwrap_or_default();
                ScriptMenu {
                    id: *script_id,
                    name: label.name,
                    enabled: label.enabled,
                    menus: entries.iter().map(MenuEntry::to_command).collect(),
                }
            })
            .collect()
    }

    fn publish(&self, tab_id: TabId) {
        self.publisher.publish(tab_id, &self.snapshot(tab_id));
    }
}

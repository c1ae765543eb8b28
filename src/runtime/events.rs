//! Typed event bus for catalog and menu changes.
//!
//! The set of events is closed: script upsert/enable/disable/delete from the
//! catalog, and menu register/unregister from running scripts. Handlers are
//! invoked synchronously, in subscription order, for every matching event.

use std::fmt;

use super::menu::{MenuCommandId, MenuRegistration};
use super::script::Script;
use super::{ScriptId, TabId};

/// Discriminant of a [`RuntimeEvent`], used to subscribe to one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Upsert,
    Enable,
    Disable,
    Delete,
    RegisterMenu,
    UnregisterMenu,
}

/// A change the runtime reacts to.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A script was installed or edited.
    Upsert(Script),
    Enable(Script),
    Disable(Script),
    Delete(Script),
    RegisterMenu(MenuRegistration),
    UnregisterMenu {
        tab_id: TabId,
        script_id: ScriptId,
        command_id: MenuCommandId,
    },
}

impl RuntimeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RuntimeEvent::Upsert(_) => EventKind::Upsert,
            RuntimeEvent::Enable(_) => EventKind::Enable,
            RuntimeEvent::Disable(_) => EventKind::Disable,
            RuntimeEvent::Delete(_) => EventKind::Delete,
            RuntimeEvent::RegisterMenu(_) => EventKind::RegisterMenu,
            RuntimeEvent::UnregisterMenu { .. } => EventKind::UnregisterMenu,
        }
    }

    /// The script a catalog event is about.
    pub fn script(&self) -> Option<&Script> {
        match self {
            RuntimeEvent::Upsert(s)
            | RuntimeEvent::Enable(s)
            | RuntimeEvent::Disable(s)
            | RuntimeEvent::Delete(s) => Some(s),
            _ => None,
        }
    }
}

/// Handler invoked for published events.
pub type EventHandler = Box<dyn Fn(&RuntimeEvent) + Send + Sync>;

/// Synchronous fan-out of [`RuntimeEvent`]s.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<(Option<EventKind>, EventHandler)>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a single kind of event.
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&RuntimeEvent) + Send + Sync + 'static,
    {
        self.subscribers.push((Some(kind), Box::new(handler)));
    }

    /// Subscribe to every event.
    pub fn subscribe_all<F>(&mut self, handler: F)
    where
        F: Fn(&RuntimeEvent) + Send + Sync + 'static,
    {
        self.subscribers.push((None, Box::new(handler)));
    }

    /// Deliver an event to every matching handler. Returns how many ran.
    pub fn publish(&self, event: &RuntimeEvent) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        for (filter, handler) in &self.subscribers {
            if filter.map_or(true, |k| k == kind) {
                handler(event);
                delivered += 1;
            }
        }
        delivered
    }
}

//! Userscript runtime core.
//!
//! Decides which user scripts run on which pages, compiles them into
//! injectable units and keeps per-tab menu state in step with the catalog.
//!
//! # Architecture
//!
//! ```text
//! ScriptHost
//! ├── index: PatternIndex<RunResource>      match/include/exclude per script
//! ├── menus: MenuRegistry                   tab -> script -> commands
//! ├── lifecycle: LifecycleController
//! │   ├── compiler: RunResourceCompiler     values + resources resolvers
//! │   └── transport: InjectionTransport     background sandbox
//! └── dispatcher: InjectionDispatcher       page loads -> instructions + badge
//! ```
//!
//! Catalog events flow through the [`EventBus`] into the host, which applies
//! them one at a time. Page scripts live in the pattern index; background
//! and scheduled scripts are handed to the transport.

pub mod catalog;
pub mod compiler;
pub mod dispatcher;
mod error;
pub mod events;
pub mod header;
pub mod host;
pub mod lifecycle;
pub mod menu;
pub mod pattern;
pub mod script;
pub mod storage;
pub mod transport;

pub use catalog::{CatalogStore, DirectoryCatalog, MemoryCatalog};
pub use compiler::{Resource, ResourcesResolver, RunResource, RunResourceCompiler, ValuesResolver};
pub use dispatcher::{
    BadgePublisher, InjectionDispatcher, InjectionInstruction, InjectionSink, PageLoad, RunAt,
};
pub use error::{RuntimeError, RuntimeResult};
pub use events::{EventBus, EventKind, RuntimeEvent};
pub use host::{Collaborators, ScriptHost, ScriptHostConfig, ScriptHostHandle};
pub use lifecycle::{LifecycleController, PageIndex, ScriptState, StartupReport};
pub use menu::{
    MenuChannel, MenuCommand, MenuCommandId, MenuPublisher, MenuRegistration, MenuRegistry,
    Requester, ScriptMenu,
};
pub use pattern::{GlobPattern, MatchPattern, PatternError, PatternIndex, UrlPattern};
pub use script::{Metadata, Script, ScriptKind, ScriptStatus};
pub use storage::{JsonValueStore, ResourceCache};
pub use transport::{DryRunTransport, InjectionTransport};

/// Unique identifier of a stored script.
pub type ScriptId = u64;

/// Browser tab identifier.
pub type TabId = u32;

/// Frame identifier within a tab; `0` is the top-level document.
pub type FrameId = u32;

//! Userscript runtime - the core of a userscript manager.
//!
//! Given a catalog of user scripts with declarative URL-matching metadata,
//! the runtime decides for every page load which scripts apply, compiles each
//! into an injectable unit and keeps per-tab menu state consistent as scripts
//! are enabled, disabled and deleted.
//!
//! # Architecture
//!
//! The library is organized into these main modules:
//!
//! - [`runtime`] - Pattern index, lifecycle, compiler, dispatcher and host
//! - [`config`] - Configuration loading and management
//! - [`logging`] - Tracing subscriber setup
//! - [`cli`] - The `userscript-runtime` command line
//!
//! # Example
//!
//! ```ignore
//! use userscript_runtime::runtime::{DirectoryCatalog, PageLoad, ScriptHost};
//!
//! let mut host = ScriptHost::new(config, collaborators);
//! host.start(&DirectoryCatalog::new("scripts")).await?;
//! let instructions = host.page_load(&PageLoad {
//!     url: "https://example.com/".into(),
//!     tab_id: 1,
//!     frame_id: 0,
//!     sender: None,
//! });
//! ```

pub mod cli;
pub mod config;
pub mod logging;
pub mod runtime;

pub use config::Config;
pub use runtime::{RuntimeError, RuntimeResult, Script, ScriptHost, ScriptId};

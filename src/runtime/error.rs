//! Error types for the script runtime.

use thiserror::Error;

use super::ScriptId;

/// Errors that can occur while loading, compiling or dispatching scripts.
///
/// None of these are fatal: the worst outcome is that a single script did not
/// (un)load, every other script keeps working.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Invalid userscript header: {0}")]
    HeaderInvalid(String),

    #[error("Failed to resolve values for script {script_id}: {message}")]
    ValueResolution { script_id: ScriptId, message: String },

    #[error("Failed to resolve resources for script {script_id}: {message}")]
    ResourceResolution { script_id: ScriptId, message: String },

    #[error("Failed to load background script {script_id}: {message}")]
    BackgroundLoad { script_id: ScriptId, message: String },

    #[error("Failed to unload background script {script_id}: {message}")]
    BackgroundUnload { script_id: ScriptId, message: String },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Script host is no longer running")]
    HostStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

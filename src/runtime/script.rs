//! Script records as handed over by the catalog.
//!
//! The catalog owns scripts; the runtime only keeps copies for indexing and
//! compilation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ScriptId;

/// Userscript metadata: every `@key` maps to its values in declaration order.
pub type Metadata = BTreeMap<String, Vec<String>>;

/// How a script is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    /// Injected into matching pages.
    #[default]
    Page,
    /// Runs in the sandbox for as long as it is enabled.
    Background,
    /// Runs in the sandbox on a `@crontab` schedule.
    Scheduled,
}

impl ScriptKind {
    /// Page scripts go through the pattern index, everything else through the
    /// injection transport.
    pub fn is_page(self) -> bool {
        self == ScriptKind::Page
    }

    /// Infer the kind from parsed metadata.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        if metadata.contains_key("crontab") {
            ScriptKind::Scheduled
        } else if metadata.contains_key("background") {
            ScriptKind::Background
        } else {
            ScriptKind::Page
        }
    }
}

/// Whether the user has the script switched on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStatus {
    #[default]
    Enabled,
    Disabled,
}

/// A stored userscript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub id: ScriptId,
    pub name: String,
    #[serde(default)]
    pub kind: ScriptKind,
    #[serde(default)]
    pub status: ScriptStatus,
    #[serde(default)]
    pub metadata: Metadata,
    /// Per-installation overrides edited by the user, applied on top of
    /// `metadata` key by key.
    #[serde(default)]
    pub overrides: Option<Metadata>,
    #[serde(default)]
    pub code: String,
}

impl Script {
    pub fn new(id: ScriptId, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: ScriptKind::Page,
            status: ScriptStatus::Enabled,
            metadata: Metadata::new(),
            overrides: None,
            code: code.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ScriptStatus::Enabled
    }

    /// Metadata with the per-installation overrides applied.
    ///
    /// An overridden key replaces the whole value list; lists are never merged.
    pub fn effective_metadata(&self) -> Metadata {
        let mut merged = self.metadata.clone();
        if let Some(overrides) = &self.overrides {
            for (key, values) in overrides {
                merged.insert(key.clone(), values.clone());
            }
        }
        merged
    }

    /// Builder-style helper used by catalogs and tests.
    pub fn with_meta<I, S>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata
            .insert(key.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_kind(mut self, kind: ScriptKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_status(mut self, status: ScriptStatus) -> Self {
        self.status = status;
        self
    }
}

impl AsRef<Script> for Script {
    fn as_ref(&self) -> &Script {
        self
    }
}

/// First value declared for `key`, if any.
pub fn first_value<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata
        .get(key)
        .and_then(|values| values.first())
        .map(String::as_str)
}

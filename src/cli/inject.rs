//! `match` and `inject`: run a page load against the configured catalog.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use super::surfaces::LogSurface;
use crate::config::Config;
use crate::runtime::{
    Collaborators, DirectoryCatalog, DryRunTransport, InjectionInstruction, JsonValueStore,
    PageLoad, ResourceCache, ScriptHost, ScriptHostConfig, TabId,
};

/// Build a host over the configured catalog and load every script.
pub async fn start_host(config: &Config) -> anyhow::Result<ScriptHost> {
    let surface = Arc::new(LogSurface);
    let collaborators = Collaborators {
        values: Arc::new(JsonValueStore::new(config.values_dir())),
        resources: Arc::new(ResourceCache::new(config.resources_dir())),
        transport: Arc::new(DryRunTransport),
        sink: surface.clone(),
        badge: surface.clone(),
        menus: surface,
    };
    let host_config = ScriptHostConfig {
        transport_timeout: config.transport_timeout(),
        runtime_source: config
            .bootstrap_source()
            .context("Failed to read in-page runtime")?,
        ..Default::default()
    };

    let mut host = ScriptHost::new(host_config, collaborators);
    let catalog = DirectoryCatalog::new(config.catalog_dir());
    let report = host
        .start(&catalog)
        .await
        .with_context(|| format!("Failed to load catalog from {}", catalog.dir().display()))?;
    for (script_id, error) in &report.failed {
        eprintln!("warning: script {} not loaded: {}", script_id, error);
    }
    Ok(host)
}

pub async fn run_match(config: &Config, url: &str) -> anyhow::Result<()> {
    let host = start_host(config).await?;
    let scripts = host.query_page_scripts(url, 0);
    if scripts.is_empty() {
        println!("No scripts match {}", url);
        return Ok(());
    }
    for script in scripts {
        let state = if script.enabled { "enabled" } else { "disabled" };
        println!("{:>4}  {:<8}  {}", script.id, state, script.name);
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InjectOutput<'a> {
    url: &'a str,
    tab_id: TabId,
    frame_id: u32,
    badge: u32,
    instructions: Vec<InjectionInstruction>,
}

pub async fn run_inject(config: &Config, url: &str, tab: TabId, frame: u32) -> anyhow::Result<()> {
    url::Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?;

    let mut host = start_host(config).await?;
    let load = PageLoad {
        url: url.to_string(),
        tab_id: tab,
        frame_id: frame,
        sender: Some("cli".to_string()),
    };
    let instructions = host.page_load(&load);
    let output = InjectOutput {
        url,
        tab_id: tab,
        frame_id: frame,
        badge: host.dispatcher().badge_count(tab),
        instructions,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

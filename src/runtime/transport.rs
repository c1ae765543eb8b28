//! Transport to the sandbox that runs background and scheduled scripts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::compiler::RunResource;
use super::ScriptId;

/// Request/response channel to the background sandbox.
///
/// Calls are single-shot: the runtime bounds them with a timeout and never
/// retries.
#[async_trait]
pub trait InjectionTransport: Send + Sync {
    /// Start a background script with its compiled resource.
    async fn enable(&self, resource: Arc<RunResource>) -> anyhow::Result<()>;

    /// Stop a running background script.
    async fn disable(&self, script_id: ScriptId) -> anyhow::Result<()>;
}

/// Run a transport call, turning a timeout into an error.
pub(crate) async fn with_timeout<F>(timeout: Duration, call: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "no response from sandbox within {} ms",
            timeout.as_millis()
        )),
    }
}

/// Transport that only logs; used when no sandbox is attached.
#[derive(Debug, Default, Clone)]
pub struct DryRunTransport;

#[async_trait]
impl InjectionTransport for DryRunTransport {
    async fn enable(&self, resource: Arc<RunResource>) -> anyhow::Result<()> {
        info!(
            script_id = resource.id(),
            name = %resource.script().name,
            flag = resource.flag(),
            "Background script would start"
        );
        Ok(())
    }

    async fn disable(&self, script_id: ScriptId) -> anyhow::Result<()> {
        info!(script_id, "Background script would stop");
        Ok(())
    }
}

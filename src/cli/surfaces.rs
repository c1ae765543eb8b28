//! Output surfaces used when the runtime runs without a browser attached.

use crate::runtime::{
    BadgePublisher, FrameId, InjectionInstruction, InjectionSink, MenuPublisher, ScriptMenu,
    TabId,
};

/// Reports everything it is handed through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct LogSurface;

impl InjectionSink for LogSurface {
    fn inject(&self, tab_id: TabId, frame_id: FrameId, instructions: &[InjectionInstruction]) {
        for instruction in instructions {
            tracing::debug!(
                tab_id,
                frame_id,
                run_at = ?instruction.run_at,
                bytes = instruction.code.len(),
                "Inject"
            );
        }
    }
}

impl BadgePublisher for LogSurface {
    fn publish(&self, tab_id: TabId, count: u32) {
        tracing::info!(tab_id, count, "Badge");
    }
}

impl MenuPublisher for LogSurface {
    fn publish(&self, tab_id: TabId, menus: &[ScriptMenu]) {
        let commands: usize = menus.iter().map(|m| m.menus.len()).sum();
        tracing::info!(tab_id, scripts = menus.len(), commands, "Menu snapshot");
    }
}

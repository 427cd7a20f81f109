//! Pending changes command handler

use anyhow::Result;

use servicemaps_core::Engine;

use crate::output::{format_time, Output};

/// List changes waiting for upload, oldest first
pub fn list(engine: &Engine, output: &Output) -> Result<()> {
    let changes = engine.queue().list()?;
    output.list(
        &changes,
        "pending change",
        |c| {
            format!(
                "#{:<4} {:<6} {:<17} {} (queued {})",
                c.sequence,
                c.action.as_str(),
                c.kind.as_str(),
                c.target,
                format_time(&c.created_at)
            )
        },
        |c| c.id.to_string(),
    )
}

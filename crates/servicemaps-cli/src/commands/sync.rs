//! Sync command handlers

use anyhow::{bail, Result};

use servicemaps_core::sync::SyncOutcome;
use servicemaps_core::Engine;

use crate::output::{Output, OutputFormat};

/// Upload pending changes, refresh the cache, then re-evaluate the state
pub async fn sync(engine: &Engine, output: &Output) -> Result<()> {
    let config = engine.config();

    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             servicemaps config set sync_enabled true"
        );
    }

    output.message(&format!("Syncing with {}...", config.api_url));

    let mut events = engine.manager().subscribe_events();
    let outcome = engine.manager().synchronize().await;
    let state = engine.manager().startup_process(false).await;

    // Rejected uploads are dropped from the queue; tell the user which
    while let Ok(event) = events.try_recv() {
        if let servicemaps_core::SyncEvent::ChangeRejected {
            kind,
            target,
            message,
        } = event
        {
            output.warn(&format!(
                "Server refused {} {}: {}",
                kind,
                target.encode(),
                message
            ));
        }
    }

    match outcome {
        Ok(SyncOutcome::Completed(summary)) => match output.format {
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "status": "success",
                        "state": state.as_str(),
                        "uploaded": summary.uploaded,
                        "retained": summary.retained,
                        "rejected": summary.rejected,
                        "changed": summary.changed
                    })
                );
            }
            _ => {
                output.success(&format!(
                    "Sync complete - {} uploaded, {} change(s) applied",
                    summary.uploaded, summary.changed
                ));
                if summary.retained > 0 {
                    output.message(&format!(
                        "  {} change(s) still waiting for upload",
                        summary.retained
                    ));
                }
                output.message(&format!("  State: {}", state));
            }
        },
        Ok(SyncOutcome::Coalesced) => output.message("A sync is already running"),
        Ok(SyncOutcome::Skipped) => {
            bail!(
                "Not signed in. Set your session with:\n  \
                 servicemaps config set user_email you@example.com\n  \
                 servicemaps config set access_token <token>"
            );
        }
        Err(e) => {
            output.message(&format!("Sync failed: {}", e));
            output.message("Cached data was kept.");
            return Err(e.into());
        }
    }

    Ok(())
}

/// Clear the cache and the pending queue
pub async fn logout(engine: &Engine, output: &Output) -> Result<()> {
    let pending = engine.queue().count()?;
    if pending > 0 {
        output.warn(&format!(
            "Discarding {} change(s) that were never uploaded",
            pending
        ));
    }
    engine.logout().await?;
    output.success("Signed out; local data removed");
    Ok(())
}

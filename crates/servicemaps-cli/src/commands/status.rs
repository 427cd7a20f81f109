//! Status command handler

use anyhow::Result;

use servicemaps_core::{Engine, EntityKind};

use crate::output::{format_time, Output, OutputFormat};

/// Show status information
///
/// Evaluates the startup state from the cache alone; no network calls.
pub async fn show(engine: &Engine, output: &Output) -> Result<()> {
    let state = engine.manager().startup_process(false).await;
    let config = engine.config();
    let store = engine.store();
    let last_sync = store.last_full_sync()?;
    let pending = engine.queue().count()?;

    let mut counts = Vec::new();
    for kind in EntityKind::ALL {
        counts.push((kind, store.count(kind)?));
    }

    match output.format {
        OutputFormat::Json => {
            let counts: serde_json::Map<_, _> = counts
                .iter()
                .map(|(kind, n)| (kind.as_str().to_string(), serde_json::json!(n)))
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "state": state.as_str(),
                    "sync_enabled": config.sync_enabled,
                    "api_url": config.api_url,
                    "realtime_url": config.realtime_url,
                    "last_full_sync": last_sync,
                    "pending_changes": pending,
                    "database": config.sqlite_path(),
                    "counts": counts
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", state);
        }
        OutputFormat::Human => {
            println!("Service Maps Status");
            println!("===================");
            println!();
            println!("State: {}", state);
            println!();
            println!("Sync:");
            println!(
                "  Status:    {}",
                if config.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!("  Server:    {}", config.api_url);
            if let Some(ref url) = config.realtime_url {
                println!("  Realtime:  {}", url);
            }
            println!(
                "  Last sync: {}",
                last_sync
                    .as_ref()
                    .map(format_time)
                    .unwrap_or_else(|| "never".to_string())
            );
            println!("  Pending:   {} change(s)", pending);
            println!();
            println!("Storage:");
            println!("  Location: {}", config.sqlite_path().display());
            println!();
            println!("Contents:");
            for (kind, n) in counts {
                println!("  {:<18} {}", format!("{}:", kind), n);
            }
        }
    }

    Ok(())
}

//! Watch command handler
//!
//! Brings the engine to the foreground and prints what changes until
//! interrupted: territory summaries, the pending queue, sync passes and the
//! realtime connection.

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;

use servicemaps_core::query::{PendingSummary, TerritoryOverview};
use servicemaps_core::realtime::ConnectionStatus;
use servicemaps_core::{Engine, SyncEvent};

use crate::output::{Output, OutputFormat};

fn describe(event: &SyncEvent) -> String {
    match event {
        SyncEvent::StateChanged(state) => format!("State: {}", state),
        SyncEvent::SyncStarted => "Sync started".to_string(),
        SyncEvent::SyncCompleted(summary) => format!(
            "Sync complete - {} uploaded, {} change(s) applied",
            summary.uploaded, summary.changed
        ),
        SyncEvent::SyncFailed(reason) => format!("Sync failed: {}", reason),
        SyncEvent::ChangeRejected {
            kind,
            target,
            message,
        } => format!("Server refused {} {}: {}", kind, target, message),
        SyncEvent::SessionChanged => "Credentials changed; refreshing".to_string(),
    }
}

async fn next_status(rx: &mut Option<watch::Receiver<ConnectionStatus>>) -> Option<ConnectionStatus> {
    match rx {
        Some(rx) => {
            rx.changed().await.ok()?;
            let status = *rx.borrow();
            Some(status)
        }
        None => std::future::pending().await,
    }
}

pub async fn run(engine: &Engine, output: &Output) -> Result<()> {
    let mut events = engine.manager().subscribe_events();
    let state = engine.foreground().await;
    output.message(&format!("State: {} (Ctrl-C to stop)", state));

    let mut territories = engine.queries().subscribe(TerritoryOverview);
    let mut pending = engine.queries().subscribe(PendingSummary);
    let mut status = engine.notifier().map(|n| n.subscribe_status());
    if status.is_none() {
        output.message("Realtime updates not configured; showing local changes only");
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(rows) = territories.next() => {
                if output.is_json() {
                    output.json(&serde_json::json!({"territories": rows}))?;
                } else {
                    let houses: i64 = rows.iter().map(|r| r.house_count).sum();
                    output.message(&format!(
                        "{} territory(ies), {} house(s)",
                        rows.len(),
                        houses
                    ));
                }
            }
            Some(summary) = pending.next() => {
                match output.format {
                    OutputFormat::Json => output.json(&serde_json::json!({"pending": summary}))?,
                    _ => output.message(&format!("{} change(s) waiting for upload", summary.count)),
                }
            }
            event = events.recv() => match event {
                Ok(event) => match output.format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::json!({"event": describe(&event)}));
                    }
                    _ => output.message(&describe(&event)),
                },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            Some(current) = next_status(&mut status) => {
                output.message(&format!("Realtime: {:?}", current));
            }
        }
    }

    territories.unsubscribe();
    pending.unsubscribe();
    engine.background().await;
    output.message("Stopped");
    Ok(())
}

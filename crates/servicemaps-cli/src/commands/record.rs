//! Local edits
//!
//! Written to the cache and queued immediately; they reach the server on
//! the next sync.

use anyhow::{bail, Context, Result};
use chrono::Utc;

use servicemaps_core::{
    EnqueueOutcome, Engine, EntityKind, PhoneCall, RecordKey, Visit, VisitSymbol,
};

use crate::output::{Output, OutputFormat};

/// Name recorded on visits and calls
fn publisher(engine: &Engine) -> String {
    engine
        .config()
        .session
        .as_ref()
        .and_then(|s| s.user_name.clone().or_else(|| s.user_email.clone()))
        .unwrap_or_default()
}

fn report(output: &Output, what: &str, id: &str, outcome: &EnqueueOutcome) {
    match output.format {
        OutputFormat::Json => {
            let status = match outcome {
                EnqueueOutcome::Queued(_) => "queued",
                EnqueueOutcome::Collapsed(_) => "merged",
                EnqueueOutcome::Cancelled => "cancelled",
                EnqueueOutcome::Ignored(_) => "ignored",
            };
            println!("{}", serde_json::json!({"id": id, "status": status}));
        }
        OutputFormat::Quiet => println!("{}", id),
        OutputFormat::Human => match outcome {
            EnqueueOutcome::Cancelled => {
                println!("✓ Removed {} {} (it was never uploaded)", what, id)
            }
            EnqueueOutcome::Ignored(_) => {
                println!("⚠ {} {} is already queued for deletion", what, id)
            }
            _ => println!("✓ Saved {} {}", what, id),
        },
    }
}

pub fn add_visit(
    engine: &Engine,
    house: String,
    symbol: VisitSymbol,
    notes: String,
    output: &Output,
) -> Result<()> {
    let visit = Visit::new(
        house,
        Utc::now().timestamp_millis(),
        symbol,
        notes,
        publisher(engine),
    );
    let outcome = engine
        .mutations()
        .add(&visit)
        .with_context(|| format!("Could not record visit for house {}", visit.house))?;
    report(output, "visit", &visit.id, &outcome);
    Ok(())
}

pub fn delete_visit(engine: &Engine, id: String, output: &Output) -> Result<()> {
    let key = RecordKey::id(&id);
    if engine.store().get::<Visit>(&key)?.is_none() {
        bail!("Visit not found: {}", id);
    }
    let outcome = engine.mutations().delete(EntityKind::Visit, &key)?;
    report(output, "visit", &id, &outcome);
    Ok(())
}

pub fn add_call(engine: &Engine, number: String, notes: String, output: &Output) -> Result<()> {
    let call = PhoneCall::new(
        number,
        Utc::now().timestamp_millis(),
        notes,
        publisher(engine),
    );
    let outcome = engine
        .mutations()
        .add(&call)
        .with_context(|| format!("Could not record call for number {}", call.phone_number))?;
    report(output, "call", &call.id, &outcome);
    Ok(())
}

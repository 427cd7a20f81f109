//! Realtime change notifications
//!
//! The server pushes a small event for every change inside a congregation.
//! Events are hints: delivery is best-effort, so the notifier refreshes just
//! the named entity and relies on a freshness watchdog to fall back to a
//! full sync when events may have been missed.
//!
//! ## Architecture
//!
//! - **channel**: the push transport ([`WebSocketChannel`])
//! - **notifier**: the background listener that applies events and runs
//!   the watchdog ([`RealtimeNotifier`])

pub mod channel;
pub mod notifier;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{AnyRecord, EntityKind, PhoneCall, RecordKey, Visit};

pub use channel::WebSocketChannel;
pub use notifier::{ConnectionStatus, NotifierSettings, RealtimeNotifier};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    #[error("Could not connect: {0}")]
    Connect(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Channel closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// One pushed change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_kind: EntityKind,
    pub entity_id: RecordKey,
    pub operation: ChangeOperation,
    /// Full entity payload, when the server includes it
    ///
    /// Either a JSON object or a string holding one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ChangeEvent {
    /// Decode the embedded payload, if any
    ///
    /// Visits and calls get their id recomputed from parent and date, the
    /// same way locally created ones are named.
    pub fn embedded_record(&self) -> serde_json::Result<Option<AnyRecord>> {
        let value = match &self.data {
            None | Some(serde_json::Value::Null) => return Ok(None),
            Some(serde_json::Value::String(text)) => serde_json::from_str(text)?,
            Some(value) => value.clone(),
        };

        let record = match AnyRecord::from_json(self.entity_kind, value)? {
            AnyRecord::Visit(mut visit) => {
                visit.id = Visit::client_id(&visit.house, visit.date);
                AnyRecord::Visit(visit)
            }
            AnyRecord::PhoneCall(mut call) => {
                call.id = PhoneCall::client_id(&call.phone_number, call.date);
                AnyRecord::PhoneCall(call)
            }
            other => other,
        };
        Ok(Some(record))
    }
}

/// Who the subscription is for; a change resubscribes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeScope {
    pub congregation: String,
    pub user: Option<String>,
    pub admin: bool,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent, RealtimeError>> + Send>>;

/// Push transport
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Open a subscription; the stream ends when the connection does
    async fn subscribe(&self, scope: &RealtimeScope) -> Result<EventStream, RealtimeError>;
}

/// Something that can run a full snapshot sync on request
#[async_trait]
pub trait FullSyncTrigger: Send + Sync {
    async fn request_full_sync(&self);
}

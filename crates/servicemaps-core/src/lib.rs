//! Service Maps Core Library
//!
//! This crate provides the sync engine behind Service Maps, a field-service
//! app for publishers working door-to-door and phone territories. Every
//! screen reads from a local relational cache; the server is reached only
//! in the background.
//!
//! # Architecture
//!
//! - **SQLite**: the local cache, one table per entity kind
//! - **Pending change log**: local writes queued durably until the server
//!   confirms them
//! - **Snapshots + realtime pushes**: full passes reconcile the whole
//!   cache, pushes refresh single entities in between
//!
//! # Quick Start
//!
//! ```text
//! let engine = Engine::from_config(Config::load()?)?;
//! let state = engine.foreground().await;
//!
//! // Record a visit; it shows up immediately and uploads on the next pass
//! engine.mutations().add(&Visit::new(house, now, VisitSymbol::NC, "", user))?;
//!
//! // Watch the houses of an address
//! let mut houses = engine.queries().subscribe(HouseList { address });
//! while let Some(rows) = houses.next().await { /* render */ }
//! ```
//!
//! # Modules
//!
//! - `engine`: Service container (main entry point)
//! - `models`: Entity structs, kinds and keys
//! - `storage`: SQLite cache and change notifications
//! - `pending`: Durable queue of local changes
//! - `upload`: Pushes the queue to the server
//! - `reconcile`: Merges server snapshots into the cache
//! - `remote`: HTTP contract with the server
//! - `realtime`: Push channel listener
//! - `sync`: Startup state machine and full sync passes
//! - `query`: Live projections for the UI
//! - `config`: Application configuration

pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod pending;
pub mod query;
pub mod realtime;
pub mod reconcile;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod upload;

#[cfg(test)]
mod testing;

pub use config::{Config, SessionConfig};
pub use engine::Engine;
pub use error::{SyncError, SyncResult};
pub use models::{
    AnyRecord, EntityKind, House, PhoneCall, PhoneNumber, PhoneTerritory, Recall, RecordKey,
    Territory, TerritoryAddress, Token, TokenTerritory, UserToken, Visit, VisitSymbol,
};
pub use pending::{ChangeAction, EnqueueOutcome, LocalMutations, PendingChange, PendingQueue};
pub use query::{Projection, QueryHub, Subscription};
pub use realtime::{ConnectionStatus, RealtimeNotifier, RealtimeScope};
pub use reconcile::{FullSnapshot, ReconcileReport, Reconciler};
pub use remote::{HttpRemote, RemoteApi, RemoteError};
pub use storage::{LocalStore, StorageError, StorageResult};
pub use sync::{StartupState, SyncEvent, SyncManager};
pub use upload::{UploadReport, Uploader};

//! Synchronization
//!
//! Drives full sync passes and the startup state machine.
//!
//! ## Flow
//!
//! 1. Flush the pending change queue to the server
//! 2. Fetch territory, phone, key and recall snapshots concurrently
//! 3. Reconcile the snapshots into the local cache
//! 4. Re-evaluate which startup state the data and credentials support

mod credentials;
mod manager;
mod state;

pub use credentials::{CredentialCheck, CredentialProvider, SessionSnapshot, StaticCredentials};
pub use manager::{SyncEvent, SyncManager, SyncOutcome, SyncSummary};
pub use state::StartupState;

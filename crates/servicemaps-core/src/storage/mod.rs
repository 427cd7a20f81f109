//! Storage layer
//!
//! The local relational cache: one SQLite table per mirrored entity kind
//! plus the durable pending-change log.
//!
//! ## Architecture
//!
//! - **schema**: table layout, cascades and version tracking
//! - **record**: typed row mapping and the generic statements built from it
//! - **store**: the single-writer handle that commits transactions and
//!   announces what they touched

pub mod error;
pub mod record;
pub mod schema;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use record::{Record, UpsertOutcome};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use store::{LocalStore, StoreChange, WriteTx};

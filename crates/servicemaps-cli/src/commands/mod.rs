//! Command handlers

pub mod browse;
pub mod config;
pub mod pending;
pub mod record;
pub mod status;
pub mod sync;
pub mod watch;

//! modqueue - A distributed queue for moderation reports.
//!
//! Front-end nodes append reports to their own Redis/Valkey store with
//! collision-free IDs; a processor drains every store through a single
//! serial callback with at-least-once delivery, bounded retries and a
//! quarantine stream for reports that keep failing.

pub mod cipher;
pub mod config;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod server;
pub mod store;
pub mod types;

#[cfg(test)]
pub mod test_utils;

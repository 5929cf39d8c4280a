//! Handling of inbound chat traffic.
//!
//! - `command`: text commands that mutate a server's digest configuration
//! - `ingest`: buffering of ordinary messages for the next digest

pub mod command;
pub mod ingest;

//! The digest scheduling and aggregation core.
//!
//! `store` holds durable per-server configuration, `buffer` the uncollected
//! window of messages, `producer` turns a window into a delivered digest and
//! `scheduler` decides when each server's window closes. `names` maps ids to
//! the names people see.

pub mod buffer;
pub mod names;
pub mod producer;
pub mod scheduler;
pub mod store;

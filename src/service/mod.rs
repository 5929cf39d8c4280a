//! Collaborators of the digest core.
//!
//! This module contains the external integrations used by the digester:
//! - Chat services (e.g., Slack) that feed messages and commands in
//! - Configuration persistence (JSON file, in-memory)
//! - Digest rendering (HTML)
//! - Mail delivery (SMTP)
//!
//! Each service module defines both generic traits and concrete implementations,
//! allowing for extensibility and easy testing.

pub mod chat;
pub mod mail;
pub mod persistence;
pub mod render;

//! Core components, types, and utilities for the message-digester.
//!
//! This module contains fundamental building blocks used throughout the application:
//! - Configuration handling and environment variables.
//! - Common types, result handling and the digest error taxonomy.
//! - Email address validation.
//! - An injectable clock.

pub mod clock;
pub mod config;
pub mod email;
pub mod error;
pub mod types;

//! Outbound mail for rendered digests.
//!
//! This module defines the `GenericMailClient` trait with an SMTP implementation,
//! and a disabled implementation used when no sender credentials are configured.

pub mod disabled;
pub mod smtp;

use std::{ops::Deref, sync::Arc};

use async_trait::async_trait;

use crate::base::{
    config::Config,
    types::{Document, Res, Void},
};

// Traits.

/// Generic mail client trait that clients must implement.
///
/// Sending is treated as fallible and potentially slow.
#[async_trait]
pub trait GenericMailClient: Send + Sync + 'static {
    /// Deliver `document` to every address in `recipients`.
    async fn send(&self, document: &Document, recipients: &[String]) -> Void;
}

// Structs.

/// Mail client for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct MailClient {
    inner: Arc<dyn GenericMailClient>,
}

impl Deref for MailClient {
    type Target = dyn GenericMailClient;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl MailClient {
    pub fn new(inner: Arc<dyn GenericMailClient>) -> Self {
        Self { inner }
    }

    /// SMTP when a sender is configured, otherwise a client that only logs.
    pub fn from_config(config: &Config) -> Res<Self> {
        match (&config.email_sender, &config.email_password, &config.smtp_server) {
            (Some(sender), Some(password), Some(server)) => Self::smtp(sender, password, server, config.smtp_port),
            _ => Ok(Self::disabled()),
        }
    }
}

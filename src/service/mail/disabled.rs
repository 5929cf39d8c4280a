//! Mail client used when email is not configured.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::base::types::{Document, Void};

use super::{GenericMailClient, MailClient};

impl MailClient {
    /// Creates a mail client that logs instead of sending.
    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledMailClient))
    }
}

/// Disabled mail client implementation.
pub struct DisabledMailClient;

#[async_trait]
impl GenericMailClient for DisabledMailClient {
    async fn send(&self, document: &Document, recipients: &[String]) -> Void {
        info!(subject = %document.subject, recipients = recipients.len(), "Email disabled, digest not sent.");
        Ok(())
    }
}

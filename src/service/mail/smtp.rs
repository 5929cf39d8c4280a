//! SMTP delivery via `lettre`.
//!
//! Digests go out over STARTTLS with the sender's credentials. Recipients only
//! appear in the envelope; the visible `To` header is a placeholder so nobody
//! sees the rest of the list.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::{
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    address::Envelope,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use tracing::{info, instrument};

use crate::base::types::{Document, Res, Void};

use super::{GenericMailClient, MailClient};

const UNDISCLOSED_RECIPIENTS: &str = "Undisclosed Recipients <undisclosed-recipients@no-reply.com>";

impl MailClient {
    /// Creates an SMTP mail client.
    pub fn smtp(sender: &str, password: &str, server: &str, port: u16) -> Res<Self> {
        let client = SmtpMailClient::new(sender, password, server, port)?;
        Ok(Self::new(Arc::new(client)))
    }
}

/// SMTP mail client implementation.
pub struct SmtpMailClient {
    sender: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailClient {
    #[instrument(name = "SmtpMailClient::new", skip(password))]
    pub fn new(sender: &str, password: &str, server: &str, port: u16) -> Res<Self> {
        let sender: Mailbox = sender.parse()?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(server)?
            .port(port)
            .credentials(Credentials::new(sender.email.to_string(), password.to_string()))
            .build();

        Ok(Self { sender, transport })
    }

    fn build_message(&self, document: &Document, recipients: &[String]) -> Res<Message> {
        let recipients = recipients.iter().map(|r| r.parse::<Address>()).collect::<Result<Vec<_>, _>>()?;
        let envelope = Envelope::new(Some(self.sender.email.clone()), recipients)?;

        let message = Message::builder()
            .from(self.sender.clone())
            .to(UNDISCLOSED_RECIPIENTS.parse()?)
            .subject(document.subject.clone())
            .header(ContentType::parse(&document.content_type)?)
            .envelope(envelope)
            .body(document.body.clone())?;

        Ok(message)
    }
}

#[async_trait]
impl GenericMailClient for SmtpMailClient {
    #[instrument(name = "SmtpMailClient::send", skip_all, fields(recipients = recipients.len()))]
    async fn send(&self, document: &Document, recipients: &[String]) -> Void {
        let message = self.build_message(document, recipients)?;

        self.transport.send(message).await.map_err(|e| anyhow::anyhow!("Failed to send email: {}", e))?;

        info!("Digest email sent.");

        Ok(())
    }
}

// Tests.

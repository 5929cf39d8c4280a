//! Digest production for a single server.
//!
//! The producer drains the server's window, hands the payload to the renderer
//! and the mail client, and holds on to the drained messages until the send is
//! confirmed. Any failure puts them back in the buffer so the retry on the next
//! tick delivers the same content.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    base::{
        error::{DigestError, DigestResult},
        types::{DigestPayload, ProduceOutcome, SkipReason, Void},
    },
    digest::{buffer::MessageBuffer, names::NameDirectory, store::ConfigStore},
    service::{mail::MailClient, render::Renderer},
};

/// Producer policies.
#[derive(Debug, Clone, Copy)]
pub struct ProducerOptions {
    /// Mail a digest even when the window holds no messages.
    pub send_empty_digests: bool,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self { send_empty_digests: true }
    }
}

/// Digest producer for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct DigestProducer {
    inner: Arc<DigestProducerInner>,
}

struct DigestProducerInner {
    store: ConfigStore,
    buffer: MessageBuffer,
    names: NameDirectory,
    renderer: Renderer,
    mail: MailClient,
    options: ProducerOptions,
}

impl DigestProducer {
    pub fn new(store: ConfigStore, buffer: MessageBuffer, names: NameDirectory, renderer: Renderer, mail: MailClient, options: ProducerOptions) -> Self {
        Self {
            inner: Arc::new(DigestProducerInner {
                store,
                buffer,
                names,
                renderer,
                mail,
                options,
            }),
        }
    }

    /// Produce and deliver the digest for `server_id` covering the window up to `now`.
    ///
    /// A server without channels or recipients is skipped and its buffered window
    /// discarded. Cancelling `cancel` while the digest is being sent fails the
    /// production.
    #[instrument(skip(self, cancel))]
    pub async fn produce(&self, server_id: &str, now: DateTime<Utc>, cancel: &CancellationToken) -> DigestResult<ProduceOutcome> {
        let inner = &self.inner;

        let config = inner.store.get(server_id).await.ok_or_else(|| DigestError::NotFound(server_id.to_string()))?;

        let skip = if config.monitored_channels.is_empty() {
            Some(SkipReason::NoChannels)
        } else if config.recipient_emails.is_empty() {
            Some(SkipReason::NoRecipients)
        } else {
            None
        };

        if let Some(reason) = skip {
            let dropped = inner.buffer.discard(server_id).await;
            info!(?reason, dropped, "Server not fully configured, skipping digest.");
            return Ok(ProduceOutcome::Skipped(reason));
        }

        let messages = inner.buffer.drain(server_id).await;

        if messages.is_empty() && !inner.options.send_empty_digests {
            info!("No new messages, skipping digest.");
            return Ok(ProduceOutcome::Skipped(SkipReason::Empty));
        }

        let payload = DigestPayload {
            server_id: server_id.to_string(),
            server_name: inner.names.server_label(server_id).await,
            channel_names: inner.names.channel_names(server_id).await,
            window_start: config.last_digest_at,
            window_end: now,
            messages,
            recipient_emails: config.recipient_emails.into_iter().collect(),
        };

        let message_count = payload.messages.len();

        match self.deliver(&payload, cancel).await {
            Ok(()) => {
                info!(message_count, "Digest delivered.");
                Ok(ProduceOutcome::Delivered { message_count })
            }
            Err(cause) => {
                warn!(message_count, "Digest delivery failed, restoring messages.");
                inner.buffer.restore(server_id, payload.messages).await;
                Err(DigestError::production(server_id, cause))
            }
        }
    }

    async fn deliver(&self, payload: &DigestPayload, cancel: &CancellationToken) -> Void {
        let document = self.inner.renderer.render(payload)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow::anyhow!("Shutdown requested before the digest was sent.")),
            result = self.inner.mail.send(&document, &payload.recipient_emails) => result,
        }
    }
}

// Tests.

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone};
    use mockall::mock;

    use super::*;
    use crate::{
        base::{
            clock::Clock,
            types::{BufferedMessage, Document, Res},
        },
        digest::{names::NameDirectory, store::StoreOptions},
        service::{mail::GenericMailClient, persistence::ConfigPersistence, render::GenericRenderer},
    };

    mock! {
        pub Render {}

        impl GenericRenderer for Render {
            fn render(&self, payload: &DigestPayload) -> Res<Document>;
        }
    }

    mock! {
        pub Mail {}

        #[async_trait]
        impl GenericMailClient for Mail {
            async fn send(&self, document: &Document, recipients: &[String]) -> Void;
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn document() -> Document {
        Document {
            subject: "digest".to_string(),
            content_type: "text/html".to_string(),
            body: Vec::new(),
        }
    }

    fn message(content: &str, posted_at: DateTime<Utc>) -> BufferedMessage {
        BufferedMessage {
            channel_id: "C1".to_string(),
            author_display_name: "alice".to_string(),
            content: content.to_string(),
            posted_at,
        }
    }

    /// A store registered at T-61min with an hourly interval, plus a buffer.
    async fn setup() -> (ConfigStore, MessageBuffer) {
        let options = StoreOptions::new(TimeDelta::minutes(60)).with_clock(Clock::fixed(now() - TimeDelta::minutes(61)));
        let store = ConfigStore::open(ConfigPersistence::memory(), options).await.unwrap();
        let buffer = MessageBuffer::new(store.clone());

        (store, buffer)
    }

    async fn configure(store: &ConfigStore) {
        store.add_channel("S", "C1").await.unwrap();
        store.add_emails("S", &["team@example.com"]).await.unwrap();
    }

    fn producer(store: &ConfigStore, buffer: &MessageBuffer, render: MockRender, mail: MockMail, options: ProducerOptions) -> DigestProducer {
        producer_with_names(store, buffer, NameDirectory::new(), render, mail, options)
    }

    fn producer_with_names(store: &ConfigStore, buffer: &MessageBuffer, names: NameDirectory, render: MockRender, mail: MockMail, options: ProducerOptions) -> DigestProducer {
        DigestProducer::new(store.clone(), buffer.clone(), names, Renderer::new(Arc::new(render)), MailClient::new(Arc::new(mail)), options)
    }

    #[tokio::test]
    async fn test_payload_holds_window_and_ordered_messages() {
        let (store, buffer) = setup().await;
        configure(&store).await;

        buffer.append("S", message("later", now() - TimeDelta::minutes(10))).await;
        buffer.append("S", message("earlier", now() - TimeDelta::minutes(30))).await;

        let captured = Arc::new(Mutex::new(None));
        let captured_clone = captured.clone();

        let mut render = MockRender::new();
        render.expect_render().times(1).returning(move |payload| {
            *captured_clone.lock().unwrap() = Some(payload.clone());
            Ok(document())
        });

        let mut mail = MockMail::new();
        mail.expect_send().withf(|_, recipients| recipients.len() == 1 && recipients[0] == "team@example.com").times(1).returning(|_, _| Ok(()));

        let producer = producer(&store, &buffer, render, mail, ProducerOptions::default());
        let outcome = producer.produce("S", now(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, ProduceOutcome::Delivered { message_count: 2 });

        let payload = captured.lock().unwrap().take().unwrap();
        assert_eq!(payload.window_start, now() - TimeDelta::minutes(61));
        assert_eq!(payload.window_end, now());
        assert_eq!(payload.messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), vec!["earlier", "later"]);
        assert_eq!(payload.server_name, "S");
        assert!(payload.channel_names.is_empty());
        assert_eq!(buffer.len("S").await, 0);
    }

    #[tokio::test]
    async fn test_payload_carries_known_names() {
        let (store, buffer) = setup().await;
        configure(&store).await;

        let names = NameDirectory::new();
        names.set_server_name("S", "Acme").await;
        names.set_channel_name("S", "C1", "general").await;

        let mut render = MockRender::new();
        render
            .expect_render()
            .withf(|payload| payload.server_name == "Acme" && payload.channel_label("C1") == "general" && payload.channel_label("C2") == "C2")
            .times(1)
            .returning(|_| Ok(document()));
        let mut mail = MockMail::new();
        mail.expect_send().times(1).returning(|_, _| Ok(()));

        let producer = producer_with_names(&store, &buffer, names, render, mail, ProducerOptions::default());

        producer.produce("S", now(), &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_recipients_is_skipped_without_sending() {
        let (store, buffer) = setup().await;
        store.add_channel("S", "C1").await.unwrap();
        buffer.append("S", message("hello", now())).await;

        let mut render = MockRender::new();
        render.expect_render().never();
        let mut mail = MockMail::new();
        mail.expect_send().never();

        let producer = producer(&store, &buffer, render, mail, ProducerOptions::default());
        let outcome = producer.produce("S", now(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, ProduceOutcome::Skipped(SkipReason::NoRecipients));
        assert_eq!(buffer.len("S").await, 0);
    }

    #[tokio::test]
    async fn test_no_channels_is_skipped() {
        let (store, buffer) = setup().await;
        store.add_emails("S", &["team@example.com"]).await.unwrap();

        let mut render = MockRender::new();
        render.expect_render().never();
        let mut mail = MockMail::new();
        mail.expect_send().never();

        let producer = producer(&store, &buffer, render, mail, ProducerOptions::default());
        let outcome = producer.produce("S", now(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, ProduceOutcome::Skipped(SkipReason::NoChannels));
    }

    #[tokio::test]
    async fn test_empty_window_is_sent_by_default() {
        let (store, buffer) = setup().await;
        configure(&store).await;

        let mut render = MockRender::new();
        render.expect_render().withf(|payload| payload.messages.is_empty()).times(1).returning(|_| Ok(document()));
        let mut mail = MockMail::new();
        mail.expect_send().times(1).returning(|_, _| Ok(()));

        let producer = producer(&store, &buffer, render, mail, ProducerOptions::default());
        let outcome = producer.produce("S", now(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, ProduceOutcome::Delivered { message_count: 0 });
    }

    #[tokio::test]
    async fn test_empty_window_can_be_suppressed() {
        let (store, buffer) = setup().await;
        configure(&store).await;

        let mut render = MockRender::new();
        render.expect_render().never();
        let mut mail = MockMail::new();
        mail.expect_send().never();

        let producer = producer(&store, &buffer, render, mail, ProducerOptions { send_empty_digests: false });
        let outcome = producer.produce("S", now(), &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, ProduceOutcome::Skipped(SkipReason::Empty));
    }

    #[tokio::test]
    async fn test_send_failure_restores_messages() {
        let (store, buffer) = setup().await;
        configure(&store).await;
        buffer.append("S", message("keep me", now() - TimeDelta::minutes(5))).await;

        let mut render = MockRender::new();
        render.expect_render().returning(|_| Ok(document()));
        let mut mail = MockMail::new();
        mail.expect_send().times(1).returning(|_, _| Err(anyhow::anyhow!("connection refused")));

        let producer = producer(&store, &buffer, render, mail, ProducerOptions::default());
        let result = producer.produce("S", now(), &CancellationToken::new()).await;

        assert!(matches!(result, Err(DigestError::Production { .. })));

        let remaining = buffer.drain("S").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "keep me");
    }

    #[tokio::test]
    async fn test_render_failure_restores_messages() {
        let (store, buffer) = setup().await;
        configure(&store).await;
        buffer.append("S", message("keep me", now() - TimeDelta::minutes(5))).await;

        let mut render = MockRender::new();
        render.expect_render().returning(|_| Err(anyhow::anyhow!("malformed")));
        let mut mail = MockMail::new();
        mail.expect_send().never();

        let producer = producer(&store, &buffer, render, mail, ProducerOptions::default());
        let result = producer.produce("S", now(), &CancellationToken::new()).await;

        assert!(matches!(result, Err(DigestError::Production { .. })));
        assert_eq!(buffer.len("S").await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_production_fails_closed() {
        let (store, buffer) = setup().await;
        configure(&store).await;
        buffer.append("S", message("keep me", now() - TimeDelta::minutes(5))).await;

        let mut render = MockRender::new();
        render.expect_render().returning(|_| Ok(document()));
        let mut mail = MockMail::new();
        mail.expect_send().returning(|_, _| Ok(()));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let producer = producer(&store, &buffer, render, mail, ProducerOptions::default());
        let result = producer.produce("S", now(), &cancel).await;

        assert!(matches!(result, Err(DigestError::Production { .. })));
        assert_eq!(buffer.len("S").await, 1);
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let (store, buffer) = setup().await;

        let producer = producer(&store, &buffer, MockRender::new(), MockMail::new(), ProducerOptions::default());
        let result = producer.produce("nope", now(), &CancellationToken::new()).await;

        assert!(matches!(result, Err(DigestError::NotFound(_))));
    }
}

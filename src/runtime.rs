//! Runtime services and shared state for the digester.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::{
    base::{
        clock::Clock,
        config::Config,
        types::{Res, Void},
    },
    digest::{
        buffer::MessageBuffer,
        names::NameDirectory,
        producer::{DigestProducer, ProducerOptions},
        scheduler::{DigestScheduler, SchedulerOptions},
        store::{ConfigStore, StoreOptions},
    },
    interaction::command::CommandHandler,
    service::{chat::ChatClient, mail::MailClient, persistence::ConfigPersistence, render::Renderer},
};

/// Runtime service context that can be shared across the application.
///
/// It is designed to be trivially cloneable, allowing it to be passed around
/// without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct Runtime {
    /// The configuration for the application.
    pub config: Config,
    /// Durable per-server configuration.
    pub store: ConfigStore,
    /// Messages waiting for the next digest.
    pub buffer: MessageBuffer,
    /// Server and channel names learned from the chat platform.
    pub names: NameDirectory,
    pub producer: DigestProducer,
    pub scheduler: DigestScheduler,
    pub commands: CommandHandler,
    /// The chat client instance.
    pub chat: ChatClient,
    /// Cancelled when configuration can no longer be persisted.
    fatal: CancellationToken,
    /// Stops the scheduler.
    shutdown: CancellationToken,
}

impl Runtime {
    /// Create a new runtime instance, connecting to the chat platform.
    #[instrument(skip_all)]
    pub async fn new(config: Config) -> Res<Self> {
        let persistence = ConfigPersistence::json_file(config.config_file.clone());
        let mail = MailClient::from_config(&config)?;

        Self::with_services(config, persistence, Renderer::html(), mail, Clock::system(), |config, buffer, commands, names| async move {
            ChatClient::slack(&config, buffer, commands, names).await
        })
        .await
    }

    /// Create a runtime from explicit collaborators.
    pub async fn with_services<F, Fut>(config: Config, persistence: ConfigPersistence, renderer: Renderer, mail: MailClient, clock: Clock, chat: F) -> Res<Self>
    where
        F: FnOnce(Config, MessageBuffer, CommandHandler, NameDirectory) -> Fut,
        Fut: Future<Output = Res<ChatClient>>,
    {
        let fatal = CancellationToken::new();
        let shutdown = CancellationToken::new();

        // Core.

        let store_options = StoreOptions::new(config.default_digest_interval()).with_clock(clock).with_shutdown(fatal.clone());
        let store = ConfigStore::open(persistence, store_options).await?;
        let buffer = MessageBuffer::new(store.clone());
        let names = NameDirectory::new();

        let producer = DigestProducer::new(
            store.clone(),
            buffer.clone(),
            names.clone(),
            renderer,
            mail,
            ProducerOptions {
                send_empty_digests: config.send_empty_digests,
            },
        );

        let scheduler_options = SchedulerOptions::new(config.tick_interval(), config.max_concurrent_digests).with_cancel(shutdown.clone());
        let scheduler = DigestScheduler::new(store.clone(), producer.clone(), scheduler_options);

        let commands = CommandHandler::new(store.clone(), names.clone(), config.admin_user_ids.clone());

        // Chat.

        let chat = chat(config.clone(), buffer.clone(), commands.clone(), names.clone()).await?;

        Ok(Self {
            config,
            store,
            buffer,
            names,
            producer,
            scheduler,
            commands,
            chat,
            fatal,
            shutdown,
        })
    }

    /// Run until the chat listener stops or shutdown is requested.
    ///
    /// A persistence failure ends the run with an error. In-flight digests are
    /// failed closed before returning.
    pub async fn start(&self) -> Void {
        let scheduler = {
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };

        let result = tokio::select! {
            result = self.chat.start() => {
                info!("Chat listener stopped.");
                result
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down ...");
                Ok(())
            }
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested ...");
                Ok(())
            }
            _ = self.fatal.cancelled() => {
                error!("Configuration could not be persisted, shutting down ...");
                Err(anyhow::anyhow!("Configuration could not be persisted."))
            }
        };

        self.shutdown.cancel();
        scheduler.await?;

        result
    }

    /// Stop the scheduler; `start` then returns once in-flight digests settle.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

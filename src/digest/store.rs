//! Durable per-server configuration.
//!
//! The store keeps one [`ServerConfig`] per server behind its own lock, so
//! mutations of a single server are serialized while different servers proceed
//! in parallel. Every mutation is written through the injected persistence
//! before it becomes visible; a failed write leaves the in-memory record as it
//! was and cancels the shutdown token, since running on with configuration that
//! cannot be made durable would silently lose it.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    base::{
        clock::Clock,
        email::normalize_emails,
        error::{DigestError, DigestResult},
        types::{ChannelId, Res, ServerId},
    },
    service::persistence::ConfigPersistence,
};

// Types.

/// Configuration of one monitored server, as persisted.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server_id: ServerId,
    #[serde(default)]
    pub monitored_channels: BTreeSet<ChannelId>,
    #[serde(default)]
    pub recipient_emails: BTreeSet<String>,
    #[serde_as(as = "DurationSeconds<i64>")]
    #[serde(rename = "digest_interval_secs")]
    pub digest_interval: TimeDelta,
    /// Time of the last digest, or of registration if none has fired yet.
    pub last_digest_at: DateTime<Utc>,
}

impl ServerConfig {
    /// A fresh record with no channels and no recipients.
    pub fn new(server_id: &str, digest_interval: TimeDelta, registered_at: DateTime<Utc>) -> Self {
        Self {
            server_id: server_id.to_string(),
            monitored_channels: BTreeSet::new(),
            recipient_emails: BTreeSet::new(),
            digest_interval,
            last_digest_at: registered_at,
        }
    }

    /// Whether the interval has elapsed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now - self.last_digest_at >= self.digest_interval
    }
}

/// Options for opening a [`ConfigStore`].
#[derive(Clone)]
pub struct StoreOptions {
    pub default_interval: TimeDelta,
    pub clock: Clock,
    /// Cancelled when a write cannot be persisted.
    pub shutdown: CancellationToken,
}

impl StoreOptions {
    pub fn new(default_interval: TimeDelta) -> Self {
        Self {
            default_interval,
            clock: Clock::system(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

type Entry = Arc<Mutex<ServerConfig>>;

/// Configuration store for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<ConfigStoreInner>,
}

struct ConfigStoreInner {
    persistence: ConfigPersistence,
    options: StoreOptions,
    servers: RwLock<HashMap<ServerId, Entry>>,
}

impl ConfigStore {
    /// Open the store, loading every persisted record.
    #[instrument(name = "ConfigStore::open", skip_all)]
    pub async fn open(persistence: ConfigPersistence, options: StoreOptions) -> Res<Self> {
        if options.default_interval <= TimeDelta::zero() {
            return Err(anyhow::anyhow!("The default digest interval must be positive."));
        }

        let mut records = persistence.load_all().await?;

        // A non-positive interval would make the server due on every tick.
        for record in records.iter_mut().filter(|r| r.digest_interval <= TimeDelta::zero()) {
            warn!(server_id = %record.server_id, "Persisted digest interval of {}s is not positive, using the default.", record.digest_interval.num_seconds());
            record.digest_interval = options.default_interval;
        }

        let servers = records.into_iter().map(|r| (r.server_id.clone(), Arc::new(Mutex::new(r)))).collect::<HashMap<_, _>>();

        info!("Configuration store opened with {} server(s).", servers.len());

        Ok(Self {
            inner: Arc::new(ConfigStoreInner {
                persistence,
                options,
                servers: RwLock::new(servers),
            }),
        })
    }

    /// The token cancelled on a persistence failure.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.options.shutdown
    }

    /// The current time according to the store clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.options.clock.now()
    }

    /// Snapshot of a server's configuration, if it exists.
    pub async fn get(&self, server_id: &str) -> Option<ServerConfig> {
        let entry = self.entry(server_id).await?;
        let config = entry.lock().await.clone();
        Some(config)
    }

    /// Returns the existing configuration or registers the server with defaults.
    pub async fn get_or_create(&self, server_id: &str) -> DigestResult<ServerConfig> {
        let entry = self.entry_or_create(server_id).await?;
        let config = entry.lock().await.clone();
        Ok(config)
    }

    /// Every known server id.
    pub async fn server_ids(&self) -> Vec<ServerId> {
        self.inner.servers.read().await.keys().cloned().collect()
    }

    /// Start monitoring a channel. Returns `false` if it already was.
    #[instrument(skip(self))]
    pub async fn add_channel(&self, server_id: &str, channel_id: &str) -> DigestResult<bool> {
        self.mutate(server_id, |c| Ok(c.monitored_channels.insert(channel_id.to_string()))).await
    }

    /// Stop monitoring a channel. Returns `false` if it was not monitored.
    #[instrument(skip(self))]
    pub async fn remove_channel(&self, server_id: &str, channel_id: &str) -> DigestResult<bool> {
        self.mutate(server_id, |c| Ok(c.monitored_channels.remove(channel_id))).await
    }

    /// Add recipients. Returns how many were not already present.
    ///
    /// If any address is invalid nothing is changed.
    #[instrument(skip(self, emails))]
    pub async fn add_emails<S: AsRef<str>>(&self, server_id: &str, emails: &[S]) -> DigestResult<usize> {
        let emails = normalize_emails(emails)?;

        self.mutate(server_id, |c| Ok(emails.into_iter().filter(|e| c.recipient_emails.insert(e.clone())).count())).await
    }

    /// Remove recipients. Returns how many were actually present.
    ///
    /// If any address is invalid nothing is changed.
    #[instrument(skip(self, emails))]
    pub async fn remove_emails<S: AsRef<str>>(&self, server_id: &str, emails: &[S]) -> DigestResult<usize> {
        let emails = normalize_emails(emails)?;

        self.mutate(server_id, |c| Ok(emails.iter().filter(|e| c.recipient_emails.remove(e.as_str())).count())).await
    }

    /// Change the digest interval.
    #[instrument(skip(self))]
    pub async fn set_interval(&self, server_id: &str, interval: TimeDelta) -> DigestResult<()> {
        if interval <= TimeDelta::zero() {
            return Err(DigestError::validation("The digest interval must be positive."));
        }

        self.mutate(server_id, |c| {
            c.digest_interval = interval;
            Ok(())
        })
        .await
    }

    /// Record that a digest fired at `at`.
    ///
    /// Times earlier than the current `last_digest_at` are ignored.
    #[instrument(skip(self))]
    pub async fn mark_digested(&self, server_id: &str, at: DateTime<Utc>) -> DigestResult<()> {
        let entry = self.entry(server_id).await.ok_or_else(|| DigestError::NotFound(server_id.to_string()))?;

        self.apply(&entry, |c| {
            if at > c.last_digest_at {
                c.last_digest_at = at;
            } else {
                debug!("Ignoring non-advancing digest time.");
            }
            Ok(())
        })
        .await
    }

    /// Servers whose interval has elapsed at `now`, in no particular order.
    pub async fn list_due(&self, now: DateTime<Utc>) -> Vec<ServerId> {
        let entries: Vec<Entry> = self.inner.servers.read().await.values().cloned().collect();

        let mut due = Vec::new();
        for entry in entries {
            let config = entry.lock().await;
            if config.is_due(now) {
                due.push(config.server_id.clone());
            }
        }

        due
    }

    /// Whether `channel_id` is monitored on `server_id`.
    pub async fn is_monitored(&self, server_id: &str, channel_id: &str) -> bool {
        match self.entry(server_id).await {
            Some(entry) => entry.lock().await.monitored_channels.contains(channel_id),
            None => false,
        }
    }

    // Internals.

    async fn entry(&self, server_id: &str) -> Option<Entry> {
        self.inner.servers.read().await.get(server_id).cloned()
    }

    async fn entry_or_create(&self, server_id: &str) -> DigestResult<Entry> {
        if let Some(entry) = self.entry(server_id).await {
            return Ok(entry);
        }

        // Hold the new record's lock until it is persisted so nobody mutates a record that may be rolled back.
        let (entry, guard) = {
            let mut servers = self.inner.servers.write().await;

            if let Some(entry) = servers.get(server_id) {
                return Ok(entry.clone());
            }

            let record = ServerConfig::new(server_id, self.inner.options.default_interval, self.now());
            let entry = Arc::new(Mutex::new(record));
            let guard = entry.clone().lock_owned().await;

            servers.insert(server_id.to_string(), entry.clone());

            (entry, guard)
        };

        if let Err(err) = self.persist(&guard).await {
            self.inner.servers.write().await.remove(server_id);
            return Err(err);
        }

        info!(server_id, "Registered new server.");

        drop(guard);

        Ok(entry)
    }

    async fn mutate<R>(&self, server_id: &str, op: impl FnOnce(&mut ServerConfig) -> DigestResult<R>) -> DigestResult<R> {
        let entry = self.entry_or_create(server_id).await?;
        self.apply(&entry, op).await
    }

    /// Apply `op` to a copy of the record and swap it in once persisted.
    async fn apply<R>(&self, entry: &Entry, op: impl FnOnce(&mut ServerConfig) -> DigestResult<R>) -> DigestResult<R> {
        let mut current = entry.lock().await;

        let mut next = current.clone();
        let result = op(&mut next)?;

        if next != *current {
            self.persist(&next).await?;
            *current = next;
        }

        Ok(result)
    }

    async fn persist(&self, record: &ServerConfig) -> DigestResult<()> {
        if let Err(err) = self.inner.persistence.save(record).await {
            error!(server_id = %record.server_id, "Failed to persist configuration, shutting down: {:#}", err);
            self.inner.options.shutdown.cancel();
            return Err(DigestError::Persistence(err));
        }

        Ok(())
    }
}

// Tests.

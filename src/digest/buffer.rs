//! Per-server buffer of messages awaiting the next digest.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument};

use crate::{
    base::types::{BufferedMessage, ServerId},
    digest::store::ConfigStore,
};

type Entry = Arc<Mutex<Vec<BufferedMessage>>>;

/// Message buffer for the application.
///
/// Messages are kept in ingestion order per server; ordering by `posted_at`
/// happens on drain. Only channels currently monitored in the [`ConfigStore`]
/// are buffered, so a server that has not been configured accumulates nothing.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct MessageBuffer {
    inner: Arc<MessageBufferInner>,
}

struct MessageBufferInner {
    store: ConfigStore,
    servers: RwLock<HashMap<ServerId, Entry>>,
}

impl MessageBuffer {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            inner: Arc::new(MessageBufferInner {
                store,
                servers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Buffer a message. Returns `false` if its channel is not monitored.
    #[instrument(skip(self, message), fields(channel_id = %message.channel_id))]
    pub async fn append(&self, server_id: &str, message: BufferedMessage) -> bool {
        if !self.inner.store.is_monitored(server_id, &message.channel_id).await {
            debug!("Ignoring message from unmonitored channel.");
            return false;
        }

        let entry = self.entry_or_insert(server_id).await;
        entry.lock().await.push(message);

        true
    }

    /// Take every buffered message for the server, oldest first.
    ///
    /// The buffer is swapped for an empty one in a single step; messages appended
    /// concurrently belong to the next drain.
    pub async fn drain(&self, server_id: &str) -> Vec<BufferedMessage> {
        let Some(entry) = self.entry(server_id).await else {
            return Vec::new();
        };

        let mut messages = std::mem::take(&mut *entry.lock().await);

        // Stable, so equal timestamps keep ingestion order.
        messages.sort_by_key(|m| m.posted_at);

        messages
    }

    /// Put a drained batch back in front of anything appended since.
    pub async fn restore(&self, server_id: &str, messages: Vec<BufferedMessage>) {
        if messages.is_empty() {
            return;
        }

        let entry = self.entry_or_insert(server_id).await;
        let mut buffered = entry.lock().await;

        let mut restored = messages;
        restored.append(&mut buffered);
        *buffered = restored;
    }

    /// Drop every buffered message for the server. Returns how many were dropped.
    pub async fn discard(&self, server_id: &str) -> usize {
        match self.entry(server_id).await {
            Some(entry) => std::mem::take(&mut *entry.lock().await).len(),
            None => 0,
        }
    }

    /// Number of messages currently buffered for the server.
    pub async fn len(&self, server_id: &str) -> usize {
        match self.entry(server_id).await {
            Some(entry) => entry.lock().await.len(),
            None => 0,
        }
    }

    // Internals.

    async fn entry(&self, server_id: &str) -> Option<Entry> {
        self.inner.servers.read().await.get(server_id).cloned()
    }

    async fn entry_or_insert(&self, server_id: &str) -> Entry {
        if let Some(entry) = self.entry(server_id).await {
            return entry;
        }

        self.inner.servers.write().await.entry(server_id.to_string()).or_default().clone()
    }
}

// Tests.

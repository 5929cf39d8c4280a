//! Human-readable server and channel names.
//!
//! The chat adapter records names as it learns them; the producer and the
//! command layer read them back. Anything not yet known falls back to its id.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use tokio::sync::RwLock;

use crate::base::types::{ChannelId, ServerId};

/// Name directory for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone, Default)]
pub struct NameDirectory {
    inner: Arc<NameDirectoryInner>,
}

#[derive(Default)]
struct NameDirectoryInner {
    servers: RwLock<HashMap<ServerId, String>>,
    channels: RwLock<HashMap<ServerId, BTreeMap<ChannelId, String>>>,
}

impl NameDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_server_name(&self, server_id: &str, name: impl Into<String>) {
        self.inner.servers.write().await.insert(server_id.to_string(), name.into());
    }

    pub async fn set_channel_name(&self, server_id: &str, channel_id: &str, name: impl Into<String>) {
        self.inner.channels.write().await.entry(server_id.to_string()).or_default().insert(channel_id.to_string(), name.into());
    }

    pub async fn server_name(&self, server_id: &str) -> Option<String> {
        self.inner.servers.read().await.get(server_id).cloned()
    }

    pub async fn channel_name(&self, server_id: &str, channel_id: &str) -> Option<String> {
        self.inner.channels.read().await.get(server_id).and_then(|c| c.get(channel_id)).cloned()
    }

    /// Every known channel name of `server_id`, keyed by channel id.
    pub async fn channel_names(&self, server_id: &str) -> BTreeMap<ChannelId, String> {
        self.inner.channels.read().await.get(server_id).cloned().unwrap_or_default()
    }

    /// The server's name, or its id if unknown.
    pub async fn server_label(&self, server_id: &str) -> String {
        self.server_name(server_id).await.unwrap_or_else(|| server_id.to_string())
    }

    /// The channel's name, or its id if unknown.
    pub async fn channel_label(&self, server_id: &str, channel_id: &str) -> String {
        self.channel_name(server_id, channel_id).await.unwrap_or_else(|| channel_id.to_string())
    }
}

// Tests.

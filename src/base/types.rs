use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Err = anyhow::Error;
pub type Res<T> = Result<T, Err>;
pub type Void = Res<()>;

/// Identifier of a chat server (a Slack team, a Discord guild, etc.).
pub type ServerId = String;
/// Identifier of a channel within a server.
pub type ChannelId = String;

/// A single chat message held in a server's buffer until its digest fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub channel_id: ChannelId,
    pub author_display_name: String,
    pub content: String,
    pub posted_at: DateTime<Utc>,
}

/// Everything a renderer and a mail client need to deliver one digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestPayload {
    pub server_id: ServerId,
    /// Display name of the server, or its id if unknown.
    pub server_name: String,
    /// Known channel names, keyed by channel id.
    pub channel_names: BTreeMap<ChannelId, String>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Messages in chronological order.
    pub messages: Vec<BufferedMessage>,
    /// Recipients at the time the payload was built.
    pub recipient_emails: Vec<String>,
}

impl DigestPayload {
    /// The channel's name, or its id if unknown.
    pub fn channel_label<'a>(&'a self, channel_id: &'a str) -> &'a str {
        self.channel_names.get(channel_id).map(String::as_str).unwrap_or(channel_id)
    }
}

/// A rendered digest, ready to be mailed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub subject: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Why a due server did not get a digest this period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoChannels,
    NoRecipients,
    /// The window was empty and empty digests are suppressed.
    Empty,
}

/// Result of a successful production attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProduceOutcome {
    Delivered { message_count: usize },
    Skipped(SkipReason),
}

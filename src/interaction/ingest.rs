use tracing::{debug, instrument};

use crate::{base::types::BufferedMessage, digest::buffer::MessageBuffer};

/// Buffer a chat message for the next digest of `server_id`.
///
/// Messages from channels that are not monitored are dropped, as are messages
/// whose content is blank. Adapters should build the content with
/// [`compose_content`] so that attachment-only messages are kept. Returns
/// whether the message was buffered.
#[instrument(skip_all, fields(server_id = %server_id, channel_id = %message.channel_id))]
pub async fn handle_message_ingest(server_id: &str, message: BufferedMessage, buffer: &MessageBuffer) -> bool {
    if message.content.trim().is_empty() {
        debug!("Skipping message without text.");
        return false;
    }

    let buffered = buffer.append(server_id, message).await;

    if !buffered {
        debug!("Skipping message from unmonitored channel.");
    }

    buffered
}

/// Message text followed by one placeholder per attachment name.
pub fn compose_content(text: Option<&str>, attachments: &[String]) -> String {
    let mut parts: Vec<String> = text.map(str::trim).filter(|t| !t.is_empty()).map(str::to_string).into_iter().collect();

    parts.extend(attachments.iter().map(|name| match name.trim() {
        "" => "[attachment]".to_string(),
        name => format!("[attachment: {name}]"),
    }));

    parts.join(" ")
}

// Tests.

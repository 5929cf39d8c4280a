//! HTML email rendering.
//!
//! Messages are laid out per channel (in order of first activity), and within a
//! channel grouped under the minute they were posted, so the digest is not
//! cluttered with one timestamp per line.

use std::{fmt::Write, sync::Arc};

use chrono::{DateTime, Utc};

use crate::base::types::{BufferedMessage, DigestPayload, Document, Res};

use super::{GenericRenderer, Renderer};

const MINUTE_FORMAT: &str = "%a %b %d %I:%M %p UTC";
const WINDOW_FORMAT: &str = "%Y-%m-%d %H:%M UTC";

impl Renderer {
    /// Creates the HTML renderer.
    pub fn html() -> Self {
        Self::new(Arc::new(HtmlRenderer))
    }
}

/// HTML renderer implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlRenderer;

impl GenericRenderer for HtmlRenderer {
    fn render(&self, payload: &DigestPayload) -> Res<Document> {
        if payload.window_end < payload.window_start {
            return Err(anyhow::anyhow!("Digest window ends before it starts."));
        }

        let mut html = String::from("<html><body style=\"font-family: Arial, sans-serif;\">\n");

        writeln!(html, "<h1>Digest for {}</h1>", escape(&payload.server_name))?;
        writeln!(html, "<p>{} &ndash; {}</p>", payload.window_start.format(WINDOW_FORMAT), payload.window_end.format(WINDOW_FORMAT))?;

        if payload.messages.is_empty() {
            html.push_str("<p>No new messages</p>\n");
        }

        for (channel_id, messages) in group_by_channel(&payload.messages) {
            writeln!(html, "<h2>#{}</h2>", escape(payload.channel_label(channel_id)))?;

            for (minute, group) in group_by_minute(&messages) {
                writeln!(html, "<h3>{minute}</h3>")?;
                html.push_str("<ul>\n");
                for message in group {
                    writeln!(html, "    <li><strong>{}:</strong> {}</li>", escape(&message.author_display_name), escape(&message.content))?;
                }
                html.push_str("</ul>\n");
            }
        }

        html.push_str("</body></html>");

        Ok(Document {
            subject: format!("Message Digest for {}", payload.server_name),
            content_type: "text/html".to_string(),
            body: html.into_bytes(),
        })
    }
}

// Helpers.

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

/// Channels in order of their first message, each with its messages in order.
fn group_by_channel(messages: &[BufferedMessage]) -> Vec<(&str, Vec<&BufferedMessage>)> {
    let mut groups: Vec<(&str, Vec<&BufferedMessage>)> = Vec::new();

    for message in messages {
        match groups.iter_mut().find(|(channel_id, _)| *channel_id == message.channel_id) {
            Some((_, group)) => group.push(message),
            None => groups.push((message.channel_id.as_str(), vec![message])),
        }
    }

    groups
}

/// Consecutive runs of messages posted within the same minute.
fn group_by_minute<'a>(messages: &[&'a BufferedMessage]) -> Vec<(String, Vec<&'a BufferedMessage>)> {
    let mut groups: Vec<(String, Vec<&BufferedMessage>)> = Vec::new();

    for &message in messages {
        let minute = minute_label(message.posted_at);
        match groups.last_mut() {
            Some((label, group)) if *label == minute => group.push(message),
            _ => groups.push((minute, vec![message])),
        }
    }

    groups
}

fn minute_label(at: DateTime<Utc>) -> String {
    at.format(MINUTE_FORMAT).to_string()
}

// Tests.

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn message(channel_id: &str, author: &str, content: &str, posted_at: DateTime<Utc>) -> BufferedMessage {
        BufferedMessage {
            channel_id: channel_id.to_string(),
            author_display_name: author.to_string(),
            content: content.to_string(),
            posted_at,
        }
    }

    fn payload(messages: Vec<BufferedMessage>) -> DigestPayload {
        DigestPayload {
            server_id: "T1".to_string(),
            server_name: "T1".to_string(),
            channel_names: Default::default(),
            window_start: t0(),
            window_end: t0() + TimeDelta::hours(1),
            messages,
            recipient_emails: vec!["a@example.com".to_string()],
        }
    }

    fn body(document: &Document) -> String {
        String::from_utf8(document.body.clone()).unwrap()
    }

    #[test]
    fn test_empty_digest_renders() {
        let document = HtmlRenderer.render(&payload(vec![])).unwrap();

        assert_eq!(document.subject, "Message Digest for T1");
        assert_eq!(document.content_type, "text/html");
        assert!(body(&document).contains("<p>No new messages</p>"));
    }

    #[test]
    fn test_content_is_escaped() {
        let document = HtmlRenderer.render(&payload(vec![message("C1", "<bob>", "<script>alert(1)</script> & co", t0())])).unwrap();
        let html = body(&document);

        assert!(html.contains("&lt;script&gt;alert(1)&lt;/script&gt; &amp; co"));
        assert!(html.contains("<strong>&lt;bob&gt;:</strong>"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn test_grouping_by_channel_and_minute() {
        let messages = vec![
            message("C2", "alice", "first", t0()),
            message("C1", "bob", "second", t0() + TimeDelta::seconds(10)),
            message("C2", "carol", "third", t0() + TimeDelta::seconds(30)),
            message("C2", "dave", "fourth", t0() + TimeDelta::minutes(2)),
        ];

        let html = body(&HtmlRenderer.render(&payload(messages)).unwrap());

        // Channels appear in order of first activity.
        let c2 = html.find("<h2>#C2</h2>").unwrap();
        let c1 = html.find("<h2>#C1</h2>").unwrap();
        assert!(c2 < c1);

        // Two minute headers under C2, one under C1.
        assert_eq!(html.matches("<h3>").count(), 3);
        assert!(html.contains("<h3>Sat Mar 01 09:00 AM UTC</h3>"));
        assert!(html.contains("<h3>Sat Mar 01 09:02 AM UTC</h3>"));

        let first = html.find("first").unwrap();
        let third = html.find("third").unwrap();
        assert!(first < third);
    }

    #[test]
    fn test_names_replace_ids() {
        let mut payload = payload(vec![message("C1", "alice", "hi", t0()), message("C2", "bob", "yo", t0())]);
        payload.server_name = "Acme & Co".to_string();
        payload.channel_names.insert("C1".to_string(), "general".to_string());

        let document = HtmlRenderer.render(&payload).unwrap();
        let html = body(&document);

        assert_eq!(document.subject, "Message Digest for Acme & Co");
        assert!(html.contains("<h1>Digest for Acme &amp; Co</h1>"));
        assert!(html.contains("<h2>#general</h2>"));
        assert!(!html.contains("<h2>#C1</h2>"));

        // Channels without a known name keep their id.
        assert!(html.contains("<h2>#C2</h2>"));
    }

    #[test]
    fn test_inverted_window_is_malformed() {
        let mut payload = payload(vec![]);
        payload.window_end = payload.window_start - TimeDelta::seconds(1);

        assert!(HtmlRenderer.render(&payload).is_err());
    }
}

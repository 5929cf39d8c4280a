//! Text commands that configure a server's digest.
//!
//! Commands look like `<name> [args]`, optionally prefixed with `!`. Each one
//! maps onto a [`ConfigStore`] mutation and answers with a human-readable reply.

use std::{collections::HashSet, fmt::Write, str::FromStr, sync::Arc};

use chrono::TimeDelta;
use tracing::{info, instrument, warn};

use crate::{
    base::{
        email::email_list_from_csv,
        error::{DigestError, DigestResult},
        types::{ChannelId, ServerId},
    },
    digest::{names::NameDirectory, store::ConfigStore},
};

const NO_PERMISSION: &str = "You don't have permission to use this command.";
const INTERNAL_ERROR: &str = "An error occurred while processing the command.";
const EMAILS_NOT_UPDATED: &str = "Email recipient list not updated";

/// Every command name with a one-line description, in help order.
const COMMANDS: &[(&str, &str)] = &[
    ("add_channel", "Adds the current channel to the digest"),
    ("remove_channel", "Removes the current channel from the digest"),
    ("add_emails", "Adds email recipients of the message digest"),
    ("remove_emails", "Removes email recipients from the message digest"),
    ("set_interval", "Sets the digest interval, in minutes or as a duration like `1h 30m`"),
    ("show_config", "Prints the configuration for the server"),
    ("help", "Lists the available commands"),
];

// Types.

/// A parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddChannel,
    RemoveChannel,
    AddEmails(Vec<String>),
    RemoveEmails(Vec<String>),
    SetInterval(TimeDelta),
    ShowConfig,
    Help,
    Unknown(String),
}

impl FromStr for Command {
    type Err = DigestError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        let text = text.strip_prefix('!').unwrap_or(text);

        let (name, args) = match text.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (text, ""),
        };

        let command = match name.to_lowercase().as_str() {
            "add_channel" => Command::AddChannel,
            "remove_channel" => Command::RemoveChannel,
            "add_emails" => Command::AddEmails(email_list_from_csv(args)),
            "remove_emails" => Command::RemoveEmails(email_list_from_csv(args)),
            "set_interval" => Command::SetInterval(parse_interval(args)?),
            "show_config" => Command::ShowConfig,
            "help" | "" => Command::Help,
            other => Command::Unknown(other.to_string()),
        };

        Ok(command)
    }
}

/// Where a command came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub user_id: String,
}

// Handler.

/// Command handler for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct CommandHandler {
    store: ConfigStore,
    names: NameDirectory,
    admin_user_ids: Arc<HashSet<String>>,
}

impl CommandHandler {
    /// When `admin_user_ids` is empty every user may run commands.
    pub fn new(store: ConfigStore, names: NameDirectory, admin_user_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            store,
            names,
            admin_user_ids: Arc::new(admin_user_ids.into_iter().collect()),
        }
    }

    /// Parse and run `text`, returning the reply.
    pub async fn handle_text(&self, ctx: &CommandContext, text: &str) -> String {
        if !self.is_permitted(&ctx.user_id) {
            return NO_PERMISSION.to_string();
        }

        match text.parse::<Command>() {
            Ok(command) => self.handle(ctx, command).await,
            Err(err) => err.to_string(),
        }
    }

    /// Run `command`, returning the reply.
    #[instrument(name = "CommandHandler::handle", skip(self), fields(server_id = %ctx.server_id))]
    pub async fn handle(&self, ctx: &CommandContext, command: Command) -> String {
        if !self.is_permitted(&ctx.user_id) {
            warn!(user_id = %ctx.user_id, "Rejected command from non-admin user.");
            return NO_PERMISSION.to_string();
        }

        let is_email_command = matches!(command, Command::AddEmails(_) | Command::RemoveEmails(_));

        match self.execute(ctx, command).await {
            Ok(reply) => reply,
            Err(DigestError::Validation(message)) if is_email_command => format!("{message}\n{EMAILS_NOT_UPDATED}"),
            Err(DigestError::Validation(message)) => message,
            Err(err) => {
                warn!("Command failed: {}", err);
                INTERNAL_ERROR.to_string()
            }
        }
    }

    fn is_permitted(&self, user_id: &str) -> bool {
        self.admin_user_ids.is_empty() || self.admin_user_ids.contains(user_id)
    }

    async fn execute(&self, ctx: &CommandContext, command: Command) -> DigestResult<String> {
        let server_id = ctx.server_id.as_str();
        let channel_id = ctx.channel_id.as_str();

        let reply = match command {
            Command::AddChannel => {
                let channel = self.names.channel_label(server_id, channel_id).await;
                if self.store.add_channel(server_id, channel_id).await? {
                    info!(channel_id, "Channel added to digest.");
                    format!("Added channel #{channel} to monitored channels.")
                } else {
                    format!("Channel #{channel} is already monitored.")
                }
            }
            Command::RemoveChannel => {
                let channel = self.names.channel_label(server_id, channel_id).await;
                if self.store.remove_channel(server_id, channel_id).await? {
                    info!(channel_id, "Channel removed from digest.");
                    format!("Removed channel #{channel} from monitored channels.")
                } else {
                    format!("Channel #{channel} is not being monitored.")
                }
            }
            Command::AddEmails(emails) => {
                let added = self.store.add_emails(server_id, &emails).await?;
                info!(added, "Email recipient list updated.");
                "Email recipient list updated".to_string()
            }
            Command::RemoveEmails(emails) => {
                let removed = self.store.remove_emails(server_id, &emails).await?;
                info!(removed, "Email recipient list updated.");
                "Email recipient list updated".to_string()
            }
            Command::SetInterval(interval) => {
                self.store.set_interval(server_id, interval).await?;
                info!("Digest interval set to {}.", describe_interval(interval));
                format!("Digest interval set to {}.", describe_interval(interval))
            }
            Command::ShowConfig => self.show_config(server_id).await,
            Command::Help => help_text(),
            Command::Unknown(name) => format!("Command `{name}` not found.\n{}", command_list()),
        };

        Ok(reply)
    }

    async fn show_config(&self, server_id: &str) -> String {
        let Some(config) = self.store.get(server_id).await else {
            return "No configuration set yet.".to_string();
        };

        let channels = if config.monitored_channels.is_empty() {
            "None".to_string()
        } else {
            let mut labels = Vec::with_capacity(config.monitored_channels.len());
            for channel_id in &config.monitored_channels {
                labels.push(format!("#{}", self.names.channel_label(server_id, channel_id).await));
            }
            labels.join(", ")
        };

        let emails = if config.recipient_emails.is_empty() {
            "None".to_string()
        } else {
            config.recipient_emails.iter().cloned().collect::<Vec<_>>().join(", ")
        };

        format!(
            "channels: {channels}\nemail_recipients: {emails}\ndigest_interval: {}\nlast_digest: {}",
            describe_interval(config.digest_interval),
            config.last_digest_at.to_rfc3339()
        )
    }
}

// Helpers.

/// Whole minutes (`90`), or a duration such as `1h 30m`.
fn parse_interval(args: &str) -> DigestResult<TimeDelta> {
    if args.is_empty() {
        return Err(DigestError::validation("Usage: set_interval <minutes>"));
    }

    if let Ok(minutes) = args.parse::<i64>() {
        return TimeDelta::try_minutes(minutes).ok_or_else(|| DigestError::validation("The digest interval is too large."));
    }

    let duration = humantime::parse_duration(args).map_err(|e| DigestError::validation(format!("Invalid interval `{args}`: {e}.")))?;

    if duration < std::time::Duration::from_secs(60) {
        return Err(DigestError::validation("Interval must be at least 1 minute."));
    }

    TimeDelta::from_std(duration).map_err(|_| DigestError::validation("The digest interval is too large."))
}

fn describe_interval(interval: TimeDelta) -> String {
    if interval.num_seconds() % 60 == 0 {
        return format!("{} minutes", interval.num_minutes());
    }

    match interval.to_std() {
        Ok(duration) => humantime::format_duration(duration).to_string(),
        Err(_) => format!("{} seconds", interval.num_seconds()),
    }
}

fn command_list() -> String {
    let mut text = String::from("Available commands:");
    for (name, _) in COMMANDS {
        let _ = write!(text, "\n!{name}");
    }
    text
}

fn help_text() -> String {
    let mut text = String::from("Available commands:");
    for (name, brief) in COMMANDS {
        let _ = write!(text, "\n!{name} - {brief}");
    }
    text
}

// Tests.

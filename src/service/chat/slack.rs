//! Slack integration over socket mode.
//!
//! Push `message` events from any channel are offered to the buffer (the buffer
//! decides whether the channel is monitored), and slash command text is
//! dispatched to the command handler. The Slack team id is used as the server id.
//! Team and channel names are looked up once and recorded in the
//! [`NameDirectory`] so digests and replies can show them.

use std::{collections::HashMap, ops::Deref, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use slack_morphism::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::{
    base::{
        config::Config,
        types::{BufferedMessage, Res, Void},
    },
    digest::{buffer::MessageBuffer, names::NameDirectory},
    interaction::{
        command::{CommandContext, CommandHandler},
        ingest::{compose_content, handle_message_ingest},
    },
};

use super::{ChatClient, GenericChatClient};

// Type aliases.

type FullClient = slack_morphism::SlackClient<SlackClientHyperConnector<HttpsConnector<HttpConnector>>>;

// Extra methods on `ChatClient` applied by the slack implementation.

impl ChatClient {
    /// Creates a new Slack chat client.
    pub async fn slack(config: &Config, buffer: MessageBuffer, commands: CommandHandler, names: NameDirectory) -> Res<Self> {
        let client = SlackChatClient::new(config, buffer, commands, names).await?;
        Ok(Self::new(Arc::new(client)))
    }
}

// Structs.

/// User state for the slack socket client.
struct SlackUserState {
    bot_token: SlackApiToken,
    bot_user_id: String,
    buffer: MessageBuffer,
    commands: CommandHandler,
    names: NameDirectory,
    display_names: Arc<Mutex<HashMap<String, String>>>,
}

/// Slack client implementation.
struct SlackChatClient {
    app_token: SlackApiToken,
    bot_token: SlackApiToken,
    bot_user_id: String,
    client: Arc<FullClient>,
    buffer: MessageBuffer,
    commands: CommandHandler,
    names: NameDirectory,
}

impl Deref for SlackChatClient {
    type Target = FullClient;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl SlackChatClient {
    /// Create a new Slack chat client.
    #[instrument(name = "SlackChatClient::new", skip_all)]
    pub async fn new(config: &Config, buffer: MessageBuffer, commands: CommandHandler, names: NameDirectory) -> Res<Self> {
        // Initialize tokens.

        let app_token = SlackApiToken::new(SlackApiTokenValue(config.slack_app_token.clone()));
        let bot_token = SlackApiToken::new(SlackApiTokenValue(config.slack_bot_token.clone()));

        // Initialize the Slack client.

        let https_connector = HttpsConnector::<HttpConnector>::builder().with_native_roots()?.https_only().enable_all_versions().build();
        let connector = SlackClientHyperConnector::with_connector(https_connector);
        let client = Arc::new(slack_morphism::SlackClient::new(connector));

        // Get the bot's user ID.

        let session = client.open_session(&bot_token);
        let bot_user = session.auth_test().await?;
        let bot_user_id = bot_user.user_id.0;

        info!("Slack bot user ID: {}", bot_user_id);

        Ok(Self {
            app_token,
            bot_token,
            bot_user_id,
            client,
            buffer,
            commands,
            names,
        })
    }
}

#[async_trait]
impl GenericChatClient for SlackChatClient {
    async fn start(&self) -> Void {
        // Initialize the socket mode listener.

        let socket_mode_callbacks = SlackSocketModeListenerCallbacks::new()
            .with_command_events(handle_command_event)
            .with_push_events(handle_push_event);

        // Initialize the socket mode listener environment.

        let listener_environment = Arc::new(SlackClientEventsListenerEnvironment::new(self.client.clone()).with_user_state(SlackUserState {
            bot_token: self.bot_token.clone(),
            bot_user_id: self.bot_user_id.clone(),
            buffer: self.buffer.clone(),
            commands: self.commands.clone(),
            names: self.names.clone(),
            display_names: Arc::new(Mutex::new(HashMap::new())),
        }));

        let socket_mode_listener = Arc::new(SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            listener_environment.clone(),
            socket_mode_callbacks,
        ));

        // Register the app token and serve until the listener is shut down.
        socket_mode_listener.listen_for(&self.app_token).await?;
        socket_mode_listener.serve().await;

        Ok(())
    }
}

// Socket mode listener callbacks for Slack.

/// Handles slash commands from Slack.
#[instrument(skip_all)]
async fn handle_command_event(
    event: SlackCommandEvent,
    client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> Result<SlackCommandEventResponse, Box<dyn std::error::Error + Send + Sync>> {
    let states = states.read().await;
    let user_state = states.get_user_state::<SlackUserState>().ok_or(anyhow::anyhow!("Failed to get user state"))?;

    let ctx = CommandContext {
        server_id: event.team_id.0.clone(),
        channel_id: event.channel_id.0.clone(),
        user_id: event.user_id.0.clone(),
    };

    let text = event.text.as_deref().unwrap_or_default();
    info!(server_id = %ctx.server_id, "Received command `{}` ...", text);

    record_names(&client, user_state, &ctx.server_id, &ctx.channel_id).await;

    let reply = user_state.commands.handle_text(&ctx, text).await;

    Ok(SlackCommandEventResponse::new(SlackMessageContent::new().with_text(reply)))
}

/// Handles push events from Slack.
#[instrument(skip_all)]
async fn handle_push_event(event_callback: SlackPushEventCallback, client: Arc<SlackHyperClient>, states: SlackClientEventsUserState) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let server_id = event_callback.team_id.0.clone();
    let states = states.read().await;
    let user_state = states.get_user_state::<SlackUserState>().ok_or(anyhow::anyhow!("Failed to get user state"))?;

    match event_callback.event {
        SlackEventCallbackBody::Message(message_event) => {
            // Edits, deletions, joins and other bot-generated subtypes are not part of the conversation.
            if !matches!(message_event.subtype, None | Some(SlackMessageEventType::FileShare)) {
                debug!("Skipping message event with subtype {:?}.", message_event.subtype);
                return Ok(());
            }

            let Some(user_id) = message_event.sender.user.as_ref().map(|u| u.0.clone()) else {
                debug!("Skipping message event without a user.");
                return Ok(());
            };

            if user_id == user_state.bot_user_id {
                return Ok(());
            }

            let channel_id = message_event.origin.channel.as_ref().ok_or(anyhow::anyhow!("Failed to get channel ID"))?.0.to_owned();
            let content = message_event.content.as_ref().map(message_content).unwrap_or_default();
            let posted_at = parse_slack_ts(&message_event.origin.ts.0).unwrap_or_else(|| {
                warn!("Unparseable message timestamp `{}`, using receive time.", message_event.origin.ts.0);
                Utc::now()
            });

            let author_display_name = match &message_event.sender.username {
                Some(username) => username.clone(),
                None => display_name(&client, user_state, &user_id).await,
            };

            let message = BufferedMessage {
                channel_id,
                author_display_name,
                content,
                posted_at,
            };

            record_names(&client, user_state, &server_id, &message.channel_id).await;
            handle_message_ingest(&server_id, message, &user_state.buffer).await;
        }
        _ => {
            debug!("Received unhandled push event.")
        }
    }

    Ok(())
}

// Helpers.

/// Resolve a user's display name, caching the answer; falls back to the user id.
async fn display_name(client: &SlackHyperClient, user_state: &SlackUserState, user_id: &str) -> String {
    if let Some(name) = user_state.display_names.lock().await.get(user_id) {
        return name.clone();
    }

    let session = client.open_session(&user_state.bot_token);
    let request = SlackApiUsersInfoRequest::new(SlackUserId(user_id.to_string()));

    let name = match session.users_info(&request).await {
        Ok(response) => {
            let profile = response.user.profile;
            profile
                .as_ref()
                .and_then(|p| p.display_name.clone().filter(|n| !n.is_empty()))
                .or_else(|| profile.as_ref().and_then(|p| p.real_name.clone()))
                .unwrap_or_else(|| user_id.to_string())
        }
        Err(err) => {
            warn!("Failed to look up user `{}`: {}", user_id, err);
            return user_id.to_string();
        }
    };

    user_state.display_names.lock().await.insert(user_id.to_string(), name.clone());

    name
}

/// Text of a message plus a placeholder for each shared file or attachment.
fn message_content(content: &SlackMessageContent) -> String {
    let files = content.files.iter().flatten().map(|f| f.name.clone().or_else(|| f.title.clone()).unwrap_or_default());
    let attachments = content.attachments.iter().flatten().map(|a| a.title.clone().or_else(|| a.fallback.clone()).unwrap_or_default());

    compose_content(content.text.as_deref(), &files.chain(attachments).collect::<Vec<_>>())
}

/// Look up and record the team and channel names the directory does not know yet.
async fn record_names(client: &SlackHyperClient, user_state: &SlackUserState, server_id: &str, channel_id: &str) {
    let names = &user_state.names;
    let session = client.open_session(&user_state.bot_token);

    if names.server_name(server_id).await.is_none() {
        let request = SlackApiTeamInfoRequest::new().with_team(SlackTeamId(server_id.to_string()));

        match session.team_info(&request).await {
            Ok(response) => {
                if let Some(name) = response.team.name {
                    names.set_server_name(server_id, name).await;
                }
            }
            Err(err) => warn!("Failed to look up team `{}`: {}", server_id, err),
        }
    }

    if names.channel_name(server_id, channel_id).await.is_none() {
        let request = SlackApiConversationsInfoRequest::new(SlackChannelId(channel_id.to_string()));

        match session.conversations_info(&request).await {
            Ok(response) => {
                if let Some(name) = response.channel.name {
                    names.set_channel_name(server_id, channel_id, name).await;
                }
            }
            Err(err) => warn!("Failed to look up channel `{}`: {}", channel_id, err),
        }
    }
}

/// Slack timestamps are `<unix seconds>.<microseconds>`.
fn parse_slack_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, micros) = ts.split_once('.').unwrap_or((ts, "0"));

    let secs = secs.parse::<i64>().ok()?;
    let micros = micros.parse::<u32>().ok()?;

    DateTime::from_timestamp(secs, micros.checked_mul(1_000)?)
}

// Tests.

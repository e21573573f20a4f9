//! Telegram Bot API over plain HTTPS: `sendMessage` for delivery, `getUpdates` long polling
//! to discover chats.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::worker;
use super::{BotClient, BotError, BotEvent, Connector, Delivery};
use crate::plugins::{Plugin, PluginContext, PluginError};

pub const NAME: &str = "Telegram";
const API_BASE: &str = "https://api.telegram.org";
const POLL_TIMEOUT_SECS: u64 = 11;
const POLL_RETRY: Duration = Duration::from_secs(5);

#[derive(Deserialize, Debug)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: String,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize, Debug)]
struct ResponseParameters {
    migrate_to_chat_id: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct User {
    id: i64,
}

#[derive(Deserialize, Debug)]
struct Chat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize, Debug)]
struct Message {
    chat: Chat,
    text: Option<String>,
    migrate_to_chat_id: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct ChatMember {
    status: String,
}

#[derive(Deserialize, Debug)]
struct ChatMemberUpdated {
    chat: Chat,
    new_chat_member: ChatMember,
}

#[derive(Deserialize, Debug)]
struct Update {
    update_id: i64,
    message: Option<Message>,
    my_chat_member: Option<ChatMemberUpdated>,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    disable_notification: bool,
    disable_web_page_preview: bool,
}

/// Maps one update to the target list changes it implies.
fn classify(update: &Update) -> Vec<BotEvent<i64>> {
    if let Some(member) = &update.my_chat_member {
        let chat = member.chat.id;
        return match member.new_chat_member.status.as_str() {
            "member" | "administrator" => vec![BotEvent::Joined(chat)],
            "left" | "kicked" => vec![BotEvent::Left(chat)],
            _ => Vec::new(),
        };
    }

    let Some(message) = &update.message else {
        return Vec::new();
    };
    let chat = message.chat.id;
    if let Some(to) = message.migrate_to_chat_id {
        return vec![BotEvent::Migrated { from: chat, to }];
    }
    let text = message.text.as_deref().unwrap_or_default();
    if message.chat.kind == "private" && !text.starts_with("/start") {
        return vec![BotEvent::Greet(chat), BotEvent::Joined(chat)];
    }
    // Any message reveals a chat the bot is in, even one it joined before the token was set.
    vec![BotEvent::Joined(chat)]
}

fn delivery(status: StatusCode, response: ApiResponse<serde_json::Value>) -> Delivery<i64> {
    if response.ok {
        return Delivery::Delivered;
    }
    if let Some(to) = response.parameters.and_then(|p| p.migrate_to_chat_id) {
        return Delivery::Migrated(to);
    }
    let reason = format!("{status}: {}", response.description);
    if status == StatusCode::FORBIDDEN || response.description.contains("chat not found") {
        Delivery::Permanent(reason)
    } else {
        Delivery::Transient(reason)
    }
}

pub struct TelegramClient {
    http: Client,
    base: String,
}

impl TelegramClient {
    /// Checks the token with `getMe`.
    pub async fn connect(http: Client, token: &str) -> Result<Self, BotError> {
        let client = Self {
            http,
            base: format!("{API_BASE}/bot{token}"),
        };
        let response: ApiResponse<User> = client
            .http
            .get(format!("{}/getMe", client.base))
            .send()
            .await?
            .json()
            .await?;
        match response.result {
            Some(user) if response.ok => {
                info!(bot_id = user.id, "Telegram token accepted.");
                Ok(client)
            }
            _ => Err(BotError::Rejected(response.description)),
        }
    }

    async fn poll(&self, offset: i64) -> Result<Vec<Update>, BotError> {
        let response: ApiResponse<Vec<Update>> = self
            .http
            .get(format!("{}/getUpdates", self.base))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", POLL_TIMEOUT_SECS.to_string()),
                ("allowed_updates", r#"["message","my_chat_member"]"#.to_string()),
            ])
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .send()
            .await?
            .json()
            .await?;
        if !response.ok {
            if response.error_code == Some(401) {
                return Err(BotError::Rejected(response.description));
            }
            return Err(BotError::Api(response.description));
        }
        Ok(response.result.unwrap_or_default())
    }
}

#[async_trait]
impl BotClient for TelegramClient {
    type Target = i64;
    const PLATFORM: &'static str = NAME;
    const MESSAGE_LIMIT: usize = 4096;

    async fn send(&self, target: &i64, text: &str, silent: bool) -> Delivery<i64> {
        let request = SendMessage {
            chat_id: *target,
            text,
            disable_notification: silent,
            disable_web_page_preview: true,
        };
        let response = match self
            .http
            .post(format!("{}/sendMessage", self.base))
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Delivery::Transient(e.without_url().to_string()),
        };
        let status = response.status();
        match response.json::<ApiResponse<serde_json::Value>>().await {
            Ok(body) => delivery(status, body),
            Err(e) => Delivery::Transient(format!("{status}: {}", e.without_url())),
        }
    }

    async fn listen(&self, events: mpsc::Sender<BotEvent<i64>>) -> Result<(), BotError> {
        let mut offset = 0;
        loop {
            let updates = match self.poll(offset).await {
                Ok(updates) => updates,
                Err(e @ BotError::Rejected(_)) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Telegram polling failed, retrying.");
                    tokio::time::sleep(POLL_RETRY).await;
                    continue;
                }
            };
            for update in updates {
                offset = offset.max(update.update_id + 1);
                for event in classify(&update) {
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
            if events.is_closed() {
                return Ok(());
            }
        }
    }
}

pub fn connector(http: Client) -> Connector<TelegramClient> {
    Arc::new(move |token: String| {
        let http = http.clone();
        Box::pin(async move { TelegramClient::connect(http, &token).await.map(Arc::new) })
    })
}

pub async fn create(ctx: PluginContext) -> Result<Arc<dyn Plugin>, PluginError> {
    let connector = connector(ctx.services.http.clone());
    worker::create(ctx, connector).await
}

//! Discord: REST v10 for delivery, a gateway session to learn which guild channels to use.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info, warn};

use super::worker;
use super::{BotClient, BotError, BotEvent, Connector, Delivery};
use crate::plugins::{Plugin, PluginContext, PluginError};
use crate::version;

pub const NAME: &str = "Discord";
const API_BASE: &str = "https://discord.com/api/v10";
const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// GUILDS | DIRECT_MESSAGES
const INTENTS: u64 = 1 | 1 << 12;
const SUPPRESS_NOTIFICATIONS: u64 = 1 << 12;

const CHANNEL_GUILD_TEXT: u64 = 0;
const CHANNEL_GUILD_NEWS: u64 = 5;

const OP_DISPATCH: u64 = 0;
const OP_HEARTBEAT: u64 = 1;
const OP_IDENTIFY: u64 = 2;
const OP_RECONNECT: u64 = 7;
const OP_INVALID_SESSION: u64 = 9;
const OP_HELLO: u64 = 10;

/// Close codes after which reconnecting with the same token cannot succeed.
const FATAL_CLOSE_CODES: [u16; 5] = [4004, 4010, 4011, 4013, 4014];

#[derive(Deserialize, Debug)]
struct GatewayPayload {
    op: u64,
    #[serde(default)]
    d: Value,
    s: Option<u64>,
    t: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Identity {
    id: String,
}

#[derive(Deserialize, Debug)]
struct ChannelInfo {
    id: String,
    #[serde(rename = "type")]
    kind: u64,
    #[serde(default)]
    position: i64,
}

/// Channels seen per guild during one session, to map guild removal back to targets.
#[derive(Default, Debug)]
struct GuildIndex {
    channels: HashMap<String, Vec<String>>,
}

/// News channels, else the system channel, else the first text channel.
fn pick_channels(guild: &Value) -> Vec<String> {
    let mut channels: Vec<ChannelInfo> = guild
        .get("channels")
        .cloned()
        .and_then(|c| serde_json::from_value(c).ok())
        .unwrap_or_default();
    channels.sort_by_key(|c| c.position);

    let news: Vec<String> = channels
        .iter()
        .filter(|c| c.kind == CHANNEL_GUILD_NEWS)
        .map(|c| c.id.clone())
        .collect();
    if !news.is_empty() {
        return news;
    }
    if let Some(system) = guild.get("system_channel_id").and_then(Value::as_str) {
        return vec![system.to_string()];
    }
    channels
        .iter()
        .find(|c| c.kind == CHANNEL_GUILD_TEXT)
        .map(|c| vec![c.id.clone()])
        .unwrap_or_default()
}

fn classify(kind: &str, data: &Value, self_id: &str, guilds: &mut GuildIndex) -> Vec<BotEvent<String>> {
    let str_field = |name: &str| data.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
    match kind {
        "GUILD_CREATE" => {
            if data.get("unavailable").and_then(Value::as_bool) == Some(true) {
                return Vec::new();
            }
            let picked = pick_channels(data);
            guilds.channels.insert(str_field("id"), picked.clone());
            picked.into_iter().map(BotEvent::Joined).collect()
        }
        "GUILD_DELETE" => {
            // Outages are reported as unavailable; only a real removal drops the targets.
            if data.get("unavailable").and_then(Value::as_bool) == Some(true) {
                return Vec::new();
            }
            guilds
                .channels
                .remove(&str_field("id"))
                .unwrap_or_default()
                .into_iter()
                .map(BotEvent::Left)
                .collect()
        }
        "CHANNEL_DELETE" => vec![BotEvent::Left(str_field("id"))],
        "MESSAGE_CREATE" => {
            let in_guild = data.get("guild_id").is_some_and(|g| !g.is_null());
            let author = data.get("author");
            let author_id = author.and_then(|a| a.get("id")).and_then(Value::as_str);
            let is_bot = author
                .and_then(|a| a.get("bot"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if in_guild || is_bot || author_id == Some(self_id) {
                Vec::new()
            } else {
                vec![BotEvent::Greet(str_field("channel_id"))]
            }
        }
        _ => Vec::new(),
    }
}

fn delivery(status: StatusCode, body: String) -> Delivery<String> {
    if status.is_success() {
        Delivery::Delivered
    } else if status == StatusCode::FORBIDDEN || status == StatusCode::NOT_FOUND {
        Delivery::Permanent(format!("{status}: {body}"))
    } else {
        Delivery::Transient(format!("{status}: {body}"))
    }
}

fn heartbeat(seq: Option<u64>) -> WsMessage {
    WsMessage::Text(json!({ "op": OP_HEARTBEAT, "d": seq }).to_string().into())
}

pub struct DiscordClient {
    http: Client,
    token: String,
    user_id: String,
    application_id: String,
}

impl DiscordClient {
    /// Resolves the bot user and its application, which also validates the token.
    pub async fn connect(http: Client, token: &str) -> Result<Self, BotError> {
        let mut client = Self {
            http,
            token: token.to_string(),
            user_id: String::new(),
            application_id: String::new(),
        };
        client.user_id = client.get::<Identity>("/users/@me").await?.id;
        client.application_id = client.get::<Identity>("/oauth2/applications/@me").await?.id;
        info!(application_id = %client.application_id, "Discord token accepted.");
        Ok(client)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, BotError> {
        let response = self
            .http
            .get(format!("{API_BASE}{path}"))
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(BotError::Rejected(format!("{path}: {status}")));
        }
        if !status.is_success() {
            return Err(BotError::Api(format!("{path}: {status}")));
        }
        Ok(response.json().await?)
    }

    /// One gateway session. `Ok` means the worker is gone; errors ask for a reconnect.
    async fn session(&self, events: &mpsc::Sender<BotEvent<String>>) -> Result<(), BotError> {
        let (stream, _) = tokio_tungstenite::connect_async(GATEWAY_URL).await?;
        let (mut sink, mut stream) = stream.split();

        let hello: GatewayPayload = match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => serde_json::from_str(text.as_str())?,
            other => return Err(BotError::Api(format!("expected Hello, got {other:?}"))),
        };
        if hello.op != OP_HELLO {
            return Err(BotError::Api(format!("expected Hello, got op {}", hello.op)));
        }
        let interval_ms = hello
            .d
            .get("heartbeat_interval")
            .and_then(Value::as_u64)
            .unwrap_or(41_250);
        let period = Duration::from_millis(interval_ms);

        let identify = json!({
            "op": OP_IDENTIFY,
            "d": {
                "token": self.token,
                "intents": INTENTS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": version::generator(),
                    "device": version::generator(),
                },
            },
        });
        sink.send(WsMessage::Text(identify.to_string().into())).await?;

        let mut heartbeats = interval_at(Instant::now() + period, period);
        let mut seq = None;
        let mut guilds = GuildIndex::default();
        loop {
            tokio::select! {
                _ = heartbeats.tick() => sink.send(heartbeat(seq)).await?,
                message = stream.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        let payload: GatewayPayload = serde_json::from_str(text.as_str())?;
                        if payload.s.is_some() {
                            seq = payload.s;
                        }
                        match payload.op {
                            OP_DISPATCH => {
                                let kind = payload.t.unwrap_or_default();
                                for event in classify(&kind, &payload.d, &self.user_id, &mut guilds) {
                                    if events.send(event).await.is_err() {
                                        return Ok(());
                                    }
                                }
                            }
                            OP_HEARTBEAT => sink.send(heartbeat(seq)).await?,
                            OP_RECONNECT | OP_INVALID_SESSION => {
                                return Err(BotError::Api(format!("gateway asked to reconnect (op {})", payload.op)));
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                        if code.is_some_and(|c| FATAL_CLOSE_CODES.contains(&c)) {
                            return Err(BotError::Rejected(format!("gateway closed: {reason}")));
                        }
                        return Err(BotError::Api(format!("gateway closed: {reason}")));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(BotError::Api("gateway stream ended".to_string())),
                },
                _ = events.closed() => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl BotClient for DiscordClient {
    type Target = String;
    const PLATFORM: &'static str = NAME;
    const MESSAGE_LIMIT: usize = 2000;

    async fn send(&self, target: &String, text: &str, silent: bool) -> Delivery<String> {
        let body = json!({
            "content": text,
            "flags": if silent { SUPPRESS_NOTIFICATIONS } else { 0 },
        });
        let response = self
            .http
            .post(format!("{API_BASE}/channels/{target}/messages"))
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
            .json(&body)
            .send()
            .await;
        match response {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                delivery(status, body)
            }
            Err(e) => Delivery::Transient(e.to_string()),
        }
    }

    async fn listen(&self, events: mpsc::Sender<BotEvent<String>>) -> Result<(), BotError> {
        loop {
            match self.session(&events).await {
                Ok(()) => return Ok(()),
                Err(e @ BotError::Rejected(_)) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Discord gateway session ended, reconnecting.");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    debug!("Reconnecting to the Discord gateway.");
                }
            }
        }
    }

    async fn invite_link(&self) -> Option<String> {
        Some(format!(
            "https://discord.com/api/oauth2/authorize?client_id={}&scope=bot&permissions=2048",
            urlencoding::encode(&self.application_id)
        ))
    }
}

pub fn connector(http: Client) -> Connector<DiscordClient> {
    Arc::new(move |token: String| {
        let http = http.clone();
        Box::pin(async move { DiscordClient::connect(http, &token).await.map(Arc::new) })
    })
}

pub async fn create(ctx: PluginContext) -> Result<Arc<dyn Plugin>, PluginError> {
    let connector = connector(ctx.services.http.clone());
    worker::create(ctx, connector).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guild(channels: Value, system: Option<&str>) -> Value {
        json!({ "id": "g1", "channels": channels, "system_channel_id": system })
    }

    #[test]
    fn test_pick_channels_prefers_news() {
        let channels = json!([
            {"id": "t1", "type": 0, "position": 0},
            {"id": "n1", "type": 5, "position": 2},
            {"id": "n2", "type": 5, "position": 1},
        ]);
        assert_eq!(pick_channels(&guild(channels, Some("t1"))), vec!["n2", "n1"]);
    }

    #[test]
    fn test_pick_channels_falls_back() {
        let channels = json!([
            {"id": "v1", "type": 2, "position": 0},
            {"id": "t2", "type": 0, "position": 3},
            {"id": "t1", "type": 0, "position": 1},
        ]);
        assert_eq!(pick_channels(&guild(channels.clone(), Some("sys"))), vec!["sys"]);
        assert_eq!(pick_channels(&guild(channels, None)), vec!["t1"]);
        assert!(pick_channels(&guild(json!([]), None)).is_empty());
    }

    #[test]
    fn test_guild_lifecycle() {
        let mut index = GuildIndex::default();
        let created = guild(json!([{"id": "n1", "type": 5, "position": 0}]), None);
        assert_eq!(
            classify("GUILD_CREATE", &created, "me", &mut index),
            vec![BotEvent::Joined("n1".to_string())]
        );

        let outage = json!({"id": "g1", "unavailable": true});
        assert!(classify("GUILD_DELETE", &outage, "me", &mut index).is_empty());

        let removed = json!({"id": "g1"});
        assert_eq!(
            classify("GUILD_DELETE", &removed, "me", &mut index),
            vec![BotEvent::Left("n1".to_string())]
        );
        assert_eq!(
            classify("CHANNEL_DELETE", &json!({"id": "c9"}), "me", &mut index),
            vec![BotEvent::Left("c9".to_string())]
        );
    }

    #[test]
    fn test_direct_messages_are_greeted() {
        let mut index = GuildIndex::default();
        let dm = json!({"channel_id": "d1", "author": {"id": "u1"}});
        assert_eq!(
            classify("MESSAGE_CREATE", &dm, "me", &mut index),
            vec![BotEvent::Greet("d1".to_string())]
        );
        let own = json!({"channel_id": "d1", "author": {"id": "me"}});
        assert!(classify("MESSAGE_CREATE", &own, "me", &mut index).is_empty());
        let in_guild = json!({"channel_id": "c1", "guild_id": "g1", "author": {"id": "u1"}});
        assert!(classify("MESSAGE_CREATE", &in_guild, "me", &mut index).is_empty());
    }

    #[test]
    fn test_delivery_classification() {
        assert_eq!(delivery(StatusCode::OK, String::new()), Delivery::Delivered);
        assert!(matches!(delivery(StatusCode::FORBIDDEN, String::new()), Delivery::Permanent(_)));
        assert!(matches!(delivery(StatusCode::NOT_FOUND, String::new()), Delivery::Permanent(_)));
        assert!(matches!(
            delivery(StatusCode::TOO_MANY_REQUESTS, String::new()),
            Delivery::Transient(_)
        ));
    }
}

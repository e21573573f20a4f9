//! Chat bot delivery. Platform clients implement [`BotClient`]; [`worker`] owns the
//! target list and the paced send queue for any of them.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod discord;
pub mod telegram;
pub mod worker;

#[derive(Error, Debug)]
pub enum BotError {
    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("API error: {0}")]
    Api(String),
    /// The platform refused the session for good (bad token, missing intents).
    #[error("Rejected by platform: {0}")]
    Rejected(String),
}

/// Request URLs can carry the bot token, so they never make it into an error message.
impl From<reqwest::Error> for BotError {
    fn from(e: reqwest::Error) -> Self {
        BotError::Http(e.without_url())
    }
}

/// Result of sending one segment to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<T> {
    Delivered,
    /// The chat moved; the segment should go to the new id.
    Migrated(T),
    /// The target is unreachable for good and should be forgotten.
    Permanent(String),
    Transient(String),
}

/// Something the listener observed that changes the target list or wants a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotEvent<T> {
    Joined(T),
    Left(T),
    Migrated { from: T, to: T },
    Greet(T),
}

#[async_trait]
pub trait BotClient: Send + Sync + 'static {
    type Target: Clone + PartialEq + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static;

    const PLATFORM: &'static str;
    /// Maximum characters per message.
    const MESSAGE_LIMIT: usize;

    async fn send(&self, target: &Self::Target, text: &str, silent: bool) -> Delivery<Self::Target>;

    /// Reports events until the receiver is dropped (`Ok`) or the session is refused for good.
    async fn listen(&self, events: mpsc::Sender<BotEvent<Self::Target>>) -> Result<(), BotError>;

    async fn invite_link(&self) -> Option<String> {
        None
    }
}

/// Builds a connected client from a token.
pub type Connector<C> = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Arc<C>, BotError>> + Send + Sync>;

/// Splits `text` into messages of at most `limit` characters.
///
/// Cuts after the last newline inside the window, else after the last space, else at the
/// limit. Every delimiter stays with the chunk before it, so stripping the `[n/total] `
/// prefixes and concatenating yields the original text.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut digits = 1;
    loop {
        // "[" n "/" total "] "
        let budget = limit.saturating_sub(2 * digits + 4).max(1);
        let chunks = chunks(text, budget);
        let total = chunks.len();
        if total.to_string().len() <= digits {
            return chunks
                .iter()
                .enumerate()
                .map(|(i, chunk)| format!("[{}/{total}] {chunk}", i + 1))
                .collect();
        }
        digits += 1;
    }
}

fn chunks(text: &str, budget: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let Some((end, _)) = rest.char_indices().nth(budget) else {
            chunks.push(rest);
            break;
        };
        let window = &rest[..end];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map_or(end, |i| i + 1);
        chunks.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    chunks
}

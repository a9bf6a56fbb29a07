//! Telegram front end — long-polls the Bot API for updates and sends
//! replies. A thin transport; all decisions live in the dispatcher.

pub mod dispatcher;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use secrecy::{ExposeSecret, SecretString};

use crate::error::BotError;

pub use dispatcher::Dispatcher;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// One inbound text message, already reduced to what the dispatcher needs.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub premium: bool,
    pub text: String,
}

pub type InboundStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// Outbound message sink, abstracted so the dispatcher can be exercised
/// without a live Bot API.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), BotError>;
}

/// Telegram Bot API transport.
pub struct TelegramBot {
    token: SecretString,
    http: reqwest::Client,
}

impl TelegramBot {
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            http: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.token.expose_secret()
        )
    }

    /// Verify the token against getMe.
    pub async fn health_check(&self) -> Result<(), BotError> {
        let resp = self
            .http
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| BotError::Api {
                method: "getMe".into(),
                reason: e.to_string(),
            })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BotError::Api {
                method: "getMe".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    /// Start long-polling. Messages arrive on the returned stream until the
    /// receiver is dropped.
    pub fn start(&self) -> InboundStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let token = self.token.clone();
        let client = self.http.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram front end listening for messages...");

            loop {
                let url = format!(
                    "https://api.telegram.org/bot{}/getUpdates",
                    token.expose_secret()
                );
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": 30,
                    "allowed_updates": ["message"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: serde_json::Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                if let Some(results) = data.get("result").and_then(serde_json::Value::as_array) {
                    for update in results {
                        if let Some(uid) =
                            update.get("update_id").and_then(serde_json::Value::as_i64)
                        {
                            offset = uid + 1;
                        }

                        let Some(message) = parse_message(update) else {
                            continue;
                        };

                        if tx.send(message).is_err() {
                            tracing::info!("Telegram listener channel closed");
                            return;
                        }
                    }
                }
            }
        });

        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        }))
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits messages that exceed Telegram's 4096 char limit.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), BotError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_chunk(chat_id, &chunk).await?;
        }
        Ok(())
    }

    async fn send_chunk(&self, chat_id: i64, text: &str) -> Result<(), BotError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .http
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| BotError::SendFailed {
                chat_id: chat_id.to_string(),
                reason: e.to_string(),
            })?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self
            .http
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(|e| BotError::SendFailed {
                chat_id: chat_id.to_string(),
                reason: e.to_string(),
            })?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(BotError::SendFailed {
                chat_id: chat_id.to_string(),
                reason: format!(
                    "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
                ),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Outbox for TelegramBot {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), BotError> {
        self.send_message(chat_id, text).await
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Reduce one getUpdates entry to an InboundMessage. Non-text updates and
/// updates missing sender identity are skipped.
fn parse_message(update: &serde_json::Value) -> Option<InboundMessage> {
    let message = update.get("message")?;
    let text = message.get("text")?.as_str()?.to_string();
    let from = message.get("from")?;
    let user_id = from.get("id")?.as_i64()?;
    let chat_id = message.get("chat")?.get("id")?.as_i64()?;

    let username = from
        .get("username")
        .and_then(|u| u.as_str())
        .map(String::from);
    let first_name = from
        .get("first_name")
        .and_then(|n| n.as_str())
        .unwrap_or("there")
        .to_string();
    let premium = from
        .get("is_premium")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    Some(InboundMessage {
        chat_id,
        user_id,
        username,
        first_name,
        premium,
        text,
    })
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let chunk = &remaining[..max_len];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(max_len);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { max_len } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

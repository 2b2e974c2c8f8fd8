use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram rejects messages over 4096 chars; cap below that with headroom.
pub const MAX_MESSAGE_LEN: usize = 4000;

/// Chat identifiers arrive as integers from real chats and as strings in
/// some client payloads. Normalized to a canonical string once at the
/// boundary so authorization stays a plain string comparison.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ChatId {
    Int(i64),
    Str(String),
}

impl ChatId {
    pub fn canonical(&self) -> String {
        match self {
            ChatId::Int(id) => id.to_string(),
            ChatId::Str(id) => id.clone(),
        }
    }
}

/// Incoming webhook update. Only the fields the bot reads are modeled;
/// everything else in the payload is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub text: Option<String>,
    pub chat: Option<Chat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: ChatId,
}

impl Update {
    /// Extract the message text and canonical chat id, if both are present.
    pub fn message_parts(&self) -> Option<(&str, String)> {
        let message = self.message.as_ref()?;
        let text = message.text.as_deref()?;
        let chat = message.chat.as_ref()?;
        Some((text, chat.id.canonical()))
    }
}

/// Outbound Telegram Bot API client. All notifications go to the one
/// chat fixed at construction.
pub struct Notifier {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
    api_base: String,
}

impl Notifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self::with_api_base(bot_token, chat_id, DEFAULT_API_BASE.to_string())
    }

    /// Same as `new` but against a custom API endpoint (for tests).
    pub fn with_api_base(bot_token: String, chat_id: String, api_base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token,
            chat_id,
            api_base,
        }
    }

    /// Send `text` to the configured chat, truncated to the Telegram
    /// length cap. Delivery is best-effort, at most once: failures are
    /// logged and swallowed, never retried.
    pub async fn notify(&self, text: &str) {
        let body = truncate_to(text, MAX_MESSAGE_LEN);
        if let Err(e) = self.send_message(body).await {
            error!("Failed to send Telegram message: {e:#}");
        }
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);

        let response = self
            .client
            .post(&url)
            .json(&json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await
            .context("Failed to reach Telegram API")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Telegram API error ({status}): {body}");
        }

        debug!("Sent message to chat {}", self.chat_id);
        Ok(())
    }

    /// Register `{public_url}/telegram` as this bot's webhook endpoint.
    pub async fn set_webhook(&self, public_url: &str) -> Result<Value> {
        let webhook_url = format!("{}/telegram", public_url.trim_end_matches('/'));
        let url = format!("{}/bot{}/setWebhook", self.api_base, self.bot_token);

        let response = self
            .client
            .post(&url)
            .json(&json!({ "url": webhook_url }))
            .send()
            .await
            .context("Failed to reach Telegram API")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Telegram API error ({status}): {body}");
        }

        let result = response
            .json()
            .await
            .context("Failed to parse setWebhook response")?;

        info!("Webhook registered: {}", webhook_url);
        Ok(result)
    }

    /// Fetch the current webhook registration from Telegram.
    pub async fn webhook_info(&self) -> Result<Value> {
        let url = format!("{}/bot{}/getWebhookInfo", self.api_base, self.bot_token);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach Telegram API")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Telegram API error ({status}): {body}");
        }

        response
            .json()
            .await
            .context("Failed to parse getWebhookInfo response")
    }
}

/// Cut `text` after at most `max_chars` characters, never splitting a
/// multi-byte character.
pub fn truncate_to(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

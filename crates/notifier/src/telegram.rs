//! Telegram Bot API transport: reminders with an inline "Transferred" button,
//! callback answers and `getUpdates` long polling.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use gift_common::error::AppError;
use gift_common::traits::Transport;
use gift_common::types::{AckControl, InboundEvent, UpdateBatch, UserId};

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Extra client-side slack on top of the server-side long-poll timeout.
const POLL_CLIENT_SLACK: Duration = Duration::from_secs(5);

const ALLOWED_UPDATES: [&str; 2] = ["message", "callback_query"];

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Base URL without the `/bot<token>` suffix.
    pub api_url: String,
    /// Timeout for every call except `getUpdates`.
    pub request_timeout: Duration,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub struct TelegramTransport {
    config: TelegramConfig,
    client: reqwest::Client,
}

impl TelegramTransport {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    /// POST a JSON body and unwrap the `{ok, result}` envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, AppError> {
        let response = self
            .client
            .post(self.api_url(method))
            .timeout(self.config.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::Transport(format!("{method} failed: {e}")))?;

        let status = response.status();
        let envelope: TelegramApiResponse<T> = response
            .json()
            .await
            .map_err(|e| AppError::Transport(format!("invalid {method} response ({status}): {e}")))?;

        envelope.into_result(method)
    }

    async fn fetch_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<TelegramUpdate>, AppError> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ALLOWED_UPDATES,
        });

        let sent = self
            .client
            .post(self.api_url("getUpdates"))
            .timeout(Duration::from_secs(timeout_secs) + POLL_CLIENT_SLACK)
            .json(&body)
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            // A long poll that outlives the client timeout just saw nothing.
            Err(e) if e.is_timeout() => {
                tracing::debug!(timeout_secs, "getUpdates timed out, treating as empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(AppError::Transport(format!("getUpdates failed: {e}"))),
        };

        if response.status() == StatusCode::CONFLICT {
            tracing::error!("getUpdates returned 409 Conflict, removing webhook");
            if let Err(e) = self.delete_webhook().await {
                tracing::error!(error = %e, "Removing webhook after conflict failed");
            }
            return Err(AppError::Transport(
                "getUpdates conflict: another consumer or a webhook is active".to_string(),
            ));
        }

        let envelope: TelegramApiResponse<Vec<TelegramUpdate>> = response
            .json()
            .await
            .map_err(|e| AppError::Transport(format!("invalid getUpdates response: {e}")))?;
        envelope.into_result("getUpdates")
    }

    async fn delete_webhook(&self) -> Result<(), AppError> {
        let _: bool = self
            .call("deleteWebhook", &serde_json::json!({}))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(
        &self,
        target: UserId,
        text: &str,
        control: Option<&AckControl>,
    ) -> Result<(), AppError> {
        let body = send_message_body(target, text, control);
        let _: serde_json::Value = self.call("sendMessage", &body).await?;
        Ok(())
    }

    async fn acknowledge_control(&self, control_id: &str) -> Result<(), AppError> {
        let body = serde_json::json!({ "callback_query_id": control_id });
        let _: bool = self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }

    async fn poll_updates(&self, cursor: i64, timeout_secs: u64) -> Result<UpdateBatch, AppError> {
        let updates = self.fetch_updates(cursor, timeout_secs).await?;
        if !updates.is_empty() {
            tracing::debug!(count = updates.len(), "Received updates");
        }
        Ok(into_batch(updates))
    }

    async fn remove_stale_subscription(&self) -> Result<(), AppError> {
        self.delete_webhook().await?;
        tracing::info!("Webhook removed (or none was set)");
        Ok(())
    }
}

/// `sendMessage` payload; the control becomes a one-button inline keyboard.
fn send_message_body(target: UserId, text: &str, control: Option<&AckControl>) -> serde_json::Value {
    let mut body = serde_json::json!({
        "chat_id": target.get(),
        "text": text,
    });
    if let Some(control) = control {
        body["reply_markup"] = serde_json::json!({
            "inline_keyboard": [[{
                "text": control.label,
                "callback_data": control.payload,
            }]]
        });
    }
    body
}

/// Convert raw updates; the cursor moves past every update, even ignored ones.
fn into_batch(updates: Vec<TelegramUpdate>) -> UpdateBatch {
    let next_cursor = updates.iter().map(|u| u.update_id + 1).max();
    let events = updates.iter().filter_map(TelegramUpdate::to_inbound).collect();
    UpdateBatch {
        events,
        next_cursor,
    }
}

// --- Telegram API Types ---

#[derive(Debug, Deserialize)]
pub struct TelegramApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
}

impl<T> TelegramApiResponse<T> {
    fn into_result(self, method: &str) -> Result<T, AppError> {
        if !self.ok {
            return Err(AppError::Transport(format!(
                "{method} rejected ({}): {}",
                self.error_code.unwrap_or_default(),
                self.description.unwrap_or_default()
            )));
        }
        self.result
            .ok_or_else(|| AppError::Transport(format!("{method} returned no result")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

impl TelegramUpdate {
    /// Map to an engine event. Anything other than `/start` or a button
    /// press is dropped.
    pub fn to_inbound(&self) -> Option<InboundEvent> {
        if let Some(query) = &self.callback_query {
            return Some(query.to_inbound());
        }

        let msg = self.message.as_ref()?;
        let from = msg.from.as_ref()?;
        if from.is_bot || !is_start_command(msg.text.as_deref()?) {
            return None;
        }

        Some(InboundEvent::Register {
            requester: UserId::new(from.id)?,
            handle: from.username.clone(),
        })
    }
}

impl TelegramCallbackQuery {
    fn to_inbound(&self) -> InboundEvent {
        let owner = self.data.as_deref().and_then(AckControl::parse_owner);
        match (UserId::new(self.from.id), owner) {
            (Some(requester), Some(owner)) => InboundEvent::Acknowledge {
                control_id: self.id.clone(),
                requester,
                owner,
            },
            _ => InboundEvent::UnknownControl {
                control_id: self.id.clone(),
            },
        }
    }
}

/// `/start`, `/start payload` and `/start@SomeBot` all count.
fn is_start_command(text: &str) -> bool {
    let command = text.split_whitespace().next().unwrap_or_default();
    command == "/start" || command.starts_with("/start@")
}

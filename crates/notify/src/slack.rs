//! Slack Web API notifier.
//!
//! Uses `chat.postMessage` for delivery, `conversations.open` for group
//! conversations and `users.lookupByEmail` for identity resolution. Messages
//! are sent as legacy attachments so fields, footer and the acknowledge
//! button render the way the chat surface expects.

use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::traits::{ChatUser, Delivery, Message, Notifier, NotifyError};

const ATTACHMENT_COLOR: &str = "#3AA3E3";

/// Sends messages through the Slack Web API.
#[derive(Debug)]
pub struct SlackNotifier {
    bot_token: String,
    api_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    /// Creates a new `SlackNotifier` from configuration values.
    ///
    /// If `bot_token` starts with `${`, the value between `${` and `}` is
    /// resolved as an environment variable name. Returns
    /// [`NotifyError::Config`] if the token is empty or the env var is missing.
    pub fn from_config(bot_token: String, api_url: String) -> Result<Self, NotifyError> {
        let resolved_token = if bot_token.starts_with("${") {
            let var_name = bot_token
                .strip_prefix("${")
                .and_then(|s| s.strip_suffix('}'))
                .ok_or_else(|| {
                    NotifyError::Config(format!("Malformed env var reference: {bot_token}"))
                })?;
            std::env::var(var_name).map_err(|_| {
                NotifyError::Config(format!("Environment variable '{var_name}' is not set"))
            })?
        } else {
            bot_token
        };

        if resolved_token.is_empty() {
            return Err(NotifyError::Config(
                "Slack bot token must not be empty".to_string(),
            ));
        }

        Ok(Self {
            bot_token: resolved_token,
            api_url: api_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.api_url, method)
    }

    /// Check the HTTP status and the `ok` flag of a Web API response.
    async fn read_response(response: reqwest::Response) -> Result<Value, NotifyError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(30);
            return Err(NotifyError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        let body: Value = response.json().await?;
        if body.get("ok") == Some(&Value::Bool(true)) {
            return Ok(body);
        }

        let error = body
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown Slack API error");
        Err(NotifyError::Api(format!("{error} (HTTP {status})")))
    }

    async fn post_message(&self, channel: &str, message: &Message) -> Result<Delivery, NotifyError> {
        let body = message_payload(channel, message);

        tracing::debug!(channel = %channel, "Sending Slack message");

        let response = self
            .client
            .post(self.url("chat.postMessage"))
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await?;
        let resp = Self::read_response(response).await?;

        let sent_at = resp
            .get("ts")
            .and_then(|v| v.as_str())
            .and_then(parse_slack_ts)
            .unwrap_or_else(Utc::now);
        let channel = resp
            .get("channel")
            .and_then(|v| v.as_str())
            .unwrap_or(channel)
            .to_string();

        tracing::info!(channel = %channel, "Slack message sent");
        Ok(Delivery { channel, sent_at })
    }
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    async fn send_direct(&self, user_id: &str, message: &Message) -> Result<Delivery, NotifyError> {
        self.post_message(user_id, message).await
    }

    async fn send_between(
        &self,
        user_ids: &[String],
        message: &Message,
    ) -> Result<Delivery, NotifyError> {
        if user_ids.is_empty() {
            return Err(NotifyError::Config("no users to open a conversation with".into()));
        }
        let response = self
            .client
            .post(self.url("conversations.open"))
            .bearer_auth(&self.bot_token)
            .json(&json!({ "users": user_ids.join(",") }))
            .send()
            .await?;
        let resp = Self::read_response(response).await?;
        let channel = resp
            .get("channel")
            .and_then(|c| c.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| NotifyError::Api("conversations.open returned no channel id".into()))?
            .to_string();

        self.post_message(&channel, message).await
    }

    async fn post_channel(&self, channel: &str, message: &Message) -> Result<Delivery, NotifyError> {
        self.post_message(channel, message).await
    }

    async fn lookup_user_by_email(&self, email: &str) -> Result<Option<ChatUser>, NotifyError> {
        let response = self
            .client
            .get(self.url("users.lookupByEmail"))
            .bearer_auth(&self.bot_token)
            .query(&[("email", email)])
            .send()
            .await?;

        let resp = match Self::read_response(response).await {
            Ok(v) => v,
            Err(NotifyError::Api(e)) if e.starts_with("users_not_found") => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(user) = resp.get("user") else {
            return Ok(None);
        };
        let id = user.get("id").and_then(|v| v.as_str()).unwrap_or_default();
        if id.is_empty() {
            return Ok(None);
        }
        Ok(Some(ChatUser {
            id: id.to_string(),
            real_name: user
                .get("real_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            tz_offset: user
                .get("tz_offset")
                .and_then(|v| v.as_i64())
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(0),
        }))
    }

    fn channel_name(&self) -> &str {
        "slack"
    }
}

/// Build the `chat.postMessage` body for a message.
pub fn message_payload(channel: &str, message: &Message) -> Value {
    let mut attachment = json!({
        "text": message.text,
        "color": ATTACHMENT_COLOR,
    });
    if let Some(title) = &message.title {
        attachment["title"] = json!(title);
    }
    if let Some(footer) = &message.footer {
        attachment["footer"] = json!(footer);
    }
    if let Some(callback) = &message.callback_id {
        attachment["callback_id"] = json!(callback);
    }
    if !message.fields.is_empty() {
        attachment["fields"] = message
            .fields
            .iter()
            .map(|f| json!({ "title": f.title, "value": f.value, "short": false }))
            .collect();
    }
    if message.ack_button {
        attachment["actions"] = json!([{
            "name": "accept",
            "text": "Acknowledge",
            "type": "button",
            "value": "ack",
        }]);
    }

    json!({
        "channel": channel,
        "text": message.title.as_deref().unwrap_or(&message.text),
        "attachments": [attachment],
    })
}

/// Slack message timestamps are epoch seconds with a microsecond fraction.
fn parse_slack_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{frac:0<6}").get(..6)?.parse().ok()?;
    Utc.timestamp_opt(secs, micros * 1_000).single()
}

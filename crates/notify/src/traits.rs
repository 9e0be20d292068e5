//! Notifier trait definition and shared message types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Errors that can occur during notification delivery.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Chat API error: {0}")]
    Api(String),

    #[error("Template rendering failed: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

/// A labelled value shown under the message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageField {
    pub title: String,
    pub value: String,
}

impl MessageField {
    pub fn new(title: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            value: value.into(),
        }
    }
}

/// A rendered message ready for delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Message {
    pub title: Option<String>,
    pub text: String,
    pub fields: Vec<MessageField>,
    pub footer: Option<String>,
    /// Callback identifier the chat surface routes interactions by.
    pub callback_id: Option<String>,
    /// Attach an "Acknowledge" button.
    pub ack_button: bool,
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_field(mut self, title: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(MessageField::new(title, value));
        self
    }

    pub fn with_footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    pub fn with_callback(mut self, callback_id: impl Into<String>) -> Self {
        self.callback_id = Some(callback_id.into());
        self
    }

    pub fn with_ack_button(mut self) -> Self {
        self.ack_button = true;
        self
    }
}

/// Where and when a message landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: String,
    pub sent_at: DateTime<Utc>,
}

/// A chat user resolved from an email address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUser {
    pub id: String,
    pub real_name: String,
    /// Seconds east of UTC.
    pub tz_offset: i32,
}

/// Trait for chat delivery implementations.
///
/// Delivery is best-effort: callers log failures and move on.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a direct message to one user.
    async fn send_direct(&self, user_id: &str, message: &Message) -> Result<Delivery, NotifyError>;

    /// Open a conversation between several users and post the message there.
    async fn send_between(
        &self,
        user_ids: &[String],
        message: &Message,
    ) -> Result<Delivery, NotifyError>;

    /// Post to a channel (operator alerts).
    async fn post_channel(&self, channel: &str, message: &Message) -> Result<Delivery, NotifyError>;

    /// Resolve a chat user by email. `Ok(None)` when no such user exists.
    async fn lookup_user_by_email(&self, email: &str) -> Result<Option<ChatUser>, NotifyError>;

    /// Human-readable name for this channel (e.g., "slack").
    fn channel_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_parts() {
        let m = Message::text("hello")
            .with_title("Device: SN001")
            .with_field("Required Version", "14.4.1")
            .with_footer("Model: MacBook Pro, OS: 13.2")
            .with_ack_button();
        assert_eq!(m.title.as_deref(), Some("Device: SN001"));
        assert_eq!(m.fields, vec![MessageField::new("Required Version", "14.4.1")]);
        assert!(m.ack_button);
        assert!(m.callback_id.is_none());
    }
}

//! Outbound chat delivery for compliance escalation.
//!
//! This crate provides:
//! - `Notifier` trait for pluggable chat backends
//! - `SlackNotifier`, a Slack Web API implementation
//! - Minijinja templates for first messages, reminders, manager and operator alerts

pub mod slack;
pub mod templating;
pub mod traits;

pub use slack::SlackNotifier;
pub use templating::{MessageContext, MessageTemplates, TemplateRenderer};
pub use traits::{ChatUser, Delivery, Message, MessageField, Notifier, NotifyError};

//! Minijinja template rendering for outbound message text.
//!
//! Each escalation policy ships a [`MessageTemplates`] set. Templates are
//! plain strings rendered against a [`MessageContext`]; a fresh
//! [`minijinja::Environment`] is created per render call.

use serde::Serialize;

use crate::traits::NotifyError;

/// Values available to every message template.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageContext {
    pub service_name: String,
    pub serial: String,
    pub user_name: String,
    pub user_id: String,
    pub manager_id: String,
    pub model: String,
    pub os_version: String,
    pub required_version: String,
    /// Human-readable deadline (policy specific).
    pub deadline: String,
    pub cutoff: String,
    /// When the first message went out, in the owner's timezone.
    pub first_message: String,
    /// Owners or devices listed in operator alerts.
    pub items: Vec<String>,
}

/// Renders message templates using minijinja.
#[derive(Debug, Default)]
pub struct TemplateRenderer {
    _private: (),
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self { _private: () }
    }

    fn build_env() -> minijinja::Environment<'static> {
        let mut env = minijinja::Environment::new();
        env.add_filter("possessive", possessive_filter);
        env.add_filter("mention", mention_filter);
        env
    }

    /// Render a template string with the given context.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Template`] if the template is invalid or
    /// rendering fails.
    pub fn render<S: Serialize>(&self, template_str: &str, ctx: &S) -> Result<String, NotifyError> {
        let env = Self::build_env();
        env.render_str(template_str, ctx)
            .map(|s| s.trim().to_string())
            .map_err(|e| NotifyError::Template(e.to_string()))
    }

    /// Check that a template parses without evaluating it.
    pub fn validate(&self, template_str: &str) -> Result<(), NotifyError> {
        let env = Self::build_env();
        env.template_from_str(template_str)
            .map_err(|e| NotifyError::Template(e.to_string()))?;
        Ok(())
    }
}

/// `{{ user_name | possessive }}` → `Frodo's`
fn possessive_filter(value: String) -> String {
    laggard_core::clock::possessive(&value)
}

/// `{{ user_id | mention }}` → `<@U123>`
fn mention_filter(value: String) -> String {
    format!("<@{value}>")
}

// ── Template sets ─────────────────────────────────────────────

pub const ACK_NUDGE: &str =
    "Hi there! Just a gentle reminder to acknowledge the previous message about updating.";

pub const REQUESTED_REMINDER: &str =
    ":wave: Here is your requested reminder to update your device!";

const CADENCE_FIRST: &str = r#"
Hello {{ user_name }}!

Your device {{ serial }} is running version {{ os_version }}, which no longer meets the
required version {{ required_version }}. Please install the update by {{ deadline }}.

Press *Acknowledge* below once you have read this. If the device is still out of date
a couple of days after that, {{ service_name }} will follow up with your manager.
"#;

const CADENCE_REMINDER: &str = r#"
Hello {{ user_name }}, this is a reminder that {{ serial }} still needs the update to
{{ required_version }} (currently {{ os_version }}). The deadline is {{ deadline }}.
"#;

const CADENCE_MANAGER: &str = r#"
Hello! This is {{ service_name }}. On {{ first_message }} {{ user_name }} was asked to update
their device ({{ model }}, serial {{ serial }}) to {{ required_version }}. It is still running
{{ os_version }}.

Could you help make sure {{ user_name | possessive }} device gets updated? Thanks {{ user_id | mention }}!
"#;

const INTERVAL_FIRST: &str = r#"
Hello {{ user_name }}!

Your device {{ serial }} needs to be updated to {{ required_version }} by {{ deadline }}
(it is running {{ os_version }}). Please press *Acknowledge* below, then install the update
as soon as you can. You will get regular reminders until the device is up to date.
"#;

const INTERVAL_REMINDER: &str = r#"
Your device {{ serial }} is still running {{ os_version }}. The update to {{ required_version }}
is due by {{ deadline }}. Please install it as soon as possible.
"#;

const MISSING_MANAGERS: &str = r#"
{{ service_name }} could not find a manager for these users:
{% for item in items %}• {{ item }}
{% endfor %}"#;

const DEADLINE_PASSED: &str = r#"
The update deadline ({{ deadline }}) has passed. {{ items | length }} device(s) are still below {{ required_version }}:
{% for item in items %}• {{ item }}
{% endfor %}"#;

/// The message texts a policy renders.
#[derive(Debug, Clone)]
pub struct MessageTemplates {
    pub first_message: String,
    pub reminder: String,
    pub manager: String,
    pub missing_managers: String,
    pub deadline_passed: String,
}

impl MessageTemplates {
    /// Texts for the fixed weekly (manager day) policy.
    pub fn cadence() -> Self {
        Self {
            first_message: CADENCE_FIRST.into(),
            reminder: CADENCE_REMINDER.into(),
            manager: CADENCE_MANAGER.into(),
            missing_managers: MISSING_MANAGERS.into(),
            deadline_passed: DEADLINE_PASSED.into(),
        }
    }

    /// Texts for the continuous reminder-interval policy.
    pub fn interval() -> Self {
        Self {
            first_message: INTERVAL_FIRST.into(),
            reminder: INTERVAL_REMINDER.into(),
            manager: CADENCE_MANAGER.into(),
            missing_managers: MISSING_MANAGERS.into(),
            deadline_passed: DEADLINE_PASSED.into(),
        }
    }

    /// Parse every template once so a broken set fails at startup.
    pub fn validate(&self, renderer: &TemplateRenderer) -> Result<(), NotifyError> {
        for t in [
            &self.first_message,
            &self.reminder,
            &self.manager,
            &self.missing_managers,
            &self.deadline_passed,
        ] {
            renderer.validate(t)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context() -> MessageContext {
        MessageContext {
            service_name: "laggard".into(),
            serial: "SN001".into(),
            user_name: "Frodo Baggins".into(),
            user_id: "U123".into(),
            manager_id: "U999".into(),
            model: "MacBook Pro".into(),
            os_version: "13.2".into(),
            required_version: "13.4.1".into(),
            deadline: "Wednesday, March 6".into(),
            cutoff: "17:00".into(),
            first_message: "Monday, March 4, 2024 9:30 AM".into(),
            items: vec![],
        }
    }

    #[test]
    fn render_basic_template() {
        let r = TemplateRenderer::new();
        let out = r.render("Device {{ serial }} on {{ os_version }}", &sample_context()).unwrap();
        assert_eq!(out, "Device SN001 on 13.2");
    }

    #[test]
    fn possessive_and_mention_filters() {
        let r = TemplateRenderer::new();
        let out = r
            .render("{{ user_name | possessive }} / {{ user_id | mention }}", &sample_context())
            .unwrap();
        assert_eq!(out, "Frodo Baggins' / <@U123>");
    }

    #[test]
    fn manager_template_names_user_and_date() {
        let r = TemplateRenderer::new();
        let out = r.render(&MessageTemplates::cadence().manager, &sample_context()).unwrap();
        assert!(out.contains("Frodo Baggins was asked"));
        assert!(out.contains("Monday, March 4, 2024 9:30 AM"));
        assert!(out.contains("<@U123>"));
    }

    #[test]
    fn list_templates_iterate_items() {
        let r = TemplateRenderer::new();
        let mut ctx = sample_context();
        ctx.items = vec!["sam@example.com".into(), "pippin@example.com".into()];
        let out = r.render(&MessageTemplates::cadence().deadline_passed, &ctx).unwrap();
        assert!(out.contains("2 device(s)"));
        assert!(out.contains("• pippin@example.com"));
    }

    #[test]
    fn shipped_templates_are_valid() {
        let r = TemplateRenderer::new();
        MessageTemplates::cadence().validate(&r).unwrap();
        MessageTemplates::interval().validate(&r).unwrap();
    }

    #[test]
    fn invalid_template_produces_error() {
        let r = TemplateRenderer::new();
        match r.render("{{ unclosed", &sample_context()) {
            Err(NotifyError::Template(msg)) => assert!(!msg.is_empty()),
            other => panic!("Expected Template error, got: {:?}", other),
        }
        assert!(r.validate("{{ unclosed").is_err());
    }
}

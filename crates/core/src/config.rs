use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::clock::{self, ActiveWindow};
use crate::error::CoreError;
use crate::version::OsVersion;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Re-read .env on reload; values in the file win over the process env.
pub fn reload_dotenv() {
    dotenvy::dotenv_override().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse a profiled env var. An unparseable value is recorded in `rejected`
/// so validation can refuse it.
fn profiled_env_parse<T: FromStr>(
    profile: &str,
    key: &str,
    default: T,
    rejected: &mut Vec<String>,
) -> T {
    match profiled_env_opt(profile, key) {
        Some(v) => match v.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                rejected.push(format!("{key}={v:?}"));
                default
            }
        },
        None => default,
    }
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    profiled_env_opt(profile, key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn profiled_env_list(profile: &str, key: &str, default: &[&str]) -> Vec<String> {
    match profiled_env_opt(profile, key) {
        Some(v) => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn profiled_env_duration(profile: &str, key: &str, default: Duration) -> Duration {
    profiled_env_opt(profile, key)
        .and_then(|v| clock::parse_duration(&v))
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub postgres: PostgresConfig,
    pub slack: SlackConfig,
    pub inventory: InventoryConfig,
    pub identity: IdentityConfig,
    pub engine: EngineSettings,
    pub schedule: ScheduleConfig,
    pub control: ControlConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `LAGGARD_PROFILE`. When set (e.g. `STAGING`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("LAGGARD_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p),
            slack: SlackConfig::from_env_profiled(p),
            inventory: InventoryConfig::from_env_profiled(p),
            identity: IdentityConfig::from_env_profiled(p),
            engine: EngineSettings::from_env_profiled(p),
            schedule: ScheduleConfig::from_env_profiled(p),
            control: ControlConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Check everything the engine cannot start without.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.engine.validate()?;
        if self.slack.bot_token.is_empty() {
            return Err(CoreError::Config("SLACK_BOT_TOKEN is required".into()));
        }
        if !self.inventory.is_configured() {
            return Err(CoreError::Config(
                "KANDJI_URL and KANDJI_TOKEN are required".into(),
            ));
        }
        if self.engine.policy == PolicyKind::Cadence && !self.identity.is_configured() {
            return Err(CoreError::Config(
                "OKTA_URL and OKTA_TOKEN are required for the cadence policy".into(),
            ));
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:     {}:{}", self.server.host, self.server.port);
        tracing::info!("  postgres:   host={}, db={}", self.postgres.host, self.postgres.database);
        tracing::info!("  slack:      alert_channel={}", self.slack.alert_channel.as_deref().unwrap_or("(none)"));
        tracing::info!("  inventory:  url={}", self.inventory.url);
        tracing::info!("  identity:   url={}", self.identity.url);
        tracing::info!(
            "  engine:     policy={}, required={}, deadline={} {}, testing={}",
            self.engine.policy,
            self.engine.required_version,
            self.engine.deadline,
            self.engine.cutoff_time,
            self.engine.testing,
        );
        tracing::info!(
            "  schedule:   reconcile={}s, check={}s, poll={}s, deadline={}s",
            self.schedule.reconcile_interval.as_secs(),
            self.schedule.check_interval.as_secs(),
            self.schedule.poll_interval.as_secs(),
            self.schedule.deadline_check_interval.as_secs(),
        );
    }

    /// Return a redacted view safe for API responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "server": { "host": self.server.host, "port": self.server.port },
            "postgres": {
                "host": self.postgres.host,
                "port": self.postgres.port,
                "database": self.postgres.database,
                "configured": self.postgres.is_configured(),
            },
            "slack": {
                "alert_channel": self.slack.alert_channel,
                "configured": !self.slack.bot_token.is_empty(),
            },
            "inventory": { "url": self.inventory.url, "configured": self.inventory.is_configured() },
            "identity": { "url": self.identity.url, "configured": self.identity.is_configured() },
            "engine": {
                "policy": self.engine.policy.to_string(),
                "required_version": self.engine.required_version,
                "deadline": self.engine.deadline,
                "cutoff_time": self.engine.cutoff_time,
                "testing": self.engine.testing,
                "testing_users": self.engine.testing_users.len(),
            },
            "control": { "enabled": self.control.token.is_some() },
        })
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_u16(p, "PORT", 8080),
            cors_origin: profiled_env_or(p, "CORS_ORIGIN", "*"),
        }
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Full connection URL; takes precedence over the individual parts.
    #[serde(skip_serializing)]
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database: String,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_opt(p, "PG_URL"),
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            user: profiled_env_or(p, "PG_USER", ""),
            password: profiled_env_or(p, "PG_PASSWORD", ""),
            database: profiled_env_or(p, "PG_DATABASE", "laggard"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some() || !self.user.is_empty()
    }

    pub fn database_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.database
            ),
        }
    }
}

// ── Slack ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(skip_serializing)]
    pub bot_token: String,
    pub api_url: String,
    /// Channel for operator alerts (missing managers, deadline summary).
    pub alert_channel: Option<String>,
}

impl SlackConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            bot_token: profiled_env_or(p, "SLACK_BOT_TOKEN", ""),
            api_url: profiled_env_or(p, "SLACK_API_URL", "https://slack.com/api"),
            alert_channel: profiled_env_opt(p, "SLACK_ALERT_CHANNEL"),
        }
    }
}

// ── Inventory (MDM) ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    pub url: String,
    #[serde(skip_serializing)]
    pub token: String,
}

impl InventoryConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_or(p, "KANDJI_URL", ""),
            token: profiled_env_or(p, "KANDJI_TOKEN", ""),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.url.is_empty() && !self.token.is_empty()
    }
}

// ── Identity (IdP) ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub url: String,
    #[serde(skip_serializing)]
    pub token: String,
}

impl IdentityConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_or(p, "OKTA_URL", ""),
            token: profiled_env_or(p, "OKTA_TOKEN", ""),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.url.is_empty() && !self.token.is_empty()
    }
}

// ── Escalation engine ─────────────────────────────────────────

/// Which escalation policy drives the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Fixed weekly manager day.
    Cadence,
    /// Continuous per-device reminder interval.
    Interval,
}

impl FromStr for PolicyKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cadence" | "manager" => Ok(PolicyKind::Cadence),
            "interval" | "timebound" => Ok(PolicyKind::Interval),
            other => Err(CoreError::Config(format!(
                "unknown policy {other:?} (expected cadence or interval)"
            ))),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Cadence => f.write_str("cadence"),
            PolicyKind::Interval => f.write_str("interval"),
        }
    }
}

/// Runtime settings read by the policies on every tick; swapped on reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub policy: PolicyKind,
    /// Raw policy value as configured, kept so validation can report it.
    #[serde(skip)]
    pub policy_raw: Option<String>,
    /// `KEY="value"` entries that did not parse; reported by `validate`.
    #[serde(skip)]
    pub rejected: Vec<String>,
    pub service_name: String,
    pub required_version: String,
    /// `MM-DD-YYYY`
    pub deadline: String,
    /// `HH:MM`
    pub cutoff_time: String,
    pub escalation_weekday: Weekday,
    pub escalation_threshold_hours: u32,
    pub resend_after_hours: u32,
    /// Minutes.
    pub default_reminder_interval: u32,
    pub supported_platforms: Vec<String>,
    pub testing: bool,
    pub testing_users: Vec<String>,
    pub testing_start_time: String,
    pub testing_end_time: String,
    pub send_manager_missing: bool,
    pub alert_channel: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Cadence,
            policy_raw: None,
            rejected: Vec::new(),
            service_name: "laggard".into(),
            required_version: String::new(),
            deadline: String::new(),
            cutoff_time: "17:00".into(),
            escalation_weekday: Weekday::Wed,
            escalation_threshold_hours: 48,
            resend_after_hours: 24,
            default_reminder_interval: 60,
            supported_platforms: vec!["mac".into(), "macos".into()],
            testing: false,
            testing_users: Vec::new(),
            testing_start_time: "09:00".into(),
            testing_end_time: "10:00".into(),
            send_manager_missing: false,
            alert_channel: None,
        }
    }
}

impl EngineSettings {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        let policy_raw = profiled_env_opt(p, "LAGGARD_POLICY");
        let policy = policy_raw
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(d.policy);
        let mut rejected = Vec::new();
        let escalation_weekday =
            profiled_env_parse(p, "ESCALATION_WEEKDAY", d.escalation_weekday, &mut rejected);
        let escalation_threshold_hours = profiled_env_parse(
            p,
            "ESCALATION_THRESHOLD_HOURS",
            d.escalation_threshold_hours,
            &mut rejected,
        );
        let resend_after_hours =
            profiled_env_parse(p, "RESEND_AFTER_HOURS", d.resend_after_hours, &mut rejected);
        let default_reminder_interval = profiled_env_parse(
            p,
            "DEFAULT_REMINDER_INTERVAL",
            d.default_reminder_interval,
            &mut rejected,
        );

        Self {
            policy,
            policy_raw,
            service_name: profiled_env_or(p, "SERVICE_NAME", &d.service_name),
            required_version: profiled_env_or(p, "REQUIRED_VERSION", ""),
            deadline: profiled_env_or(p, "DEADLINE", ""),
            cutoff_time: profiled_env_or(p, "CUTOFF_TIME", &d.cutoff_time),
            rejected,
            escalation_weekday,
            escalation_threshold_hours,
            resend_after_hours,
            default_reminder_interval,
            supported_platforms: profiled_env_list(p, "SUPPORTED_PLATFORMS", &["mac", "macos"]),
            testing: profiled_env_bool(p, "TESTING", false),
            testing_users: profiled_env_list(p, "TESTING_USERS", &[]),
            testing_start_time: profiled_env_or(p, "TESTING_START_TIME", &d.testing_start_time),
            testing_end_time: profiled_env_or(p, "TESTING_END_TIME", &d.testing_end_time),
            send_manager_missing: profiled_env_bool(p, "SEND_MANAGER_MISSING", false),
            alert_channel: profiled_env_opt(p, "SLACK_ALERT_CHANNEL"),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if let Some(raw) = &self.policy_raw {
            raw.parse::<PolicyKind>()?;
        }
        if !self.rejected.is_empty() {
            return Err(CoreError::Config(format!(
                "unparseable settings: {}",
                self.rejected.join(", ")
            )));
        }
        if self.required_version.is_empty() {
            return Err(CoreError::Config("REQUIRED_VERSION is required".into()));
        }
        self.required_version.parse::<OsVersion>()?;
        if self.deadline.is_empty() {
            return Err(CoreError::Config("DEADLINE is required".into()));
        }
        self.deadline_at()?;
        if self.default_reminder_interval == 0 {
            return Err(CoreError::Config(
                "DEFAULT_REMINDER_INTERVAL must be at least 1 minute".into(),
            ));
        }
        if self.testing {
            self.testing_window()?;
        }
        Ok(())
    }

    /// Deadline and cutoff as a UTC instant.
    pub fn deadline_at(&self) -> Result<chrono::DateTime<chrono::Utc>, CoreError> {
        clock::parse_deadline(&self.deadline, &self.cutoff_time)
    }

    pub fn testing_window(&self) -> Result<ActiveWindow, CoreError> {
        ActiveWindow::parse(&self.testing_start_time, &self.testing_end_time)
    }

    pub fn is_test_user(&self, user_id: &str) -> bool {
        self.testing_users.iter().any(|u| u == user_id)
    }

    pub fn default_reminder(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.default_reminder_interval))
    }
}

// ── Loop schedule ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub reconcile_interval: Duration,
    pub check_interval: Duration,
    pub poll_interval: Duration,
    pub deadline_check_interval: Duration,
}

impl ScheduleConfig {
    fn from_env_profiled(p: &str) -> Self {
        let fifteen = Duration::from_secs(15 * 60);
        Self {
            reconcile_interval: profiled_env_duration(p, "RECONCILE_INTERVAL", fifteen),
            check_interval: profiled_env_duration(p, "CHECK_INTERVAL", fifteen),
            poll_interval: profiled_env_duration(p, "POLL_INTERVAL", fifteen),
            deadline_check_interval: profiled_env_duration(
                p,
                "DEADLINE_CHECK_INTERVAL",
                Duration::from_secs(5 * 60),
            ),
        }
    }
}

// ── Control surface ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Bearer token for `/control/*`; the routes are disabled when unset.
    #[serde(skip_serializing)]
    pub token: Option<String>,
}

impl ControlConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            token: profiled_env_opt(p, "LAGGARD_CONTROL_TOKEN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_engine() -> EngineSettings {
        EngineSettings {
            required_version: "14.4.1".into(),
            deadline: "06-30-2024".into(),
            ..Default::default()
        }
    }

    #[test]
    fn policy_aliases() {
        assert_eq!("manager".parse::<PolicyKind>().unwrap(), PolicyKind::Cadence);
        assert_eq!("Timebound".parse::<PolicyKind>().unwrap(), PolicyKind::Interval);
        assert_eq!("interval".parse::<PolicyKind>().unwrap(), PolicyKind::Interval);
        assert!("weekly".parse::<PolicyKind>().is_err());
    }

    #[test]
    fn engine_defaults_validate_once_required_fields_set() {
        assert!(EngineSettings::default().validate().is_err());
        assert!(valid_engine().validate().is_ok());
    }

    #[test]
    fn bad_version_is_config_error() {
        let mut e = valid_engine();
        e.required_version = "fourteen".into();
        assert!(matches!(e.validate(), Err(CoreError::Version(_))));
    }

    #[test]
    fn bad_deadline_rejected() {
        let mut e = valid_engine();
        e.deadline = "2024-06-30".into();
        assert!(matches!(e.validate(), Err(CoreError::DateTime { .. })));
    }

    #[test]
    fn bad_policy_value_rejected() {
        let mut e = valid_engine();
        e.policy_raw = Some("weekly".into());
        assert!(matches!(e.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn unparseable_engine_values_rejected() {
        let p = "LAGGARD_BAD_ENGINE_TEST";
        env::set_var(format!("{p}_REQUIRED_VERSION"), "14.4.1");
        env::set_var(format!("{p}_DEADLINE"), "06-30-2024");
        env::set_var(format!("{p}_ESCALATION_WEEKDAY"), "Wensday");
        env::set_var(format!("{p}_RESEND_AFTER_HOURS"), "a day");

        let e = EngineSettings::from_env_profiled(p);
        assert_eq!(e.escalation_weekday, Weekday::Wed);
        match e.validate() {
            Err(CoreError::Config(msg)) => {
                assert!(msg.contains("ESCALATION_WEEKDAY"));
                assert!(msg.contains("RESEND_AFTER_HOURS"));
                assert!(!msg.contains("DEFAULT_REMINDER_INTERVAL"));
            }
            other => panic!("expected config error, got {other:?}"),
        }

        env::set_var(format!("{p}_ESCALATION_WEEKDAY"), "Friday");
        env::set_var(format!("{p}_RESEND_AFTER_HOURS"), "12");
        let e = EngineSettings::from_env_profiled(p);
        assert_eq!(e.escalation_weekday, Weekday::Fri);
        assert_eq!(e.resend_after_hours, 12);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn testing_window_checked_only_in_test_mode() {
        let mut e = valid_engine();
        e.testing_start_time = "nine".into();
        assert!(e.validate().is_ok());
        e.testing = true;
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_user_lookup() {
        let mut e = valid_engine();
        e.testing_users = vec!["U1".into(), "U2".into()];
        assert!(e.is_test_user("U2"));
        assert!(!e.is_test_user("U3"));
    }

    #[test]
    fn database_url_prefers_full_url() {
        let mut pg = PostgresConfig {
            url: None,
            host: "db".into(),
            port: 5433,
            user: "app".into(),
            password: "pw".into(),
            database: "laggard".into(),
        };
        assert_eq!(pg.database_url(), "postgres://app:pw@db:5433/laggard");
        pg.url = Some("postgres://other/db".into());
        assert_eq!(pg.database_url(), "postgres://other/db");
    }

    #[test]
    fn redacted_summary_has_no_secrets() {
        let mut cfg = Config::for_profile("LAGGARD_REDACTION_TEST");
        cfg.slack.bot_token = "xoxb-secret".into();
        cfg.control.token = Some("control-secret".into());
        let text = cfg.redacted_summary().to_string();
        assert!(!text.contains("xoxb-secret"));
        assert!(!text.contains("control-secret"));
        assert!(text.contains("\"enabled\":true"));
    }
}

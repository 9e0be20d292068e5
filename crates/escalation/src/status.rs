//! Service and per-routine status, read by the HTTP surface.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutineStatus {
    pub name: String,
    pub start: Option<DateTime<Utc>>,
    pub finish: Option<DateTime<Utc>>,
    pub message: String,
    pub finish_no_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub db_connected: bool,
    pub running: bool,
    pub message: String,
    /// 0 when healthy, otherwise the last failure code.
    pub code: u16,
    pub routines: BTreeMap<String, RoutineStatus>,
}

#[derive(Debug, Default)]
pub struct StatusHandler {
    inner: RwLock<ServiceStatus>,
}

impl StatusHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> ServiceStatus {
        self.inner.read().await.clone()
    }

    pub async fn routine_started(&self, name: &str, now: DateTime<Utc>) {
        let entry = RoutineStatus {
            name: name.to_string(),
            start: Some(now),
            finish: None,
            message: "running".into(),
            finish_no_error: false,
        };
        self.inner.write().await.routines.insert(name.to_string(), entry);
    }

    /// Close out a routine run with its summary, or the failure text.
    pub async fn routine_finished(
        &self,
        name: &str,
        now: DateTime<Utc>,
        outcome: Result<String, String>,
    ) {
        let mut status = self.inner.write().await;
        let start = status.routines.get(name).and_then(|r| r.start);
        let finish_no_error = outcome.is_ok();
        let message = match outcome {
            Ok(summary) if summary.is_empty() => "ok".to_string(),
            Ok(summary) => summary,
            Err(e) => e,
        };
        let entry = RoutineStatus {
            name: name.to_string(),
            start,
            finish: Some(now),
            finish_no_error,
            message,
        };
        status.routines.insert(name.to_string(), entry);
    }

    pub async fn set_running(&self, running: bool) {
        self.inner.write().await.running = running;
    }

    pub async fn set_db_connected(&self, connected: bool) {
        self.inner.write().await.db_connected = connected;
    }

    pub async fn set_message(&self, message: impl Into<String>, code: u16) {
        let mut status = self.inner.write().await;
        status.message = message.into();
        status.code = code;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn routine_lifecycle_is_recorded() {
        let status = StatusHandler::new();
        let t0 = Utc::now();
        status.routine_started("reconcile", t0).await;

        let snap = status.snapshot().await;
        let r = &snap.routines["reconcile"];
        assert_eq!(r.start, Some(t0));
        assert!(r.finish.is_none());
        assert!(!r.finish_no_error);

        status
            .routine_finished(
                "reconcile",
                t0 + Duration::seconds(2),
                Ok("added 1, removed 0".into()),
            )
            .await;
        let snap = status.snapshot().await;
        let r = &snap.routines["reconcile"];
        assert_eq!(r.start, Some(t0));
        assert_eq!(r.finish, Some(t0 + Duration::seconds(2)));
        assert!(r.finish_no_error);
        assert_eq!(r.message, "added 1, removed 0");
    }

    #[tokio::test]
    async fn empty_summary_reads_ok() {
        let status = StatusHandler::new();
        status.routine_finished("poll", Utc::now(), Ok(String::new())).await;
        assert_eq!(status.snapshot().await.routines["poll"].message, "ok");
    }

    #[tokio::test]
    async fn failed_routine_keeps_error_text() {
        let status = StatusHandler::new();
        status
            .routine_finished("check", Utc::now(), Err("store unavailable".into()))
            .await;
        let snap = status.snapshot().await;
        assert!(!snap.routines["check"].finish_no_error);
        assert_eq!(snap.routines["check"].message, "store unavailable");
        assert!(snap.routines["check"].start.is_none());
    }

    #[tokio::test]
    async fn service_flags_serialize() {
        let status = StatusHandler::new();
        status.set_running(true).await;
        status.set_db_connected(true).await;
        status.set_message("degraded", 503).await;

        let json = serde_json::to_value(status.snapshot().await).unwrap();
        assert_eq!(json["running"], true);
        assert_eq!(json["db_connected"], true);
        assert_eq!(json["code"], 503);
        assert_eq!(json["message"], "degraded");
    }
}

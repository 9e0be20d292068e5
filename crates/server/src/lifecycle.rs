//! Start/stop/reload control over the engine loops.
//!
//! A single controller task owns the loop [`CancellationToken`] and consumes
//! [`Signal`]s from an mpsc channel. Each loop ticks on its own interval and
//! records its runs in the [`StatusHandler`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use laggard_core::config::{EngineSettings, ScheduleConfig};
use laggard_core::Config;
use laggard_escalation::{
    poll_requested, DeadlineCheck, DeadlineOutcome, EscalationError, EscalationPolicy,
    FleetReconciler, Messenger, StatusHandler,
};

pub const RECONCILE: &str = "reconcile";
pub const CHECK: &str = "check";
pub const POLL: &str = "poll";
pub const DEADLINE: &str = "deadline";

const SIGNAL_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Start,
    Stop,
    Reload,
}

impl std::str::FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "reload" => Ok(Self::Reload),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// Cloneable sender side of the controller.
#[derive(Clone)]
pub struct LifecycleHandle {
    tx: mpsc::Sender<Signal>,
}

impl LifecycleHandle {
    pub fn new(tx: mpsc::Sender<Signal>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, signal: Signal) -> anyhow::Result<()> {
        self.tx
            .send(signal)
            .await
            .map_err(|_| anyhow::anyhow!("lifecycle controller has exited"))
    }
}

/// Re-reads configuration for a reload.
pub type ConfigLoader = Box<dyn Fn() -> anyhow::Result<Config> + Send + Sync>;

/// Everything the loops run against.
pub struct Engine {
    pub policy: Arc<dyn EscalationPolicy>,
    pub reconciler: Arc<FleetReconciler>,
    pub messenger: Arc<Messenger>,
    pub settings: Arc<RwLock<EngineSettings>>,
    pub deadline: DeadlineCheck,
    pub status: Arc<StatusHandler>,
    pub schedule: ScheduleConfig,
}

pub struct Lifecycle {
    engine: Arc<Engine>,
    rx: mpsc::Receiver<Signal>,
    loader: ConfigLoader,
    running: Option<CancellationToken>,
}

impl Lifecycle {
    pub fn new(engine: Arc<Engine>, loader: ConfigLoader) -> (Self, LifecycleHandle) {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let lifecycle = Self {
            engine,
            rx,
            loader,
            running: None,
        };
        (lifecycle, LifecycleHandle::new(tx))
    }

    /// Consume signals until `shutdown` fires or every handle is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = self.rx.recv() => match signal {
                    Some(Signal::Start) => self.start().await,
                    Some(Signal::Stop) => self.stop().await,
                    Some(Signal::Reload) => self.reload().await,
                    None => break,
                },
            }
        }
        self.stop().await;
        info!("lifecycle controller exited");
    }

    fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    async fn start(&mut self) {
        if self.is_running() {
            info!("start ignored: loops already running");
            return;
        }
        self.engine.status.set_running(true).await;
        self.engine.status.set_message("running", 0).await;

        let token = CancellationToken::new();
        let engine = &self.engine;
        let schedule = &engine.schedule;

        tokio::spawn(run_every(RECONCILE, schedule.reconcile_interval, token.clone(), engine.status.clone(), {
            let engine = engine.clone();
            move |now| {
                let engine = engine.clone();
                async move {
                    let report = engine.reconciler.reconcile(engine.policy.as_ref(), now).await?;
                    Ok(report.summary())
                }
            }
        }));

        tokio::spawn(run_every(CHECK, schedule.check_interval, token.clone(), engine.status.clone(), {
            let engine = engine.clone();
            move |now| {
                let engine = engine.clone();
                async move { Ok(engine.policy.check(now).await?.summary()) }
            }
        }));

        tokio::spawn(run_every(POLL, schedule.poll_interval, token.clone(), engine.status.clone(), {
            let engine = engine.clone();
            move |now| {
                let engine = engine.clone();
                async move {
                    let window = chrono::Duration::from_std(engine.schedule.poll_interval)
                        .unwrap_or_else(|_| chrono::Duration::minutes(1));
                    let requested = poll_requested(&engine.messenger, now, window).await?;
                    let report = engine.policy.poll(now).await?;
                    Ok(format!("requested {requested}, {}", report.summary()))
                }
            }
        }));

        tokio::spawn(run_every(DEADLINE, schedule.deadline_check_interval, token.clone(), engine.status.clone(), {
            let engine = engine.clone();
            let token = token.clone();
            move |now| {
                let engine = engine.clone();
                let token = token.clone();
                async move {
                    let settings = engine.settings.read().await.clone();
                    let outcome = engine.deadline.check(&settings, engine.policy.as_ref(), now).await?;
                    if outcome != DeadlineOutcome::Pending {
                        info!("update deadline has passed, stopping loops");
                        token.cancel();
                        engine.status.set_running(false).await;
                        engine.status.set_message("update deadline passed", 0).await;
                    }
                    Ok(format!("{outcome:?}").to_lowercase())
                }
            }
        }));

        self.running = Some(token);
        info!(policy = self.engine.policy.name(), "loops started");
    }

    /// Cancel the loops. Sends already spawned run to completion.
    async fn stop(&mut self) {
        if let Some(token) = self.running.take() {
            token.cancel();
            info!(in_flight = self.engine.messenger.in_flight(), "loops stopped");
        }
        self.engine.status.set_running(false).await;
    }

    async fn reload(&mut self) {
        let config = match (self.loader)() {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "reload failed, keeping current settings");
                return;
            }
        };
        if let Err(e) = config.validate() {
            warn!(error = %e, "reloaded configuration is invalid, keeping current settings");
            self.engine
                .status
                .set_message(format!("reload rejected: {e}"), 400)
                .await;
            return;
        }

        let mut next = config.engine;
        let mut settings = self.engine.settings.write().await;
        if next.policy != settings.policy {
            warn!(current = %settings.policy, requested = %next.policy, "policy changes need a restart");
            next.policy = settings.policy;
        }
        if next.deadline != settings.deadline || next.cutoff_time != settings.cutoff_time {
            self.engine.deadline.reset();
        }
        *settings = next;
        drop(settings);

        self.engine.status.set_message("configuration reloaded", 0).await;
        info!("configuration reloaded");
    }
}

/// Run `tick` every `period` until `token` is cancelled.
async fn run_every<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    status: Arc<StatusHandler>,
    mut tick: F,
) where
    F: FnMut(DateTime<Utc>) -> Fut + Send,
    Fut: Future<Output = Result<String, EscalationError>> + Send,
{
    let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(routine = name, period_secs = period.as_secs(), "routine started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let now = Utc::now();
                status.routine_started(name, now).await;
                match tick(now).await {
                    Ok(summary) => {
                        debug!(routine = name, summary = %summary, "routine finished");
                        status.routine_finished(name, Utc::now(), Ok(summary)).await;
                    }
                    Err(e) => {
                        warn!(routine = name, error = %e, "routine failed");
                        status.routine_finished(name, Utc::now(), Err(e.to_string())).await;
                    }
                }
            }
        }
    }
    debug!(routine = name, "routine stopped");
}

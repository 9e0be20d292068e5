mod api;
mod cli;
mod db;
mod lifecycle;
mod router;
mod state;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use laggard_connector::{IdentityProvider, KandjiClient, OktaClient};
use laggard_core::config::{load_dotenv, reload_dotenv};
use laggard_core::Config;
use laggard_escalation::{
    build_policy, templates_for, DeadlineCheck, FleetReconciler, Messenger, StatusHandler,
};
use laggard_notify::SlackNotifier;

use crate::cli::Cli;
use crate::lifecycle::{Engine, Lifecycle, LifecycleHandle, Signal};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    load_dotenv();
    let config = Config::from_env();
    config.validate()?;
    config.log_summary();

    let store = db::init_store(&config.postgres, cli.memory_store).await?;
    let notifier = Arc::new(SlackNotifier::from_config(
        config.slack.bot_token.clone(),
        config.slack.api_url.clone(),
    )?);
    let inventory = Arc::new(KandjiClient::from_config(&config.inventory)?);
    let identity: Option<Arc<dyn IdentityProvider>> = if config.identity.is_configured() {
        Some(Arc::new(OktaClient::from_config(&config.identity)?))
    } else {
        None
    };

    let kind = config.engine.policy;
    let settings = Arc::new(RwLock::new(config.engine.clone()));
    let messenger = Arc::new(Messenger::new(
        store.clone(),
        notifier.clone(),
        settings.clone(),
        templates_for(kind),
    ));
    messenger.templates().validate(messenger.renderer())?;
    if let Err(e) = messenger.release_stale_claims().await {
        warn!(error = %e, "could not release stale send claims");
    }

    let policy = build_policy(kind, messenger.clone(), identity)?;
    let reconciler = Arc::new(FleetReconciler::new(
        inventory,
        store.clone(),
        notifier,
        settings.clone(),
    ));

    let status = Arc::new(StatusHandler::new());
    status.set_db_connected(store.ping().await.is_ok()).await;

    let engine = Arc::new(Engine {
        policy,
        reconciler,
        messenger: messenger.clone(),
        settings,
        deadline: DeadlineCheck::new(),
        status: status.clone(),
        schedule: config.schedule.clone(),
    });

    let (lifecycle, handle) = Lifecycle::new(
        engine,
        Box::new(|| -> anyhow::Result<Config> {
            reload_dotenv();
            Ok(Config::from_env())
        }),
    );
    let shutdown = CancellationToken::new();
    let controller = tokio::spawn(lifecycle.run(shutdown.clone()));

    if cli.paused {
        info!("started paused; POST /control/start to begin");
    } else {
        handle.send(Signal::Start).await?;
    }
    spawn_reload_listener(handle.clone());

    let state = Arc::new(AppState {
        status,
        store,
        lifecycle: handle,
        control_token: config.control.token.clone(),
        config_summary: config.redacted_summary(),
    });
    let app = router::build_router(state, &config.server.cors_origin);

    let addr = cli.bind_addr(&config.server);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, policy = %kind, "laggard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(os_signal())
        .await?;

    info!("shutting down");
    shutdown.cancel();
    if let Err(e) = controller.await {
        warn!(error = %e, "lifecycle controller panicked");
    }

    let timeout = Duration::from_secs(cli.shutdown_timeout);
    if tokio::time::timeout(timeout, messenger.drain()).await.is_err() {
        warn!(
            in_flight = messenger.in_flight(),
            "in-flight sends did not finish; their claims are released on next start"
        );
    }
    info!("laggard exited cleanly");
    Ok(())
}

/// SIGHUP triggers a configuration reload.
fn spawn_reload_listener(handle: LifecycleHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to register SIGHUP, reload only via /control/reload");
                return;
            }
        };
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading configuration");
                if handle.send(Signal::Reload).await.is_err() {
                    break;
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        let _ = handle;
    }
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C.
async fn os_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to register signal handlers, falling back to ctrl_c");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl_c");
        std::future::pending::<()>().await;
    }
}

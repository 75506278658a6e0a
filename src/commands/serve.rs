//! The `serve` command: wire up the store, registry, hub, and dispatcher,
//! then run the HTTP server until shutdown.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use parlor::agent::{AgentCatalog, ProcessAgent};
use parlor::background::BackgroundTasks;
use parlor::config::Config;
use parlor::dispatch::{Dispatcher, DispatchTimeouts};
use parlor::hub::SyncHub;
use parlor::server::{self, AppState};
use parlor::session::SessionRegistry;
use parlor::store::Store;

pub async fn run(config_path: &str, host: Option<IpAddr>, port: Option<u16>) -> Result<()> {
    let mut config = Config::load(config_path)
        .await
        .with_context(|| format!("loading {config_path}"))?;
    config.apply_env()?;
    if let Some(host) = host {
        config.server.host = host.to_string();
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let store = Store::open(&config.store.path)
        .with_context(|| format!("opening store at {}", config.store.path.display()))?;

    let registry =
        SessionRegistry::with_retention(Duration::from_secs(config.session.retention_seconds));
    let _sweeper =
        registry.spawn_sweeper(Duration::from_secs(config.session.sweep_interval_seconds));
    spawn_idempotency_sweep(
        store.clone(),
        Duration::from_secs(config.session.sweep_interval_seconds),
    );

    let agents = AgentCatalog::new();
    for agent in &config.agents {
        agents.register(
            agent.id.clone(),
            Arc::new(
                ProcessAgent::new(agent.command.clone(), agent.args.clone())
                    .with_env(agent.env.clone()),
            ),
        );
    }
    if agents.is_empty() {
        warn!("no agents configured; dispatches will fail until agents are added");
    }

    let hub = SyncHub::new(store.clone());
    let background_tasks = BackgroundTasks::new();
    let dispatcher = Dispatcher::new(
        store.clone(),
        registry.clone(),
        hub.clone(),
        agents.clone(),
        background_tasks.clone(),
    )
    .with_timeouts(DispatchTimeouts {
        session: Duration::from_secs(config.session.timeout_seconds),
        acquire: Duration::from_secs(config.session.acquire_timeout_seconds),
    });

    let (shutdown_tx, shutdown_rx) = server::shutdown_channel();
    let state = AppState {
        store,
        registry,
        hub,
        agents,
        dispatcher,
        background_tasks: background_tasks.clone(),
        shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    let app = server::build_app(
        state,
        &config.server.base_url,
        config.server.request_timeout_seconds,
        config.server.max_connections,
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!(
        addr = %addr,
        base_url = %config.server.base_url,
        agents = config.agents.len(),
        "server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await?;

    // Let in-flight session tasks finish persisting before exit.
    background_tasks.shutdown().await;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown_rx: oneshot::Receiver<()>) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
        _ = shutdown_rx => {
            info!("received shutdown request, shutting down");
        }
    }
}

fn spawn_idempotency_sweep(store: Store, interval: Duration) {
    let _ = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            let _ = ticker.tick().await;
            match store.purge_expired_idempotency() {
                Ok(0) => {}
                Ok(removed) => info!(removed, "purged expired idempotency records"),
                Err(e) => warn!(error = %e, "idempotency purge failed"),
            }
        }
    });
}

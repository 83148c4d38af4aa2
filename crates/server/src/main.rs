//! The EasyGrid realtime collaboration server.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use easygrid_broker::{Hub, HubConfig};
use easygrid_core::TableSchema;
use easygrid_engine::WriteOrchestrator;
use easygrid_store::RecordStore;

mod auth;
mod config;
mod error;
mod routes;
mod state;

use auth::AuthProvider;
use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    if let Some(cache_dsn) = &config.cache_dsn {
        tracing::info!(cache_dsn, "cache DSN configured; in-process caches stay authoritative");
    }

    let store = load_store(&config)?;
    let orchestrator = Arc::new(WriteOrchestrator::new(store)?);
    bootstrap_schemas(&config, &orchestrator).await?;

    let hub = Hub::new(orchestrator.clone(), HubConfig::default());
    spawn_persister(&config, orchestrator.clone());

    let state = AppState {
        hub,
        orchestrator: orchestrator.clone(),
        auth: Arc::new(AuthProvider::new(config.api_tokens.clone())),
    };
    let app = routes::router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "easygrid server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    persist_store(&config, &orchestrator).await;
    Ok(())
}

/// Loads the store snapshot from the database DSN, or starts empty.
fn load_store(config: &Config) -> anyhow::Result<RecordStore> {
    let path = config.database_path();
    if !path.exists() {
        tracing::info!(path = %path.display(), "no store snapshot; starting empty");
        return Ok(RecordStore::new());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading store snapshot {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing store snapshot {}", path.display()))?;
    let store = RecordStore::import(&value)
        .with_context(|| format!("restoring store snapshot {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        tables = store.schemas().count(),
        "store snapshot restored"
    );
    Ok(store)
}

/// Registers tables from the bootstrap schema file, skipping the ones the
/// snapshot already carries.
async fn bootstrap_schemas(
    config: &Config,
    orchestrator: &Arc<WriteOrchestrator>,
) -> anyhow::Result<()> {
    let Some(path) = &config.schema_path else {
        return Ok(());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading schema bootstrap {}", path.display()))?;
    let schemas: Vec<TableSchema> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing schema bootstrap {}", path.display()))?;
    let known = orchestrator.table_ids().await;
    for schema in schemas {
        if known.contains(&schema.id) {
            continue;
        }
        let table_id = schema.id.clone();
        orchestrator
            .create_table(schema)
            .await
            .with_context(|| format!("registering table {table_id}"))?;
        tracing::info!(table = table_id, "table bootstrapped");
    }
    Ok(())
}

/// Flushes the store snapshot to disk on an interval.
fn spawn_persister(config: &Config, orchestrator: Arc<WriteOrchestrator>) {
    let config = config.clone();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(config.persist_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = serde_json::Value::Null;
        loop {
            ticker.tick().await;
            let snapshot = orchestrator.export_store().await;
            if snapshot == last {
                continue;
            }
            if let Err(err) = write_snapshot(&config, &snapshot) {
                tracing::error!(error = %err, "store snapshot flush failed");
            } else {
                last = snapshot;
            }
        }
    });
}

async fn persist_store(config: &Config, orchestrator: &Arc<WriteOrchestrator>) {
    let snapshot = orchestrator.export_store().await;
    if let Err(err) = write_snapshot(config, &snapshot) {
        tracing::error!(error = %err, "final store snapshot flush failed");
    }
}

fn write_snapshot(config: &Config, snapshot: &serde_json::Value) -> anyhow::Result<()> {
    let path = config.database_path();
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec(snapshot)?)
        .with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, &path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}

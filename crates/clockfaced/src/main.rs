use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod store;

use config::Config;
use dbus_interface::{AppState, ClockfaceService};
use engine::Engine;
use store::Store;

const BUS_NAME: &str = "org.clockface.Clockface1";
const OBJECT_PATH: &str = "/org/clockface/Clockface1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("clockfaced starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        liveness_enabled = config.liveness_enabled,
        session_bus = config.session_bus,
        "configuration loaded"
    );
    if !config.liveness_enabled {
        tracing::warn!("liveness detection disabled; spoofed captures will not be rejected");
    }

    let engine = Engine::from_config(&config).context("failed to initialise inference engine")?;
    let engine = engine::spawn_engine(engine);

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    let session_bus = config.session_bus;
    let service = ClockfaceService {
        state: Arc::new(AppState {
            config,
            engine,
            store,
        }),
    };

    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = if session_bus { "session" } else { "system" }, name = BUS_NAME, "clockfaced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("clockfaced shutting down");

    Ok(())
}

//! Tracker Runtime
//!
//! Runs the chatter overlap tracker until a fatal error or CTRL+C:
//! - Applies SQLite schema migrations
//! - Restores iteration state and the snapshot spool
//! - Drives passes over the top channels, flushing every N passes
//!
//! Usage:
//!   cargo run --release --bin tracker_runtime
//!
//! Exit codes:
//!   0 - stopped by CTRL+C
//!   1 - fatal tracker error (restart resumes from persisted state)
//!   2 - invalid configuration
//!
//! Environment variables: see `TrackerConfig::from_env`.

use chatterflow::tracker::{
    controller::ControllerSettings, db::OverlapDbWriter, state_store::IterationStateStore,
    HelixClient, IterationController, JsonFileStateStore, SnapshotStore, SqliteOverlapWriter,
    TrackerConfig, UpstreamApi,
};
use dotenv::dotenv;
use log::{error, info, warn};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    // NOTE: Workaround for rustls issue
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("⚠️  rustls crypto provider was already installed");
    }

    info!("🚀 Tracker Runtime");

    let config = TrackerConfig::from_env();
    if let Err(e) = config.validate() {
        error!("❌ Configuration error: {}", e);
        process::exit(2);
    }

    info!("📊 Configuration:");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ State file: {}", config.state_path);
    info!(
        "   ├─ Spool: {}",
        config.spool_dir.as_deref().unwrap_or("disabled")
    );
    info!("   ├─ Pass budget: {}s", config.pass_budget_secs);
    info!("   ├─ Flush every: {} passes", config.flush_threshold);
    info!("   ├─ Top channels: {}", config.top_channel_limit);
    info!("   └─ Fetch attempts: {} (0 = unlimited)", config.max_fetch_attempts);

    let mut controller = match build_controller(&config) {
        Ok(controller) => controller,
        Err(e) => {
            error!("❌ FATAL: {}", e);
            process::exit(1);
        }
    };

    info!("🔄 Press CTRL+C to shutdown");

    let outcome = tokio::select! {
        result = controller.run() => Some(result),

        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
                Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
            }
            None
        }
    };

    if let Some(Err(e)) = outcome {
        error!(
            "❌ FATAL: {} (iteration {}, phase {:?})",
            e,
            controller.state().iteration,
            controller.phase()
        );
        process::exit(1);
    }

    info!("✅ Tracker runtime stopped");
}

fn build_controller(config: &TrackerConfig) -> Result<IterationController, Box<dyn std::error::Error>> {
    info!("🔧 Initializing database...");
    let db: Arc<dyn OverlapDbWriter> = Arc::new(SqliteOverlapWriter::open_with_schema(
        &config.db_path,
        &config.schema_dir,
    )?);
    info!("✅ Database initialized");

    let store = match &config.spool_dir {
        Some(dir) => SnapshotStore::with_spool(dir)?,
        None => SnapshotStore::new(),
    };

    let api: Arc<dyn UpstreamApi> = Arc::new(HelixClient::new(config)?);
    let state_store: Arc<dyn IterationStateStore> =
        Arc::new(JsonFileStateStore::new(&config.state_path));

    Ok(IterationController::new(
        ControllerSettings::from_config(config),
        api,
        db,
        state_store,
        Arc::new(store),
    ))
}

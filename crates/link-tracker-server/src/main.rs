use anyhow::{Context, Result};
use link_tracker_ecdysis::{
    Completion, EnvironmentChannel, ExecLauncher, Generation, InheritedDescriptors, ListenerSet,
    RestartConfig, RestartCoordinator,
};
use std::sync::Arc;
use tracing::{error, info};

mod clock;
mod config;
mod db;
mod hits;
mod server;
mod telemetry;

use clock::SystemClock;
use config::{ServerConfig, ENV_PREFIX};
use db::{Database, LibsqlLinkStore, LinkStore};
use hits::HitRecorder;
use server::{api_router, public_router, AppState, HttpHandler};

const PUBLIC_LISTENER: &str = "public";
const API_LISTENER: &str = "api";

fn main() -> Result<()> {
    // Inherited descriptors are wrapped before anything else can open one.
    let channel = EnvironmentChannel::new(ENV_PREFIX);
    let generation = channel
        .decode_process_env()
        .context("Invalid restart environment")?;
    let inherited = InheritedDescriptors::adopt(&generation.envelope)
        .context("Failed to adopt inherited descriptors")?;
    let launcher = ExecLauncher::from_current_process(channel)
        .context("Failed to resolve current executable")?;

    let config = ServerConfig::from_env().context("Failed to load server configuration")?;
    telemetry::init(config.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    info!(
        role = %generation.role,
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        "Link tracker starting"
    );
    config.log_config();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let completion = runtime.block_on(serve(config, generation, inherited, launcher))?;

    match completion {
        Completion::Shutdown => {
            info!("Link tracker stopped");
            Ok(())
        }
        Completion::Replace(replacement) => {
            // Leave a stuck blocking task behind rather than wait on it.
            runtime.shutdown_background();
            let err = replacement.execute();
            error!(error = %err, "Restart failed after draining, exiting");
            Err(err).context("Failed to replace process image")
        }
    }
}

async fn serve(
    config: ServerConfig,
    generation: Generation,
    mut inherited: InheritedDescriptors,
    launcher: ExecLauncher,
) -> Result<Completion<ExecLauncher>> {
    let mut listeners = ListenerSet::new(config.drain_timeout);
    let public = listeners
        .resume_or_bind(
            PUBLIC_LISTENER,
            config.public_addr,
            inherited.take(PUBLIC_LISTENER),
        )
        .await?;
    let api = match config.api_addr {
        Some(addr) => Some(
            listeners
                .resume_or_bind(API_LISTENER, addr, inherited.take(API_LISTENER))
                .await?,
        ),
        None => None,
    };
    let ready = inherited.take_ready();
    inherited.ensure_claimed()?;

    let db = Database::open("link-tracker", &config.db_path)
        .await
        .context("Failed to open database")?;
    if !db.health_check().await? {
        anyhow::bail!("Database is not answering queries");
    }
    let store: Arc<dyn LinkStore> = Arc::new(
        LibsqlLinkStore::new(db)
            .await
            .context("Failed to run migrations")?,
    );
    info!("Database initialized and migrations complete");

    let (hits, hit_worker) = HitRecorder::spawn(store.clone(), config.hit_queue_capacity);
    let state = Arc::new(AppState::new(store, hits, Arc::new(SystemClock)));

    let restart_config = RestartConfig {
        ready_timeout: config.ready_timeout,
        ..RestartConfig::default()
    };
    let mut coordinator =
        RestartCoordinator::new(&generation, listeners, launcher, restart_config, ready)?;

    coordinator.serve(
        &public,
        HttpHandler::new(public_router(state.clone(), api.is_none())),
    );
    if let Some(api) = &api {
        coordinator.serve(api, HttpHandler::new(api_router(state.clone())));
    }
    drop(state);

    let completion = coordinator.run().await;
    hit_worker.finish(config.drain_timeout).await;

    Ok(completion?)
}

use std::{process::ExitCode, sync::Arc};

use config::Config;
use registry::{ContainerStore, RecordStore};
use runtime::{ContainerRuntime, DockerRuntime};

mod api;
mod broadcast;
mod cli;
mod config;
mod intake;
mod lifecycle;
mod pipeline;
mod reconciler;
mod registry;
mod runtime;
mod signals;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("Unable to load config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Unable to open the container store: {0}")]
    Store(#[from] registry::StoreError),
    #[error("Unable to connect to Docker: {0}")]
    Runtime(#[from] runtime::RuntimeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    // Initialize the logger
    env_logger::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let args = cli::get_cli_args();
    let mut config = Config::try_init(&args.config).await?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    let shutdown = signals::handle_shutdown();

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect(&config.docker)?);
    let store: Arc<dyn ContainerStore> = match &config.store.path {
        Some(path) => Arc::new(RecordStore::open(path).await?),
        None => {
            log::warn!("No store path configured, container records will not survive a restart");
            Arc::new(RecordStore::in_memory())
        }
    };

    let registry = Arc::new(registry::ContainerRegistry::new(store, runtime.clone()));
    let broadcaster = Arc::new(broadcast::BuildLogBroadcaster::new(
        config.build.log_capacity,
    ));
    let lifecycle = Arc::new(lifecycle::LifecycleController::new(
        registry.clone(),
        runtime.clone(),
    ));
    let intake = intake::ArchiveIntake::new(
        &config.build.workspace_dir,
        &config.build.dockerfile,
        broadcaster.clone(),
    );
    let pipeline = Arc::new(pipeline::ImageBuildPipeline::new(
        registry.clone(),
        lifecycle.clone(),
        runtime.clone(),
        intake,
        broadcaster.clone(),
        pipeline::PipelineSettings::from(&config.build),
    ));

    let reconciler = config.health.enabled.then(|| {
        let reconciler = reconciler::HealthReconciler::new(runtime.clone(), &config.health);
        tokio::spawn(reconciler.run(shutdown.clone()))
    });

    let state = Arc::new(api::AppState {
        registry,
        lifecycle,
        pipeline,
        broadcaster,
        staging_dir: config.build.staging_dir.clone(),
        log_grace: config.build.log_grace(),
        shutdown: shutdown.clone(),
    });
    let app = api::router(state, config.server.upload_limit_bytes);

    let listener = tokio::net::TcpListener::bind(config.server.listen).await?;
    log::info!("Listening on {}", listener.local_addr()?);
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    axum::serve(listener, app)
        .with_graceful_shutdown(signals::wait_for_shutdown(shutdown))
        .await?;

    if let Some(reconciler) = reconciler {
        let _ = reconciler.await;
    }
    log::info!("Shut down cleanly");
    Ok(())
}

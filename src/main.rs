use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use leafsight::{AppState, Args, ModelKind, ModelRegistry, OnnxLoader, OnnxModel, Pipeline, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let loader = OnnxLoader::new(
        OnnxModel::new(args.cuda, args.gpu_memory_growth),
        args.model_paths(),
        args.substrate_options(),
    );
    let registry = Arc::new(ModelRegistry::new(loader));
    let pipeline = Pipeline::from_args(&args, registry.clone())?;

    if args.warm_up {
        let registry = registry.clone();
        tokio::task::spawn_blocking(move || {
            for kind in ModelKind::ALL {
                match registry.get(kind) {
                    Ok(_) => info!(model = %kind, "warmed up"),
                    Err(e) => warn!(model = %kind, error = %e, "warm-up failed, will retry on first request"),
                }
            }
        })
        .await?;
    }

    let state = Arc::new(AppState::new(pipeline, args.workers, args.request_timeout()));
    let app = router(state, args.body_limit);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, cuda = args.cuda, workers = args.workers, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutting down");
        })
        .await?;
    Ok(())
}

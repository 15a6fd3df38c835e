use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use formrunner::core::{Settings, WorkerContext};
use formrunner::store::RedisStore;
use formrunner::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,chromiumoxide=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let settings = Settings::from_env();
    settings.cache.ensure_dirs()?;

    info!(
        "Starting worker {} for task type `{}`",
        settings.general.worker_uid, settings.general.worker_type
    );

    let store = RedisStore::connect(&settings.redis.url()).await.map_err(|e| {
        error!("cannot reach the shared store at {}: {e}", settings.redis.url());
        e
    })?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let ctx = WorkerContext::new(settings, Arc::new(store), http);
    let worker = Worker::new(ctx)?;

    tokio::select! {
        result = worker.run() => result,
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping worker");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::gate::GateContext;
use crate::router;
use crate::store::{Client, PostgresFlagStore};

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = match PostgresFlagStore::new(
        &config.database_url,
        config.max_pg_connections,
        config.acquire_timeout(),
    ) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("Failed to create flag store client: {}", e);
            return;
        }
    };

    serve_with_store(config, store, listener, shutdown).await
}

/// Serves the gate against any flag store, used by `serve` and by the integration tests.
pub async fn serve_with_store<F>(
    config: Config,
    store: Arc<dyn Client + Send + Sync>,
    listener: TcpListener,
    shutdown: F,
) where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!(
        policy = config.missing_flag_policy.as_str(),
        destinations = config.destinations.0.len(),
        "starting autopost gate"
    );

    let gate = GateContext::new(&config, store);
    let app = router::router(gate, &config);

    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(e) => tracing::warn!("could not read listener address: {}", e),
    }

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("server exited with error: {}", e);
    }
}

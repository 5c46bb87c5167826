use anyhow::Context;
use envconfig::Envconfig;
use tokio::signal;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use autopost_gate::config::Config;
use autopost_gate::server::serve;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("Invalid configuration")?;

    let log_layer = {
        let base_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true);

        if *config.debug {
            // Development: pretty colored output
            base_layer
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_ansi(true)
                .with_filter(EnvFilter::from_default_env())
                .boxed()
        } else {
            // Production: JSON
            base_layer
                .json()
                .with_filter(EnvFilter::from_default_env())
                .boxed()
        }
    };

    tracing_subscriber::registry().with(log_layer).init();

    let listener = tokio::net::TcpListener::bind(config.address)
        .await
        .with_context(|| format!("could not bind {}", config.address))?;
    serve(config, listener, shutdown()).await;

    Ok(())
}

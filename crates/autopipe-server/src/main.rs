#![doc = include_str!("../README.md")]

mod config;
mod metered;
mod telemetry;

use anyhow::Context;
use autopipe::{
    CopyFactory, DispatchServer, HeaderStackingFactory, RegexFactory, ServerDescriptor,
    ServiceFactory,
};
use clap::Parser;
use config::{CliArgs, FilterKind, ServerConfig};
use metered::MeteredFactory;
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use telemetry::{TelemetryProviders, init_telemetry};
use tokio::{net::TcpListener, signal};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let listener = TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server_addr))?;
    let local_addr = listener.local_addr()?;
    log_startup_info(local_addr, &config);

    match config.filter {
        FilterKind::Copy => run_server(CopyFactory, listener, local_addr, config, providers).await,
        FilterKind::Regex => {
            run_server(RegexFactory, listener, local_addr, config, providers).await
        }
    }
}

async fn run_server<F: ServiceFactory>(
    filter: F,
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    providers: TelemetryProviders,
) -> anyhow::Result<()> {
    let server = Arc::new(DispatchServer::new(
        MeteredFactory::new(HeaderStackingFactory::new(filter)),
        config.dispatch_config(),
    )?);

    // The listener is already bound, so early clients wait in the backlog.
    let published = match &config.publish_dir {
        Some(dir) => Some(publish(dir, local_addr, &config)?),
        None => None,
    };

    let accept = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run(listener).await }
    });

    shutdown_signal().await;

    // 1. Withdraw the descriptor so no new pipelines route here
    if let Some(path) = published {
        if let Err(_e) = std::fs::remove_file(&path) {
            #[cfg(feature = "tracing")]
            tracing::warn!("failed to remove descriptor {}: {_e}", path.display());
        }
    }

    // 2. Stop accepting, drain running services
    server.shutdown().await;
    accept.await??;

    let _stats = server.stats();
    #[cfg(feature = "tracing")]
    tracing::info!(
        accepted = _stats.accepted,
        rejected = _stats.rejected,
        completed = _stats.completed,
        failed = _stats.failed,
        "Service shut down successfully"
    );

    // 3. Flush telemetry
    providers.shutdown();
    Ok(())
}

fn publish(dir: &Path, local_addr: SocketAddr, config: &ServerConfig) -> anyhow::Result<PathBuf> {
    let host = config.advertise_host.clone().unwrap_or_else(|| {
        if local_addr.ip().is_unspecified() {
            "localhost".to_owned()
        } else {
            local_addr.ip().to_string()
        }
    });
    let descriptor = ServerDescriptor {
        name: config.service_name.clone(),
        host,
        port: local_addr.port(),
        synopsis: config.synopsis.clone(),
    };
    let path = descriptor
        .publish(dir)
        .with_context(|| format!("failed to publish descriptor into {}", dir.display()))?;

    #[cfg(feature = "tracing")]
    tracing::info!("Published descriptor {}", path.display());
    Ok(path)
}

fn log_startup_info(_addr: SocketAddr, _config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting {} filter on {} with full config: {:#?}",
            _config.filter.name(),
            _addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting {} filter on {} with {} workers",
            _config.filter.name(),
            _addr,
            _config.num_workers
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("failed to install SIGTERM handler: {_e}");
                core::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = core::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::error!("failed to install Ctrl+C handler: {_e}");
            core::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");
}

#![doc = include_str!("../README.md")]

mod config;

use anyhow::Context;
use autopipe::{Orchestrator, PipelineRequest, ReaderFeeder, ServerDirectory};
use clap::Parser;
use config::{CliArgs, ClientConfig};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ClientConfig::try_from(args)?;

    // stdout carries pipeline output; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))?;

    let directory = config
        .servers_dir
        .as_deref()
        .map(ServerDirectory::load)
        .transpose()?;

    if config.list {
        if let Some(directory) = &directory {
            list(directory);
        }
        return Ok(());
    }

    let requests = config
        .stages
        .iter()
        .map(|stage| stage.request(directory.as_ref()))
        .collect::<anyhow::Result<Vec<_>>>()?;

    run(&config, &requests).await
}

async fn run(config: &ClientConfig, requests: &[PipelineRequest]) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::new(config.orchestrator)?;
    orchestrator.start()?;

    #[cfg(feature = "tracing")]
    tracing::debug!(
        "Opening pipeline through {}",
        requests
            .iter()
            .map(PipelineRequest::addr)
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    let mut stream = orchestrator
        .open(requests, ReaderFeeder(tokio::io::stdin()))
        .await
        .context("failed to open pipeline")?;

    let mut stdout = tokio::io::stdout();
    let copied = async {
        tokio::io::copy(&mut stream, &mut stdout).await?;
        stdout.flush().await
    }
    .await;

    // Always close, even if stdout went away, so the hops are released.
    let closed = orchestrator.close(&mut stream).await;
    orchestrator.shutdown();

    // A failed hop usually also breaks the copy; the close error names it.
    closed.context("pipeline failed")?;
    copied.context("failed to write pipeline output")?;
    Ok(())
}

fn list(directory: &ServerDirectory) {
    for descriptor in directory.descriptors() {
        println!(
            "{:<20} {}:{:<6} {}",
            descriptor.name,
            descriptor.host,
            descriptor.port,
            descriptor.synopsis.as_deref().unwrap_or("")
        );
    }
    for (name, error) in directory.failures() {
        eprintln!("{name}: {error}");
    }
}

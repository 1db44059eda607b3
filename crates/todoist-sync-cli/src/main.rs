mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use todoist_sync::{Client, ConfigBuilder, ConfigLayer};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigBuilder::new()
        .files(cli.config_files())
        .overrides(ConfigLayer {
            token: cli.token.clone(),
            api_url: cli.api_url.clone(),
            use_sync_api: cli.sync_api.then_some(true),
            debug: cli.debug.then_some(true),
            ..ConfigLayer::default()
        })
        .build()
        .context("Failed to load configuration")?;

    init_logging(config.debug)?;
    tracing::debug!("[Main] Using {:?}", config);

    let mut client = Client::new(config).context("Failed to create Todoist client")?;
    commands::run(&mut client, cli.command).await
}

/// Logs go to stderr. RUST_LOG overrides the default level.
fn init_logging(debug: bool) -> Result<()> {
    use opentelemetry::trace::TracerProvider as _;

    // W3C trace context on outgoing requests
    opentelemetry::global::set_text_map_propagator(
        opentelemetry_sdk::propagation::TraceContextPropagator::new(),
    );
    let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
    let tracer = provider.tracer("todoist-sync");
    opentelemetry::global::set_tracer_provider(provider);

    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level))
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()?;
    Ok(())
}

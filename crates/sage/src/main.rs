use anyhow::{Context, Result};
use clap::Parser;
use sage_models::config::SageConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sage", about = "Symbol Analysis Gateway Engine")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/sage.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Load config
    let config_str = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("Failed to read config: {}", cli.config))?;
    let config: SageConfig =
        toml::from_str(&config_str).with_context(|| "Failed to parse config")?;

    let mut app = sage::bootstrap(&config);
    let router = sage::build_router(app.state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
    info!(address = %config.server.bind_address, "Gateway listening");

    let shutdown = app.cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    // Drain the pipeline tasks after the HTTP surface is down.
    app.cancel.cancel();
    while let Some(joined) = app.tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Pipeline task ended with error"),
            Err(e) => warn!(error = %e, "Pipeline task panicked"),
        }
    }
    info!("Shutdown complete");

    Ok(())
}

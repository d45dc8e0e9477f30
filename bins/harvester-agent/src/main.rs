use std::sync::Arc;

use clap::Parser;

#[derive(Parser)]
#[command(name = "harvester-agent", about = "Host-resident telemetry collection agent")]
struct Cli {
    /// Path to JSON configuration file.
    #[arg(long, default_value = "harvester.json", env = "HARVESTER_CONFIG")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!(config = %cli.config, "loading configuration");
    let config = match harvester_engine::config::AgentConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(harvester_engine::registry::PluginRegistry::new());
    if let Err(e) = registry.load(&config.plugin_modules) {
        tracing::error!(error = %e, "failed to load plugin catalog");
        std::process::exit(1);
    }

    tracing::info!(pipelines = config.pipelines.len(), "bootstrapping agent");
    let mut agent = match harvester_engine::agent::Agent::bootstrap(config, registry).await {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(error = %e, "failed to bootstrap agent");
            std::process::exit(1);
        }
    };

    tracing::info!("harvester-agent started, press Ctrl+C to stop");

    // Listen for SIGHUP (config reload) and SIGINT/SIGTERM (shutdown).
    let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGHUP handler");
            std::process::exit(1);
        }
    };

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                tracing::info!(config = %cli.config, "SIGHUP received, reloading configuration");
                match agent.reload_from_file(&cli.config).await {
                    Ok(()) => tracing::info!("configuration reloaded successfully"),
                    Err(e) => tracing::error!(error = %e, "configuration reload failed (keeping old config)"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down...");
                break;
            }
        }
    }

    agent.shutdown().await;
}

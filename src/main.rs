//! inferproxy - streaming reverse proxy for a local inference backend
//!
//! Validates inference requests, forwards them to the backend through a
//! bounded connection pool and streams the responses back.

use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use inferproxy::config::Config;
use inferproxy::proxy::run_server;
use inferproxy::router::RouteTable;

#[derive(Parser)]
#[command(name = "inferproxy")]
#[command(about = "Streaming reverse proxy for a local inference backend")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Serve {
        /// Path to configuration file (defaults are used if it does not exist)
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long, env = "INFERPROXY_LISTEN")]
        listen: Option<String>,

        /// Override listen port (binds all interfaces)
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// Override upstream base URL
        #[arg(short, long, env = "OLLAMA_URL")]
        upstream: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show configured routes
    Routes {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

fn init_tracing(level: &str) {
    let default_filter = format!("inferproxy={},tower_http=info", level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load configuration from {}", path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            port,
            upstream,
        } => {
            let found = Path::new(&config).exists();
            let mut cfg = if found {
                load_config(&config)?
            } else {
                Config::default()
            };

            init_tracing(&cfg.logging.level);
            if found {
                tracing::info!(config = %config, "Loaded configuration");
            } else {
                tracing::warn!(config = %config, "Config file not found, using defaults");
            }

            if let Some(port) = port {
                cfg.server.listen = format!("0.0.0.0:{}", port);
            }
            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                cfg.server.listen = addr;
            }
            if let Some(url) = upstream {
                tracing::info!(upstream = %url, "Override upstream URL");
                cfg.upstream.url = url;
            }
            cfg.validate()?;

            run_server(cfg).await
        }

        Commands::Check { config } => {
            let cfg = load_config(&config)?;
            init_tracing(&cfg.logging.level);

            println!("Configuration OK: {}", config);
            println!("  listen:    {}", cfg.server.listen);
            println!(
                "  upstream:  {} (pool {}, acquire timeout {}ms)",
                cfg.upstream.url, cfg.upstream.pool_size, cfg.upstream.acquire_timeout_ms
            );
            println!(
                "  health:    GET {} every {}ms (degraded above {}ms)",
                cfg.health.path, cfg.health.interval_ms, cfg.health.latency_threshold_ms
            );
            println!("  routes:    {}", cfg.routes.len());
            Ok(())
        }

        Commands::Routes { config } => {
            let cfg = load_config(&config)?;
            init_tracing(&cfg.logging.level);

            let table = RouteTable::new(&cfg.routes);
            println!("{:<20} {:<24} REQUIRED", "PATH", "UPSTREAM");
            for route in table.routes() {
                println!(
                    "{:<20} {:<24} {}",
                    route.path,
                    route.upstream_path,
                    route.required_fields.join(", ")
                );
            }
            Ok(())
        }
    }
}

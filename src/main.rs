use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use routeguard::config::{LoggingConfig, RouteguardConfig};
use routeguard::endpoint::{EndpointId, RuleStatus, RuleUpdate};
use routeguard::guard::Guard;
use routeguard::ratelimit::SystemClock;
use routeguard::reconcile::RouteManifest;
use routeguard::store::{JsonFileRepository, RuleStore};
use routeguard::watch::SystemWatch;

#[derive(Parser)]
#[command(name = "routeguard", version, about = "Endpoint rate limiting with route reconciliation")]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile the route manifest against stored endpoints once
    Reconcile {
        /// Route manifest; defaults to guard.routes_path
        #[arg(long)]
        routes: Option<PathBuf>,
    },
    /// Reconcile, then keep re-scanning routes and watching system usage
    Serve,
    /// List changelog entries
    Changelog {
        /// Include resolved entries
        #[arg(long)]
        all: bool,
    },
    /// Mark a changelog entry as resolved
    Resolve { id: u64 },
    /// Configure the rate limit rule of an endpoint
    Rule(RuleArgs),
    /// List stored endpoints and their rules
    Endpoints,
}

#[derive(clap::Args)]
struct RuleArgs {
    /// Endpoint id
    id: u64,
    #[arg(long)]
    status: RuleStatus,
    #[arg(long)]
    ip_based: bool,
    #[arg(long)]
    permanent_ban: bool,
    /// Requests allowed per window
    #[arg(long)]
    limit: u32,
    /// Window length in seconds
    #[arg(long)]
    window: u64,
    /// Ban length in seconds
    #[arg(long, default_value_t = 0)]
    ban: u64,
    /// Parameter to include in the rate limit key (repeatable)
    #[arg(long = "param")]
    params: Vec<String>,
    /// Header to include in the rate limit key (repeatable)
    #[arg(long = "header")]
    headers: Vec<String>,
}

impl RuleArgs {
    fn to_update(&self) -> RuleUpdate {
        RuleUpdate {
            status: self.status,
            ip_based: self.ip_based,
            permanent_ban: self.permanent_ban,
            limit_count: self.limit,
            window_seconds: self.window,
            ban_seconds: self.ban,
            enabled_parameters: self.params.iter().cloned().collect::<BTreeSet<_>>(),
            enabled_headers: self.headers.iter().cloned().collect::<BTreeSet<_>>(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RouteguardConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    let repository = JsonFileRepository::new(&config.storage.state_path);
    let store = RuleStore::open(repository).context("Failed to open rule store")?;
    let guard = Arc::new(Guard::new(store, Arc::new(SystemClock), &config.guard));

    match cli.command {
        Command::Reconcile { routes } => {
            let routes = routes.unwrap_or_else(|| config.guard.routes_path.clone());
            let manifest = RouteManifest::from_file(&routes)?;
            let result = guard.reconcile(&manifest.endpoints)?;
            println!("{}", result.outcome);
            for entry in &result.changelog {
                println!("{}", serde_json::to_string(entry)?);
            }
        }
        Command::Serve => serve(guard, &config).await?,
        Command::Changelog { all } => {
            for entry in guard.changelog(!all) {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Command::Resolve { id } => {
            guard.resolve_changelog(id)?;
            println!("resolved {}", id);
        }
        Command::Rule(args) => {
            let endpoint = guard.update_rule(EndpointId(args.id), &args.to_update())?;
            println!("{}", serde_json::to_string_pretty(endpoint.as_ref())?);
        }
        Command::Endpoints => {
            for endpoint in guard.rules().endpoints() {
                println!("{}", serde_json::to_string(&endpoint)?);
            }
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(guard: Arc<Guard<JsonFileRepository>>, config: &RouteguardConfig) -> anyhow::Result<()> {
    info!("Starting Routeguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let manifest = RouteManifest::from_file(&config.guard.routes_path)?;
    let result = guard.reconcile(&manifest.endpoints)?;
    info!(outcome = %result.outcome, changes = result.changelog.len(), "Startup reconciliation complete");

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut tasks = Vec::new();

    if config.guard.rescan_interval_secs > 0 {
        tasks.push(tokio::spawn(guard.clone().rescan(
            config.guard.routes_path.clone(),
            Duration::from_secs(config.guard.rescan_interval_secs),
            shutdown_tx.subscribe(),
        )));
    }
    if config.watch.enabled {
        let watch = SystemWatch::new(&config.watch);
        tasks.push(tokio::spawn(watch.run(
            Duration::from_secs(config.watch.sample_interval_secs),
            shutdown_tx.subscribe(),
        )));
    }

    shutdown_signal().await;
    // No receivers is fine: nothing was spawned.
    let _ = shutdown_tx.send(());
    for task in tasks {
        task.await?;
    }

    info!("Routeguard stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

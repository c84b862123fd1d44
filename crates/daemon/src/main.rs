mod config;
mod invalidate;
mod watcher;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use trove_cache_sweeper::{CacheSweeper, Matcher};
use trove_git_source::{
    GitHubAdapter, GitHubConfig, GitSourceTracker, LocalGitAdapter, RetryPolicy, SourceAdapter,
    WatchReconciler,
};
use trove_local_store::{ContentStore, ExpirationScheduler};

#[derive(Parser)]
#[command(name = "trove-daemon", version, about = "Site content tracking daemon")]
struct Cli {
    /// Config file (defaults to ~/.config/trove/trove.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default)
    Run,
    /// Purge cached responses for a host
    Purge {
        #[arg(long)]
        host: String,
        /// Exact path to purge
        #[arg(long, conflicts_with = "pattern")]
        path: Option<String>,
        /// Regex searched in each cached path
        #[arg(long)]
        pattern: Option<String>,
    },
    /// Print the webhook secret derived for this host
    HookSecret,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("trove_daemon=info".parse().unwrap())
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli).await {
        error!("Daemon fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let path = match cli.config {
        Some(path) => path,
        None => config::config_path()?,
    };
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(path).await,
        Command::Purge {
            host,
            path: uri,
            pattern,
        } => purge(path, host, uri, pattern).await,
        Command::HookSecret => {
            let cfg = config::load_config(&path)?;
            println!("{}", config::hook_secret(&cfg));
            Ok(())
        }
    }
}

async fn run(config_path: PathBuf) -> Result<()> {
    info!("trove-daemon starting");

    let cfg = config::load_config(&config_path)?;
    info!("Loaded {} site(s) from {}", cfg.sites.len(), config_path.display());
    let hook_secret = config::hook_secret(&cfg);

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Content store and expiration timers. Subscribe before the startup scan
    // so no sidecar written meanwhile is missed.
    let store = ContentStore::new(&cfg.storage.root);
    let scheduler = ExpirationScheduler::new(store.clone());
    let meta_events = store.subscribe();
    let pending = scheduler
        .start(&config::expiry_targets(&cfg.sites))
        .await;
    info!("{} pending expiration(s) scheduled", pending);
    let scheduler_handle = tokio::spawn(scheduler.run(meta_events, shutdown_rx.clone()));

    // Git sources
    let github = GitHubAdapter::new(GitHubConfig::from_settings(
        &cfg.github,
        &cfg.server,
        &hook_secret,
    ))
    .context("Failed to build GitHub client")?;
    let adapters: Vec<Arc<dyn SourceAdapter>> =
        vec![Arc::new(github), Arc::new(LocalGitAdapter::new())];
    let tracker = Arc::new(GitSourceTracker::new(adapters, hook_secret));
    let tracker_handle = tokio::spawn({
        let tracker = Arc::clone(&tracker);
        let shutdown = shutdown_rx.clone();
        async move { tracker.run(shutdown).await }
    });

    // Sites flow from the config file to the reconciler.
    let (sites_tx, sites_rx) = watch::channel(Arc::new(cfg.sites.clone()));
    let _config_watcher = match watcher::start_config_watcher(&config_path, sites_tx.clone()) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!("Config changes will not be picked up: {:#}", e);
            None
        }
    };

    let reconciler = WatchReconciler::new(Arc::clone(&tracker), RetryPolicy::from_settings(&cfg.retry));
    let sweeper = CacheSweeper::new(&cfg.sweeper.cache_root);
    let invalidation_handle = tokio::spawn(invalidate::run_invalidation(
        reconciler.subscribe(),
        sites_rx.clone(),
        sweeper,
        shutdown_rx.clone(),
    ));
    let reconciler_handle = tokio::spawn({
        let reconciler = reconciler.clone();
        let shutdown = shutdown_rx.clone();
        async move { reconciler.run(sites_rx, shutdown).await }
    });

    // Wait for shutdown signal
    wait_for_shutdown().await;

    info!("Shutdown signal received, stopping...");
    let _ = shutdown_tx.send(true);
    drop(sites_tx);

    // Wait for tasks to finish
    let _ = reconciler_handle.await;
    let _ = invalidation_handle.await;
    let _ = tracker_handle.await;
    let _ = scheduler_handle.await;
    tracker.close().await;

    info!("trove-daemon stopped");
    Ok(())
}

async fn purge(
    config_path: PathBuf,
    host: String,
    path: Option<String>,
    pattern: Option<String>,
) -> Result<()> {
    let cfg = config::load_config(&config_path)?;
    let matcher = match (path, pattern) {
        (Some(path), _) => Matcher::Exact(path),
        (None, Some(pattern)) => Matcher::Pattern(
            regex::Regex::new(&pattern).with_context(|| format!("Invalid pattern {pattern:?}"))?,
        ),
        (None, None) => Matcher::Any,
    };

    let sweeper = CacheSweeper::new(&cfg.sweeper.cache_root);
    let removed = sweeper
        .purge(&host, matcher)
        .await
        .context("Cache purge failed")?;
    for entry in &removed {
        println!("{} {}{}", entry.status, entry.hostname, entry.path);
    }
    println!("Removed {} cache entr{}", removed.len(), if removed.len() == 1 { "y" } else { "ies" });
    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to register Ctrl+C handler");
        info!("Received Ctrl+C");
    }
}

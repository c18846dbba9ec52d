use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use playbill_cache::SnapshotCache;
use playbill_config::{ensure_workspace_config, validate_config};
use playbill_core::normalize_city;
use playbill_poller::{PollIntervals, PollingScheduler};
use playbill_resolver::AliasResolver;
use playbill_store::CatalogStore;
use tracing_subscriber::EnvFilter;

use crate::fetch::{SourceClient, SourceFetcher, lock_store};
use crate::reconcile::{SnapshotRebuild, SourceRefresher};

mod fetch;
mod reconcile;

#[derive(Debug, Parser)]
#[command(author, version, about = "PLAYBILL ticket catalog sync daemon")]
struct Cli {
    #[arg(
        long,
        default_value = ".",
        help = "Workspace root holding the .playbill state directory"
    )]
    workspace: PathBuf,

    #[arg(long, help = "Run a single poll cycle and exit")]
    run_once: bool,

    #[arg(
        long,
        conflicts_with = "run_once",
        help = "Resolve a show title and print its cached view as JSON"
    )]
    query: Option<String>,

    #[arg(long, requires = "query", help = "City scope for --query")]
    city: Option<String>,

    #[arg(long, help = "Print classified change records as JSON lines")]
    print_events: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let workspace = cli.workspace.canonicalize().with_context(|| {
        format!(
            "failed to resolve workspace path {}",
            cli.workspace.display()
        )
    })?;

    let config = ensure_workspace_config(&workspace).with_context(|| {
        format!(
            "failed to load or create workspace config at {}",
            workspace.join(".playbill/config.toml").display()
        )
    })?;
    for warning in validate_config(&config) {
        eprintln!(
            "PLAYBILL config warning [{}]: {}",
            warning.code, warning.message
        );
    }

    let store = Arc::new(Mutex::new(
        CatalogStore::open(&workspace).context("failed to open catalog store")?,
    ));
    let resolver =
        Arc::new(AliasResolver::load(store.clone()).context("failed to load alias resolver")?);
    let client = SourceClient::new(&config.source).context("failed to build source client")?;

    let ttl_seconds = config.cache.default_ttl_secs as i64;
    let refresher = Arc::new(SourceRefresher::new(
        client.clone(),
        store.clone(),
        ttl_seconds,
    ));
    let cache = Arc::new(SnapshotCache::new(
        store.clone(),
        refresher,
        config.cache.refresh_limit,
        ttl_seconds,
    ));

    if let Some(title) = cli.query.as_deref() {
        return run_query(title, cli.city.as_deref(), &store, &resolver, &cache);
    }

    let fetcher = Arc::new(SourceFetcher::new(
        client,
        store.clone(),
        resolver.clone(),
        config.source.detail_limit,
    ));
    let callback = Arc::new(SnapshotRebuild::new(
        cache.clone(),
        resolver.clone(),
        store.clone(),
        ttl_seconds,
        cli.print_events,
    ));
    let mut scheduler = PollingScheduler::new(fetcher, callback)
        .with_intervals(PollIntervals::from_secs(
            config.poll.baseline_interval_secs,
            config.poll.backoff_interval_secs,
            config.poll.max_backoff_interval_secs,
        ))
        .with_callback_limit(config.poll.callback_limit);

    if cli.run_once {
        scheduler.run_once().await;
        return Ok(());
    }

    let handle = scheduler.start();
    tracing::info!(workspace = %workspace.display(), "polling started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested; waiting for the in-flight cycle");
    handle.stop().await;
    Ok(())
}

/// Resolve a title through the alias system and print the cached view. Each
/// search name probed is recorded as a hit or miss so unresponsive aliases
/// prune themselves.
fn run_query(
    title: &str,
    city: Option<&str>,
    store: &Mutex<CatalogStore>,
    resolver: &AliasResolver,
    cache: &SnapshotCache,
) -> Result<()> {
    let city_norm = city.map(normalize_city).filter(|city| !city.is_empty());
    let names = resolver.resolve_ordered_names(Some(title), None);

    for name in &names {
        let found = lock_store(store)
            .find_work_by_search_name(name)
            .context("search-name lookup failed")?;
        match found {
            Some(work_id) => {
                if let Err(err) = resolver.record_response(title, name, true) {
                    tracing::warn!(error = %err, "failed to record resolver hit");
                }
                let view = cache.read(work_id, city_norm.as_deref());
                println!(
                    "{}",
                    serde_json::to_string_pretty(&view)
                        .context("failed to render snapshot view")?
                );
                return Ok(());
            }
            None => {
                if let Err(err) = resolver.record_response(title, name, false) {
                    tracing::warn!(error = %err, "failed to record resolver miss");
                }
            }
        }
    }

    println!("no catalog entry for '{title}'; tried: {}", names.join(", "));
    Ok(())
}

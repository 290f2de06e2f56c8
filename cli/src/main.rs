//! chainview CLI — resync scopes, replay transactions and run periodic jobs.
//!
//! # Commands
//! ```text
//! chainview info
//! chainview check-config --config chainview.toml
//! chainview resync       --config chainview.toml [--module posts [--scope subspace/7]] [--height 1200]
//! chainview replay       --config chainview.toml --tag message.module=feegrant
//! chainview schedule     --config chainview.toml
//! ```
//!
//! Chain state is served from the JSON snapshot named by `chain.snapshot`;
//! without one the chain is empty.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainview_core::chain::{ChainQuery, MemoryChain, TagPredicate, TimeoutQuery};
use chainview_core::config::{LogConfig, StoreBackend, ViewConfig};
use chainview_core::error::ViewError;
use chainview_core::registry::ModuleRegistry;
use chainview_core::scheduler::{Job, Scheduler};
use chainview_core::store::{HeightGatedStore, Scope};
use chainview_core::types::Height;
use chainview_modules::build_registry;
use chainview_storage::{InMemoryStore, PostgresOptions, PostgresStore, SqliteStore};

#[derive(Parser)]
#[command(
    name = "chainview",
    about = "ChainView — module dispatch and reconciliation for chain indexers",
    version
)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long, global = true, env = "CHAINVIEW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered modules and their capabilities
    Info,

    /// Load and validate the configuration, then print it
    #[command(name = "check-config")]
    CheckConfig,

    /// Rebuild stored state from the chain
    Resync {
        /// Only this module (default: `reconcile.modules`, or every module)
        #[arg(long)]
        module: Option<String>,
        /// Only this scope of `--module`
        #[arg(long, requires = "module")]
        scope: Option<String>,
        /// Height to query and write at (default: `reconcile.height`, then the chain's current height)
        #[arg(long)]
        height: Option<Height>,
    },

    /// Re-dispatch every transaction matching the given tags
    Replay {
        /// `key=value` pairs, all of which must match
        #[arg(long, num_args = 1.., required = true)]
        tag: Vec<String>,
    },

    /// Run periodic module jobs (and the periodic resync) until Ctrl-C
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ViewConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ViewConfig::default(),
    };

    if let Commands::CheckConfig = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_tracing(&config.logging);
    let chain = open_chain(&config)?;

    match config.database.backend {
        StoreBackend::Memory => run(Arc::new(InMemoryStore::new()), chain, &config, cli.command).await,
        StoreBackend::Sqlite => {
            let store = SqliteStore::open_with(&config.database.url, config.database.max_connections)
                .await
                .context("opening sqlite store")?;
            run(Arc::new(store), chain, &config, cli.command).await
        }
        StoreBackend::Postgres => {
            let opts = PostgresOptions {
                max_connections: config.database.max_connections,
                ..PostgresOptions::default()
            };
            let store = PostgresStore::connect_with_options(&config.database.url, opts)
                .await
                .context("connecting to postgres")?;
            run(Arc::new(store), chain, &config, cli.command).await
        }
    }
}

/// Initialise tracing from the `[logging]` section. `RUST_LOG` wins when set.
fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

fn open_chain(config: &ViewConfig) -> Result<Arc<dyn ChainQuery>> {
    let chain = match &config.chain.snapshot {
        Some(path) => MemoryChain::from_file(path, config.chain.page_size)
            .with_context(|| format!("loading chain snapshot {path}"))?,
        None => {
            warn!("no chain.snapshot configured; serving an empty chain");
            MemoryChain::new(config.chain.page_size)
        }
    };
    Ok(Arc::new(TimeoutQuery::new(chain, config.timeout())))
}

async fn run<S>(store: Arc<S>, chain: Arc<dyn ChainQuery>, config: &ViewConfig, command: Commands) -> Result<()>
where
    S: HeightGatedStore + 'static,
{
    let registry = Arc::new(build_registry(store, chain.clone(), config));

    match command {
        Commands::Info => cmd_info(&registry),
        Commands::CheckConfig => Ok(()),
        Commands::Resync { module, scope, height } => {
            let height = resync_height(height, config, chain.as_ref()).await?;
            cmd_resync(&registry, config, module, scope, height).await
        }
        Commands::Replay { tag } => cmd_replay(&registry, chain.as_ref(), &tag).await,
        Commands::Schedule => cmd_schedule(registry, chain, config).await,
    }
}

fn cmd_info(registry: &ModuleRegistry) -> Result<()> {
    println!("ChainView v{}", env!("CARGO_PKG_VERSION"));
    for descriptor in registry.descriptors() {
        let caps: Vec<String> = descriptor.capabilities.iter().map(|c| c.to_string()).collect();
        println!("  {:<12} {}", descriptor.name, caps.join(", "));
    }
    Ok(())
}

/// Reconciliation writes at the query height, so it has to be a real one.
async fn resync_height(flag: Option<Height>, config: &ViewConfig, chain: &dyn ChainQuery) -> Result<Height> {
    let height = match flag.unwrap_or(config.reconcile.height) {
        0 => chain.latest_height().await.context("resolving the chain height")?,
        pinned => pinned,
    };
    if height == 0 {
        bail!("resync needs a height > 0 (pass --height, set reconcile.height or serve a chain with blocks)");
    }
    Ok(height)
}

async fn cmd_resync(
    registry: &ModuleRegistry,
    config: &ViewConfig,
    module: Option<String>,
    scope: Option<String>,
    height: Height,
) -> Result<()> {
    let reports = match (module, scope) {
        (Some(module), Some(scope)) => vec![registry.reconcile(&module, &Scope::new(scope), height).await?],
        (Some(module), None) => registry.reconcile_module(&module, height).await?,
        (None, _) if !config.reconcile.modules.is_empty() => {
            let mut reports = vec![];
            for module in &config.reconcile.modules {
                reports.extend(registry.reconcile_module(module, height).await?);
            }
            reports
        }
        (None, _) => registry.reconcile_all(height).await?,
    };

    for report in &reports {
        println!("{}", serde_json::to_string(report)?);
    }
    info!(height, reports = reports.len(), "resync complete");
    Ok(())
}

async fn cmd_replay(registry: &ModuleRegistry, chain: &dyn ChainQuery, tags: &[String]) -> Result<()> {
    let predicate = TagPredicate::parse(&tags.join(" AND ")).context("parsing --tag")?;
    let summary = registry.replay_txs(chain, &predicate).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn cmd_schedule(registry: Arc<ModuleRegistry>, chain: Arc<dyn ChainQuery>, config: &ViewConfig) -> Result<()> {
    let mut scheduler = Scheduler::new();
    let jobs = registry.schedule_periodic(&mut scheduler).await?;

    if let Some(interval) = config.reconcile_interval() {
        // every run re-derives state at the chain's height at that moment
        let modules = config.reconcile.modules.clone();
        let registry = registry.clone();
        let job = Job::from_fn("reconcile:all", interval, move || {
            let registry = registry.clone();
            let chain = chain.clone();
            let modules = modules.clone();
            async move {
                registry.reconcile_latest(chain.as_ref(), &modules).await?;
                Ok::<(), ViewError>(())
            }
        });
        scheduler.schedule(job).await?;
    }

    info!(jobs = scheduler.len(), module_jobs = jobs, names = ?scheduler.job_names(), "scheduler running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    scheduler.shutdown();
    info!("scheduler stopped");
    Ok(())
}

//! Tunnel Endpoint Manager Daemon Entry Point

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sonic_orch_common::{KeyOpFieldsValues, Orch};
use sonic_tepmgrd::config::StoreBackend;
use sonic_tepmgrd::store::Datastore;
#[cfg(feature = "redis")]
use sonic_tepmgrd::store::RedisStore;
#[cfg(feature = "redis")]
use sonic_tepmgrd::tables::{DEVICE_VTEP_TABLE, TEP_TABLE};
use sonic_tepmgrd::{
    JobCoordinator, MemoryStore, StoreIdAllocator, StoreMonitorInstaller, TepMgr, TepMgrConfig,
    TepMgrSettings, TepOrch,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// SONiC Tunnel Endpoint Manager
#[derive(Parser, Debug)]
#[command(name = "tepmgrd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = sonic_tepmgrd::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Redis server host, overrides the configuration file
    #[arg(long)]
    redis_host: Option<String>,

    /// Redis server port, overrides the configuration file
    #[arg(long)]
    redis_port: Option<u16>,
}

fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Source of change-feed entries.
enum ChangeFeed {
    #[cfg(feature = "redis")]
    Redis(Arc<RedisStore>),
    /// Nothing feeds the in-memory store; the daemon only idles.
    Idle,
}

impl ChangeFeed {
    async fn poll(&self, config: &TepMgrConfig) -> Vec<(&'static str, Vec<KeyOpFieldsValues>)> {
        match self {
            #[cfg(feature = "redis")]
            ChangeFeed::Redis(store) => {
                let batch = config.database.poll_batch_size;
                // split the wait between both queues
                let timeout = config.database.poll_timeout_secs / 2.0;
                let mut polled = Vec::new();
                for table in [TEP_TABLE, DEVICE_VTEP_TABLE] {
                    match store.pop_changes(table, batch, timeout).await {
                        Ok(entries) if !entries.is_empty() => polled.push((table, entries)),
                        Ok(_) => {}
                        Err(e) => warn!(table, error = %e, "failed to poll change feed"),
                    }
                }
                polled
            }
            ChangeFeed::Idle => {
                tokio::time::sleep(config.poll_timeout()).await;
                Vec::new()
            }
        }
    }
}

async fn open_store(config: &TepMgrConfig) -> anyhow::Result<(Arc<dyn Datastore>, ChangeFeed)> {
    match config.database.backend {
        StoreBackend::Memory => {
            warn!("using the in-memory store; state is lost on exit and no change feed is read");
            let store: Arc<dyn Datastore> = Arc::new(MemoryStore::new());
            Ok((store, ChangeFeed::Idle))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let db = &config.database;
            let store = Arc::new(
                RedisStore::connect(&db.redis_host, db.redis_port, db.db_number)
                    .await
                    .context("failed to connect to Redis")?,
            );
            let shared: Arc<dyn Datastore> = store.clone();
            Ok((shared, ChangeFeed::Redis(store)))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => {
            anyhow::bail!("redis backend requested but tepmgrd was built without the redis feature")
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = TepMgrConfig::load_or_default(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(host) = args.redis_host {
        config.database.redis_host = host;
    }
    if let Some(port) = args.redis_port {
        config.database.redis_port = port;
    }
    config.validate().context("invalid configuration")?;

    info!("Backend: {:?}", config.database.backend);
    info!(
        "ID pool: {} ({}..={})",
        config.id_pool.name, config.id_pool.low, config.id_pool.high
    );
    info!(
        "Max concurrent passes: {}",
        config.worker.max_concurrent_passes
    );

    let (store, feed) = open_store(&config).await?;

    let allocator = Arc::new(StoreIdAllocator::new(store.clone()));
    allocator
        .create_pool(&config.id_pool.name, config.id_pool.low, config.id_pool.high)
        .await
        .context("failed to create tunnel name pool")?;

    let monitor_settings = config.monitor_settings();
    let monitor = Arc::new(StoreMonitorInstaller::new(store.clone(), monitor_settings));
    let mgr = Arc::new(TepMgr::new(
        store,
        allocator,
        monitor,
        TepMgrSettings {
            id_pool: config.id_pool.name.clone(),
            monitor: monitor_settings,
        },
    ));
    let jobs = Arc::new(JobCoordinator::new(config.worker.max_concurrent_passes));
    let mut orch = TepOrch::new(mgr, jobs.clone(), config.database.poll_batch_size);

    info!(
        "{} consuming {:?} (priority {})",
        orch.name(),
        orch.table_names(),
        orch.priority()
    );
    info!("tepmgrd initialized successfully");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
            polled = feed.poll(&config) => {
                for (table, entries) in polled {
                    debug!(table, count = entries.len(), "received change-feed entries");
                    orch.add_entries(table, entries);
                }
            }
        }
        orch.do_task().await;
    }

    if orch.has_pending_tasks() {
        for task in orch.dump_pending_tasks() {
            warn!("Unprocessed entry at shutdown: {}", task);
        }
    }
    jobs.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    info!("====================================================================");
    info!("Starting SONiC tepmgrd (Rust implementation)");
    info!("====================================================================");

    match run(args).await {
        Ok(()) => {
            info!("tepmgrd stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("tepmgrd failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use swapi_ingest::config::PipelineConfig;
use swapi_ingest::database_ops::memory::MemoryStore;
use swapi_ingest::database_ops::pg::PgStore;
use swapi_ingest::database_ops::store::CatalogStore;
use swapi_ingest::logging::init_tracing;
use swapi_ingest::normalization::entity::EntityKind;
use swapi_ingest::pipeline::{render_summary, PassSummary, Pipeline};
use swapi_ingest::swapi::transport::ReqwestTransport;
use swapi_ingest::util::db::Db;
use swapi_ingest::util::env;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "swapi-ingest", version, about = "Star Wars API catalogue ingester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Walk every collection and upsert each entity (default)
    Ingest(IngestArgs),
    /// Create the per-kind tables if they do not exist
    Schema {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
    /// Print persisted row counts per kind
    Counts {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
    },
}

#[derive(Args, Debug, Default)]
struct IngestArgs {
    /// Comma-separated kinds to ingest (planets,people,starships,vehicles)
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,
    /// Run against an in-memory store; nothing is written to Postgres
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Override SWAPI_BASE_URL
    #[arg(long)]
    base_url: Option<String>,
    /// Override INGEST_MAX_CONCURRENCY (size of the fetch permit pool)
    #[arg(long)]
    max_concurrency: Option<usize>,
    /// Override INGEST_BATCH_SIZE (entities per scheduler chunk)
    #[arg(long)]
    batch_size: Option<usize>,
    /// Optional override for the database URL
    #[arg(long)]
    db_url: Option<String>,
}

const LOGGED_KEYS: &[&str] = &[
    "SWAPI_BASE_URL",
    "INGEST_MAX_CONCURRENCY",
    "INGEST_BATCH_SIZE",
    "INGEST_BATCH_DELAY_MS",
    "INGEST_MAX_ATTEMPTS",
    "INGEST_BACKOFF_MS",
    "INGEST_RATE_LIMIT_BACKOFF_MS",
    "INGEST_RATE_LIMIT_RETRIES",
    "INGEST_RATE_LIMIT_CURVE",
    "INGEST_RETRY_ON_STATUS",
    "INGEST_REQUEST_TIMEOUT_SECS",
    "INGEST_PASS_BUDGET_SECS",
    "DB_MAX_CONNS",
    "DATABASE_URL",
    "DB_URL",
];

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing("info,sqlx=warn")?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Ingest(IngestArgs::default())) {
        Commands::Ingest(args) => run_ingest(args).await,
        Commands::Schema { db_url } => {
            let config = PipelineConfig::from_env();
            let store = connect_store(db_url, config.db_max_connections).await?;
            store
                .ensure_schema()
                .await
                .context("schema creation failed")?;
            info!("schema ready");
            Ok(())
        }
        Commands::Counts { db_url } => {
            let config = PipelineConfig::from_env();
            let store = connect_store(db_url, config.db_max_connections).await?;
            for kind in EntityKind::PASS_ORDER {
                let n = store
                    .count(kind)
                    .await
                    .with_context(|| format!("count {}", kind.table()))?;
                println!("{:<12} {:>8}", kind.table(), n);
            }
            Ok(())
        }
    }
}

async fn run_ingest(args: IngestArgs) -> Result<()> {
    env::preflight_check("swapi-ingest", &[], LOGGED_KEYS)?;

    let mut config = PipelineConfig::from_env();
    if let Some(base) = args.base_url {
        config.base_url = base.trim().trim_end_matches('/').to_string();
    }
    if let Some(n) = args.max_concurrency {
        config.max_concurrency = n.max(1);
    }
    if let Some(n) = args.batch_size {
        config.batch_size = n.max(1);
    }
    let kinds = parse_kinds(&args.only)?;
    info!(
        base_url = %config.base_url,
        max_concurrency = config.max_concurrency,
        batch_size = config.batch_size,
        dry_run = args.dry_run,
        kinds = ?kinds,
        "starting ingest"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    let summaries = if args.dry_run {
        let store = Arc::new(MemoryStore::new());
        store.ensure_schema().await?;
        ingest_into(store, config, &kinds, &cancel).await?
    } else {
        let store = connect_store(args.db_url, config.db_max_connections).await?;
        store
            .ensure_schema()
            .await
            .context("schema creation failed")?;
        ingest_into(Arc::new(store), config, &kinds, &cancel).await?
    };

    print!("{}", render_summary(&summaries));
    Ok(())
}

async fn ingest_into<S: CatalogStore>(
    store: Arc<S>,
    config: PipelineConfig,
    kinds: &[EntityKind],
    cancel: &CancellationToken,
) -> Result<Vec<PassSummary>> {
    let transport = ReqwestTransport::new(config.request_timeout)?;
    let pipeline = Pipeline::new(config, Arc::new(transport), store);
    Ok(pipeline.run_all(kinds, cancel).await)
}

async fn connect_store(db_url: Option<String>, max_connections: u32) -> Result<PgStore> {
    let database_url = match db_url {
        Some(url) => url,
        None => env::db_url()?,
    };
    info!(url = %env::redact_value("DATABASE_URL", &database_url), "connecting");
    let db = Db::connect(&database_url, max_connections)
        .await
        .context("database unreachable")?;
    Ok(PgStore::new(db))
}

fn parse_kinds(only: &[String]) -> Result<Vec<EntityKind>> {
    if only.is_empty() {
        return Ok(EntityKind::PASS_ORDER.to_vec());
    }
    let mut kinds = Vec::with_capacity(only.len());
    for raw in only {
        match EntityKind::parse(raw) {
            Some(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Some(_) => {}
            None => bail!("unknown kind {raw:?}; expected planets, people, starships or vehicles"),
        }
    }
    Ok(kinds)
}

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};

use engverse::api::{run_api_server, ApiState};
use engverse::embeddings::late_interaction::{LateInteraction, SidecarRetriever};
use engverse::monitoring::run_metrics_server;
use engverse::{
    create_search_index, ops, run_crawlers, seed_queue, Crawler, EmbeddingProvider, Frontier,
    Indexer, Metrics, PageArchive, SearchPlanner, Settings, StoreClient,
};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Distributed engineering-blog crawler and hybrid search service"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed the crawl queue from SEED_START_URLS
    Seed,

    /// Run crawler workers
    Crawl(CrawlArgs),

    /// Run the indexing worker
    Index,

    /// Create the search index (idempotent)
    InitIndex,

    /// Serve the search API
    Api,

    /// Serve Prometheus metrics
    Metrics,

    /// Show index and queue status
    Status,

    /// Clear crawl queues, fetch records, and robots state
    Clear,

    /// Requeue stored crawl docs for re-indexing
    Requeue(RequeueArgs),

    /// Index a single stored crawl doc by id
    IndexOne { doc_id: String },
}

#[derive(Args)]
struct CrawlArgs {
    /// Stop after storing this many docs (0 = no limit)
    #[arg(long, default_value = "0")]
    max_docs: usize,

    /// Worker count override (default: CRAWLER_CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Stop once the frontier has been empty for this many seconds
    #[arg(long)]
    idle_grace: Option<f64>,
}

#[derive(Args)]
struct RequeueArgs {
    /// Clear the raw queue before requeuing
    #[arg(long)]
    clear: bool,

    /// Batch size for queue pushes
    #[arg(long, default_value = "1000")]
    batch: usize,
}

fn build_http_client(settings: &Settings) -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        reqwest::header::HeaderValue::from_str(&settings.user_agent)?,
    );
    let client = reqwest::Client::builder()
        .default_headers(headers)
        .timeout(std::time::Duration::from_secs(settings.request_timeout_s))
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()?;
    Ok(client)
}

/// Resolve the embedding stack: keyword-only runs none, pylate/colbert runs
/// the late-interaction sidecar, everything else a single-vector provider.
fn build_embedding_stack(
    settings: &Settings,
    http: &reqwest::Client,
) -> Result<(Option<EmbeddingProvider>, Option<Box<dyn LateInteraction>>)> {
    if settings.keyword_only {
        return Ok((None, None));
    }
    if settings.late_interaction() {
        let retriever = SidecarRetriever::new(settings, http.clone());
        return Ok((None, Some(Box::new(retriever))));
    }
    let provider = EmbeddingProvider::from_settings(settings, http.clone())?;
    Ok((Some(provider), None))
}

/// Expose /metrics next to long-running commands; failure to bind is not
/// fatal for the command itself.
fn spawn_metrics_server(metrics: Arc<Metrics>, port: u16) {
    tokio::spawn(async move {
        if let Err(err) = run_metrics_server(metrics, port).await {
            warn!("metrics server unavailable: {err:#}");
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let settings = Arc::new(Settings::from_env());

    match cli.command {
        Commands::Seed => {
            let store = StoreClient::connect(&settings.redis_url).await?;
            let frontier = Frontier::new(store, &settings);
            for url in settings.seed_start_urls.split(',') {
                let url = url.trim();
                if url.is_empty() {
                    continue;
                }
                seed_queue(&frontier, &settings, url, "seed").await?;
            }
        }
        Commands::Crawl(args) => {
            let store = StoreClient::connect(&settings.redis_url).await?;
            let metrics = Arc::new(Metrics::new()?);
            spawn_metrics_server(metrics.clone(), settings.metrics_port);
            let archive = Arc::new(PageArchive::from_settings(&settings));
            let http = build_http_client(&settings)?;
            let crawler = Crawler::new(
                settings.clone(),
                store,
                archive,
                http,
                metrics,
            );
            let workers = args.concurrency.unwrap_or(settings.max_workers);
            let max_docs = (args.max_docs > 0).then_some(args.max_docs);
            run_crawlers(crawler, workers, max_docs, args.idle_grace).await?;
        }
        Commands::Index => {
            let store = StoreClient::connect(&settings.redis_url).await?;
            let metrics = Arc::new(Metrics::new()?);
            spawn_metrics_server(metrics.clone(), settings.metrics_port);
            let archive = Arc::new(PageArchive::from_settings(&settings));
            let http = build_http_client(&settings)?;
            let (provider, late) = build_embedding_stack(&settings, &http)?;
            let indexer = Indexer::new(settings.clone(), store, archive, provider, late, metrics);
            indexer.run().await?;
        }
        Commands::InitIndex => {
            let store = StoreClient::connect(&settings.redis_url).await?;
            create_search_index(&store, &settings).await?;
        }
        Commands::Api => {
            let store = StoreClient::connect(&settings.redis_url).await?;
            let metrics = Arc::new(Metrics::new()?);
            spawn_metrics_server(metrics.clone(), settings.metrics_port);
            let http = build_http_client(&settings)?;
            let (provider, late) = build_embedding_stack(&settings, &http)?;
            let mut planner =
                SearchPlanner::new(settings.clone(), store, provider, late, metrics);
            if settings.search_doc_cache {
                let cached = planner.load_doc_cache().await?;
                info!("doc cache warmed with {cached} documents");
            }
            let state = Arc::new(ApiState { planner });
            run_api_server(state, settings.api_port).await?;
        }
        Commands::Metrics => {
            let metrics = Arc::new(Metrics::new()?);
            run_metrics_server(metrics, settings.metrics_port).await?;
        }
        Commands::Status => {
            let store = StoreClient::connect(&settings.redis_url).await?;
            ops::status(&store, &settings).await?;
        }
        Commands::Clear => {
            let store = StoreClient::connect(&settings.redis_url).await?;
            ops::clear_crawl(&store, &settings).await?;
        }
        Commands::Requeue(args) => {
            let store = StoreClient::connect(&settings.redis_url).await?;
            ops::requeue_raw(&store, &settings, args.clear, args.batch).await?;
        }
        Commands::IndexOne { doc_id } => {
            let store = StoreClient::connect(&settings.redis_url).await?;
            let metrics = Arc::new(Metrics::new()?);
            let archive = Arc::new(PageArchive::from_settings(&settings));
            let http = build_http_client(&settings)?;
            let (provider, late) = build_embedding_stack(&settings, &http)?;
            let indexer = Indexer::new(settings.clone(), store, archive, provider, late, metrics);
            ops::index_one(&indexer, &doc_id).await?;
        }
    }

    Ok(())
}

//! Omnibox - natural-language gateway to feed data sources

use clap::{Parser, Subcommand};
use omnibox::cache::CacheRegistry;
use omnibox::catalog::CatalogStore;
use omnibox::config::Config;
use omnibox::embedding::TextEmbedder;
use omnibox::error::OmniError;
use omnibox::extraction::ParameterExtractor;
use omnibox::fetch::FetchExecutor;
use omnibox::llm::{client_from_config, LlmClient};
use omnibox::pipeline::{QueryProcessor, ResearchOrchestrator, SimpleOrchestrator};
use omnibox::resolver::{EntityResolver, SemanticNameSearcher};
use omnibox::retrieval::SemanticRetriever;
use omnibox::router::IntentRouter;
use omnibox::server::{serve, AppContext};
use omnibox::stream::TaskRegistry;
use omnibox::subscription::{SubscriptionIndexer, SubscriptionService, SubscriptionStore};
use omnibox::vector::VectorStore;
use omnibox::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Omnibox: ask feed data sources in plain language
#[derive(Parser)]
#[command(name = "omnibox")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Configuration file path (TOML); the environment is used when absent
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Run the HTTP and WebSocket server (default)
    Serve,
    /// Rebuild the enriched catalog and the vector indexes
    Index,
    /// Print configuration and index health
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    info!("Starting omnibox v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(cli.config.as_deref())?;
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(config).await,
        Commands::Index => run_index(config).await,
        Commands::Status => show_status(config).await,
    }
}

/// Initialize logging
fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .map_err(|e| OmniError::internal(format!("Invalid log level: {e}")))?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| OmniError::internal(format!("Failed to set logger: {e}")))?;
    Ok(())
}

/// Everything the pipelines need, built once at boot.
struct Components {
    catalog: Arc<CatalogStore>,
    vectors: Arc<VectorStore>,
    embedder: TextEmbedder,
    caches: CacheRegistry,
    llm: Arc<dyn LlmClient>,
    subscription_store: Arc<SubscriptionStore>,
    fetcher: Arc<FetchExecutor>,
}

async fn build_components(config: &Config) -> Result<Components> {
    config.validate()?;
    let caches = CacheRegistry::new(&config.cache);
    let embedder = TextEmbedder::init(&config.embedding)?;
    let vectors = Arc::new(VectorStore::open(&config.storage.vector_dir)?);
    let catalog = Arc::new(CatalogStore::open(&config.storage.enriched_catalog_path)?);
    let llm: Arc<dyn LlmClient> =
        Arc::from(client_from_config(&config.llm, config.timeouts.llm())?);
    let subscription_store =
        Arc::new(SubscriptionStore::connect(&config.storage.database_url).await?);
    let fetcher = Arc::new(FetchExecutor::new(
        config.feed.clone(),
        &config.timeouts,
        caches.clone(),
    ));
    Ok(Components {
        catalog,
        vectors,
        embedder,
        caches,
        llm,
        subscription_store,
        fetcher,
    })
}

async fn run_server(config: Config) -> Result<()> {
    let parts = build_components(&config).await?;

    if parts.catalog.is_empty() {
        warn!("catalog is empty; run `omnibox index` to build it from the raw catalog file");
    }

    let retriever = Arc::new(SemanticRetriever::new(
        parts.embedder.clone(),
        parts.vectors.clone(),
        parts.caches.clone(),
    ));
    let extractor = ParameterExtractor::new(
        parts.llm.clone(),
        parts.caches.clone(),
        config.llm.temperature,
    );
    let resolver = EntityResolver::new(
        parts.subscription_store.clone(),
        Arc::new(SemanticNameSearcher::new(
            parts.embedder.clone(),
            parts.vectors.clone(),
        )),
        parts.caches.clone(),
    );
    let simple = Arc::new(SimpleOrchestrator::new(
        retriever,
        extractor,
        resolver,
        parts.fetcher.clone(),
        parts.catalog.clone(),
    ));

    let research = if config.research_enabled {
        let processor: Arc<dyn QueryProcessor> = simple.clone();
        Some(Arc::new(ResearchOrchestrator::new(
            parts.llm.clone(),
            processor,
        )))
    } else {
        info!("research subsystem disabled by configuration");
        None
    };

    let intent_router = Arc::new(IntentRouter::new(parts.llm.clone(), research.is_some()));
    let subscriptions = Arc::new(SubscriptionService::new(
        parts.subscription_store.clone(),
        SubscriptionIndexer::new(parts.embedder.clone(), parts.vectors.clone()),
        parts.caches.clone(),
    ));

    let ctx = Arc::new(AppContext {
        config,
        catalog: parts.catalog,
        simple,
        research,
        intent_router,
        subscriptions,
        subscription_store: parts.subscription_store,
        fetcher: parts.fetcher,
        vectors: parts.vectors,
        registry: TaskRegistry::new(),
    });
    serve(ctx).await
}

/// Rebuild the enriched catalog from the raw file and refresh both vector
/// collections.
async fn run_index(config: Config) -> Result<()> {
    let parts = build_components(&config).await?;

    let snapshot = parts
        .catalog
        .rebuild_from_file(&config.storage.catalog_path)?;
    let retriever = SemanticRetriever::new(
        parts.embedder.clone(),
        parts.vectors.clone(),
        parts.caches.clone(),
    );
    retriever.index_routes(&snapshot).await?;

    let subscriptions = parts.subscription_store.list().await?;
    let indexer = SubscriptionIndexer::new(parts.embedder, parts.vectors.clone());
    indexer.reindex_all(&subscriptions).await?;

    info!(
        routes = snapshot.len(),
        subscriptions = subscriptions.len(),
        "indexing complete"
    );
    Ok(())
}

async fn show_status(config: Config) -> Result<()> {
    println!("omnibox v{}", env!("CARGO_PKG_VERSION"));
    println!("  llm provider:      {}", config.llm.provider);
    println!("  llm model:         {}", config.llm.model);
    println!("  embedding model:   {}", config.embedding.model);
    println!("  feed primary:      {}", config.feed.primary_base);
    println!("  feed fallback:     {}", config.feed.fallback_base);
    println!("  research enabled:  {}", config.research_enabled);

    match build_components(&config).await {
        Ok(parts) => {
            println!("  catalog routes:    {}", parts.catalog.len());
            println!(
                "  indexed routes:    {}",
                parts.vectors.count(omnibox::retrieval::ROUTE_COLLECTION)
            );
            println!(
                "  indexed subs:      {}",
                parts
                    .vectors
                    .count(omnibox::subscription::SUBSCRIPTION_COLLECTION)
            );
            println!(
                "  feed primary up:   {}",
                parts.fetcher.primary_healthy().await
            );
        }
        Err(e) => println!("  bootstrap failed:  {e}"),
    }
    Ok(())
}

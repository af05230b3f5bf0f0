use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use guide::chat::ChatService;
use guide::db::Database;
use guide::expansion::ConceptTable;
use guide::openrouter::OpenRouterClient;
use guide::random::ThreadRandom;
use guide::rate_limit::RateLimiter;
use guide::server::AppState;
use guide::store::QuotationStore;
use guide::{run_server, AppConfig, QuotationSelector};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let db = Database::new(&config).await?;
    let concepts = match &config.selection.concept_table_path {
        Some(path) => ConceptTable::load(path)?,
        None => ConceptTable::default(),
    };
    tracing::info!(concepts = concepts.concepts().len(), "concept table loaded");

    if config.completion.api_key.is_none() {
        tracing::warn!("OPENROUTER_API_KEY is not set; chat requests will fail");
    }

    let store: Arc<dyn QuotationStore> = Arc::new(db.clone());
    let selector = QuotationSelector::new(
        store.clone(),
        Arc::new(concepts),
        Arc::new(ThreadRandom),
        config.selection_limits(),
    );
    let limiter = RateLimiter::new(Arc::new(db), &config.rate_limit);
    let completion = OpenRouterClient::new(config.completion.clone());

    let chat = ChatService::new(selector, Arc::new(completion), Some(limiter));

    run_server(config, AppState::new(store, chat, CancellationToken::new())).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

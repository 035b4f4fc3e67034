mod classify;
mod config;
mod context;
mod db;
mod engine;
mod error;
mod exam_doc;
mod explain;
mod llm;
mod models;
mod prompts;
mod reading;
mod reading_cache;
mod routes;
mod sentence_order;
mod store;
#[cfg(test)]
mod testing;
mod text;

use std::path::Path;
use std::sync::Arc;

use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Settings;
use crate::db::PgStore;
use crate::engine::ExplainEngine;
use crate::llm::HttpChatModel;
use crate::reading::ReadingAnnotator;
use crate::store::{ExplainStore, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load()?;

    let store: Arc<dyn ExplainStore> = match settings.database_url.as_deref() {
        Some(url) => Arc::new(PgStore::new(db::init_pool(url).await?)),
        None => {
            warn!("no database_url configured; using in-memory store");
            Arc::new(MemoryStore::seed_from_dir(Path::new(&settings.exam_data_dir)).await?)
        }
    };
    if settings.llm_api_key.is_none() {
        warn!("no llm_api_key configured; explanation requests will fail until one is set");
    }
    if !Path::new(&settings.dictionary_path).exists() {
        warn!(path = %settings.dictionary_path, "tokenizer dictionary not found; readings will fail until it is installed");
    }
    let model = Arc::new(HttpChatModel::from_settings(&settings)?);
    let annotator = Arc::new(ReadingAnnotator::from_dictionary(&settings.dictionary_path));
    let engine = Arc::new(ExplainEngine::new(
        store,
        model,
        annotator,
        settings.prompt_version.clone(),
    ));

    let app = routes::router(routes::AppState::new(engine));

    let listener =
        tokio::net::TcpListener::bind((settings.bind_host.as_str(), settings.port)).await?;
    info!(
        model = %settings.llm_model,
        prompt_version = %settings.prompt_version,
        "listening on {}:{}",
        settings.bind_host,
        settings.port
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        signal(SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

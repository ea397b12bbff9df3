use std::sync::Arc;
use tracing::{error, info};

mod chat;
mod config;
mod error;
mod events;
mod inference;
mod manager;
mod ocr;
mod render;
mod store;
mod web;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before the filter reads RUST_LOG; report the result once logging is up.
    let dotenv = dotenvy::dotenv();

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    match dotenv {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(e) => info!("No .env file found or failed to load: {}", e),
    }

    let settings = config::Settings::from_env()?;
    info!("ocrchat starting with data in {}", settings.data_dir.display());

    let generator = inference::client::OllamaClient::new(
        &settings.ollama_url,
        settings.max_tokens,
        settings.timeout,
    )?;
    info!(
        "Using model {} at {} (timeout {:?})",
        settings.model, settings.ollama_url, settings.timeout
    );

    let engine = ocr::TesseractCli::new(
        settings.tesseract_cmd.clone(),
        settings.tesseract_lang.clone(),
    );
    let ocr = ocr::OcrAdapter::new(Arc::new(engine));

    let state = Arc::new(web::AppState::new(&settings, Arc::new(generator), ocr)?);
    let app = web::server::router(state);

    let listener = tokio::net::TcpListener::bind(settings.bind).await?;
    info!("Chat UI listening on http://{}", settings.bind);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use tollgate::counters::WindowCounters;
use tollgate::{AppState, Settings, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let settings = Settings::from_env();
    if let Some(parent) = settings.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let store = Store::open(&settings.database_path, settings.database_pool_size).await?;
    tracing::info!(path = %settings.database_path.display(), "database ready");

    let listen = format!("{}:{}", settings.host, settings.port);
    let backend_url = settings.ollama_base_url.clone();
    let state = AppState::new(settings, store)?;

    let _pruner = WindowCounters::spawn_pruner(
        Arc::clone(&state.counters),
        Duration::from_secs(300),
    );

    let app = tollgate::router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, backend = %backend_url, "tollgate-proxy listening");
    axum::serve(listener, app).await?;
    Ok(())
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use appointment_queue_cell::services::{
    DataPlanes, LocalCache, LocalStore, MemoryRemoteStore, RemoteStore, SupabaseRemoteStore, SystemClock,
};
use appointment_queue_cell::QueueCellState;
use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;
use shared_models::session::SessionContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting clinic queue API server");

    let config = AppConfig::from_env();

    let remote: Arc<dyn RemoteStore> = if config.is_configured() {
        let client = Arc::new(SupabaseClient::new(&config));
        let poll = Duration::from_secs(config.queue.remote_poll_interval_secs.max(1));
        info!("Remote store: Supabase at {}", client.get_base_url());
        Arc::new(SupabaseRemoteStore::new(client, poll))
    } else {
        warn!("Remote store: in-memory, data is lost on restart");
        Arc::new(MemoryRemoteStore::new())
    };

    let local: Arc<dyn LocalStore> = match &config.queue.local_cache_dir {
        Some(dir) => Arc::new(LocalCache::open(dir)?),
        None => Arc::new(LocalCache::in_memory()),
    };

    let planes = Arc::new(DataPlanes::new(remote, local, Arc::new(SystemClock), config.queue.clone()));
    let state = Arc::new(QueueCellState::new(planes, SessionContext::anonymous()));

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router::create_router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use collabchat::relay;
use collabchat::store::PgStore;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let store = PgStore::connect(&database_url).await.expect("database init failed");
    let app = relay::app(relay::RelayState::new(Arc::new(store)));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "collabchat relay listening");
    axum::serve(listener, app).await.expect("server failed");
}

//! Database initialization and migration runner.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Initialize the PostgreSQL connection pool and run the chat migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let max_connections = crate::config::env_parse("CHAT_DB_MAX_CONNECTIONS", 5u32);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}

//! Basic example showing how to use sea-orm-observe.
//!
//! Run with: cargo run --example basic --features sqlx-postgres

use std::time::Duration;

use sea_orm::Database;
use sea_orm_observe::prelude::*;
use sea_orm_observe::{classify, sink};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sea_orm_observe=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Install a `metrics` recorder of your choice before this to export them.
    sink::describe_metrics();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/test".into());

    tracing::info!("Connecting to database...");

    let db = Database::connect(&database_url).await?.observe_with(
        "primary",
        ObserveConfig::development().with_database_name("test"),
    );

    let rows = db.query("SELECT 1 AS one", []).await?;
    tracing::info!(rows = rows.len(), "plain query");

    let cancel = CancellationToken::new();
    let policy = RetryPolicy::new(classify::is_transient_error)
        .with_max_attempts(3)
        .with_backoff(Duration::from_millis(50), Duration::from_millis(200));
    let row = db
        .query_row_context_retryable(&cancel, &policy, "SELECT now()::text AS now", [])
        .await;
    match row.err() {
        None => {
            let now: String = row.try_get("now")?;
            tracing::info!(%now, "retryable query");
        }
        Some(err) => tracing::warn!(error = %err, "retryable query failed"),
    }

    let tx = db.begin().await?;
    tx.exec("SELECT pg_sleep(0.15)", []).await?;
    tx.query("SELECT 1", []).await?;
    tx.commit().await?;

    db.measure_stats();
    db.close().await?;

    Ok(())
}

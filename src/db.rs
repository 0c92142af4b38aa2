use std::path::Path;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;
use turso::{Builder, Connection, Database};

use crate::error::GatewayError;

/// Global database instance
static DATABASE: OnceCell<Arc<Database>> = OnceCell::const_new();

/// Initialize the database and create all tables
pub async fn init_db(path: &Path) -> Result<(), GatewayError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            GatewayError::DatabaseError(format!("Failed to create DB directory: {e}"))
        })?;
    }

    let path_str = path.to_str().unwrap_or("gateway.db");
    let db = Builder::new_local(path_str)
        .build()
        .await
        .map_err(|e| GatewayError::DatabaseError(format!("Failed to open database: {e}")))?;

    let conn = db
        .connect()
        .map_err(|e| GatewayError::DatabaseError(format!("Failed to connect: {e}")))?;

    create_tables(&conn).await?;

    DATABASE
        .set(Arc::new(db))
        .map_err(|_| GatewayError::DatabaseError("Database already initialized".into()))?;

    info!("Database initialized at {}", path_str);
    Ok(())
}

async fn create_tables(conn: &Connection) -> Result<(), GatewayError> {
    // Plan overrides written by the webhook processor and the admin path.
    // Accounts without a row are on the free plan.
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS account_plans (
            account_id TEXT PRIMARY KEY,
            plan TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        (),
    )
    .await
    .map_err(|e| GatewayError::DatabaseError(format!("Failed to create account_plans: {e}")))?;

    // One row per account per UTC day
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS usage_daily (
            account_id TEXT NOT NULL,
            day TEXT NOT NULL,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, day)
        )
        "#,
        (),
    )
    .await
    .map_err(|e| GatewayError::DatabaseError(format!("Failed to create usage_daily: {e}")))?;

    // Append-only log, one row per completed gateway call
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS usage_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            model TEXT NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            streaming INTEGER NOT NULL DEFAULT 0,
            tool_name TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
        (),
    )
    .await
    .map_err(|e| GatewayError::DatabaseError(format!("Failed to create usage_records: {e}")))?;

    // Lazy 1:1 mapping to the payments provider's customer ids
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS billing_customers (
            account_id TEXT PRIMARY KEY,
            customer_id TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        )
        "#,
        (),
    )
    .await
    .map_err(|e| GatewayError::DatabaseError(format!("Failed to create billing_customers: {e}")))?;

    // The external event id is the idempotency key: a row's existence
    // means the event was already applied
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS subscription_events (
            event_id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            plan TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
        (),
    )
    .await
    .map_err(|e| {
        GatewayError::DatabaseError(format!("Failed to create subscription_events: {e}"))
    })?;

    Ok(())
}

/// Get a database connection
pub async fn get_conn() -> Result<Connection, GatewayError> {
    let db = DATABASE
        .get()
        .ok_or_else(|| GatewayError::DatabaseError("Database not initialized".into()))?;
    db.connect()
        .map_err(|e| GatewayError::DatabaseError(format!("Failed to get connection: {e}")))
}

/// Read an integer column as u64, treating NULL/errors as 0
pub fn get_u64(row: &turso::Row, idx: usize) -> u64 {
    row.get::<i64>(idx).unwrap_or(0) as u64
}

/// Shared in-memory database for tests. Tests use distinct account ids,
/// so a process-wide instance is safe to share.
#[cfg(test)]
pub async fn init_test_db() {
    let _ = DATABASE
        .get_or_try_init(|| async {
            let db = Builder::new_local(":memory:")
                .build()
                .await
                .map_err(|e| GatewayError::DatabaseError(e.to_string()))?;
            let conn = db
                .connect()
                .map_err(|e| GatewayError::DatabaseError(e.to_string()))?;
            create_tables(&conn).await?;
            Ok::<_, GatewayError>(Arc::new(db))
        })
        .await;
}

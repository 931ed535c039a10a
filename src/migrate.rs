use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema on a fresh database (`sumtree init`).
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // One row per batch
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_status (
            batch_id TEXT PRIMARY KEY,
            current_level INTEGER NOT NULL DEFAULT 0,
            total_documents INTEGER NOT NULL DEFAULT 0,
            processed_documents INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
            error_message TEXT,
            root_id TEXT,
            started_at INTEGER,
            completed_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            CHECK (processed_documents <= total_documents)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Provenance tree nodes
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_nodes (
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            hierarchy_level INTEGER NOT NULL CHECK (hierarchy_level >= 0),
            position INTEGER NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            summary TEXT NOT NULL DEFAULT '',
            parent_id TEXT,
            child_ids_json TEXT NOT NULL DEFAULT '[]',
            token_count INTEGER NOT NULL DEFAULT 0,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            UNIQUE(batch_id, hierarchy_level, position),
            FOREIGN KEY (batch_id) REFERENCES processing_status(batch_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_nodes_batch_level ON document_nodes(batch_id, hierarchy_level, position)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_nodes_parent ON document_nodes(parent_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_status_created_at ON processing_status(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

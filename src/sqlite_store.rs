//! SQLite-backed [`NodeStore`] implementation.
//!
//! Nodes live in `document_nodes` (child ids and metadata as JSON text)
//! and batch bookkeeping in `processing_status`. Level writes and status
//! updates each run in a single transaction.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use summary_tree_core::error::StoreError;
use summary_tree_core::models::{DocumentNode, ProcessingStatus, StatusUpdate};
use summary_tree_core::store::{validate_node_batch, NodeStore};

use crate::config::Config;
use crate::db;
use crate::migrate::apply_schema;

/// SQLite implementation of the [`NodeStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const NODE_COLUMNS: &str = "id, batch_id, hierarchy_level, position, content, summary, parent_id, child_ids_json, token_count, metadata_json, created_at";

const STATUS_COLUMNS: &str = "batch_id, current_level, total_documents, processed_documents, status, error_message, root_id, started_at, completed_at, created_at, updated_at";

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn row_to_node(row: &SqliteRow) -> Result<DocumentNode> {
    let child_ids_json: String = row.try_get("child_ids_json")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    let level: i64 = row.try_get("hierarchy_level")?;
    let position: i64 = row.try_get("position")?;
    let token_count: i64 = row.try_get("token_count")?;

    Ok(DocumentNode {
        id: row.try_get("id")?,
        batch_id: row.try_get("batch_id")?,
        hierarchy_level: u32::try_from(level).context("hierarchy_level out of range")?,
        position: u32::try_from(position).context("position out of range")?,
        content: row.try_get("content")?,
        summary: row.try_get("summary")?,
        parent_id: row.try_get("parent_id")?,
        child_ids: serde_json::from_str(&child_ids_json)
            .with_context(|| format!("invalid child_ids_json: {}", child_ids_json))?,
        token_count: u64::try_from(token_count).context("token_count out of range")?,
        metadata: serde_json::from_str(&metadata_json)
            .with_context(|| format!("invalid metadata_json: {}", metadata_json))?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_status(row: &SqliteRow) -> Result<ProcessingStatus> {
    let status: String = row.try_get("status")?;
    let current_level: i64 = row.try_get("current_level")?;
    let total: i64 = row.try_get("total_documents")?;
    let processed: i64 = row.try_get("processed_documents")?;

    Ok(ProcessingStatus {
        batch_id: row.try_get("batch_id")?,
        current_level: u32::try_from(current_level).context("current_level out of range")?,
        total_documents: u64::try_from(total).context("total_documents out of range")?,
        processed_documents: u64::try_from(processed)
            .context("processed_documents out of range")?,
        status: status.parse()?,
        error_message: row.try_get("error_message")?,
        root_id: row.try_get("root_id")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Take the write lock for the batch's status row as the transaction's
/// first statement. SQLite only waits out `busy_timeout` when a deferred
/// transaction starts with a write; a read that later upgrades fails
/// with `SQLITE_BUSY` at once under concurrent writers.
async fn lock_batch(tx: &mut Transaction<'_, Sqlite>, batch_id: &str) -> Result<()> {
    let result =
        sqlx::query("UPDATE processing_status SET updated_at = updated_at WHERE batch_id = ?")
            .bind(batch_id)
            .execute(&mut **tx)
            .await?;
    if result.rows_affected() == 0 {
        bail!("batch not found: {}", batch_id);
    }
    Ok(())
}

#[async_trait]
impl NodeStore for SqliteStore {
    async fn init(&self) -> Result<()> {
        apply_schema(&self.pool).await
    }

    async fn create_batch(&self, status: &ProcessingStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO processing_status (batch_id, current_level, total_documents,
                                           processed_documents, status, error_message,
                                           root_id, started_at, completed_at,
                                           created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&status.batch_id)
        .bind(i64::from(status.current_level))
        .bind(status.total_documents as i64)
        .bind(status.processed_documents as i64)
        .bind(status.status.as_str())
        .bind(&status.error_message)
        .bind(&status.root_id)
        .bind(status.started_at)
        .bind(status.completed_at)
        .bind(status.created_at)
        .bind(status.updated_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::BatchExists(status.batch_id.clone()).into())
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to create batch {}", status.batch_id))
            }
        }
    }

    async fn write_nodes(&self, batch_id: &str, nodes: &[DocumentNode]) -> Result<()> {
        validate_node_batch(batch_id, nodes)?;
        if nodes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        lock_batch(&mut tx, batch_id).await?;

        for node in nodes {
            sqlx::query(
                r#"
                INSERT INTO document_nodes (id, batch_id, hierarchy_level, position, content,
                                            summary, parent_id, child_ids_json, token_count,
                                            metadata_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&node.id)
            .bind(&node.batch_id)
            .bind(i64::from(node.hierarchy_level))
            .bind(i64::from(node.position))
            .bind(&node.content)
            .bind(&node.summary)
            .bind(&node.parent_id)
            .bind(serde_json::to_string(&node.child_ids)?)
            .bind(node.token_count as i64)
            .bind(serde_json::to_string(&node.metadata)?)
            .bind(node.created_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert node {}", node.id))?;
        }

        // Link children; a child must be in this batch and still unparented.
        for node in nodes {
            for child_id in &node.child_ids {
                let result = sqlx::query(
                    "UPDATE document_nodes SET parent_id = ? WHERE id = ? AND batch_id = ? AND parent_id IS NULL",
                )
                .bind(&node.id)
                .bind(child_id)
                .bind(batch_id)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() != 1 {
                    bail!(
                        "cannot link child {} to parent {}: child missing, in another batch, or already linked",
                        child_id,
                        node.id
                    );
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_status(
        &self,
        batch_id: &str,
        update: &StatusUpdate,
    ) -> Result<ProcessingStatus> {
        let mut tx = self.pool.begin().await?;
        lock_batch(&mut tx, batch_id).await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM processing_status WHERE batch_id = ?",
            STATUS_COLUMNS
        ))
        .bind(batch_id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut status = match row {
            Some(row) => row_to_status(&row)?,
            None => bail!("batch not found: {}", batch_id),
        };

        status.apply(update, now())?;

        sqlx::query(
            r#"
            UPDATE processing_status
            SET current_level = ?, total_documents = ?, processed_documents = ?, status = ?,
                error_message = ?, root_id = ?, started_at = ?, completed_at = ?, updated_at = ?
            WHERE batch_id = ?
            "#,
        )
        .bind(i64::from(status.current_level))
        .bind(status.total_documents as i64)
        .bind(status.processed_documents as i64)
        .bind(status.status.as_str())
        .bind(&status.error_message)
        .bind(&status.root_id)
        .bind(status.started_at)
        .bind(status.completed_at)
        .bind(status.updated_at)
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(status)
    }

    async fn read_level(&self, batch_id: &str, level: u32) -> Result<Vec<DocumentNode>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM document_nodes WHERE batch_id = ? AND hierarchy_level = ? ORDER BY position ASC",
            NODE_COLUMNS
        ))
        .bind(batch_id)
        .bind(i64::from(level))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_node).collect()
    }

    async fn read_batch(&self, batch_id: &str) -> Result<Vec<DocumentNode>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM document_nodes WHERE batch_id = ? ORDER BY hierarchy_level ASC, position ASC",
            NODE_COLUMNS
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_node).collect()
    }

    async fn get_status(&self, batch_id: &str) -> Result<Option<ProcessingStatus>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM processing_status WHERE batch_id = ?",
            STATUS_COLUMNS
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_status).transpose()
    }

    async fn get_node(&self, id: &str) -> Result<Option<DocumentNode>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM document_nodes WHERE id = ?",
            NODE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_node).transpose()
    }

    async fn list_batches(&self) -> Result<Vec<ProcessingStatus>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM processing_status ORDER BY created_at DESC, batch_id ASC",
            STATUS_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_status).collect()
    }
}

//! Storage abstraction for the provenance tree.
//!
//! The [`NodeStore`] trait defines every persistence operation the
//! hierarchy builder and query surface need, so the engine runs unchanged
//! against SQLite in production and [`memory::InMemoryStore`] in tests.
//!
//! Implementations must guarantee:
//!
//! - schema setup in [`init`](NodeStore::init) is idempotent;
//! - [`write_nodes`](NodeStore::write_nodes) is all-or-nothing, including
//!   the `parent_id` links it sets on children;
//! - every read is scoped by `batch_id`.

pub mod memory;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;

use crate::models::{DocumentNode, ProcessingStatus, StatusUpdate};

/// Abstract storage backend for document nodes and batch status.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`init`](NodeStore::init) | Create schema objects (idempotent) |
/// | [`create_batch`](NodeStore::create_batch) | Insert a new status row |
/// | [`write_nodes`](NodeStore::write_nodes) | Persist one level's nodes and link their children |
/// | [`update_status`](NodeStore::update_status) | Apply a validated partial status update |
/// | [`read_level`](NodeStore::read_level) | Nodes of one level, in position order |
/// | [`read_batch`](NodeStore::read_batch) | Every node of a batch, by level then position |
/// | [`get_status`](NodeStore::get_status) | Status row of a batch |
/// | [`get_node`](NodeStore::get_node) | A single node by id |
/// | [`list_batches`](NodeStore::list_batches) | All status rows, newest first |
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn init(&self) -> Result<()>;

    /// Insert a status row. Fails if the batch id already exists.
    async fn create_batch(&self, status: &ProcessingStatus) -> Result<()>;

    /// Insert `nodes` and set `parent_id` on each of their children.
    ///
    /// Every node must belong to `batch_id`; every child must exist in the
    /// same batch and must not already have a parent. On any failure
    /// nothing is written.
    async fn write_nodes(&self, batch_id: &str, nodes: &[DocumentNode]) -> Result<()>;

    /// Apply `update` and return the resulting row.
    async fn update_status(&self, batch_id: &str, update: &StatusUpdate)
        -> Result<ProcessingStatus>;

    async fn read_level(&self, batch_id: &str, level: u32) -> Result<Vec<DocumentNode>>;

    async fn read_batch(&self, batch_id: &str) -> Result<Vec<DocumentNode>>;

    async fn get_status(&self, batch_id: &str) -> Result<Option<ProcessingStatus>>;

    async fn get_node(&self, id: &str) -> Result<Option<DocumentNode>>;

    async fn list_batches(&self) -> Result<Vec<ProcessingStatus>>;
}

/// Checks shared by every backend before a level write touches storage.
pub fn validate_node_batch(batch_id: &str, nodes: &[DocumentNode]) -> Result<()> {
    let mut ids = HashSet::new();
    let mut slots = HashSet::new();
    let mut claimed = HashSet::new();
    for node in nodes {
        if node.batch_id != batch_id {
            bail!(
                "node {} belongs to batch {}, not {}",
                node.id,
                node.batch_id,
                batch_id
            );
        }
        if !ids.insert(node.id.as_str()) {
            bail!("duplicate node id in write: {}", node.id);
        }
        if !slots.insert((node.hierarchy_level, node.position)) {
            bail!(
                "duplicate position {} at level {} in batch {}",
                node.position,
                node.hierarchy_level,
                batch_id
            );
        }
        for child in &node.child_ids {
            if child == &node.id {
                bail!("node {} lists itself as a child", node.id);
            }
            if !claimed.insert(child.as_str()) {
                bail!("child {} is claimed by more than one parent", child);
            }
        }
    }
    Ok(())
}

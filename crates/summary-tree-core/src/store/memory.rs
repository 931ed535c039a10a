//! In-memory [`NodeStore`] implementation for tests and embedded use.
//!
//! All state sits behind one `std::sync::RwLock`, so a level write either
//! lands completely or not at all.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{DocumentNode, ProcessingStatus, StatusUpdate};

use super::{validate_node_batch, NodeStore};

#[derive(Default)]
struct State {
    batches: HashMap<String, ProcessingStatus>,
    nodes: HashMap<String, DocumentNode>,
}

/// In-memory store. Nothing survives the process.
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn sorted(mut nodes: Vec<DocumentNode>) -> Vec<DocumentNode> {
    nodes.sort_by_key(|n| (n.hierarchy_level, n.position));
    nodes
}

#[async_trait]
impl NodeStore for InMemoryStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn create_batch(&self, status: &ProcessingStatus) -> Result<()> {
        let mut state = self.state.write().map_err(|_| anyhow!("store lock poisoned"))?;
        if state.batches.contains_key(&status.batch_id) {
            return Err(StoreError::BatchExists(status.batch_id.clone()).into());
        }
        state
            .batches
            .insert(status.batch_id.clone(), status.clone());
        Ok(())
    }

    async fn write_nodes(&self, batch_id: &str, nodes: &[DocumentNode]) -> Result<()> {
        validate_node_batch(batch_id, nodes)?;
        let mut state = self.state.write().map_err(|_| anyhow!("store lock poisoned"))?;

        if !state.batches.contains_key(batch_id) {
            bail!("batch not found: {}", batch_id);
        }

        // Validate everything before mutating anything. Children may be
        // nodes already stored or nodes staged in this same write.
        let staged: HashMap<&str, &DocumentNode> =
            nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        for node in nodes {
            if state.nodes.contains_key(&node.id) {
                bail!("node already exists: {}", node.id);
            }
            let slot_taken = state.nodes.values().any(|n| {
                n.batch_id == batch_id
                    && n.hierarchy_level == node.hierarchy_level
                    && n.position == node.position
            });
            if slot_taken {
                bail!(
                    "position {} at level {} already used in batch {}",
                    node.position,
                    node.hierarchy_level,
                    batch_id
                );
            }
            for child_id in &node.child_ids {
                let child = state
                    .nodes
                    .get(child_id)
                    .or_else(|| staged.get(child_id.as_str()).copied());
                match child {
                    Some(child) if child.batch_id != batch_id => {
                        bail!("child {} belongs to another batch", child_id)
                    }
                    Some(child) if child.parent_id.is_some() => {
                        bail!("child {} already has a parent", child_id)
                    }
                    Some(_) => {}
                    None => bail!("child node not found in batch {}: {}", batch_id, child_id),
                }
            }
        }

        for node in nodes {
            state.nodes.insert(node.id.clone(), node.clone());
        }
        for node in nodes {
            for child_id in &node.child_ids {
                if let Some(child) = state.nodes.get_mut(child_id) {
                    child.parent_id = Some(node.id.clone());
                }
            }
        }
        Ok(())
    }

    async fn update_status(
        &self,
        batch_id: &str,
        update: &StatusUpdate,
    ) -> Result<ProcessingStatus> {
        let mut state = self.state.write().map_err(|_| anyhow!("store lock poisoned"))?;
        let row = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| anyhow!("batch not found: {}", batch_id))?;
        let mut next = row.clone();
        next.apply(update, now())?;
        *row = next.clone();
        Ok(next)
    }

    async fn read_level(&self, batch_id: &str, level: u32) -> Result<Vec<DocumentNode>> {
        let state = self.state.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(sorted(
            state
                .nodes
                .values()
                .filter(|n| n.batch_id == batch_id && n.hierarchy_level == level)
                .cloned()
                .collect(),
        ))
    }

    async fn read_batch(&self, batch_id: &str) -> Result<Vec<DocumentNode>> {
        let state = self.state.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(sorted(
            state
                .nodes
                .values()
                .filter(|n| n.batch_id == batch_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get_status(&self, batch_id: &str) -> Result<Option<ProcessingStatus>> {
        let state = self.state.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(state.batches.get(batch_id).cloned())
    }

    async fn get_node(&self, id: &str) -> Result<Option<DocumentNode>> {
        let state = self.state.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(state.nodes.get(id).cloned())
    }

    async fn list_batches(&self) -> Result<Vec<ProcessingStatus>> {
        let state = self.state.read().map_err(|_| anyhow!("store lock poisoned"))?;
        let mut rows: Vec<ProcessingStatus> = state.batches.values().cloned().collect();
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.batch_id.cmp(&b.batch_id))
        });
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatchStatus, Metadata};

    fn node(id: &str, batch: &str, level: u32, position: u32, children: &[&str]) -> DocumentNode {
        DocumentNode {
            id: id.into(),
            batch_id: batch.into(),
            hierarchy_level: level,
            position,
            content: String::new(),
            summary: format!("summary of {}", id),
            parent_id: None,
            child_ids: children.iter().map(|c| c.to_string()).collect(),
            token_count: 3,
            metadata: Metadata::new(),
            created_at: 0,
        }
    }

    async fn store_with_batch(batch: &str) -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .create_batch(&ProcessingStatus::pending(batch, 0))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn duplicate_batch_is_rejected() {
        let store = store_with_batch("b1").await;
        let err = store
            .create_batch(&ProcessingStatus::pending("b1", 0))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::BatchExists("b1".into()))
        );
    }

    #[tokio::test]
    async fn write_links_children_to_parent() {
        let store = store_with_batch("b1").await;
        store
            .write_nodes("b1", &[node("a", "b1", 0, 0, &[]), node("b", "b1", 0, 1, &[])])
            .await
            .unwrap();
        store
            .write_nodes("b1", &[node("p", "b1", 1, 0, &["a", "b"])])
            .await
            .unwrap();

        let level0 = store.read_level("b1", 0).await.unwrap();
        assert_eq!(level0.len(), 2);
        assert!(level0.iter().all(|n| n.parent_id.as_deref() == Some("p")));
        assert_eq!(store.read_batch("b1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn parent_and_child_in_one_write() {
        let store = store_with_batch("b1").await;
        store
            .write_nodes("b1", &[node("a", "b1", 0, 0, &[]), node("p", "b1", 1, 0, &["a"])])
            .await
            .unwrap();
        let a = store.get_node("a").await.unwrap().unwrap();
        assert_eq!(a.parent_id.as_deref(), Some("p"));

        // Two staged parents cannot share a child.
        let err = store
            .write_nodes(
                "b1",
                &[
                    node("c", "b1", 0, 1, &[]),
                    node("q", "b1", 1, 1, &["c"]),
                    node("r", "b1", 1, 2, &["c"]),
                ],
            )
            .await;
        assert!(err.is_err());
        assert!(store.get_node("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_write_changes_nothing() {
        let store = store_with_batch("b1").await;
        store
            .write_nodes("b1", &[node("a", "b1", 0, 0, &[])])
            .await
            .unwrap();
        // Second node references a missing child, so the whole write fails.
        let err = store
            .write_nodes(
                "b1",
                &[node("p1", "b1", 1, 0, &["a"]), node("p2", "b1", 1, 1, &["zz"])],
            )
            .await;
        assert!(err.is_err());
        assert!(store.get_node("p1").await.unwrap().is_none());
        assert!(store.get_node("a").await.unwrap().unwrap().parent_id.is_none());
    }

    #[tokio::test]
    async fn batches_are_isolated() {
        let store = store_with_batch("b1").await;
        store
            .create_batch(&ProcessingStatus::pending("b2", 0))
            .await
            .unwrap();
        store
            .write_nodes("b1", &[node("a", "b1", 0, 0, &[])])
            .await
            .unwrap();
        store
            .write_nodes("b2", &[node("x", "b2", 0, 0, &[])])
            .await
            .unwrap();
        // b2 cannot adopt a node from b1.
        assert!(store
            .write_nodes("b2", &[node("p", "b2", 1, 0, &["a"])])
            .await
            .is_err());
        let b1 = store.read_batch("b1").await.unwrap();
        assert_eq!(b1.len(), 1);
        assert_eq!(b1[0].id, "a");
    }

    #[tokio::test]
    async fn status_updates_are_validated() {
        let store = store_with_batch("b1").await;
        assert!(store
            .update_status("b1", &StatusUpdate::status(BatchStatus::Completed))
            .await
            .is_err());
        let row = store
            .update_status("b1", &StatusUpdate::status(BatchStatus::Processing))
            .await
            .unwrap();
        assert_eq!(row.status, BatchStatus::Processing);
        assert!(row.started_at.is_some());
        assert!(store
            .update_status("missing", &StatusUpdate::level(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn read_level_orders_by_position() {
        let store = store_with_batch("b1").await;
        store
            .write_nodes(
                "b1",
                &[
                    node("c", "b1", 0, 2, &[]),
                    node("a", "b1", 0, 0, &[]),
                    node("b", "b1", 0, 1, &[]),
                ],
            )
            .await
            .unwrap();
        let ids: Vec<String> = store
            .read_level("b1", 0)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}

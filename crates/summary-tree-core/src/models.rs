//! Data models for the provenance tree and batch bookkeeping.
//!
//! A batch produces [`DocumentNode`]s level by level: level 0 holds the
//! original chunks and their leaf summaries, each higher level merges the
//! one below it, and the single node left at the top is the root. One
//! [`ProcessingStatus`] row per batch tracks progress.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Free-form key/value bag attached to nodes and input documents.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A node in a batch's provenance tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentNode {
    pub id: String,
    pub batch_id: String,
    /// 0 for source chunks, increasing toward the root.
    pub hierarchy_level: u32,
    /// Order of the node within its level, starting at 0.
    pub position: u32,
    /// Original text. Only populated at level 0 unless merge input is kept.
    pub content: String,
    pub summary: String,
    pub parent_id: Option<String>,
    /// Ordered ids of the nodes one level below that were merged into this one.
    pub child_ids: Vec<String>,
    pub token_count: u64,
    pub metadata: Metadata,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

impl DocumentNode {
    pub fn is_leaf(&self) -> bool {
        self.child_ids.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// The node's summary, or its content when no summary exists.
    pub fn text(&self) -> &str {
        if self.summary.is_empty() {
            &self.content
        } else {
            &self.summary
        }
    }

    /// Whether this node's summary was synthesized after the model failed.
    pub fn is_fallback(&self) -> bool {
        self.metadata
            .get("fallback")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Lifecycle of a batch: `pending → processing → completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    /// Whether moving from `self` to `next` is allowed. Staying put is allowed.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Completed)
                | (Failed, Failed)
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => anyhow::bail!("unknown batch status: '{}'", other),
        }
    }
}

/// Per-batch progress row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub batch_id: String,
    pub current_level: u32,
    pub total_documents: u64,
    pub processed_documents: u64,
    pub status: BatchStatus,
    pub error_message: Option<String>,
    /// Root node id once the batch has completed.
    pub root_id: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProcessingStatus {
    /// A fresh `pending` row.
    pub fn pending(batch_id: impl Into<String>, now: i64) -> Self {
        Self {
            batch_id: batch_id.into(),
            current_level: 0,
            total_documents: 0,
            processed_documents: 0,
            status: BatchStatus::Pending,
            error_message: None,
            root_id: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A row created directly in `processing`, as if `pending` had been
    /// left at `now`. Inserting it is a single write, so a batch is never
    /// observed stuck in `pending`.
    pub fn started(batch_id: impl Into<String>, now: i64) -> Self {
        Self {
            status: BatchStatus::Processing,
            started_at: Some(now),
            ..Self::pending(batch_id, now)
        }
    }

    /// Apply `update` in place, enforcing the lifecycle invariants.
    ///
    /// Stamps `started_at` on entering `processing` and `completed_at` on
    /// reaching a terminal state.
    pub fn apply(&mut self, update: &StatusUpdate, now: i64) -> anyhow::Result<()> {
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                anyhow::bail!(
                    "invalid status transition for batch {}: {} -> {}",
                    self.batch_id,
                    self.status,
                    next
                );
            }
        }

        let total = update.total_documents.unwrap_or(self.total_documents);
        let processed = update.processed_documents.unwrap_or(self.processed_documents);
        if processed > total {
            anyhow::bail!(
                "processed documents ({}) would exceed total documents ({}) for batch {}",
                processed,
                total,
                self.batch_id
            );
        }

        if let Some(next) = update.status {
            if next == BatchStatus::Processing && self.started_at.is_none() {
                self.started_at = Some(now);
            }
            if next.is_terminal() && self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
            self.status = next;
        }
        self.total_documents = total;
        self.processed_documents = processed;
        if let Some(level) = update.current_level {
            self.current_level = level;
        }
        if let Some(ref msg) = update.error_message {
            self.error_message = Some(msg.clone());
        }
        if let Some(ref root) = update.root_id {
            self.root_id = Some(root.clone());
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Partial update for a [`ProcessingStatus`] row. `None` fields are left as-is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub status: Option<BatchStatus>,
    pub current_level: Option<u32>,
    pub total_documents: Option<u64>,
    pub processed_documents: Option<u64>,
    pub error_message: Option<String>,
    pub root_id: Option<String>,
}

impl StatusUpdate {
    pub fn status(status: BatchStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn level(level: u32) -> Self {
        Self {
            current_level: Some(level),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(BatchStatus::Failed),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// One input document handed to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SourceDocument {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            BatchStatus::Pending,
            BatchStatus::Processing,
            BatchStatus::Completed,
            BatchStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<BatchStatus>().unwrap(), s);
        }
        assert!("done".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn transitions_follow_lifecycle() {
        use BatchStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn started_row_is_processing() {
        let row = ProcessingStatus::started("b1", 50);
        assert_eq!(row.status, BatchStatus::Processing);
        assert_eq!(row.started_at, Some(50));
        assert_eq!(row.completed_at, None);
        assert_eq!(row.created_at, 50);
    }

    #[test]
    fn apply_stamps_timestamps() {
        let mut row = ProcessingStatus::pending("b1", 100);
        row.apply(&StatusUpdate::status(BatchStatus::Processing), 110)
            .unwrap();
        assert_eq!(row.started_at, Some(110));
        assert_eq!(row.completed_at, None);
        row.apply(&StatusUpdate::failed("boom"), 120).unwrap();
        assert_eq!(row.status, BatchStatus::Failed);
        assert_eq!(row.completed_at, Some(120));
        assert_eq!(row.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn apply_rejects_processed_over_total() {
        let mut row = ProcessingStatus::pending("b1", 0);
        let update = StatusUpdate {
            total_documents: Some(2),
            processed_documents: Some(3),
            ..Default::default()
        };
        assert!(row.apply(&update, 1).is_err());
        assert_eq!(row.total_documents, 0);
    }

    #[test]
    fn apply_rejects_illegal_transition() {
        let mut row = ProcessingStatus::pending("b1", 0);
        assert!(row
            .apply(&StatusUpdate::status(BatchStatus::Completed), 1)
            .is_err());
        assert_eq!(row.status, BatchStatus::Pending);
    }

    #[test]
    fn node_text_prefers_summary() {
        let mut node = DocumentNode {
            id: "n".into(),
            batch_id: "b".into(),
            hierarchy_level: 0,
            position: 0,
            content: "content".into(),
            summary: String::new(),
            parent_id: None,
            child_ids: vec![],
            token_count: 2,
            metadata: Metadata::new(),
            created_at: 0,
        };
        assert_eq!(node.text(), "content");
        node.summary = "summary".into();
        assert_eq!(node.text(), "summary");
        assert!(node.is_leaf());
        assert!(node.is_root());
        assert!(!node.is_fallback());
    }
}

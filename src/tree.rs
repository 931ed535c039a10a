//! Read-only query surface over finished and partial batches.
//!
//! Used by the `sumtree tree|final|node|status|batches` commands and the
//! `GET /batches/...` and `GET /nodes/...` endpoints. Every function takes
//! a [`NodeStore`] and never writes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use summary_tree_core::models::{DocumentNode, ProcessingStatus};
use summary_tree_core::store::NodeStore;
use summary_tree_core::tokens::take_chars;

use crate::error::EngineError;

pub const TREE_PREVIEW_CHARS: usize = 200;
pub const FINAL_PREVIEW_CHARS: usize = 500;
pub const PATH_PREVIEW_CHARS: usize = 100;
pub const DEFAULT_MAX_DEPTH: u32 = 5;
pub const MAX_DEPTH_LIMIT: u32 = 20;

/// Upper bound on parent hops when walking a breadcrumb path.
const MAX_PATH_HOPS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TreeOptions {
    /// Levels returned below and including each root, 1–20.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default)]
    pub include_content: bool,
}

fn default_max_depth() -> u32 {
    DEFAULT_MAX_DEPTH
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            include_content: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub id: String,
    pub hierarchy_level: u32,
    pub position: u32,
    pub parent_id: Option<String>,
    pub child_ids: Vec<String>,
    pub summary_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub token_count: u64,
    pub is_root: bool,
    pub is_leaf: bool,
    pub has_children: bool,
    pub fallback: bool,
    /// Children exist but were cut by `max_depth`.
    pub children_truncated: bool,
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeStats {
    pub total_nodes: usize,
    pub root_count: usize,
    /// Highest hierarchy level stored for the batch.
    pub max_depth_found: u32,
    /// Deepest level of nesting included in the response (roots are 1).
    pub max_depth_returned: u32,
    pub truncated: bool,
    pub level_distribution: BTreeMap<u32, usize>,
    pub fallback_nodes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchTree {
    pub batch_id: String,
    pub status: ProcessingStatus,
    pub roots: Vec<TreeNode>,
    pub stats: TreeStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct Navigation {
    pub is_root: bool,
    pub has_children: bool,
    pub children_ids: Vec<String>,
}

impl Navigation {
    fn of(node: &DocumentNode) -> Self {
        Self {
            is_root: node.is_root(),
            has_children: !node.child_ids.is_empty(),
            children_ids: node.child_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalSummary {
    pub batch_id: String,
    pub root: DocumentNode,
    pub summary_preview: String,
    pub status: ProcessingStatus,
    pub stats: TreeStats,
    pub navigation: Navigation,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathEntry {
    pub id: String,
    pub hierarchy_level: u32,
    pub summary_preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Sibling {
    pub id: String,
    pub position: usize,
    pub summary_preview: String,
    pub is_self: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeContext {
    pub node: DocumentNode,
    /// Ancestors from the root down to the node's parent.
    pub path: Vec<PathEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub siblings: Option<Vec<Sibling>>,
    /// Index of the node within its parent's `child_ids`.
    pub position_in_parent: Option<usize>,
    pub navigation: Navigation,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchNodes {
    pub batch_id: String,
    pub status: ProcessingStatus,
    pub nodes: Vec<DocumentNode>,
}

/// Character-bounded preview with a trailing ellipsis when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    let cut = take_chars(text, max_chars);
    if cut.len() < text.len() {
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

pub async fn batch_status(
    store: &dyn NodeStore,
    batch_id: &str,
) -> Result<ProcessingStatus, EngineError> {
    store
        .get_status(batch_id)
        .await
        .map_err(|e| EngineError::persistence(batch_id, 0, e))?
        .ok_or_else(|| EngineError::NotFound(format!("batch {}", batch_id)))
}

pub async fn list_batches(store: &dyn NodeStore) -> Result<Vec<ProcessingStatus>, EngineError> {
    store
        .list_batches()
        .await
        .map_err(|e| EngineError::persistence("*", 0, e))
}

/// Every node of a batch, ordered by level then position.
pub async fn read_batch(store: &dyn NodeStore, batch_id: &str) -> Result<BatchNodes, EngineError> {
    let status = batch_status(store, batch_id).await?;
    let nodes = store
        .read_batch(batch_id)
        .await
        .map_err(|e| EngineError::persistence(batch_id, 0, e))?;
    Ok(BatchNodes {
        batch_id: batch_id.to_string(),
        status,
        nodes,
    })
}

/// Nested tree from every parentless node of the batch.
pub async fn batch_tree(
    store: &dyn NodeStore,
    batch_id: &str,
    options: TreeOptions,
) -> Result<BatchTree, EngineError> {
    if !(1..=MAX_DEPTH_LIMIT).contains(&options.max_depth) {
        return Err(EngineError::InvalidRequest(format!(
            "max_depth must be between 1 and {}",
            MAX_DEPTH_LIMIT
        )));
    }
    let BatchNodes { status, nodes, .. } = read_batch(store, batch_id).await?;

    let mut stats = base_stats(&nodes);
    let by_id: HashMap<&str, &DocumentNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut visited = HashSet::new();
    let mut roots: Vec<&DocumentNode> = nodes.iter().filter(|n| n.is_root()).collect();
    // Highest level first, so a completed batch lists its root before strays.
    roots.sort_by(|a, b| {
        b.hierarchy_level
            .cmp(&a.hierarchy_level)
            .then(a.position.cmp(&b.position))
    });

    let roots = roots
        .into_iter()
        .filter_map(|root| build_tree_node(root, 1, &options, &by_id, &mut visited, &mut stats))
        .collect();

    Ok(BatchTree {
        batch_id: batch_id.to_string(),
        status,
        roots,
        stats,
    })
}

fn base_stats(nodes: &[DocumentNode]) -> TreeStats {
    let mut stats = TreeStats {
        total_nodes: nodes.len(),
        ..TreeStats::default()
    };
    for node in nodes {
        *stats.level_distribution.entry(node.hierarchy_level).or_default() += 1;
        stats.max_depth_found = stats.max_depth_found.max(node.hierarchy_level);
        if node.is_root() {
            stats.root_count += 1;
        }
        if node.is_fallback() {
            stats.fallback_nodes += 1;
        }
    }
    stats
}

fn build_tree_node(
    node: &DocumentNode,
    depth: u32,
    options: &TreeOptions,
    by_id: &HashMap<&str, &DocumentNode>,
    visited: &mut HashSet<String>,
    stats: &mut TreeStats,
) -> Option<TreeNode> {
    if !visited.insert(node.id.clone()) {
        return None;
    }
    stats.max_depth_returned = stats.max_depth_returned.max(depth);

    let has_children = !node.child_ids.is_empty();
    let mut children = Vec::new();
    let mut children_truncated = false;
    if has_children {
        if depth < options.max_depth {
            children = node
                .child_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()))
                .filter_map(|child| build_tree_node(child, depth + 1, options, by_id, visited, stats))
                .collect();
        } else {
            children_truncated = true;
            stats.truncated = true;
        }
    }

    Some(TreeNode {
        id: node.id.clone(),
        hierarchy_level: node.hierarchy_level,
        position: node.position,
        parent_id: node.parent_id.clone(),
        child_ids: node.child_ids.clone(),
        summary_preview: preview(node.text(), TREE_PREVIEW_CHARS),
        summary: options.include_content.then(|| node.summary.clone()),
        content: options.include_content.then(|| node.content.clone()),
        token_count: node.token_count,
        is_root: node.is_root(),
        is_leaf: node.is_leaf(),
        has_children,
        fallback: node.is_fallback(),
        children_truncated,
        children,
    })
}

/// The root of a completed batch.
pub async fn final_summary(
    store: &dyn NodeStore,
    batch_id: &str,
) -> Result<FinalSummary, EngineError> {
    let status = batch_status(store, batch_id).await?;
    let root_id = match &status.root_id {
        Some(id) => id.clone(),
        None => {
            let detail = match &status.error_message {
                Some(msg) => format!("batch {} has no root ({}: {})", batch_id, status.status, msg),
                None => format!("batch {} has no root yet ({})", batch_id, status.status),
            };
            return Err(EngineError::NotFound(detail));
        }
    };
    let nodes = store
        .read_batch(batch_id)
        .await
        .map_err(|e| EngineError::persistence(batch_id, status.current_level, e))?;
    let stats = base_stats(&nodes);
    let root = nodes
        .into_iter()
        .find(|n| n.id == root_id)
        .ok_or_else(|| EngineError::NotFound(format!("root node {}", root_id)))?;

    Ok(FinalSummary {
        batch_id: batch_id.to_string(),
        summary_preview: preview(&root.summary, FINAL_PREVIEW_CHARS),
        navigation: Navigation::of(&root),
        root,
        status,
        stats,
    })
}

/// A node with its breadcrumb path and, optionally, its siblings.
pub async fn node_context(
    store: &dyn NodeStore,
    node_id: &str,
    include_siblings: bool,
) -> Result<NodeContext, EngineError> {
    let node = get_node(store, node_id).await?;

    let mut path = Vec::new();
    let mut visited = HashSet::from([node.id.clone()]);
    let mut parent_id = node.parent_id.clone();
    let mut parent: Option<DocumentNode> = None;
    while let Some(id) = parent_id {
        if !visited.insert(id.clone()) || path.len() >= MAX_PATH_HOPS {
            tracing::warn!(node_id, at = %id, "cycle or runaway path in node ancestry");
            break;
        }
        let ancestor = match store
            .get_node(&id)
            .await
            .map_err(|e| EngineError::persistence(&node.batch_id, node.hierarchy_level, e))?
        {
            Some(n) => n,
            None => break,
        };
        if parent.is_none() {
            parent = Some(ancestor.clone());
        }
        path.push(PathEntry {
            id: ancestor.id.clone(),
            hierarchy_level: ancestor.hierarchy_level,
            summary_preview: preview(ancestor.text(), PATH_PREVIEW_CHARS),
        });
        parent_id = ancestor.parent_id;
    }
    path.reverse();

    let position_in_parent = parent
        .as_ref()
        .and_then(|p| p.child_ids.iter().position(|c| *c == node.id));

    let siblings = match (&parent, include_siblings) {
        (Some(parent), true) => {
            let mut siblings = Vec::with_capacity(parent.child_ids.len());
            for (position, id) in parent.child_ids.iter().enumerate() {
                let summary_preview = if *id == node.id {
                    preview(node.text(), TREE_PREVIEW_CHARS)
                } else {
                    match store
                        .get_node(id)
                        .await
                        .map_err(|e| EngineError::persistence(&node.batch_id, node.hierarchy_level, e))?
                    {
                        Some(sibling) => preview(sibling.text(), TREE_PREVIEW_CHARS),
                        None => continue,
                    }
                };
                siblings.push(Sibling {
                    id: id.clone(),
                    position,
                    summary_preview,
                    is_self: *id == node.id,
                });
            }
            Some(siblings)
        }
        (None, true) => Some(Vec::new()),
        (_, false) => None,
    };

    Ok(NodeContext {
        navigation: Navigation::of(&node),
        node,
        path,
        siblings,
        position_in_parent,
    })
}

async fn get_node(store: &dyn NodeStore, node_id: &str) -> Result<DocumentNode, EngineError> {
    store
        .get_node(node_id)
        .await
        .map_err(|e| EngineError::persistence("*", 0, e))?
        .ok_or_else(|| EngineError::NotFound(format!("node {}", node_id)))
}

// ============ CLI printers ============

pub async fn run_status(store: &dyn NodeStore, batch_id: &str) -> anyhow::Result<()> {
    let status = batch_status(store, batch_id).await?;
    print_status(&status);
    Ok(())
}

pub async fn run_batches(store: &dyn NodeStore) -> anyhow::Result<()> {
    let batches = list_batches(store).await?;
    if batches.is_empty() {
        println!("No batches.");
        return Ok(());
    }
    println!(
        "{:<38} {:<11} {:>5} {:>9}  CREATED",
        "BATCH", "STATUS", "LEVEL", "CHUNKS"
    );
    for b in &batches {
        println!(
            "{:<38} {:<11} {:>5} {:>9}  {}",
            b.batch_id,
            b.status,
            b.current_level,
            format!("{}/{}", b.processed_documents, b.total_documents),
            format_ts_iso(b.created_at)
        );
    }
    Ok(())
}

pub async fn run_tree(
    store: &dyn NodeStore,
    batch_id: &str,
    options: TreeOptions,
    json: bool,
) -> anyhow::Result<()> {
    let tree = batch_tree(store, batch_id, options).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tree)?);
        return Ok(());
    }
    println!(
        "batch {}  status {}  nodes {}  roots {}  levels {}",
        tree.batch_id,
        tree.status.status,
        tree.stats.total_nodes,
        tree.stats.root_count,
        tree.stats.max_depth_found + 1
    );
    for root in &tree.roots {
        print_tree_node(root, 0);
    }
    if tree.stats.truncated {
        println!("(truncated at depth {}; use --max-depth)", options.max_depth);
    }
    Ok(())
}

fn print_tree_node(node: &TreeNode, indent: usize) {
    let flag = if node.fallback { " [fallback]" } else { "" };
    println!(
        "{}L{}#{} {}{}  {}",
        "  ".repeat(indent),
        node.hierarchy_level,
        node.position,
        node.id,
        flag,
        preview(&node.summary_preview, 80).replace('\n', " ")
    );
    for child in &node.children {
        print_tree_node(child, indent + 1);
    }
    if node.children_truncated {
        println!("{}  ...", "  ".repeat(indent));
    }
}

pub async fn run_final(store: &dyn NodeStore, batch_id: &str) -> anyhow::Result<()> {
    let summary = final_summary(store, batch_id).await?;
    println!("--- Final summary ---");
    println!("batch:     {}", summary.batch_id);
    println!("root:      {}", summary.root.id);
    println!("depth:     {}", summary.root.hierarchy_level);
    println!("nodes:     {}", summary.stats.total_nodes);
    println!("fallbacks: {}", summary.stats.fallback_nodes);
    println!();
    println!("{}", summary.root.summary);
    Ok(())
}

pub async fn run_node(
    store: &dyn NodeStore,
    node_id: &str,
    include_siblings: bool,
) -> anyhow::Result<()> {
    let ctx = node_context(store, node_id, include_siblings).await?;
    println!("--- Node ---");
    println!("id:       {}", ctx.node.id);
    println!("batch:    {}", ctx.node.batch_id);
    println!("level:    {}", ctx.node.hierarchy_level);
    println!("position: {}", ctx.node.position);
    println!("metadata: {}", serde_json::Value::Object(ctx.node.metadata.clone()));
    println!();
    if !ctx.path.is_empty() {
        println!("--- Path ---");
        for entry in &ctx.path {
            println!("L{} {}  {}", entry.hierarchy_level, entry.id, entry.summary_preview);
        }
        println!();
    }
    if let Some(siblings) = &ctx.siblings {
        println!("--- Siblings ({}) ---", siblings.len());
        for s in siblings {
            let marker = if s.is_self { "*" } else { " " };
            println!("{}{} {}  {}", marker, s.position, s.id, s.summary_preview);
        }
        println!();
    }
    println!("--- Summary ---");
    println!("{}", ctx.node.summary);
    if !ctx.node.content.is_empty() {
        println!();
        println!("--- Content ---");
        println!("{}", ctx.node.content);
    }
    Ok(())
}

fn print_status(status: &ProcessingStatus) {
    println!("batch:      {}", status.batch_id);
    println!("status:     {}", status.status);
    println!("level:      {}", status.current_level);
    println!(
        "chunks:     {} / {}",
        status.processed_documents, status.total_documents
    );
    if let Some(root) = &status.root_id {
        println!("root:       {}", root);
    }
    if let Some(err) = &status.error_message {
        println!("error:      {}", err);
    }
    println!("created_at: {}", format_ts_iso(status.created_at));
    if let Some(ts) = status.completed_at {
        println!("completed:  {}", format_ts_iso(ts));
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

//! Level-by-level reduction of chunks into a single root summary.
//!
//! The builder drives one batch through its state machine:
//!
//! ```text
//! Level(0): summarize every chunk ─► write level 0 ─► status.current_level = 0
//! Level(n): one node left?  ─► root, status = completed
//!           otherwise group consecutive nodes, summarize each group,
//!           write level n+1 (links children) ─► status.current_level = n+1
//! ```
//!
//! Groups at one level are independent and are summarized concurrently,
//! bounded by a semaphore shared across batches. Results are slotted by
//! group index, so the tree shape only depends on level-0 order, never on
//! which model call finishes first.
//!
//! A level is written in one store call and the status only advances after
//! that write succeeds, so a failed write never leaves a phantom level.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use summary_tree_core::models::{BatchStatus, DocumentNode, Metadata, StatusUpdate};
use summary_tree_core::store::NodeStore;
use summary_tree_core::tokens::TokenEstimator;

use crate::error::EngineError;
use crate::invoke::{InvokeOutcome, ResilientInvoker};
use crate::progress::{BuildProgressEvent, BuildProgressReporter, NoProgress};

/// Reduction settings, built from `[engine]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    /// Nodes merged per group. Values below 2 are treated as 2.
    pub group_size: usize,
    /// Concurrent model calls allowed across all batches of one builder.
    pub max_concurrency: usize,
    pub separator: String,
    /// Store the concatenated merge input as the content of merge nodes.
    pub keep_merge_input: bool,
    pub chars_per_token: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            group_size: 2,
            max_concurrency: 3,
            separator: "\n\n---\n\n".to_string(),
            keep_merge_input: false,
            chars_per_token: 4,
        }
    }
}

/// Explicit cancellation plus an optional deadline.
///
/// Clones share the same flag; cancelling one cancels all.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also trips once `timeout` has elapsed from now.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
            ..Self::default()
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline_passed()
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn reason(&self) -> &'static str {
        if self.flag.load(Ordering::SeqCst) {
            "cancelled by caller"
        } else {
            "batch timeout exceeded"
        }
    }

    /// Resolves once the token is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            match self.deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// Partition `count` nodes into consecutive groups of `group_size`.
///
/// Strictly left to right; the last group may be shorter.
pub fn plan_merge_groups(count: usize, group_size: usize) -> Vec<Range<usize>> {
    let size = group_size.max(2);
    (0..count)
        .step_by(size)
        .map(|start| start..(start + size).min(count))
        .collect()
}

/// A level-0 chunk handed to the builder.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafInput {
    pub content: String,
    pub token_count: usize,
    pub metadata: Metadata,
}

/// Prompts and content budget for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPrompts {
    pub summary_prompt: String,
    pub context_prompt: String,
    /// Tokens of content a single model call may carry.
    pub content_budget: usize,
}

/// What a finished build produced.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub root: DocumentNode,
    /// Level of the root.
    pub depth: u32,
    pub leaf_count: usize,
    /// Nodes whose summary was synthesized after the model failed.
    pub fallback_count: usize,
}

struct Job {
    prompt: String,
    input: String,
}

pub struct HierarchyBuilder {
    store: Arc<dyn NodeStore>,
    invoker: Arc<ResilientInvoker>,
    settings: BuildSettings,
    limiter: Arc<Semaphore>,
    progress: Arc<dyn BuildProgressReporter>,
}

impl HierarchyBuilder {
    pub fn new(
        store: Arc<dyn NodeStore>,
        invoker: Arc<ResilientInvoker>,
        settings: BuildSettings,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));
        Self {
            store,
            invoker,
            settings,
            limiter,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn BuildProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    fn estimator(&self) -> TokenEstimator {
        TokenEstimator::new(self.settings.chars_per_token)
    }

    /// Reduce `leaves` to a single root, persisting every level.
    ///
    /// The batch must exist and be `processing`. On error the batch is left
    /// as is; the caller marks it failed.
    pub async fn build(
        &self,
        batch_id: &str,
        leaves: Vec<LeafInput>,
        prompts: &BuildPrompts,
        cancel: &CancelToken,
    ) -> Result<BuildOutcome, EngineError> {
        if leaves.is_empty() {
            return Err(EngineError::EmptyInput);
        }
        let leaf_count = leaves.len();
        let total = leaf_count as u64;

        self.store
            .update_status(
                batch_id,
                &StatusUpdate {
                    current_level: Some(0),
                    total_documents: Some(total),
                    processed_documents: Some(0),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EngineError::persistence(batch_id, 0, e))?;

        // Level 0: one summary per chunk.
        let jobs = leaves
            .iter()
            .map(|leaf| Job {
                prompt: prompts.summary_prompt.clone(),
                input: leaf.content.clone(),
            })
            .collect();
        let outcomes = self.run_jobs(batch_id, 0, jobs, cancel).await?;
        let mut fallback_count = outcomes.iter().filter(|o| o.fallback).count();

        let now = chrono::Utc::now().timestamp();
        let level0: Vec<DocumentNode> = leaves
            .into_iter()
            .zip(outcomes)
            .enumerate()
            .map(|(position, (leaf, outcome))| {
                let mut metadata = leaf.metadata;
                record_outcome(&mut metadata, &outcome, leaf.token_count);
                DocumentNode {
                    id: uuid::Uuid::new_v4().to_string(),
                    batch_id: batch_id.to_string(),
                    hierarchy_level: 0,
                    position: position as u32,
                    content: leaf.content,
                    summary: outcome.text,
                    parent_id: None,
                    child_ids: Vec::new(),
                    token_count: leaf.token_count as u64,
                    metadata,
                    created_at: now,
                }
            })
            .collect();

        self.persist_level(batch_id, 0, &level0, cancel).await?;
        self.store
            .update_status(
                batch_id,
                &StatusUpdate {
                    processed_documents: Some(total),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EngineError::persistence(batch_id, 0, e))?;

        let mut level = 0u32;
        let mut nodes = level0;
        while nodes.len() > 1 {
            let (next, fallbacks) = self.merge_level(batch_id, level, &nodes, prompts, cancel).await?;
            fallback_count += fallbacks;
            level += 1;
            self.persist_level(batch_id, level, &next, cancel).await?;
            self.store
                .update_status(batch_id, &StatusUpdate::level(level))
                .await
                .map_err(|e| EngineError::persistence(batch_id, level, e))?;

            nodes = self
                .store
                .read_level(batch_id, level)
                .await
                .map_err(|e| EngineError::persistence(batch_id, level, e))?;
            if nodes.len() != next.len() {
                return Err(EngineError::Persistence {
                    batch_id: batch_id.to_string(),
                    level,
                    cause: format!(
                        "read back {} nodes after writing {}",
                        nodes.len(),
                        next.len()
                    ),
                });
            }
        }

        let root = nodes.pop().ok_or_else(|| EngineError::Persistence {
            batch_id: batch_id.to_string(),
            level,
            cause: "no nodes at final level".to_string(),
        })?;

        self.store
            .update_status(
                batch_id,
                &StatusUpdate {
                    status: Some(BatchStatus::Completed),
                    root_id: Some(root.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EngineError::persistence(batch_id, level, e))?;

        tracing::info!(
            batch_id,
            depth = level,
            leaves = leaf_count,
            fallbacks = fallback_count,
            "batch completed"
        );
        self.progress.report(BuildProgressEvent::Finished {
            batch_id: batch_id.to_string(),
            depth: level,
            fallbacks: fallback_count as u64,
        });

        Ok(BuildOutcome {
            root,
            depth: level,
            leaf_count,
            fallback_count,
        })
    }

    /// Build the nodes of level `level + 1` from `nodes`. Returns the new
    /// nodes and how many of them are fallbacks.
    async fn merge_level(
        &self,
        batch_id: &str,
        level: u32,
        nodes: &[DocumentNode],
        prompts: &BuildPrompts,
        cancel: &CancelToken,
    ) -> Result<(Vec<DocumentNode>, usize), EngineError> {
        let target = level + 1;
        let groups = plan_merge_groups(nodes.len(), self.settings.group_size);
        let final_merge = groups.len() == 1;
        tracing::info!(batch_id, level = target, groups = groups.len(), "merging level");

        let estimator = self.estimator();
        let mut jobs = Vec::new();
        let mut inputs = Vec::with_capacity(groups.len());
        for group in &groups {
            let members = &nodes[group.clone()];
            if members.len() == 1 {
                inputs.push(None);
                continue;
            }
            let joined = members
                .iter()
                .map(|n| n.text())
                .collect::<Vec<_>>()
                .join(&self.settings.separator);
            let input_tokens = estimator.estimate(&joined);
            let truncated = input_tokens > prompts.content_budget;
            let input = if truncated {
                tracing::warn!(
                    batch_id,
                    level = target,
                    input_tokens,
                    budget = prompts.content_budget,
                    "merge input exceeds content budget; truncating"
                );
                estimator.truncate_to(&joined, prompts.content_budget)
            } else {
                joined
            };
            jobs.push(Job {
                prompt: merge_prompt(prompts, members.len(), target, final_merge),
                input: input.clone(),
            });
            inputs.push(Some((input, input_tokens, truncated)));
        }

        let mut outcomes = self.run_jobs(batch_id, target, jobs, cancel).await?.into_iter();
        let mut fallbacks = 0usize;
        let now = chrono::Utc::now().timestamp();
        let mut next = Vec::with_capacity(groups.len());

        for (position, (group, input)) in groups.iter().zip(inputs).enumerate() {
            let members = &nodes[group.clone()];
            let child_ids: Vec<String> = members.iter().map(|n| n.id.clone()).collect();
            let mut metadata = Metadata::new();

            let (content, summary) = match input {
                None => {
                    let child = &members[0];
                    metadata.insert("summary_source".into(), json!("promoted"));
                    metadata.insert("fallback".into(), json!(child.is_fallback()));
                    metadata.insert("attempts".into(), json!(0));
                    metadata.insert("retries".into(), json!(0));
                    (String::new(), child.text().to_string())
                }
                Some((input, input_tokens, truncated)) => {
                    let outcome = outcomes.next().ok_or_else(|| EngineError::Worker {
                        batch_id: batch_id.to_string(),
                        level: target,
                        cause: "missing merge result".to_string(),
                    })?;
                    if outcome.fallback {
                        fallbacks += 1;
                    }
                    record_outcome(&mut metadata, &outcome, input_tokens);
                    metadata.insert("input_truncated".into(), json!(truncated));
                    let content = if self.settings.keep_merge_input {
                        input
                    } else {
                        String::new()
                    };
                    (content, outcome.text)
                }
            };
            metadata.insert("child_count".into(), json!(child_ids.len()));

            next.push(DocumentNode {
                id: uuid::Uuid::new_v4().to_string(),
                batch_id: batch_id.to_string(),
                hierarchy_level: target,
                position: position as u32,
                token_count: estimator.estimate(&summary) as u64,
                content,
                summary,
                parent_id: None,
                child_ids,
                metadata,
                created_at: now,
            });
        }

        Ok((next, fallbacks))
    }

    async fn persist_level(
        &self,
        batch_id: &str,
        level: u32,
        nodes: &[DocumentNode],
        cancel: &CancelToken,
    ) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(cancelled(batch_id, level, cancel));
        }
        self.store
            .write_nodes(batch_id, nodes)
            .await
            .map_err(|e| EngineError::persistence(batch_id, level, e))
    }

    /// Run `jobs` through the invoker with bounded concurrency. Results are
    /// returned in job order.
    async fn run_jobs(
        &self,
        batch_id: &str,
        level: u32,
        jobs: Vec<Job>,
        cancel: &CancelToken,
    ) -> Result<Vec<InvokeOutcome>, EngineError> {
        let total = jobs.len();
        if cancel.is_cancelled() {
            return Err(cancelled(batch_id, level, cancel));
        }
        if total == 0 {
            return Ok(Vec::new());
        }

        let mut set = JoinSet::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let limiter = self.limiter.clone();
            let invoker = self.invoker.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let _permit = limiter.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                Some((index, invoker.invoke(&job.prompt, &job.input).await))
            });
        }

        let mut slots: Vec<Option<InvokeOutcome>> = vec![None; total];
        let mut done = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    set.abort_all();
                    tracing::warn!(batch_id, level, reason = cancel.reason(), "batch cancelled");
                    return Err(cancelled(batch_id, level, cancel));
                }
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(Some((index, outcome)))) => {
                        slots[index] = Some(outcome);
                        done += 1;
                        self.progress.report(BuildProgressEvent::Level {
                            batch_id: batch_id.to_string(),
                            level,
                            done,
                            total: total as u64,
                        });
                    }
                    Some(Ok(None)) => {}
                    Some(Err(err)) => {
                        set.abort_all();
                        return Err(EngineError::Worker {
                            batch_id: batch_id.to_string(),
                            level,
                            cause: err.to_string(),
                        });
                    }
                },
            }
        }

        slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| cancelled(batch_id, level, cancel))
    }
}

fn cancelled(batch_id: &str, level: u32, cancel: &CancelToken) -> EngineError {
    EngineError::Cancelled {
        batch_id: batch_id.to_string(),
        level,
        reason: cancel.reason().to_string(),
    }
}

fn merge_prompt(prompts: &BuildPrompts, sections: usize, target: u32, final_merge: bool) -> String {
    let instruction = if final_merge {
        format!(
            "Combine the {} section summaries below into the final summary of the whole material.",
            sections
        )
    } else {
        format!(
            "Combine the {} section summaries below into one summary for level {}.",
            sections, target
        )
    };
    format!(
        "{}\n\n{}\n\n{}",
        prompts.context_prompt, prompts.summary_prompt, instruction
    )
}

fn record_outcome(metadata: &mut Metadata, outcome: &InvokeOutcome, input_tokens: usize) {
    metadata.insert("summary_source".into(), json!(outcome.source()));
    metadata.insert("fallback".into(), json!(outcome.fallback));
    metadata.insert("attempts".into(), json!(outcome.attempts));
    metadata.insert("retries".into(), json!(outcome.retries));
    metadata.insert(
        "response_shape".into(),
        outcome.shape.map_or(Value::Null, |s| json!(s)),
    );
    metadata.insert(
        "last_error".into(),
        outcome.last_error.as_ref().map_or(Value::Null, |e| json!(e)),
    );
    metadata.insert("input_tokens".into(), json!(input_tokens));
}

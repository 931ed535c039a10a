//! Engine entry point: request in, root summary out.
//!
//! [`Engine::summarize`] validates the request, creates the batch, chunks
//! every document into level-0 leaves and hands them to the
//! [`HierarchyBuilder`]. Structural failures after the batch exists
//! (budget, persistence, cancellation) mark the batch `failed` with the
//! cause before the error is returned; lower levels already written stay
//! in the store for inspection.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use summary_tree_core::chunk::Chunker;
use summary_tree_core::error::{ChunkError, StoreError};
use summary_tree_core::models::{ProcessingStatus, SourceDocument, StatusUpdate};
use summary_tree_core::store::NodeStore;

use crate::config::{Config, PromptConfig};
use crate::error::EngineError;
use crate::hierarchy::{BuildPrompts, CancelToken, HierarchyBuilder, LeafInput};
use crate::invoke::ResilientInvoker;
use crate::llm::{create_model, InvokeOptions, LanguageModel};
use crate::progress::{BuildProgressEvent, BuildProgressReporter, NoProgress};

const MAX_BATCH_ID_LEN: usize = 128;

/// Input to one batch. Either `text` (alias `content`) or `documents`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummarizeRequest {
    #[serde(default)]
    pub documents: Vec<SourceDocument>,
    #[serde(default, alias = "content")]
    pub text: Option<String>,
    #[serde(default)]
    pub summary_prompt: Option<String>,
    #[serde(default)]
    pub context_prompt: Option<String>,
    #[serde(default)]
    pub token_budget: Option<usize>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

impl SummarizeRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn documents(documents: Vec<SourceDocument>) -> Self {
        Self {
            documents,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizeResponse {
    pub batch_id: String,
    pub final_summary: String,
    /// Number of level-0 chunks.
    pub total_documents: u64,
    /// Level of the root node.
    pub hierarchy_depth: u32,
    pub processing_complete: bool,
    pub root_id: String,
    pub fallback_count: u64,
}

pub struct Engine {
    store: Arc<dyn NodeStore>,
    builder: HierarchyBuilder,
    chunker: Chunker,
    prompts: PromptConfig,
    batch_timeout: Option<Duration>,
    progress: Arc<dyn BuildProgressReporter>,
}

impl Engine {
    /// Engine over `store` with the model selected by `config.model`.
    pub fn from_config(config: &Config, store: Arc<dyn NodeStore>) -> Result<Self> {
        let model = create_model(&config.model)?;
        Ok(Self::with_model(config, store, model))
    }

    /// Engine over `store` and an explicit model; every other setting comes
    /// from `config`.
    pub fn with_model(
        config: &Config,
        store: Arc<dyn NodeStore>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let invoker = ResilientInvoker::new(model, config.model.retry_policy())
            .with_options(InvokeOptions::from(&config.model))
            .with_fallback_chars(config.engine.fallback_chars);
        let builder =
            HierarchyBuilder::new(store.clone(), Arc::new(invoker), config.engine.build_settings());
        Self {
            store,
            builder,
            chunker: Chunker::new(config.engine.chunker_settings()),
            prompts: config.prompts.clone(),
            batch_timeout: config.engine.batch_timeout(),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn BuildProgressReporter>) -> Self {
        self.builder = self.builder.with_progress(progress.clone());
        self.progress = progress;
        self
    }

    pub fn store(&self) -> Arc<dyn NodeStore> {
        self.store.clone()
    }

    /// A fresh cancel token carrying the configured batch timeout.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::with_timeout(self.batch_timeout)
    }

    /// Run one batch to completion under the configured batch timeout.
    pub async fn summarize(
        &self,
        request: SummarizeRequest,
    ) -> Result<SummarizeResponse, EngineError> {
        self.summarize_with_cancel(request, self.cancel_token()).await
    }

    /// Run one batch, stopping early when `cancel` trips.
    pub async fn summarize_with_cancel(
        &self,
        request: SummarizeRequest,
        cancel: CancelToken,
    ) -> Result<SummarizeResponse, EngineError> {
        let documents = collect_documents(&request)?;
        let token_budget = request.token_budget.unwrap_or(self.prompts.token_budget);
        if token_budget == 0 {
            return Err(EngineError::InvalidRequest(
                "token_budget must be > 0".to_string(),
            ));
        }
        let summary_prompt = request
            .summary_prompt
            .clone()
            .unwrap_or_else(|| self.prompts.summary_prompt.clone());
        let context_prompt = request
            .context_prompt
            .clone()
            .unwrap_or_else(|| self.prompts.context_prompt.clone());

        let batch_id = match &request.batch_id {
            Some(id) => validate_batch_id(id)?,
            None => uuid::Uuid::new_v4().to_string(),
        };

        self.open_batch(&batch_id).await?;

        match self
            .run(&batch_id, &documents, summary_prompt, context_prompt, token_budget, &cancel)
            .await
        {
            Ok(response) => Ok(response),
            Err(err) => {
                self.mark_failed(&batch_id, &err).await;
                Err(err)
            }
        }
    }

    /// Insert the batch row already in `processing`. The store's unique
    /// key decides races between requests for the same id.
    async fn open_batch(&self, batch_id: &str) -> Result<(), EngineError> {
        let now = chrono::Utc::now().timestamp();
        self.store
            .create_batch(&ProcessingStatus::started(batch_id, now))
            .await
            .map_err(|e| {
                if let Some(StoreError::BatchExists(id)) = e.downcast_ref::<StoreError>() {
                    return EngineError::BatchExists(id.clone());
                }
                EngineError::persistence(batch_id, 0, e)
            })?;
        tracing::info!(batch_id, "batch started");
        Ok(())
    }

    async fn run(
        &self,
        batch_id: &str,
        documents: &[SourceDocument],
        summary_prompt: String,
        context_prompt: String,
        token_budget: usize,
        cancel: &CancelToken,
    ) -> Result<SummarizeResponse, EngineError> {
        let overhead = format!("{}\n\n{}", context_prompt, summary_prompt);
        let budget_error = |source: ChunkError| EngineError::BudgetTooSmall {
            batch_id: batch_id.to_string(),
            source,
        };
        let content_budget = self
            .chunker
            .content_budget(&overhead, token_budget)
            .map_err(budget_error)?;

        let mut leaves = Vec::new();
        for (document_index, document) in documents.iter().enumerate() {
            let chunks = match self.chunker.chunk(&document.content, &overhead, token_budget) {
                Ok(chunks) => chunks,
                Err(ChunkError::EmptyInput) => continue,
                Err(err) => return Err(budget_error(err)),
            };
            for chunk in chunks {
                let mut metadata = document.metadata.clone();
                metadata.insert("document_index".into(), json!(document_index));
                metadata.insert("chunk_index".into(), json!(chunk.index));
                metadata.insert("chunk_hash".into(), json!(chunk.hash));
                leaves.push(LeafInput {
                    content: chunk.content,
                    token_count: chunk.token_count,
                    metadata,
                });
            }
        }
        if leaves.is_empty() {
            return Err(EngineError::EmptyInput);
        }

        tracing::info!(
            batch_id,
            documents = documents.len(),
            chunks = leaves.len(),
            content_budget,
            "input chunked"
        );
        self.progress.report(BuildProgressEvent::Chunked {
            batch_id: batch_id.to_string(),
            chunks: leaves.len() as u64,
        });

        let prompts = BuildPrompts {
            summary_prompt,
            context_prompt,
            content_budget,
        };
        let outcome = self.builder.build(batch_id, leaves, &prompts, cancel).await?;

        Ok(SummarizeResponse {
            batch_id: batch_id.to_string(),
            final_summary: outcome.root.summary.clone(),
            total_documents: outcome.leaf_count as u64,
            hierarchy_depth: outcome.depth,
            processing_complete: true,
            root_id: outcome.root.id,
            fallback_count: outcome.fallback_count as u64,
        })
    }

    async fn mark_failed(&self, batch_id: &str, err: &EngineError) {
        tracing::error!(batch_id, code = err.code(), error = %err, "batch failed");
        if let Err(update_err) = self
            .store
            .update_status(batch_id, &StatusUpdate::failed(err.to_string()))
            .await
        {
            tracing::error!(batch_id, error = %update_err, "could not mark batch failed");
        }
    }
}

/// Documents with extractable text. Fails with `EmptyInput` when none
/// remain, before any batch is created.
fn collect_documents(request: &SummarizeRequest) -> Result<Vec<SourceDocument>, EngineError> {
    if request.text.is_some() && !request.documents.is_empty() {
        return Err(EngineError::InvalidRequest(
            "provide either text or documents, not both".to_string(),
        ));
    }
    let documents: Vec<SourceDocument> = match &request.text {
        Some(text) => vec![SourceDocument::new(text.clone())],
        None => request.documents.clone(),
    };
    let documents: Vec<SourceDocument> = documents
        .into_iter()
        .filter(|d| !d.content.trim().is_empty())
        .collect();
    if documents.is_empty() {
        return Err(EngineError::EmptyInput);
    }
    Ok(documents)
}

fn validate_batch_id(id: &str) -> Result<String, EngineError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(EngineError::InvalidRequest("batch_id must not be empty".into()));
    }
    if id.len() > MAX_BATCH_ID_LEN {
        return Err(EngineError::InvalidRequest(format!(
            "batch_id longer than {} bytes",
            MAX_BATCH_ID_LEN
        )));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control() || c == '/') {
        return Err(EngineError::InvalidRequest(
            "batch_id must not contain whitespace or '/'".into(),
        ));
    }
    Ok(id.to_string())
}

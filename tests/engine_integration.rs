//! End-to-end engine behavior against SQLite and in-memory stores with
//! stub language models.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use summary_tree::config::{self, Config};
use summary_tree::engine::{Engine, SummarizeRequest};
use summary_tree::error::{EngineError, InvokeError};
use summary_tree::hierarchy::CancelToken;
use summary_tree::llm::{ChatMessage, InvokeOptions, LanguageModel, MockModel};
use summary_tree::sqlite_store::SqliteStore;
use summary_tree_core::models::{
    BatchStatus, DocumentNode, ProcessingStatus, SourceDocument, StatusUpdate,
};
use summary_tree_core::store::memory::InMemoryStore;
use summary_tree_core::store::NodeStore;
use summary_tree_core::tokens::TokenEstimator;

const E2E_TEXT: &str =
    "Dr. Smith met Mr. Jones at 3 p.m. They signed the contract. The deal closed in March.";

// ─── Helpers ────────────────────────────────────────────────────────

fn test_config(tmp: &TempDir) -> Config {
    let content = format!(
        r#"
[db]
path = "{}"

[engine]
safety_margin = 10
min_content_tokens = 8
max_concurrency = 3

[model]
provider = "mock"
max_attempts = 3
timeout_secs = 1
backoff_base_ms = 1
backoff_max_ms = 5

[prompts]
summary_prompt = "Summarize."
context_prompt = "Context."
token_budget = 64
"#,
        tmp.path().join("sumtree.sqlite").display()
    );
    let cfg: Config = toml::from_str(&content).unwrap();
    config::validate(&cfg).unwrap();
    cfg
}

async fn sqlite_store(cfg: &Config) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(cfg).await.unwrap())
}

fn user_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn ceil_log2(n: usize) -> u32 {
    let mut levels = 0;
    let mut width = 1;
    while width < n {
        width *= 2;
        levels += 1;
    }
    levels
}

/// Checks the structural invariants of a finished tree and returns its root.
async fn assert_well_formed(store: &dyn NodeStore, batch_id: &str, leaves: usize) -> DocumentNode {
    let nodes = store.read_batch(batch_id).await.unwrap();
    assert!(nodes.iter().all(|n| n.batch_id == batch_id));

    let roots: Vec<&DocumentNode> = nodes.iter().filter(|n| n.parent_id.is_none()).collect();
    assert_eq!(roots.len(), 1, "expected exactly one root");
    assert_eq!(nodes.iter().filter(|n| n.hierarchy_level == 0).count(), leaves);

    for node in &nodes {
        for child_id in &node.child_ids {
            let child = nodes.iter().find(|n| &n.id == child_id).expect("child exists");
            assert_eq!(child.parent_id.as_deref(), Some(node.id.as_str()));
            assert_eq!(child.hierarchy_level + 1, node.hierarchy_level);
        }
        if let Some(parent_id) = &node.parent_id {
            let parent = nodes.iter().find(|n| &n.id == parent_id).expect("parent exists");
            assert!(parent.child_ids.contains(&node.id));
        }
        if node.hierarchy_level == 0 {
            assert!(node.child_ids.is_empty());
            assert!(!node.content.is_empty());
        }
        assert!(!node.summary.is_empty());
    }
    roots[0].clone()
}

// ─── Stub models ────────────────────────────────────────────────────

/// Fails the first `fail_first` calls with a 503, then answers.
struct FlakyModel {
    calls: AtomicU32,
    fail_first: u32,
}

#[async_trait]
impl LanguageModel for FlakyModel {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn invoke(
        &self,
        messages: &[ChatMessage],
        _options: &InvokeOptions,
    ) -> Result<Value, InvokeError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return Err(InvokeError::Http {
                status: 503,
                body: "overloaded".into(),
            });
        }
        Ok(json!({ "content": [{ "type": "text", "text": format!("Recovered: {}", user_text(messages)) }] }))
    }
}

struct AlwaysFailingModel;

#[async_trait]
impl LanguageModel for AlwaysFailingModel {
    fn name(&self) -> &str {
        "failing"
    }

    async fn invoke(
        &self,
        _messages: &[ChatMessage],
        _options: &InvokeOptions,
    ) -> Result<Value, InvokeError> {
        Ok(json!({ "unexpected": true }))
    }
}

struct SlowModel {
    delay: Duration,
}

#[async_trait]
impl LanguageModel for SlowModel {
    fn name(&self) -> &str {
        "slow"
    }

    async fn invoke(
        &self,
        _messages: &[ChatMessage],
        _options: &InvokeOptions,
    ) -> Result<Value, InvokeError> {
        tokio::time::sleep(self.delay).await;
        Ok(json!("too late"))
    }
}

/// Records the highest number of concurrent calls.
#[derive(Default)]
struct CountingModel {
    in_flight: AtomicUsize,
    max_seen: AtomicUsize,
}

#[async_trait]
impl LanguageModel for CountingModel {
    fn name(&self) -> &str {
        "counting"
    }

    async fn invoke(
        &self,
        messages: &[ChatMessage],
        _options: &InvokeOptions,
    ) -> Result<Value, InvokeError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "response": format!("Counted: {}", user_text(messages).len()) }))
    }
}

/// Echoes the user message back and keeps every input it was sent.
#[derive(Default)]
struct RecordingModel {
    inputs: Mutex<Vec<String>>,
}

#[async_trait]
impl LanguageModel for RecordingModel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn invoke(
        &self,
        messages: &[ChatMessage],
        _options: &InvokeOptions,
    ) -> Result<Value, InvokeError> {
        let text = user_text(messages);
        self.inputs.lock().unwrap().push(text.clone());
        Ok(json!({ "response": text }))
    }
}

/// Delegates to an in-memory store but refuses to write one level.
struct FailingWrites {
    inner: InMemoryStore,
    fail_level: u32,
}

#[async_trait]
impl NodeStore for FailingWrites {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }
    async fn create_batch(&self, status: &ProcessingStatus) -> Result<()> {
        self.inner.create_batch(status).await
    }
    async fn write_nodes(&self, batch_id: &str, nodes: &[DocumentNode]) -> Result<()> {
        if nodes.first().map(|n| n.hierarchy_level) == Some(self.fail_level) {
            anyhow::bail!("disk full");
        }
        self.inner.write_nodes(batch_id, nodes).await
    }
    async fn update_status(&self, batch_id: &str, update: &StatusUpdate) -> Result<ProcessingStatus> {
        self.inner.update_status(batch_id, update).await
    }
    async fn read_level(&self, batch_id: &str, level: u32) -> Result<Vec<DocumentNode>> {
        self.inner.read_level(batch_id, level).await
    }
    async fn read_batch(&self, batch_id: &str) -> Result<Vec<DocumentNode>> {
        self.inner.read_batch(batch_id).await
    }
    async fn get_status(&self, batch_id: &str) -> Result<Option<ProcessingStatus>> {
        self.inner.get_status(batch_id).await
    }
    async fn get_node(&self, id: &str) -> Result<Option<DocumentNode>> {
        self.inner.get_node(id).await
    }
    async fn list_batches(&self) -> Result<Vec<ProcessingStatus>> {
        self.inner.list_batches().await
    }
}

fn short_documents(n: usize) -> Vec<SourceDocument> {
    (0..n)
        .map(|i| SourceDocument::new(format!("Document number {} is short.", i)))
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn abbreviation_scenario_single_chunk() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    let engine = Engine::with_model(&cfg, store.clone(), Arc::new(MockModel));

    let response = engine.summarize(SummarizeRequest::text(E2E_TEXT)).await.unwrap();

    assert!(response.processing_complete);
    assert_eq!(response.total_documents, 1);
    assert_eq!(response.hierarchy_depth, 0);
    assert!(response.final_summary.starts_with("Summary: Dr. Smith met Mr. Jones at 3 p.m."));

    let leaves = store.read_level(&response.batch_id, 0).await.unwrap();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].content, E2E_TEXT);
    assert_eq!(leaves[0].id, response.root_id);
    assert_well_formed(store.as_ref(), &response.batch_id, 1).await;
}

#[tokio::test]
async fn abbreviation_scenario_two_chunks() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.engine.safety_margin = 40;
    let store = sqlite_store(&cfg).await;
    let engine = Engine::with_model(&cfg, store.clone(), Arc::new(MockModel));

    let response = engine.summarize(SummarizeRequest::text(E2E_TEXT)).await.unwrap();

    assert_eq!(response.total_documents, 2);
    assert_eq!(response.hierarchy_depth, 1);
    assert!(response.final_summary.starts_with("Summary: "));

    let leaves = store.read_level(&response.batch_id, 0).await.unwrap();
    assert_eq!(leaves[0].content, "Dr. Smith met Mr. Jones at 3 p.m. They signed the contract.");
    assert_eq!(leaves[1].content, "The deal closed in March.");

    let root = assert_well_formed(store.as_ref(), &response.batch_id, 2).await;
    assert_eq!(root.id, response.root_id);
    assert_eq!(root.child_ids, vec![leaves[0].id.clone(), leaves[1].id.clone()]);
    assert!(root.content.is_empty());
}

#[tokio::test]
async fn depth_is_ceil_log2_of_leaf_count() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    let engine = Engine::with_model(&cfg, store.clone(), Arc::new(MockModel));

    for n in 1..=9 {
        let response = engine
            .summarize(SummarizeRequest::documents(short_documents(n)))
            .await
            .unwrap();
        assert_eq!(response.total_documents, n as u64);
        assert_eq!(response.hierarchy_depth, ceil_log2(n), "n = {}", n);

        let root = assert_well_formed(store.as_ref(), &response.batch_id, n).await;
        assert_eq!(root.hierarchy_level, response.hierarchy_depth);

        let status = store.get_status(&response.batch_id).await.unwrap().unwrap();
        assert_eq!(status.status, BatchStatus::Completed);
        assert_eq!(status.current_level, response.hierarchy_depth);
        assert_eq!(status.total_documents, n as u64);
        assert_eq!(status.processed_documents, n as u64);
        assert_eq!(status.root_id.as_deref(), Some(root.id.as_str()));
        assert!(status.completed_at.is_some());
    }
}

#[tokio::test]
async fn leaf_metadata_carries_provenance() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    let engine = Engine::with_model(&cfg, store.clone(), Arc::new(MockModel));

    let docs = vec![
        SourceDocument::new("Alpha text is here.").with_metadata("source", "a.md"),
        SourceDocument::new("Beta text is here.").with_metadata("source", "b.md"),
    ];
    let response = engine.summarize(SummarizeRequest::documents(docs)).await.unwrap();

    let leaves = store.read_level(&response.batch_id, 0).await.unwrap();
    assert_eq!(leaves[1].metadata["source"], "b.md");
    assert_eq!(leaves[1].metadata["document_index"], 1);
    assert_eq!(leaves[1].metadata["chunk_index"], 0);
    assert_eq!(leaves[1].metadata["summary_source"], "model");
    assert_eq!(leaves[1].metadata["fallback"], false);
    assert_eq!(leaves[1].metadata["chunk_hash"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn flaky_model_recovers_with_two_retries() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    let model = Arc::new(FlakyModel {
        calls: AtomicU32::new(0),
        fail_first: 2,
    });
    let engine = Engine::with_model(&cfg, store.clone(), model.clone());

    let response = engine
        .summarize(SummarizeRequest::text("One short sentence."))
        .await
        .unwrap();

    assert_eq!(response.final_summary, "Recovered: One short sentence.");
    assert_eq!(response.fallback_count, 0);
    assert_eq!(model.calls.load(Ordering::SeqCst), 3);

    let root = store.get_node(&response.root_id).await.unwrap().unwrap();
    assert_eq!(root.metadata["retries"], 2);
    assert_eq!(root.metadata["attempts"], 3);
    assert_eq!(root.metadata["fallback"], false);
    assert_eq!(root.metadata["response_shape"], "content");
}

#[tokio::test]
async fn failing_model_yields_flagged_fallback() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    let engine = Engine::with_model(&cfg, store.clone(), Arc::new(AlwaysFailingModel));

    let response = engine
        .summarize(SummarizeRequest::documents(short_documents(3)))
        .await
        .unwrap();

    assert!(response.processing_complete);
    assert!(response.final_summary.starts_with("[fallback summary]"));
    // 3 leaves + 1 merged pair + the final merge; the promoted node is not a model call
    assert_eq!(response.fallback_count, 5);

    let status = store.get_status(&response.batch_id).await.unwrap().unwrap();
    assert_eq!(status.status, BatchStatus::Completed);

    let root = store.get_node(&response.root_id).await.unwrap().unwrap();
    assert!(root.is_fallback());
    assert_eq!(root.metadata["summary_source"], "fallback");
    assert_eq!(root.metadata["attempts"], 3);
    assert!(root.metadata["last_error"]
        .as_str()
        .unwrap()
        .contains("malformed"));
}

#[tokio::test]
async fn slow_model_times_out_and_falls_back() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.model.max_attempts = 2;
    let store = sqlite_store(&cfg).await;
    let engine = Engine::with_model(
        &cfg,
        store.clone(),
        Arc::new(SlowModel {
            delay: Duration::from_secs(5),
        }),
    );

    let response = engine
        .summarize(SummarizeRequest::text("A sentence that will never be summarized."))
        .await
        .unwrap();

    assert_eq!(response.fallback_count, 1);
    let root = store.get_node(&response.root_id).await.unwrap().unwrap();
    assert!(root.is_fallback());
    assert!(root.metadata["last_error"]
        .as_str()
        .unwrap()
        .contains("timed out"));
}

#[tokio::test]
async fn model_calls_respect_concurrency_bound() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.engine.max_concurrency = 2;
    let store = sqlite_store(&cfg).await;
    let model = Arc::new(CountingModel::default());
    let engine = Engine::with_model(&cfg, store.clone(), model.clone());

    let response = engine
        .summarize(SummarizeRequest::documents(short_documents(8)))
        .await
        .unwrap();

    assert_eq!(response.hierarchy_depth, 3);
    let max_seen = model.max_seen.load(Ordering::SeqCst);
    assert!((1..=2).contains(&max_seen), "max in flight was {}", max_seen);
}

#[tokio::test]
async fn persistence_failure_leaves_no_phantom_level() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = Arc::new(FailingWrites {
        inner: InMemoryStore::new(),
        fail_level: 1,
    });
    let engine = Engine::with_model(&cfg, store.clone(), Arc::new(MockModel));

    let mut request = SummarizeRequest::documents(short_documents(4));
    request.batch_id = Some("disk-full".into());
    let err = engine.summarize(request).await.unwrap_err();

    match &err {
        EngineError::Persistence { batch_id, level, cause } => {
            assert_eq!(batch_id, "disk-full");
            assert_eq!(*level, 1);
            assert!(cause.contains("disk full"));
        }
        other => panic!("expected persistence error, got {:?}", other),
    }

    let status = store.get_status("disk-full").await.unwrap().unwrap();
    assert_eq!(status.status, BatchStatus::Failed);
    assert_eq!(status.current_level, 0);
    assert!(status.error_message.unwrap().contains("disk full"));
    assert!(status.root_id.is_none());

    // Level 0 survives; level 1 was never written.
    assert_eq!(store.read_level("disk-full", 0).await.unwrap().len(), 4);
    assert!(store.read_level("disk-full", 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_batches_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    let engine_a = Engine::with_model(&cfg, store.clone(), Arc::new(MockModel));
    let engine_b = Engine::with_model(&cfg, store.clone(), Arc::new(MockModel));

    let (a, b) = tokio::join!(
        engine_a.summarize(SummarizeRequest::documents(short_documents(5))),
        engine_b.summarize(SummarizeRequest::documents(short_documents(6))),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.batch_id, b.batch_id);

    assert_well_formed(store.as_ref(), &a.batch_id, 5).await;
    assert_well_formed(store.as_ref(), &b.batch_id, 6).await;

    let ids_a: HashSet<String> = store
        .read_batch(&a.batch_id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    let ids_b: HashSet<String> = store
        .read_batch(&b.batch_id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert!(ids_a.is_disjoint(&ids_b));
    assert_eq!(store.list_batches().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_batches_share_one_database() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    let engine = Arc::new(Engine::with_model(&cfg, store.clone(), Arc::new(MockModel)));

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..24 {
        let engine = engine.clone();
        tasks.spawn(async move {
            let mut request = SummarizeRequest::documents(short_documents(9));
            request.batch_id = Some(format!("load-{}", i));
            engine.summarize(request).await
        });
    }
    let mut finished = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        finished.push(joined.unwrap().unwrap());
    }

    assert_eq!(finished.len(), 24);
    for response in &finished {
        assert_eq!(response.hierarchy_depth, 4);
        assert_well_formed(store.as_ref(), &response.batch_id, 9).await;
    }
    let batches = store.list_batches().await.unwrap();
    assert_eq!(batches.len(), 24);
    assert!(batches.iter().all(|b| b.status == BatchStatus::Completed));
}

async fn race_for_batch_id(cfg: &Config, store: Arc<dyn NodeStore>) {
    let engine = Engine::with_model(cfg, store.clone(), Arc::new(MockModel));
    let mut request = SummarizeRequest::documents(short_documents(3));
    request.batch_id = Some("contested".into());

    let (a, b) = tokio::join!(engine.summarize(request.clone()), engine.summarize(request));
    let (won, lost): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(|r| r.is_ok());
    assert_eq!(won.len(), 1);
    assert_eq!(lost.len(), 1);
    assert!(matches!(lost[0], Err(EngineError::BatchExists(ref id)) if id == "contested"));

    let status = store.get_status("contested").await.unwrap().unwrap();
    assert_eq!(status.status, BatchStatus::Completed);
    assert_well_formed(store.as_ref(), "contested", 3).await;
}

#[tokio::test]
async fn same_batch_id_race_has_one_winner_sqlite() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    race_for_batch_id(&cfg, store).await;
}

#[tokio::test]
async fn same_batch_id_race_has_one_winner_in_memory() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    race_for_batch_id(&cfg, Arc::new(InMemoryStore::new())).await;
}

#[tokio::test]
async fn oversized_merge_input_is_truncated_to_budget() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = Arc::new(InMemoryStore::new());
    let model = Arc::new(RecordingModel::default());
    let engine = Engine::with_model(&cfg, store.clone(), model.clone());

    // One sentence each, just under the 49-token content budget, so the
    // echoed leaf summaries overflow it once joined.
    let body = "alpha beta gamma delta ".repeat(7);
    let docs = vec![
        SourceDocument::new(format!("First {}.", body.trim())),
        SourceDocument::new(format!("Second {}.", body.trim())),
    ];
    let response = engine.summarize(SummarizeRequest::documents(docs)).await.unwrap();
    assert_eq!(response.total_documents, 2);
    assert_eq!(response.hierarchy_depth, 1);

    let root = store.get_node(&response.root_id).await.unwrap().unwrap();
    assert_eq!(root.metadata["input_truncated"], true);
    assert!(root.metadata["input_tokens"].as_u64().unwrap() > 49);

    let estimator = TokenEstimator::default();
    let inputs = model.inputs.lock().unwrap().clone();
    assert_eq!(inputs.len(), 3);
    for input in &inputs {
        assert!(estimator.estimate(input) <= 49, "input over budget: {}", input);
    }
    assert!(inputs[2].starts_with("First alpha"));
    assert!(!inputs[2].ends_with(&format!("Second {}.", body.trim())));
}

#[tokio::test]
async fn explicit_cancel_marks_batch_failed() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.model.timeout_secs = 60;
    let store = sqlite_store(&cfg).await;
    let engine = Engine::with_model(
        &cfg,
        store.clone(),
        Arc::new(SlowModel {
            delay: Duration::from_secs(30),
        }),
    );

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let mut request = SummarizeRequest::documents(short_documents(4));
    request.batch_id = Some("to-cancel".into());

    let run = async {
        let (result, _) = tokio::join!(engine.summarize_with_cancel(request, cancel), async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        result
    };
    let result = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("cancellation should stop the batch promptly");

    assert!(matches!(
        result,
        Err(EngineError::Cancelled { level: 0, .. })
    ));
    let status = store.get_status("to-cancel").await.unwrap().unwrap();
    assert_eq!(status.status, BatchStatus::Failed);
    assert!(status.error_message.unwrap().contains("cancelled"));
    assert!(store.read_batch("to-cancel").await.unwrap().is_empty());
}

#[tokio::test]
async fn batch_timeout_cancels() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = test_config(&tmp);
    cfg.model.timeout_secs = 60;
    cfg.engine.batch_timeout_secs = Some(1);
    let store = sqlite_store(&cfg).await;
    let engine = Engine::with_model(
        &cfg,
        store.clone(),
        Arc::new(SlowModel {
            delay: Duration::from_secs(30),
        }),
    );

    let err = engine
        .summarize(SummarizeRequest::text("Never finishes."))
        .await
        .unwrap_err();
    match err {
        EngineError::Cancelled { reason, .. } => assert_eq!(reason, "batch timeout exceeded"),
        other => panic!("expected cancellation, got {:?}", other),
    }
}

#[tokio::test]
async fn duplicate_batch_id_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    let engine = Engine::with_model(&cfg, store.clone(), Arc::new(MockModel));

    let mut request = SummarizeRequest::text("First run.");
    request.batch_id = Some("fixed".into());
    engine.summarize(request.clone()).await.unwrap();

    let err = engine.summarize(request).await.unwrap_err();
    assert!(matches!(err, EngineError::BatchExists(ref id) if id == "fixed"));
    assert_eq!(
        store.get_status("fixed").await.unwrap().unwrap().status,
        BatchStatus::Completed
    );
}

#[tokio::test]
async fn empty_input_creates_no_batch() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    let engine = Engine::with_model(&cfg, store.clone(), Arc::new(MockModel));

    let err = engine.summarize(SummarizeRequest::text(" \n\t ")).await.unwrap_err();
    assert!(matches!(err, EngineError::EmptyInput));
    assert!(store.list_batches().await.unwrap().is_empty());
}

#[tokio::test]
async fn budget_too_small_fails_batch() {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let store = sqlite_store(&cfg).await;
    let engine = Engine::with_model(&cfg, store.clone(), Arc::new(MockModel));

    let mut request = SummarizeRequest::text(E2E_TEXT);
    request.token_budget = Some(16);
    request.batch_id = Some("tiny".into());
    let err = engine.summarize(request).await.unwrap_err();
    assert!(matches!(err, EngineError::BudgetTooSmall { .. }));
    assert_eq!(err.code(), "budget_too_small");

    let status = store.get_status("tiny").await.unwrap().unwrap();
    assert_eq!(status.status, BatchStatus::Failed);
    assert!(store.read_batch("tiny").await.unwrap().is_empty());
}

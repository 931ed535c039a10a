//! # Summary Tree
//!
//! Hierarchical document summarization with a persisted provenance tree.
//!
//! Input documents are split into token-bounded, sentence-aligned chunks;
//! every chunk is summarized through a language model, and the summaries
//! are merged pairwise, level by level, until a single root summary
//! remains. Every node (which text produced which summary) is stored in
//! SQLite and can be browsed afterwards.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────────┐   ┌──────────┐
//! │  Input   │──▶│  Chunker  │──▶│  Hierarchy   │──▶│  SQLite  │
//! │ text/fs  │   │ (core)    │   │  Builder     │   │  nodes + │
//! └──────────┘   └───────────┘   └──────┬───────┘   │  status  │
//!                                       │           └────┬─────┘
//!                                ┌──────▼───────┐        │
//!                                │  Resilient   │   ┌────▼─────┐
//!                                │  Invoker     │   │ CLI/HTTP │
//!                                │  (LLM)       │   │  query   │
//!                                └──────────────┘   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`engine`] | Batch entry point (`summarize`) |
//! | [`hierarchy`] | Level-by-level reduction with bounded concurrency |
//! | [`invoke`] | Retry, timeout, normalization and fallback around model calls |
//! | [`llm`] | Language-model capability and providers |
//! | [`sqlite_store`] | SQLite `NodeStore` |
//! | [`tree`] | Read-only tree queries |
//! | [`server`] | HTTP server |
//! | [`input`] | Filesystem input loading |
//! | [`progress`] | Progress reporting on stderr |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema setup |
//! | [`error`] | Error types |
//!
//! Pure algorithms (token estimation, sentence splitting, chunking,
//! response normalization) and the storage trait live in the
//! `summary-tree-core` crate.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod input;
pub mod invoke;
pub mod llm;
pub mod migrate;
pub mod progress;
pub mod server;
pub mod sqlite_store;
pub mod tree;


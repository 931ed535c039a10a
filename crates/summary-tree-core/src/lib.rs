//! # Summary Tree Core
//!
//! Runtime-free logic for Summary Tree: data models, token estimation,
//! sentence splitting, token-budget chunking, language-model response
//! normalization, and the node store abstraction.
//!
//! This crate contains no tokio, sqlx, or network dependencies. The native
//! crate layers SQLite persistence, model providers, and the hierarchy
//! builder on top of it.

pub mod chunk;
pub mod error;
pub mod models;
pub mod normalize;
pub mod sentence;
pub mod store;
pub mod tokens;

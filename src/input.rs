//! Loading input documents from the filesystem.
//!
//! `sumtree run --input <path>` accepts a single file or a directory. A
//! directory is walked with the `[input]` include/exclude globs; every
//! matching file becomes one [`SourceDocument`] in relative-path order.

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use summary_tree_core::models::SourceDocument;

use crate::config::InputConfig;

pub fn load_documents(path: &Path, config: &InputConfig) -> Result<Vec<SourceDocument>> {
    if !path.exists() {
        bail!("Input path does not exist: {}", path.display());
    }

    if path.is_file() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        return Ok(vec![file_to_document(path, &name)?]);
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut documents = Vec::new();

    let walker = WalkDir::new(path)
        .follow_links(config.follow_symlinks)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let file = entry.path();
        let relative = file.strip_prefix(path).unwrap_or(file);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        documents.push(file_to_document(file, &rel_str)?);
    }

    documents.sort_by(|a, b| source_of(a).cmp(source_of(b)));
    tracing::debug!(root = %path.display(), files = documents.len(), "input loaded");

    Ok(documents)
}

fn source_of(doc: &SourceDocument) -> &str {
    doc.metadata
        .get("source")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
}

fn file_to_document(path: &Path, relative_path: &str) -> Result<SourceDocument> {
    let metadata = std::fs::metadata(path)?;
    let modified_secs = metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;

    let mut doc = SourceDocument::new(body)
        .with_metadata("source", relative_path)
        .with_metadata("bytes", metadata.len());
    if let Some(modified) = Utc.timestamp_opt(modified_secs, 0).single() {
        doc = doc.with_metadata("modified_at", modified.to_rfc3339());
    }
    Ok(doc)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

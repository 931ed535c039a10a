//! Build progress reporting.
//!
//! Reports observable progress while a batch is chunked and reduced level by
//! level, so users see how many groups are left at each level. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a batch build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildProgressEvent {
    /// Input was split into level-0 chunks.
    Chunked { batch_id: String, chunks: u64 },
    /// `done` of `total` summaries at `level` are finished.
    Level {
        batch_id: String,
        level: u32,
        done: u64,
        total: u64,
    },
    /// The root exists and the batch is completed.
    Finished {
        batch_id: String,
        depth: u32,
        fallbacks: u64,
    },
}

/// Reports build progress. Implementations write to stderr (human or JSON).
pub trait BuildProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the hierarchy builder, possibly
    /// from several worker tasks.
    fn report(&self, event: BuildProgressEvent);
}

/// Human-friendly progress on stderr: "batch 7f3a…  level 1  3 / 8 groups".
pub struct StderrProgress;

impl BuildProgressReporter for StderrProgress {
    fn report(&self, event: BuildProgressEvent) {
        let line = match &event {
            BuildProgressEvent::Chunked { batch_id, chunks } => {
                format!("batch {}  chunked into {} chunks\n", batch_id, format_number(*chunks))
            }
            BuildProgressEvent::Level {
                batch_id,
                level,
                done,
                total,
            } => {
                let unit = if *level == 0 { "chunks" } else { "groups" };
                format!(
                    "batch {}  level {}  {} / {} {}\n",
                    batch_id,
                    level,
                    format_number(*done),
                    format_number(*total),
                    unit
                )
            }
            BuildProgressEvent::Finished {
                batch_id,
                depth,
                fallbacks,
            } => format!(
                "batch {}  done  depth {}  fallbacks {}\n",
                batch_id,
                depth,
                format_number(*fallbacks)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BuildProgressReporter for JsonProgress {
    fn report(&self, event: BuildProgressEvent) {
        let obj = match &event {
            BuildProgressEvent::Chunked { batch_id, chunks } => serde_json::json!({
                "event": "progress",
                "batch_id": batch_id,
                "phase": "chunked",
                "chunks": chunks
            }),
            BuildProgressEvent::Level {
                batch_id,
                level,
                done,
                total,
            } => serde_json::json!({
                "event": "progress",
                "batch_id": batch_id,
                "phase": "level",
                "level": level,
                "n": done,
                "total": total
            }),
            BuildProgressEvent::Finished {
                batch_id,
                depth,
                fallbacks,
            } => serde_json::json!({
                "event": "progress",
                "batch_id": batch_id,
                "phase": "finished",
                "depth": depth,
                "fallbacks": fallbacks
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl BuildProgressReporter for NoProgress {
    fn report(&self, _event: BuildProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> std::sync::Arc<dyn BuildProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}

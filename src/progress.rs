//! Harvest run progress reporting.
//!
//! The pipeline never prints. It emits [`PipelineEvent`]s to a
//! [`ProgressReporter`] so callers decide how (or whether) progress shows up.
//! CLI reporters write to **stderr** so stdout stays parseable for scripts.

use std::io::Write;
use std::time::Duration;

/// Why a page is being retried.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetryReason {
    /// Network failure or malformed API body.
    Transient(String),
    /// The API answered a non-empty request with zero items.
    EmptyResponse,
}

/// A single observable step of a run.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    /// One ranking page scraped.
    Scraped { page: u32, ids: usize },
    /// A page's metadata arrived.
    Fetched {
        page: usize,
        total: usize,
        records: usize,
    },
    /// A page had no base games to ask for.
    Skipped { page: usize, total: usize },
    /// A page is waiting `delay` before another attempt.
    Retrying {
        page: usize,
        attempt: u32,
        delay: Duration,
        reason: RetryReason,
    },
    /// A page's records are in the staging collection.
    Staged { page: usize, documents: usize },
    /// Promotion failed; trying again after `delay`.
    PromoteRetrying { attempt: u32, delay: Duration },
    /// Staging became live.
    Published { documents: usize },
}

/// Receives pipeline events. Implementations must not block for long.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: PipelineEvent);
}

/// Human-friendly progress on stderr: "fetch  page 3 / 20  100 records".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: PipelineEvent) {
        let line = match &event {
            PipelineEvent::Scraped { page, ids } => {
                format!("scrape  page {}  {} ids\n", page, ids)
            }
            PipelineEvent::Fetched {
                page,
                total,
                records,
            } => format!(
                "fetch  page {} / {}  {} records\n",
                page + 1,
                total,
                format_number(*records as u64)
            ),
            PipelineEvent::Skipped { page, total } => {
                format!("fetch  page {} / {}  skipped (no base games)\n", page + 1, total)
            }
            PipelineEvent::Retrying {
                page,
                attempt,
                delay,
                reason,
            } => {
                let why = match reason {
                    RetryReason::Transient(msg) => msg.as_str(),
                    RetryReason::EmptyResponse => "empty response",
                };
                format!(
                    "fetch  page {}  retry #{} in {:.1}s ({})\n",
                    page + 1,
                    attempt,
                    delay.as_secs_f64(),
                    why
                )
            }
            PipelineEvent::Staged { page, documents } => {
                format!("stage  page {}  {} documents\n", page + 1, documents)
            }
            PipelineEvent::PromoteRetrying { attempt, delay } => format!(
                "publish  promote retry #{} in {:.1}s\n",
                attempt,
                delay.as_secs_f64()
            ),
            PipelineEvent::Published { documents } => format!(
                "publish  {} documents live\n",
                format_number(*documents as u64)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: PipelineEvent) {
        let obj = match &event {
            PipelineEvent::Scraped { page, ids } => serde_json::json!({
                "event": "scraped",
                "page": page,
                "ids": ids
            }),
            PipelineEvent::Fetched {
                page,
                total,
                records,
            } => serde_json::json!({
                "event": "fetched",
                "page": page,
                "total": total,
                "records": records
            }),
            PipelineEvent::Skipped { page, total } => serde_json::json!({
                "event": "skipped",
                "page": page,
                "total": total
            }),
            PipelineEvent::Retrying {
                page,
                attempt,
                delay,
                reason,
            } => {
                let (reason, detail) = match reason {
                    RetryReason::Transient(msg) => ("transient", Some(msg.clone())),
                    RetryReason::EmptyResponse => ("empty_response", None),
                };
                serde_json::json!({
                    "event": "retrying",
                    "page": page,
                    "attempt": attempt,
                    "delay_ms": delay.as_millis() as u64,
                    "reason": reason,
                    "detail": detail
                })
            }
            PipelineEvent::Staged { page, documents } => serde_json::json!({
                "event": "staged",
                "page": page,
                "documents": documents
            }),
            PipelineEvent::PromoteRetrying { attempt, delay } => serde_json::json!({
                "event": "promote_retrying",
                "attempt": attempt,
                "delay_ms": delay.as_millis() as u64
            }),
            PipelineEvent::Published { documents } => serde_json::json!({
                "event": "published",
                "documents": documents
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

impl ProgressReporter for NoProgress {
    fn report(&self, _event: PipelineEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
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

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

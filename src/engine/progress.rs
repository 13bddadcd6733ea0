//! Progress observation: status transitions reported by the engine.
//!
//! One observer method per transition. Implementations: a colored console
//! reporter, an append-only JSONL event log, a fan-out, and an in-memory
//! recorder for tests.

use crate::engine::RunSummary;
use crate::resolver::ScheduledTask;
use crate::types::FailureKind;
use anyhow::{Context, Result};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Observer of scheduled-task status transitions. All methods default to
/// no-ops so implementations pick what they care about. `Sync` is required
/// because the engine holds the tracker across await points.
pub trait ProgressTracker: Send + Sync {
    fn task_started(&mut self, _task: &ScheduledTask) {}
    fn task_succeeded(&mut self, _task: &ScheduledTask) {}
    fn task_retried(&mut self, _task: &ScheduledTask, _attempt: u32) {}
    fn block_retried(&mut self, _task: &ScheduledTask, _attempt: u32) {}
    fn task_failed(&mut self, _task: &ScheduledTask, _kind: FailureKind, _detail: &str) {}
    fn task_rescued(&mut self, _task: &ScheduledTask) {}
    fn task_skipped(&mut self, _task: &ScheduledTask) {}
    fn run_completed(&mut self, _summary: &RunSummary) {}
}

/// Tracker that ignores everything.
#[derive(Default)]
pub struct NullTracker;

impl ProgressTracker for NullTracker {}

/// Fan-out to several trackers in order.
#[derive(Default)]
pub struct MultiTracker {
    trackers: Vec<Box<dyn ProgressTracker>>,
}

impl MultiTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tracker: Box<dyn ProgressTracker>) {
        self.trackers.push(tracker);
    }
}

impl ProgressTracker for MultiTracker {
    fn task_started(&mut self, task: &ScheduledTask) {
        for t in &mut self.trackers {
            t.task_started(task);
        }
    }
    fn task_succeeded(&mut self, task: &ScheduledTask) {
        for t in &mut self.trackers {
            t.task_succeeded(task);
        }
    }
    fn task_retried(&mut self, task: &ScheduledTask, attempt: u32) {
        for t in &mut self.trackers {
            t.task_retried(task, attempt);
        }
    }
    fn block_retried(&mut self, task: &ScheduledTask, attempt: u32) {
        for t in &mut self.trackers {
            t.block_retried(task, attempt);
        }
    }
    fn task_failed(&mut self, task: &ScheduledTask, kind: FailureKind, detail: &str) {
        for t in &mut self.trackers {
            t.task_failed(task, kind, detail);
        }
    }
    fn task_rescued(&mut self, task: &ScheduledTask) {
        for t in &mut self.trackers {
            t.task_rescued(task);
        }
    }
    fn task_skipped(&mut self, task: &ScheduledTask) {
        for t in &mut self.trackers {
            t.task_skipped(task);
        }
    }
    fn run_completed(&mut self, summary: &RunSummary) {
        for t in &mut self.trackers {
            t.run_completed(summary);
        }
    }
}

/// One-line-per-transition console reporter.
#[derive(Default)]
pub struct ConsoleTracker;

impl ProgressTracker for ConsoleTracker {
    fn task_started(&mut self, task: &ScheduledTask) {
        println!("{} {}", ">>".dimmed(), task.declaration.name.bold());
    }
    fn task_succeeded(&mut self, task: &ScheduledTask) {
        println!("{} {}", "ok".bright_green(), task.declaration.name);
    }
    fn task_retried(&mut self, task: &ScheduledTask, attempt: u32) {
        println!(
            "{} {} (attempt {})",
            "retry".bright_yellow(),
            task.declaration.name,
            attempt + 1
        );
    }
    fn block_retried(&mut self, task: &ScheduledTask, attempt: u32) {
        println!(
            "{} block of {} (round {})",
            "retry".bright_yellow(),
            task.declaration.name,
            attempt + 1
        );
    }
    fn task_failed(&mut self, task: &ScheduledTask, kind: FailureKind, detail: &str) {
        println!(
            "{} {} ({}): {}",
            "fail".bright_red(),
            task.declaration.name,
            kind,
            detail
        );
    }
    fn task_rescued(&mut self, task: &ScheduledTask) {
        println!("{} {}", "rescued".bright_cyan(), task.declaration.name);
    }
    fn task_skipped(&mut self, task: &ScheduledTask) {
        println!("{} {}", "skip".dimmed(), task.declaration.name.dimmed());
    }
    fn run_completed(&mut self, summary: &RunSummary) {
        println!();
        if summary.is_failed() {
            println!(
                "{}: {} succeeded, {} failed, {} skipped",
                "FAILED".bright_red().bold(),
                summary.succeeded + summary.rescued,
                summary.failed,
                summary.skipped
            );
        } else {
            println!(
                "{}: {} succeeded",
                "OK".bright_green().bold(),
                summary.succeeded + summary.rescued
            );
        }
    }
}

/// A status transition as written to the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    TaskStarted { task: String },
    TaskSucceeded { task: String },
    TaskRetried { task: String, attempt: u32 },
    BlockRetried { task: String, attempt: u32 },
    TaskFailed { task: String, kind: String, detail: String },
    TaskRescued { task: String },
    TaskSkipped { task: String },
    RunCompleted { succeeded: u32, failed: u32, rescued: u32, skipped: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
struct TimestampedEvent {
    ts: String,
    run_id: String,
    #[serde(flatten)]
    event: ProgressEvent,
}

/// Generate a unique run ID: `"r-{short_hex}"`.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let seed = now.as_nanos() ^ (std::process::id() as u128);
    format!("r-{:012x}", seed & 0xFFFF_FFFF_FFFF)
}

/// Current UTC timestamp in ISO 8601.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Appends one JSON object per transition to an event log file. Write
/// failures are logged and swallowed; observation must never fail a run.
pub struct JsonlTracker {
    path: PathBuf,
    run_id: String,
}

impl JsonlTracker {
    pub fn new(path: PathBuf, run_id: String) -> Self {
        Self { path, run_id }
    }

    fn append(&self, event: ProgressEvent) {
        if let Err(e) = self.try_append(event) {
            tracing::warn!("event log write failed: {:#}", e);
        }
    }

    fn try_append(&self, event: ProgressEvent) -> Result<()> {
        let record = TimestampedEvent {
            ts: now_iso8601(),
            run_id: self.run_id.clone(),
            event,
        };
        let json = serde_json::to_string(&record).context("failed to serialize event")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open event log: {}", self.path.display()))?;
        writeln!(file, "{}", json).context("failed to write event")?;
        Ok(())
    }
}

impl ProgressTracker for JsonlTracker {
    fn task_started(&mut self, task: &ScheduledTask) {
        self.append(ProgressEvent::TaskStarted {
            task: task.declaration.name.clone(),
        });
    }
    fn task_succeeded(&mut self, task: &ScheduledTask) {
        self.append(ProgressEvent::TaskSucceeded {
            task: task.declaration.name.clone(),
        });
    }
    fn task_retried(&mut self, task: &ScheduledTask, attempt: u32) {
        self.append(ProgressEvent::TaskRetried {
            task: task.declaration.name.clone(),
            attempt,
        });
    }
    fn block_retried(&mut self, task: &ScheduledTask, attempt: u32) {
        self.append(ProgressEvent::BlockRetried {
            task: task.declaration.name.clone(),
            attempt,
        });
    }
    fn task_failed(&mut self, task: &ScheduledTask, kind: FailureKind, detail: &str) {
        self.append(ProgressEvent::TaskFailed {
            task: task.declaration.name.clone(),
            kind: kind.to_string(),
            detail: detail.to_string(),
        });
    }
    fn task_rescued(&mut self, task: &ScheduledTask) {
        self.append(ProgressEvent::TaskRescued {
            task: task.declaration.name.clone(),
        });
    }
    fn task_skipped(&mut self, task: &ScheduledTask) {
        self.append(ProgressEvent::TaskSkipped {
            task: task.declaration.name.clone(),
        });
    }
    fn run_completed(&mut self, summary: &RunSummary) {
        self.append(ProgressEvent::RunCompleted {
            succeeded: summary.succeeded,
            failed: summary.failed,
            rescued: summary.rescued,
            skipped: summary.skipped,
        });
    }
}

/// In-memory recorder for assertions in tests. The handle stays valid after
/// the engine consumes the tracker.
#[derive(Default)]
pub struct RecordingTracker {
    transitions: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<Mutex<Vec<(String, String)>>> {
        Arc::clone(&self.transitions)
    }

    fn record(&self, task: &ScheduledTask, transition: &str) {
        self.transitions
            .lock()
            .expect("recording lock poisoned")
            .push((task.declaration.name.clone(), transition.to_string()));
    }
}

impl ProgressTracker for RecordingTracker {
    fn task_started(&mut self, task: &ScheduledTask) {
        self.record(task, "started");
    }
    fn task_succeeded(&mut self, task: &ScheduledTask) {
        self.record(task, "succeeded");
    }
    fn task_retried(&mut self, task: &ScheduledTask, _attempt: u32) {
        self.record(task, "retried");
    }
    fn block_retried(&mut self, task: &ScheduledTask, _attempt: u32) {
        self.record(task, "block-retried");
    }
    fn task_failed(&mut self, task: &ScheduledTask, kind: FailureKind, _detail: &str) {
        self.record(task, &kind.to_string());
    }
    fn task_rescued(&mut self, task: &ScheduledTask) {
        self.record(task, "rescued");
    }
    fn task_skipped(&mut self, task: &ScheduledTask) {
        self.record(task, "skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trackers_are_shareable_across_await_points() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn ProgressTracker>();
        assert_send_sync::<MultiTracker>();
        assert_send_sync::<JsonlTracker>();
    }

    #[test]
    fn test_run_id_format() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_event_serialization_shape() {
        let record = TimestampedEvent {
            ts: "2026-01-01T00:00:00Z".into(),
            run_id: "r-000000000001".into(),
            event: ProgressEvent::TaskFailed {
                task: ":deploy".into(),
                kind: "failure".into(),
                detail: "task returned failure".into(),
            },
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"event\":\"task_failed\""));
        assert!(json.contains("\"task\":\":deploy\""));
        assert!(json.contains("\"run_id\""));
    }

    #[test]
    fn test_jsonl_tracker_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.events.jsonl");
        let mut tracker = JsonlTracker::new(path.clone(), generate_run_id());

        tracker.run_completed(&RunSummary {
            succeeded: 2,
            failed: 1,
            rescued: 0,
            skipped: 3,
        });
        tracker.run_completed(&RunSummary::default());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.lines().next().unwrap().contains("run_completed"));
    }
}

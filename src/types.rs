//! Shared value types for the execution core.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single task invocation as written on the command line: a `:`-prefixed
/// name plus its ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCall {
    pub name: String,
    pub args: Vec<String>,
}

impl TaskCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Clone of this call with extra args appended after its own args.
    pub fn with_appended_args(&self, extra: &[String]) -> Self {
        let mut args = self.args.clone();
        args.extend_from_slice(extra);
        Self {
            name: self.name.clone(),
            args,
        }
    }
}

impl fmt::Display for TaskCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Lifecycle states of a scheduled task during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Started,
    Succeeded,
    Retried,
    Rescued,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// A terminal state that does not count against the run.
    pub fn is_ok(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Rescued)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Started => "started",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Retried => "retried",
            TaskStatus::Rescued => "rescued",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// How a task failed: a clean boolean `false` vs an error it did not catch.
/// Both are handled by the same retry/rescue policy; only reporting differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The task returned `false`.
    Failure,
    /// The task returned an error.
    Errored,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Failure => write!(f, "failure"),
            FailureKind::Errored => write!(f, "errored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_appended_args_keeps_own_args_first() {
        let call = TaskCall::with_args(":deploy", vec!["--env".into(), "prod".into()]);
        let extended = call.with_appended_args(&["--verbose".to_string()]);
        assert_eq!(extended.args, vec!["--env", "prod", "--verbose"]);
        // original untouched
        assert_eq!(call.args.len(), 2);
    }

    #[test]
    fn test_task_call_display() {
        let call = TaskCall::with_args(":build", vec!["--release".into()]);
        assert_eq!(call.to_string(), ":build --release");
    }

    #[test]
    fn test_status_is_ok() {
        assert!(TaskStatus::Succeeded.is_ok());
        assert!(TaskStatus::Rescued.is_ok());
        assert!(!TaskStatus::Failed.is_ok());
        assert!(!TaskStatus::Skipped.is_ok());
    }
}

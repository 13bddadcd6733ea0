//! Per-task execution context and run-scoped temporary resources.

use anyhow::{Context as AnyhowContext, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// Run-scoped allocator for temporary files (serialization transfers and the
/// like). Everything allocated since the last release is dropped after each
/// task's execute() returns, on every exit path, so no state leaks across
/// retries.
#[derive(Default)]
pub struct TempResourceManager {
    files: Mutex<Vec<NamedTempFile>>,
}

impl TempResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a temp file owned by this manager; the path stays valid until
    /// the next `release_all()`.
    pub fn allocate_file(&self, prefix: &str) -> Result<PathBuf> {
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile()
            .context("failed to allocate temp file")?;
        let path = file.path().to_path_buf();
        self.files
            .lock()
            .expect("temp resource lock poisoned")
            .push(file);
        Ok(path)
    }

    /// Drop every resource allocated so far, deleting the backing files.
    pub fn release_all(&self) {
        self.files
            .lock()
            .expect("temp resource lock poisoned")
            .clear();
    }

    #[cfg(test)]
    pub fn allocated_count(&self) -> usize {
        self.files.lock().expect("temp resource lock poisoned").len()
    }
}

/// Everything a task sees when it runs: its merged args and env, plus the
/// run's temp resource manager.
#[derive(Clone)]
pub struct ExecutionContext {
    pub task_name: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub temp: Arc<TempResourceManager>,
}

impl ExecutionContext {
    pub fn new(
        task_name: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        temp: Arc<TempResourceManager>,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            args,
            env,
            temp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_all_deletes_files() {
        let manager = TempResourceManager::new();
        let path = manager.allocate_file("ritmo-test-").unwrap();
        assert!(path.exists());
        assert_eq!(manager.allocated_count(), 1);

        manager.release_all();
        assert!(!path.exists());
        assert_eq!(manager.allocated_count(), 0);
    }

    #[test]
    fn test_release_all_is_idempotent() {
        let manager = TempResourceManager::new();
        manager.release_all();
        manager.release_all();
    }
}

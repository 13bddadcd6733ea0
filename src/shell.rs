//! The built-in shell-command task.

use crate::context::ExecutionContext;
use crate::registry::Task;
use anyhow::{Context, Result};
use tracing::debug;

/// Runs a declared command via `sh -c`. Runtime args arrive as shell
/// positionals (`$1`, `$2`, `"$@"`); the merged env is applied on top of the
/// process environment. Exit status maps to the task boolean: zero is
/// success, anything else a clean failure.
pub struct ShellTask {
    name: String,
    command: String,
    fork: bool,
    user: Option<String>,
}

impl ShellTask {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            fork: false,
            user: None,
        }
    }

    pub fn forked(mut self, fork: bool) -> Self {
        self.fork = fork;
        self
    }

    pub fn as_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }
}

#[async_trait::async_trait]
impl Task for ShellTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool> {
        debug!("sh -c '{}' with {} arg(s)", self.command, ctx.args.len());
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .arg(&self.name)
            .args(&ctx.args)
            .envs(&ctx.env)
            .status()
            .await
            .with_context(|| format!("failed to spawn shell for '{}'", self.name))?;
        Ok(status.success())
    }

    fn should_fork(&self) -> bool {
        self.fork
    }

    fn become_user(&self) -> Option<&str> {
        self.user.as_deref()
    }
}

//! Isolated execution of a single task in a subprocess.
//!
//! The wire format is deliberately minimal: the task's registry name, its
//! resolved args, and its env map, serialized to a transfer file the worker
//! process reads back. The worker prints a one-line JSON outcome on stdout;
//! any worker-side error surfaces to the engine exactly like an in-process
//! failure.

use crate::context::ExecutionContext;
use crate::resolver::ScheduledTask;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Minimal execution context crossing the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTransfer {
    pub task_id: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub become_user: Option<String>,
}

/// What the worker reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// How a single task execution is dispatched.
#[async_trait::async_trait]
pub trait IsolationStrategy: Send + Sync {
    async fn run(&self, task: &ScheduledTask, ctx: &ExecutionContext) -> Result<bool>;
}

/// Plain in-process dispatch.
#[derive(Default)]
pub struct InProcess;

#[async_trait::async_trait]
impl IsolationStrategy for InProcess {
    async fn run(&self, task: &ScheduledTask, ctx: &ExecutionContext) -> Result<bool> {
        task.declaration.task.execute(ctx).await
    }
}

/// Subprocess dispatch through a worker command. The default worker is this
/// very binary's hidden `internal-exec` subcommand; tests substitute a stub.
pub struct SubprocessIsolation {
    worker_argv: Vec<String>,
}

impl SubprocessIsolation {
    /// Worker argv pointing back at the current executable.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("cannot locate current executable")?;
        Ok(Self {
            worker_argv: vec![exe.to_string_lossy().into_owned(), "internal-exec".into()],
        })
    }

    pub fn with_worker(worker_argv: Vec<String>) -> Self {
        Self { worker_argv }
    }
}

#[async_trait::async_trait]
impl IsolationStrategy for SubprocessIsolation {
    async fn run(&self, task: &ScheduledTask, ctx: &ExecutionContext) -> Result<bool> {
        let become_user = task.declaration.task.become_user().map(String::from);
        let transfer = ExecutionTransfer {
            task_id: task.declaration.name.clone(),
            args: ctx.args.clone(),
            env: ctx.env.clone(),
            become_user: become_user.clone(),
        };

        // Owned by the run's temp manager; released right after this attempt.
        let transfer_path = ctx.temp.allocate_file("ritmo-transfer-")?;
        let payload =
            serde_json::to_vec(&transfer).context("failed to serialize execution transfer")?;
        std::fs::write(&transfer_path, payload)
            .with_context(|| format!("failed to write {}", transfer_path.display()))?;

        let mut argv: Vec<String> = Vec::new();
        if let Some(user) = &become_user {
            argv.extend(["sudo".to_string(), "-u".to_string(), user.clone()]);
        }
        argv.extend(self.worker_argv.iter().cloned());

        tracing::debug!(
            "isolating '{}' via worker {:?}",
            task.declaration.name,
            argv
        );
        let output = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .arg("--transfer")
            .arg(&transfer_path)
            .output()
            .await
            .context("failed to spawn isolation worker")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "isolation worker exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default();
        let outcome: TransferOutcome = serde_json::from_str(line)
            .with_context(|| format!("invalid worker outcome: '{}'", line))?;

        match outcome.error {
            Some(message) => bail!("{}", message),
            None => Ok(outcome.ok),
        }
    }
}

/// Worker-side half: read a transfer file, run the named task in-process,
/// report the outcome. Called from the hidden CLI subcommand.
pub async fn run_transfer(
    transfer_path: &std::path::Path,
    registry: &dyn crate::registry::TaskRegistry,
) -> TransferOutcome {
    match run_transfer_inner(transfer_path, registry).await {
        Ok(ok) => TransferOutcome { ok, error: None },
        Err(e) => TransferOutcome {
            ok: false,
            error: Some(format!("{:#}", e)),
        },
    }
}

async fn run_transfer_inner(
    transfer_path: &std::path::Path,
    registry: &dyn crate::registry::TaskRegistry,
) -> Result<bool> {
    let raw = std::fs::read_to_string(transfer_path)
        .with_context(|| format!("failed to read {}", transfer_path.display()))?;
    let transfer: ExecutionTransfer =
        serde_json::from_str(&raw).context("invalid execution transfer")?;

    let registered = registry
        .lookup(&transfer.task_id)?
        .with_context(|| format!("task '{}' not found in worker registry", transfer.task_id))?;
    let declarations = match registered {
        crate::registry::Registered::Declarations(d) => d,
        crate::registry::Registered::Pipeline(_) => {
            bail!("'{}' names a pipeline, not a task", transfer.task_id)
        }
    };

    let temp = std::sync::Arc::new(crate::context::TempResourceManager::new());
    for declaration in &declarations {
        let ctx = ExecutionContext::new(
            &declaration.name,
            transfer.args.clone(),
            transfer.env.clone(),
            std::sync::Arc::clone(&temp),
        );
        let ok = declaration.task.execute(&ctx).await?;
        temp.release_all();
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

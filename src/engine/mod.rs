//! Sequential execution of a resolved schedule under the retry/rescue/error
//! state machine.
//!
//! One scheduled task is in flight at a time. A failed attempt is classified
//! into an explicit outcome consumed by the driver loop: retry the task,
//! restart its block, enter rescue, fire error notifications, or give up.
//! Abort decisions happen only at task boundaries, never mid-attempt.

pub mod isolation;
pub mod progress;

pub use isolation::{ExecutionTransfer, InProcess, IsolationStrategy, SubprocessIsolation};
pub use progress::{ConsoleTracker, JsonlTracker, MultiTracker, NullTracker, ProgressTracker};

use crate::blocks::{BlockArena, BlockId};
use crate::context::{ExecutionContext, TempResourceManager};
use crate::resolver::{BlockHandlers, Resolution, ScheduledTask};
use crate::types::{FailureKind, TaskStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Run-wide switches.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Continue with later independent tasks after an unrecovered failure
    /// instead of aborting immediately.
    pub keep_going: bool,
}

/// Aggregate result of a run. Failed if any task ended unrescued-failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: u32,
    pub failed: u32,
    pub rescued: u32,
    pub skipped: u32,
}

impl RunSummary {
    pub fn is_failed(&self) -> bool {
        self.failed > 0
    }
}

/// What the driver does after a task's attempts are spent (or succeed).
enum StepOutcome {
    Success,
    RetryBlock { block: BlockId },
    Rescue { block: BlockId },
    ErrorNotify { block: BlockId },
    Unrecovered,
}

/// Which retry budget covers the next attempt.
enum RetryDecision {
    Task { block: BlockId, attempt: u32 },
    Block { block: BlockId, attempt: u32 },
    Exhausted,
}

pub struct ExecutionEngine<'a> {
    arena: &'a mut BlockArena,
    isolation: Box<dyn IsolationStrategy>,
    progress: Box<dyn ProgressTracker>,
    config: RunConfig,
    temp: Arc<TempResourceManager>,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(
        arena: &'a mut BlockArena,
        isolation: Box<dyn IsolationStrategy>,
        progress: Box<dyn ProgressTracker>,
        config: RunConfig,
    ) -> Self {
        Self {
            arena,
            isolation,
            progress,
            config,
            temp: Arc::new(TempResourceManager::new()),
        }
    }

    /// Run the whole schedule to completion and report the aggregate.
    pub async fn execute(&mut self, resolution: &Resolution) -> RunSummary {
        let summary = self
            .run_list(resolution.bag.tasks(), &resolution.handlers)
            .await;
        self.progress.run_completed(&summary);
        summary
    }

    /// Drive one ordered task list. Rescue and error-notification lists
    /// re-enter here recursively, subject to the identical state machine.
    fn run_list<'b>(
        &'b mut self,
        tasks: &'b [ScheduledTask],
        handlers: &'b HashMap<BlockId, BlockHandlers>,
    ) -> Pin<Box<dyn Future<Output = RunSummary> + Send + 'b>> {
        Box::pin(async move {
            let mut statuses = vec![TaskStatus::Pending; tasks.len()];
            let mut abort = false;
            let mut i = 0;

            while i < tasks.len() {
                let task = &tasks[i];
                let outcome = self.attempt_until_decided(task).await;

                match outcome {
                    StepOutcome::Success => {
                        statuses[i] = TaskStatus::Succeeded;
                        self.progress.task_succeeded(task);
                        i += 1;
                    }
                    StepOutcome::RetryBlock { block } => {
                        // Restart from the block's first task, succeeded ones
                        // included.
                        let first = tasks
                            .iter()
                            .position(|t| t.blocks.contains(&block))
                            .unwrap_or(i);
                        for status in statuses.iter_mut().take(i + 1).skip(first) {
                            *status = TaskStatus::Pending;
                        }
                        i = first;
                    }
                    StepOutcome::Rescue { block } => {
                        let list = handlers
                            .get(&block)
                            .map(|h| h.rescue.as_slice())
                            .unwrap_or_default();
                        debug!(
                            "entering rescue ({} task(s)) for '{}'",
                            list.len(),
                            task.declaration.name
                        );
                        let rescue_summary = self.run_list(list, handlers).await;
                        if rescue_summary.is_failed() {
                            error!("rescue failed for '{}'", task.declaration.name);
                            statuses[i] = TaskStatus::Failed;
                            i = self.skip_block_rest(tasks, &mut statuses, i + 1, block);
                            abort = !self.config.keep_going;
                        } else {
                            // Healed: the rest of the block still runs.
                            statuses[i] = TaskStatus::Rescued;
                            self.progress.task_rescued(task);
                            i += 1;
                        }
                    }
                    StepOutcome::ErrorNotify { block } => {
                        let list = handlers
                            .get(&block)
                            .map(|h| h.error.as_slice())
                            .unwrap_or_default();
                        debug!(
                            "running {} error notification task(s) for '{}'",
                            list.len(),
                            task.declaration.name
                        );
                        // Side effects only; the failure stands either way.
                        let _ = self.run_list(list, handlers).await;
                        statuses[i] = TaskStatus::Failed;
                        i = self.skip_block_rest(tasks, &mut statuses, i + 1, block);
                        abort = !self.config.keep_going;
                    }
                    StepOutcome::Unrecovered => {
                        statuses[i] = TaskStatus::Failed;
                        if let Some(&block) = task.blocks.first() {
                            i = self.skip_block_rest(tasks, &mut statuses, i + 1, block);
                        } else {
                            i += 1;
                        }
                        abort = !self.config.keep_going;
                    }
                }

                if abort {
                    for (j, status) in statuses.iter_mut().enumerate().skip(i) {
                        if *status == TaskStatus::Pending {
                            *status = TaskStatus::Skipped;
                            self.progress.task_skipped(&tasks[j]);
                        }
                    }
                    break;
                }
            }

            summarize(&statuses)
        })
    }

    /// Run one task, consuming its per-task retry budget in place, until a
    /// driver-level outcome is reached.
    async fn attempt_until_decided(&mut self, task: &ScheduledTask) -> StepOutcome {
        loop {
            self.progress.task_started(task);
            debug!("started '{}' (id {})", task.declaration.name, task.id);
            let result = self.run_attempt(task).await;

            let (kind, detail) = match result {
                Ok(true) => return StepOutcome::Success,
                Ok(false) => (FailureKind::Failure, "task returned failure".to_string()),
                Err(e) => (FailureKind::Errored, format!("{:#}", e)),
            };

            match self.decide_retry(task) {
                RetryDecision::Task { block, attempt } => {
                    warn!(
                        "'{}' failed, per-task retry {} of {}",
                        task.declaration.name,
                        attempt,
                        self.arena.get(block).retry_per_task
                    );
                    self.progress.task_retried(task, attempt);
                    continue;
                }
                RetryDecision::Block { block, attempt } => {
                    warn!(
                        "'{}' failed, restarting its block (round {} of {})",
                        task.declaration.name,
                        attempt,
                        self.arena.get(block).retry_whole_block
                    );
                    self.progress.block_retried(task, attempt);
                    return StepOutcome::RetryBlock { block };
                }
                RetryDecision::Exhausted => {
                    error!("'{}' {}: {}", task.declaration.name, kind, detail);
                    self.progress.task_failed(task, kind, &detail);
                    return self.decide_recovery(task);
                }
            }
        }
    }

    /// One execution attempt, isolated if the task asks for it. Temp
    /// resources are released on every exit path before the result is
    /// inspected, so nothing leaks into a retry.
    async fn run_attempt(&self, task: &ScheduledTask) -> anyhow::Result<bool> {
        let ctx = ExecutionContext::new(
            &task.declaration.name,
            task.args.clone(),
            task.env.clone(),
            Arc::clone(&self.temp),
        );
        let implementation = &task.declaration.task;
        let wants_isolation =
            implementation.should_fork() || implementation.become_user().is_some();

        let result = if wants_isolation {
            self.isolation.run(task, &ctx).await
        } else {
            implementation.execute(&ctx).await
        };
        self.temp.release_all();
        result
    }

    /// Consult the owning blocks, innermost first: per-task budget, then
    /// whole-block budget, then outward.
    fn decide_retry(&mut self, task: &ScheduledTask) -> RetryDecision {
        for &block in &task.blocks {
            let definition = self.arena.get(block);
            let per_task = definition.retry_per_task;
            let per_block = definition.retry_whole_block;

            if self.arena.task_retries_used(block, task.id) < per_task {
                let attempt = self.arena.record_task_retry(block, task.id);
                return RetryDecision::Task { block, attempt };
            }
            if self.arena.block_retries_used(block) < per_block {
                let attempt = self.arena.record_block_retry(block);
                return RetryDecision::Block { block, attempt };
            }
        }
        RetryDecision::Exhausted
    }

    /// Retries are spent: a rescue anywhere in the chain (innermost first,
    /// at most once per task identity) wins over any error handler, since
    /// rescue can still heal the failure.
    fn decide_recovery(&mut self, task: &ScheduledTask) -> StepOutcome {
        for &block in &task.blocks {
            let definition = self.arena.get(block);
            if definition.has_rescue() && !self.arena.is_rescue_exhausted(block, task.id) {
                self.arena.mark_rescue_exhausted(block, task.id);
                return StepOutcome::Rescue { block };
            }
        }
        for &block in &task.blocks {
            if self.arena.get(block).has_error() {
                return StepOutcome::ErrorNotify { block };
            }
        }
        StepOutcome::Unrecovered
    }

    /// Mark every later task of `block` skipped; returns the index after the
    /// skipped range.
    fn skip_block_rest(
        &mut self,
        tasks: &[ScheduledTask],
        statuses: &mut [TaskStatus],
        from: usize,
        block: BlockId,
    ) -> usize {
        let mut i = from;
        while i < tasks.len() && tasks[i].blocks.contains(&block) {
            statuses[i] = TaskStatus::Skipped;
            self.progress.task_skipped(&tasks[i]);
            i += 1;
        }
        i
    }
}

fn summarize(statuses: &[TaskStatus]) -> RunSummary {
    let mut summary = RunSummary::default();
    for status in statuses {
        match status {
            TaskStatus::Succeeded => summary.succeeded += 1,
            TaskStatus::Rescued => summary.rescued += 1,
            TaskStatus::Failed => summary.failed += 1,
            TaskStatus::Skipped => summary.skipped += 1,
            _ => {}
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::progress::RecordingTracker;
    use super::*;
    use crate::blocks::{group_tokens, BlockModifiers};
    use crate::registry::{
        InMemoryRegistry, Pipeline, PipelineElement, Task, TaskDeclaration,
    };
    use crate::resolver::PipelineResolver;
    use crate::types::TaskCall;
    use anyhow::{anyhow, Result};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Scripted task: pops one result per invocation, repeating the last.
    struct ScriptedTask {
        name: String,
        script: Mutex<Vec<Result<bool, String>>>,
        invocations: AtomicU32,
    }

    impl ScriptedTask {
        fn new(name: &str, script: Vec<Result<bool, String>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: Mutex::new(script),
                invocations: AtomicU32::new(0),
            })
        }

        fn always(name: &str, ok: bool) -> Arc<Self> {
            Self::new(name, vec![Ok(ok)])
        }

        fn invocations(&self) -> u32 {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Task for ScriptedTask {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self, _ctx: &ExecutionContext) -> Result<bool> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            let step = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            };
            step.map_err(|message| anyhow!(message))
        }
    }

    struct Harness {
        registry: InMemoryRegistry,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                registry: InMemoryRegistry::new(),
            }
        }

        fn add(&mut self, task: Arc<ScriptedTask>) {
            let name = task.name.clone();
            self.registry.register_task(TaskDeclaration::new(name, task));
        }

        async fn run(
            &self,
            tokens: &[&str],
            keep_going: bool,
        ) -> (RunSummary, Arc<Mutex<Vec<(String, String)>>>) {
            let input: Vec<String> = tokens.iter().map(|s| s.to_string()).collect();
            let mut arena = BlockArena::new();
            let ids = group_tokens(&input, &mut arena).unwrap();
            let mut resolver = PipelineResolver::new(&self.registry);
            let resolution = resolver.resolve(&ids, &mut arena).unwrap();

            let tracker = RecordingTracker::new();
            let handle = tracker.handle();
            let mut engine = ExecutionEngine::new(
                &mut arena,
                Box::new(InProcess),
                Box::new(tracker),
                RunConfig { keep_going },
            );
            let summary = engine.execute(&resolution).await;
            (summary, handle)
        }
    }

    fn transitions_of(
        recorded: &Arc<Mutex<Vec<(String, String)>>>,
        name: &str,
    ) -> Vec<String> {
        recorded
            .lock()
            .unwrap()
            .iter()
            .filter(|(task, _)| task == name)
            .map(|(_, transition)| transition.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_all_green_run() {
        let mut harness = Harness::new();
        let a = ScriptedTask::always(":a", true);
        let b = ScriptedTask::always(":b", true);
        harness.add(a.clone());
        harness.add(b.clone());

        let (summary, _) = harness.run(&[":a", ":b"], false).await;
        assert_eq!(summary.succeeded, 2);
        assert!(!summary.is_failed());
        assert_eq!(a.invocations(), 1);
        assert_eq!(b.invocations(), 1);
    }

    #[tokio::test]
    async fn test_per_task_retry_exhaustion() {
        let mut harness = Harness::new();
        let flaky = ScriptedTask::always(":flaky", false);
        harness.add(flaky.clone());

        let (summary, tracker) = harness
            .run(&["{@retry", "3}", ":flaky", "{/@}"], false)
            .await;

        // 1 initial + 3 retries
        assert_eq!(flaky.invocations(), 4);
        assert!(summary.is_failed());
        assert_eq!(summary.failed, 1);
        let transitions = transitions_of(&tracker, ":flaky");
        assert_eq!(
            transitions.iter().filter(|t| *t == "retried").count(),
            3
        );
        assert!(!transitions.contains(&"rescued".to_string()));
    }

    #[tokio::test]
    async fn test_retry_heals_transient_failure() {
        let mut harness = Harness::new();
        let flaky = ScriptedTask::new(":flaky", vec![Ok(false), Ok(true)]);
        harness.add(flaky.clone());

        let (summary, _) = harness
            .run(&["{@retry", "3}", ":flaky", "{/@}"], false)
            .await;
        assert_eq!(flaky.invocations(), 2);
        assert!(!summary.is_failed());
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test]
    async fn test_rescue_heals_and_later_tasks_run() {
        let mut harness = Harness::new();
        let migrate = ScriptedTask::always(":migrate", false);
        let rollback = ScriptedTask::always(":rollback", true);
        let after = ScriptedTask::always(":after", true);
        harness.add(migrate.clone());
        harness.add(rollback.clone());
        harness.add(after.clone());

        let (summary, tracker) = harness
            .run(
                &["{@rescue", "\":rollback\"}", ":migrate", "{/@}", ":after"],
                false,
            )
            .await;

        assert_eq!(migrate.invocations(), 1);
        assert_eq!(rollback.invocations(), 1);
        assert_eq!(after.invocations(), 1);
        assert!(!summary.is_failed());
        assert_eq!(summary.rescued, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(
            transitions_of(&tracker, ":migrate").last().unwrap(),
            "rescued"
        );
    }

    #[tokio::test]
    async fn test_rescue_heals_rest_of_block_still_runs() {
        let mut harness = Harness::new();
        let migrate = ScriptedTask::always(":migrate", false);
        let rollback = ScriptedTask::always(":rollback", true);
        let seed = ScriptedTask::always(":seed", true);
        harness.add(migrate.clone());
        harness.add(rollback.clone());
        harness.add(seed.clone());

        let (summary, _) = harness
            .run(
                &["{@rescue", "\":rollback\"}", ":migrate", ":seed", "{/@}"],
                false,
            )
            .await;

        assert_eq!(seed.invocations(), 1);
        assert!(!summary.is_failed());
    }

    #[tokio::test]
    async fn test_whole_block_retry_reruns_succeeded_tasks() {
        let mut harness = Harness::new();
        let a = ScriptedTask::always(":a", true);
        let b = ScriptedTask::always(":b", false);
        harness.add(a.clone());
        harness.add(b.clone());

        let (summary, _) = harness
            .run(&["{@retry-block", "2}", ":a", ":b", "{/@}"], false)
            .await;

        // initial round + 2 block retries
        assert_eq!(a.invocations(), 3);
        assert_eq!(b.invocations(), 3);
        assert!(summary.is_failed());
    }

    #[tokio::test]
    async fn test_block_retry_restores_per_task_budget() {
        let mut harness = Harness::new();
        // Fails twice per round (retry 1 covers one), then succeeds in the
        // second round.
        let flaky = ScriptedTask::new(
            ":flaky",
            vec![Ok(false), Ok(false), Ok(false), Ok(true)],
        );
        harness.add(flaky.clone());

        let (summary, _) = harness
            .run(
                &["{@retry", "1", "@retry-block", "1}", ":flaky", "{/@}"],
                false,
            )
            .await;

        // round 1: initial + 1 retry; round 2: initial + 1 retry (succeeds)
        assert_eq!(flaky.invocations(), 4);
        assert!(!summary.is_failed());
    }

    #[tokio::test]
    async fn test_error_notification_never_heals() {
        let mut harness = Harness::new();
        let deploy = ScriptedTask::always(":deploy", false);
        let notify = ScriptedTask::always(":notify", true);
        let after = ScriptedTask::always(":after", true);
        harness.add(deploy.clone());
        harness.add(notify.clone());
        harness.add(after.clone());

        let (summary, _) = harness
            .run(
                &["{@error", "\":notify\"}", ":deploy", "{/@}", ":after"],
                false,
            )
            .await;

        assert_eq!(notify.invocations(), 1);
        assert!(summary.is_failed());
        // no keep-going: the run aborts after the failed block
        assert_eq!(after.invocations(), 0);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn test_error_notification_keep_going_continues_outside_block() {
        let mut harness = Harness::new();
        let deploy = ScriptedTask::always(":deploy", false);
        let cleanup = ScriptedTask::always(":cleanup", true);
        let notify = ScriptedTask::always(":notify", true);
        let after = ScriptedTask::always(":after", true);
        harness.add(deploy.clone());
        harness.add(cleanup.clone());
        harness.add(notify.clone());
        harness.add(after.clone());

        let (summary, _) = harness
            .run(
                &[
                    "{@error", "\":notify\"}", ":deploy", ":cleanup", "{/@}", ":after",
                ],
                true,
            )
            .await;

        // rest of the failed block is skipped even under keep-going
        assert_eq!(cleanup.invocations(), 0);
        assert_eq!(after.invocations(), 1);
        assert!(summary.is_failed());
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn test_failed_rescue_aborts_without_keep_going() {
        let mut harness = Harness::new();
        let migrate = ScriptedTask::always(":migrate", false);
        let rollback = ScriptedTask::always(":rollback", false);
        let after = ScriptedTask::always(":after", true);
        harness.add(migrate.clone());
        harness.add(rollback.clone());
        harness.add(after.clone());

        let (summary, _) = harness
            .run(
                &["{@rescue", "\":rollback\"}", ":migrate", "{/@}", ":after"],
                false,
            )
            .await;

        assert!(summary.is_failed());
        assert_eq!(after.invocations(), 0);
    }

    #[tokio::test]
    async fn test_rescue_not_reentered_after_block_retry() {
        let mut harness = Harness::new();
        let flaky = ScriptedTask::always(":flaky", false);
        let fix = ScriptedTask::always(":fix", false);
        harness.add(flaky.clone());
        harness.add(fix.clone());

        let (summary, _) = harness
            .run(
                &[
                    "{@retry-block", "1", "@rescue", "\":fix\"}", ":flaky", "{/@}",
                ],
                false,
            )
            .await;

        // The block retry fires first; once budgets are spent the rescue
        // runs (and fails) exactly once for this task identity.
        assert_eq!(fix.invocations(), 1);
        assert!(summary.is_failed());
    }

    #[tokio::test]
    async fn test_outer_rescue_wins_over_inner_error_handler() {
        let mut harness = Harness::new();
        let flaky = ScriptedTask::always(":flaky", false);
        let fix = ScriptedTask::always(":fix", true);
        let tell = ScriptedTask::always(":tell", true);
        harness.add(flaky.clone());
        harness.add(fix.clone());
        harness.add(tell.clone());
        // :flaky runs under two blocks: the pipeline's own error-notify
        // block (innermost) and the CLI-level rescue block around the
        // pipeline call.
        harness.registry.register_pipeline(Pipeline {
            name: ":inner".into(),
            elements: vec![PipelineElement::Block {
                modifiers: BlockModifiers {
                    error: ":tell".into(),
                    ..BlockModifiers::default()
                },
                calls: vec![TaskCall::new(":flaky")],
            }],
            ..Pipeline::default()
        });

        let (summary, _) = harness
            .run(&["{@rescue", "\":fix\"}", ":inner", "{/@}"], false)
            .await;

        // the healing rescue outranks the nearer notification-only handler
        assert_eq!(fix.invocations(), 1);
        assert_eq!(tell.invocations(), 0);
        assert!(!summary.is_failed());
        assert_eq!(summary.rescued, 1);
    }

    #[tokio::test]
    async fn test_run_can_be_driven_from_a_spawned_task() {
        let mut harness = Harness::new();
        let a = ScriptedTask::always(":a", true);
        harness.add(a.clone());

        // tokio::spawn requires the whole run future to be Send
        let handle = tokio::spawn(async move { harness.run(&[":a"], false).await });
        let (summary, _) = handle.await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(a.invocations(), 1);
    }

    #[tokio::test]
    async fn test_errored_task_flows_through_same_policy() {
        let mut harness = Harness::new();
        let boom = ScriptedTask::new(
            ":boom",
            vec![Err("disk on fire".to_string()), Ok(true)],
        );
        harness.add(boom.clone());

        let (summary, tracker) = harness
            .run(&["{@retry", "1}", ":boom", "{/@}"], false)
            .await;
        assert_eq!(boom.invocations(), 2);
        assert!(!summary.is_failed());
        assert!(transitions_of(&tracker, ":boom").contains(&"retried".to_string()));
    }

    #[tokio::test]
    async fn test_keep_going_plain_failure_continues() {
        let mut harness = Harness::new();
        let bad = ScriptedTask::always(":bad", false);
        let good = ScriptedTask::always(":good", true);
        harness.add(bad.clone());
        harness.add(good.clone());

        let (summary, _) = harness.run(&[":bad", ":good"], true).await;
        assert_eq!(good.invocations(), 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
    }

    #[tokio::test]
    async fn test_plain_failure_aborts_run_immediately() {
        let mut harness = Harness::new();
        let bad = ScriptedTask::always(":bad", false);
        let good = ScriptedTask::always(":good", true);
        harness.add(bad.clone());
        harness.add(good.clone());

        let (summary, tracker) = harness.run(&[":bad", ":good"], false).await;
        assert_eq!(good.invocations(), 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(transitions_of(&tracker, ":good"), vec!["skipped"]);
    }
}

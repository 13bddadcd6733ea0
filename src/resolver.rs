//! Expansion of grouped blocks into a flat, ordered schedule of concrete
//! task executions.
//!
//! Pipelines expand recursively (a pipeline step may name another pipeline;
//! there is deliberately no cycle detection, only a depth guard that turns a
//! runaway recursion into a clean error). Every produced task carries the
//! chain of blocks governing it, innermost first, and every visited block
//! gets its rescue/error lists resolved once into ready-to-run task lists.

use crate::blocks::{parse_handler_calls, ArgumentBlock, BlockArena, BlockId, BlockModifiers};
use crate::errors::ResolutionError;
use crate::registry::{rewrite_with_aliases, Registered, TaskDeclaration, TaskRegistry};
use crate::types::TaskCall;
use anyhow::Result;
use std::collections::HashMap;
use tracing::debug;

/// Hardening guard, not a behavior change: deep enough for any sane pipeline
/// composition, shallow enough to fail before the stack does.
pub const MAX_PIPELINE_DEPTH: usize = 64;

/// Env tag written into tasks resolved through a pipeline, carrying the
/// nesting depth of the pipeline that contributed them.
pub const PIPELINE_DEPTH_ENV: &str = "RITMO_PIPELINE_DEPTH";

/// A concrete unit of work, bound to its declaration, merged args and env,
/// and the governing block chain (innermost first).
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: u64,
    pub declaration: TaskDeclaration,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub parent_pipeline: Option<String>,
    pub blocks: Vec<BlockId>,
}

/// Ordered, append-only sequence of scheduled tasks.
#[derive(Debug, Default)]
pub struct ResolvedTaskBag {
    tasks: Vec<ScheduledTask>,
}

impl ResolvedTaskBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: ScheduledTask) {
        self.tasks.push(task);
    }

    pub fn tasks(&self) -> &[ScheduledTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Rescue/error task lists of one block, resolved and ready to run.
#[derive(Debug, Default)]
pub struct BlockHandlers {
    pub rescue: Vec<ScheduledTask>,
    pub error: Vec<ScheduledTask>,
}

/// Output of one `resolve()` call: the schedule plus the resolved handler
/// lists keyed by block identity.
#[derive(Debug, Default)]
pub struct Resolution {
    pub bag: ResolvedTaskBag,
    pub handlers: HashMap<BlockId, BlockHandlers>,
}

pub struct PipelineResolver<'r> {
    registry: &'r dyn TaskRegistry,
    next_id: u64,
}

impl<'r> PipelineResolver<'r> {
    pub fn new(registry: &'r dyn TaskRegistry) -> Self {
        Self {
            registry,
            next_id: 0,
        }
    }

    /// Expand the grouped blocks of one request into a flat schedule.
    /// Fails fast: any unresolved name or invalid block aborts before any
    /// task can run.
    pub fn resolve(
        &mut self,
        block_ids: &[BlockId],
        arena: &mut BlockArena,
    ) -> Result<Resolution> {
        let mut resolution = Resolution::default();
        for &id in block_ids {
            self.resolve_block_handlers(id, arena, &mut resolution.handlers)?;
            let calls = arena.get(id).tasks.clone();
            for call in &calls {
                self.resolve_call(
                    call,
                    &[id],
                    0,
                    &HashMap::new(),
                    None,
                    arena,
                    &mut resolution,
                )?;
            }
        }
        debug!(
            "resolved {} scheduled task(s) across {} block(s)",
            resolution.bag.len(),
            block_ids.len()
        );
        Ok(resolution)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_call(
        &mut self,
        call: &TaskCall,
        blocks: &[BlockId],
        depth: usize,
        env: &HashMap<String, String>,
        parent_pipeline: Option<&str>,
        arena: &mut BlockArena,
        resolution: &mut Resolution,
    ) -> Result<()> {
        let registered = self.lookup(&call.name)?;
        match registered {
            Registered::Declarations(declarations) => {
                for declaration in declarations {
                    let mut args = declaration.default_args.clone();
                    args.extend(call.args.iter().cloned());
                    let merged_env = merged(&declaration.env, env);
                    resolution.bag.push(ScheduledTask {
                        id: self.next_id(),
                        declaration,
                        args,
                        env: merged_env,
                        parent_pipeline: parent_pipeline.map(String::from),
                        blocks: blocks.to_vec(),
                    });
                }
            }
            Registered::Pipeline(pipeline) => {
                if depth + 1 > MAX_PIPELINE_DEPTH {
                    return Err(ResolutionError::DepthExceeded(MAX_PIPELINE_DEPTH).into());
                }
                debug!("expanding pipeline '{}' at depth {}", pipeline.name, depth);
                let mut pipeline_env = merged(env, &pipeline.env);
                pipeline_env.insert(PIPELINE_DEPTH_ENV.to_string(), depth.to_string());

                for element in &pipeline.elements {
                    match element {
                        crate::registry::PipelineElement::Call(inner) => {
                            // Pipeline steps take the calling invocation's
                            // blocks; their own args come from the step.
                            self.resolve_call(
                                inner,
                                blocks,
                                depth + 1,
                                &pipeline_env,
                                Some(&pipeline.name),
                                arena,
                                resolution,
                            )?;
                        }
                        crate::registry::PipelineElement::Block { modifiers, calls } => {
                            let inner_id =
                                materialize_block(modifiers, calls.clone(), arena)?;
                            self.resolve_block_handlers(
                                inner_id,
                                arena,
                                &mut resolution.handlers,
                            )?;
                            // Innermost first: the pipeline's own block takes
                            // policy precedence over inherited ones.
                            let mut chain = vec![inner_id];
                            chain.extend_from_slice(blocks);
                            for inner in calls {
                                self.resolve_call(
                                    inner,
                                    &chain,
                                    depth + 1,
                                    &pipeline_env,
                                    Some(&pipeline.name),
                                    arena,
                                    resolution,
                                )?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve a block's rescue/error call lists into their own scheduled
    /// task lists, once per block identity. Each handler task gets a fresh
    /// implicit block so the engine runs it under the uniform zero policy.
    fn resolve_block_handlers(
        &mut self,
        id: BlockId,
        arena: &mut BlockArena,
        handlers: &mut HashMap<BlockId, BlockHandlers>,
    ) -> Result<()> {
        if handlers.contains_key(&id) {
            return Ok(());
        }
        let block = arena.get(id);
        if block.has_rescue() && block.has_error() {
            return Err(ResolutionError::ConflictingHandlers.into());
        }
        let rescue_calls = block.on_rescue.clone();
        let error_calls = block.on_error.clone();

        let rescue = self.resolve_handler_list(&rescue_calls, arena)?;
        let error = self.resolve_handler_list(&error_calls, arena)?;
        handlers.insert(id, BlockHandlers { rescue, error });
        Ok(())
    }

    fn resolve_handler_list(
        &mut self,
        calls: &[TaskCall],
        arena: &mut BlockArena,
    ) -> Result<Vec<ScheduledTask>> {
        let mut scratch = Resolution::default();
        for call in calls {
            let wrapper = arena.insert(ArgumentBlock::singleton(call.clone()));
            self.resolve_call(
                call,
                &[wrapper],
                0,
                &HashMap::new(),
                None,
                arena,
                &mut scratch,
            )?;
        }
        Ok(scratch.bag.tasks.clone())
    }

    fn lookup(&self, name: &str) -> Result<Registered> {
        if let Some(found) = self.registry.lookup(name)? {
            return Ok(found);
        }
        if let Some(rewritten) = rewrite_with_aliases(name, self.registry.aliases()) {
            debug!("name '{}' missed, retrying as '{}'", name, rewritten);
            if let Some(found) = self.registry.lookup(&rewritten)? {
                return Ok(found);
            }
        }
        Err(ResolutionError::TaskNotFound(name.to_string()).into())
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Materialize a block declared inside a pipeline definition into the arena.
fn materialize_block(
    modifiers: &BlockModifiers,
    calls: Vec<TaskCall>,
    arena: &mut BlockArena,
) -> Result<BlockId> {
    let on_rescue = parse_handler_calls(&modifiers.rescue)?;
    let on_error = parse_handler_calls(&modifiers.error)?;
    Ok(arena.insert(ArgumentBlock {
        tasks: calls,
        retry_per_task: modifiers.retry,
        retry_whole_block: modifiers.retry_block,
        on_rescue,
        on_error,
        explicit: true,
    }))
}

/// Overlay merge: `overlay` wins over `base`.
fn merged(
    base: &HashMap<String, String>,
    overlay: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut out = base.clone();
    for (k, v) in overlay {
        out.insert(k.clone(), v.clone());
    }
    out
}

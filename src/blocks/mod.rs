//! Block model: the retry/rescue/error policy scopes that task invocations
//! belong to.
//!
//! Blocks live in an arena and are referenced everywhere by a copyable
//! integer handle. Per-run mutable state (retry counters, the rescue
//! exhaustion set) is stored alongside the block definition and is only ever
//! touched by the engine, one task at a time.

pub mod grouper;
pub mod modifier;
pub mod tokenizer;

pub use grouper::{group_tokens, parse_handler_calls};
pub use modifier::BlockModifiers;
pub use tokenizer::RawBlock;

use crate::types::TaskCall;
use std::collections::{HashMap, HashSet};

/// Handle to an [`ArgumentBlock`] inside a [`BlockArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub usize);

/// A group of task invocations sharing one retry/rescue/error policy.
///
/// Bare invocations get an implicit singleton block with the zero policy so
/// the engine never special-cases them.
#[derive(Debug, Clone, Default)]
pub struct ArgumentBlock {
    /// Invocations in this block, in CLI order, after shared-arg propagation.
    pub tasks: Vec<TaskCall>,
    /// Re-runs allowed per failing task before other measures.
    pub retry_per_task: u32,
    /// Restarts of the whole block allowed after per-task retries run out.
    pub retry_whole_block: u32,
    /// Alternate invocations whose success heals a failure in this block.
    pub on_rescue: Vec<TaskCall>,
    /// Side-effect-only invocations run on unrecoverable failure.
    pub on_error: Vec<TaskCall>,
    /// False for the implicit wrapper around a bare invocation.
    pub explicit: bool,
}

impl ArgumentBlock {
    /// Implicit wrapper for one bare invocation: zero retries, no handlers.
    pub fn singleton(call: TaskCall) -> Self {
        Self {
            tasks: vec![call],
            ..Self::default()
        }
    }

    pub fn has_rescue(&self) -> bool {
        !self.on_rescue.is_empty()
    }

    pub fn has_error(&self) -> bool {
        !self.on_error.is_empty()
    }
}

/// Per-run mutable counters for one block. Keyed by scheduled-task identity
/// so a whole-block retry can reset per-task counts without touching the
/// block-level count or the exhaustion set.
#[derive(Debug, Default)]
pub struct BlockRunState {
    task_retries: HashMap<u64, u32>,
    block_retries_used: u32,
    rescue_exhausted: HashSet<u64>,
}

/// Owner of every block created while parsing a request (and while
/// materializing blocks declared inside pipelines).
#[derive(Debug, Default)]
pub struct BlockArena {
    blocks: Vec<ArgumentBlock>,
    state: Vec<BlockRunState>,
}

impl BlockArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, block: ArgumentBlock) -> BlockId {
        self.blocks.push(block);
        self.state.push(BlockRunState::default());
        BlockId(self.blocks.len() - 1)
    }

    pub fn get(&self, id: BlockId) -> &ArgumentBlock {
        &self.blocks[id.0]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn task_retries_used(&self, id: BlockId, task_id: u64) -> u32 {
        self.state[id.0]
            .task_retries
            .get(&task_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn record_task_retry(&mut self, id: BlockId, task_id: u64) -> u32 {
        let count = self.state[id.0].task_retries.entry(task_id).or_insert(0);
        *count += 1;
        *count
    }

    pub fn block_retries_used(&self, id: BlockId) -> u32 {
        self.state[id.0].block_retries_used
    }

    /// Record a whole-block retry: bumps the block counter and resets every
    /// per-task count so re-run tasks get their full per-task budget again.
    pub fn record_block_retry(&mut self, id: BlockId) -> u32 {
        let state = &mut self.state[id.0];
        state.block_retries_used += 1;
        state.task_retries.clear();
        state.block_retries_used
    }

    pub fn is_rescue_exhausted(&self, id: BlockId, task_id: u64) -> bool {
        self.state[id.0].rescue_exhausted.contains(&task_id)
    }

    pub fn mark_rescue_exhausted(&mut self, id: BlockId, task_id: u64) {
        self.state[id.0].rescue_exhausted.insert(task_id);
    }
}

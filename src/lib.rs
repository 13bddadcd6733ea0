//! ritmo — sequential task runner with retriable, rescuable pipeline blocks.
//!
//! CLI tokens are grouped into policy blocks, names are resolved (pipelines
//! expanding recursively) into a flat schedule, and the schedule runs under
//! an explicit retry/rescue/error state machine.

pub mod blocks;
pub mod context;
pub mod engine;
pub mod errors;
pub mod loader;
pub mod registry;
pub mod resolver;
pub mod shell;
pub mod types;

pub use blocks::{group_tokens, ArgumentBlock, BlockArena, BlockId};
pub use engine::{ExecutionEngine, RunConfig, RunSummary};
pub use errors::{ParseError, ResolutionError};
pub use registry::{InMemoryRegistry, Pipeline, Registered, Task, TaskRegistry};
pub use resolver::{PipelineResolver, Resolution, ResolvedTaskBag, ScheduledTask};
pub use types::{TaskCall, TaskStatus};

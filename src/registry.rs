//! Task and pipeline registry: the lookup boundary between the execution
//! core and whatever defines tasks (the YAML loader, tests, embedders).

use crate::blocks::BlockModifiers;
use crate::context::ExecutionContext;
use crate::types::TaskCall;
use anyhow::Result;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A runnable task implementation.
///
/// `execute` returns `Ok(false)` for a clean failure and `Err` for an error
/// the task did not catch; the engine treats both under the same policy.
#[async_trait::async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &ExecutionContext) -> Result<bool>;

    /// Request execution in an isolated subprocess.
    fn should_fork(&self) -> bool {
        false
    }

    /// Run as another user; implies isolation.
    fn become_user(&self) -> Option<&str> {
        None
    }
}

/// A registered concrete task: the implementation plus its declaration-time
/// defaults. One registry name may map to several of these (composite
/// multi-step tasks).
#[derive(Clone)]
pub struct TaskDeclaration {
    pub name: String,
    pub description: String,
    pub task: Arc<dyn Task>,
    pub default_args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl TaskDeclaration {
    pub fn new(name: impl Into<String>, task: Arc<dyn Task>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            task,
            default_args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

impl fmt::Debug for TaskDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDeclaration")
            .field("name", &self.name)
            .field("default_args", &self.default_args)
            .finish()
    }
}

/// One step of a pipeline: a plain invocation or an inline block of them.
#[derive(Debug, Clone)]
pub enum PipelineElement {
    Call(TaskCall),
    Block {
        modifiers: BlockModifiers,
        calls: Vec<TaskCall>,
    },
}

/// A named, reusable ordered composition of invocations and blocks.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub name: String,
    pub description: String,
    pub env: HashMap<String, String>,
    pub elements: Vec<PipelineElement>,
}

/// What a registry name resolves to.
#[derive(Clone)]
pub enum Registered {
    Declarations(Vec<TaskDeclaration>),
    Pipeline(Pipeline),
}

/// Lookup boundary consumed by the resolver. Absent names are `Ok(None)`;
/// `Err` is reserved for the registry itself failing.
pub trait TaskRegistry: Send + Sync {
    fn lookup(&self, name: &str) -> Result<Option<Registered>>;

    /// Alias-group prefix substitutions, tried when a name misses.
    fn aliases(&self) -> &[(String, String)] {
        &[]
    }

    /// Registered names, for listings.
    fn names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Rewrite a missed name through the alias table: first matching prefix wins.
pub fn rewrite_with_aliases(name: &str, aliases: &[(String, String)]) -> Option<String> {
    for (from, to) in aliases {
        if let Some(rest) = name.strip_prefix(from.as_str()) {
            return Some(format!("{}{}", to, rest));
        }
    }
    None
}

/// Straightforward map-backed registry; the YAML loader produces one.
#[derive(Default)]
pub struct InMemoryRegistry {
    entries: HashMap<String, Registered>,
    aliases: Vec<(String, String)>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_task(&mut self, declaration: TaskDeclaration) {
        self.entries.insert(
            declaration.name.clone(),
            Registered::Declarations(vec![declaration]),
        );
    }

    pub fn register_composite(&mut self, name: impl Into<String>, parts: Vec<TaskDeclaration>) {
        self.entries.insert(name.into(), Registered::Declarations(parts));
    }

    pub fn register_pipeline(&mut self, pipeline: Pipeline) {
        self.entries
            .insert(pipeline.name.clone(), Registered::Pipeline(pipeline));
    }

    pub fn add_alias(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.aliases.push((from.into(), to.into()));
    }
}

impl TaskRegistry for InMemoryRegistry {
    fn lookup(&self, name: &str) -> Result<Option<Registered>> {
        Ok(self.entries.get(name).cloned())
    }

    fn aliases(&self) -> &[(String, String)] {
        &self.aliases
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

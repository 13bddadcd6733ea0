//! YAML declarations file (`ritmo.yaml`) and its conversion into a registry.
//!
//! Parses the typed schema, validates structural constraints, and builds an
//! in-memory registry of shell tasks and pipelines. The loader is one
//! producer of registries; the core only ever sees the `TaskRegistry` trait.

use crate::blocks::BlockModifiers;
use crate::registry::{InMemoryRegistry, Pipeline, PipelineElement, TaskDeclaration};
use crate::shell::ShellTask;
use crate::types::TaskCall;
use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Top-level declarations file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclarationsFile {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Env applied to every task declared in this file
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Named tasks (order-preserving)
    #[serde(default)]
    pub tasks: IndexMap<String, TaskDef>,

    /// Named pipelines (order-preserving)
    #[serde(default)]
    pub pipelines: IndexMap<String, PipelineDef>,

    /// Alias-group prefix substitutions
    #[serde(default)]
    pub aliases: IndexMap<String, String>,
}

/// One declared shell task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    #[serde(default)]
    pub description: Option<String>,

    /// Shell command run via `sh -c`
    pub shell: String,

    /// Args prepended before any CLI-given args
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Execute in an isolated subprocess
    #[serde(default)]
    pub fork: bool,

    /// Run as this user (implies isolation)
    #[serde(default)]
    pub user: Option<String>,
}

/// One declared pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    pub steps: Vec<StepDef>,
}

/// A pipeline step: a plain task reference or an inline block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepDef {
    Task {
        task: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Block {
        block: BlockDef,
    },
}

/// An inline block inside a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDef {
    #[serde(default)]
    pub retry: u32,

    #[serde(default, rename = "retry-block", alias = "retry_block")]
    pub retry_block: u32,

    /// Raw CLI text, grouped the same way as on the command line
    #[serde(default)]
    pub rescue: String,

    #[serde(default)]
    pub error: String,

    pub steps: Vec<StepDef>,
}

/// Parse a declarations file from a path.
pub fn load_declarations_file(path: &Path) -> Result<DeclarationsFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    load_declarations(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Parse a declarations file from a YAML string and validate it.
pub fn load_declarations(yaml: &str) -> Result<DeclarationsFile> {
    let file: DeclarationsFile =
        serde_yaml::from_str(yaml).context("invalid declarations YAML")?;
    validate(&file)?;
    Ok(file)
}

fn validate(file: &DeclarationsFile) -> Result<()> {
    if file.version != "1.0" {
        bail!(
            "unsupported declarations version '{}', expected '1.0'",
            file.version
        );
    }

    for (name, task) in &file.tasks {
        if task.shell.trim().is_empty() {
            bail!("task '{}' has empty shell command", name);
        }
    }

    for (name, pipeline) in &file.pipelines {
        if pipeline.steps.is_empty() {
            bail!("pipeline '{}' has no steps", name);
        }
        for step in &pipeline.steps {
            validate_step(name, step)?;
        }
    }

    Ok(())
}

fn validate_step(pipeline: &str, step: &StepDef) -> Result<()> {
    match step {
        StepDef::Task { task, .. } => {
            if !task.starts_with(':') {
                bail!(
                    "pipeline '{}' step '{}' must be ':'-prefixed",
                    pipeline,
                    task
                );
            }
        }
        StepDef::Block { block } => {
            if !block.rescue.is_empty() && !block.error.is_empty() {
                bail!(
                    "pipeline '{}' has a block declaring both rescue and error",
                    pipeline
                );
            }
            for inner in &block.steps {
                match inner {
                    StepDef::Task { .. } => validate_step(pipeline, inner)?,
                    StepDef::Block { .. } => {
                        bail!("pipeline '{}' nests a block inside a block", pipeline)
                    }
                }
            }
        }
    }
    Ok(())
}

/// Build the registry a declarations file describes. Task names are
/// registered with their `:` prefix added when missing.
pub fn build_registry(file: &DeclarationsFile) -> Result<InMemoryRegistry> {
    let mut registry = InMemoryRegistry::new();

    for (name, def) in &file.tasks {
        let name = canonical(name);
        let task = ShellTask::new(&name, &def.shell)
            .forked(def.fork)
            .as_user(def.user.clone());
        let mut env = file.env.clone();
        env.extend(def.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        registry.register_task(TaskDeclaration {
            name: name.clone(),
            description: def.description.clone().unwrap_or_default(),
            task: Arc::new(task),
            default_args: def.args.clone(),
            env,
        });
    }

    for (name, def) in &file.pipelines {
        let name = canonical(name);
        let elements = def
            .steps
            .iter()
            .map(step_to_element)
            .collect::<Result<Vec<_>>>()?;
        registry.register_pipeline(Pipeline {
            name,
            description: def.description.clone().unwrap_or_default(),
            env: def.env.clone(),
            elements,
        });
    }

    for (from, to) in &file.aliases {
        registry.add_alias(canonical(from), canonical(to));
    }

    Ok(registry)
}

fn step_to_element(step: &StepDef) -> Result<PipelineElement> {
    match step {
        StepDef::Task { task, args } => Ok(PipelineElement::Call(TaskCall::with_args(
            canonical(task),
            args.clone(),
        ))),
        StepDef::Block { block } => {
            let calls = block
                .steps
                .iter()
                .map(|inner| match inner {
                    StepDef::Task { task, args } => {
                        Ok(TaskCall::with_args(canonical(task), args.clone()))
                    }
                    StepDef::Block { .. } => bail!("blocks cannot nest"),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(PipelineElement::Block {
                modifiers: BlockModifiers {
                    retry: block.retry,
                    retry_block: block.retry_block,
                    rescue: block.rescue.clone(),
                    error: block.error.clone(),
                },
                calls,
            })
        }
    }
}

fn canonical(name: &str) -> String {
    if name.starts_with(':') {
        name.to_string()
    } else {
        format!(":{}", name)
    }
}

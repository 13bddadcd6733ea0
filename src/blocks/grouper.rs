//! Grouping of CLI tokens into ordered blocks of task invocations.
//!
//! Two passes: a state machine that opens a new invocation on every
//! `:`-prefixed token (or shared-args `@`), attaching flags and positionals
//! to the open one, and replaces each tokenizer placeholder with a fully
//! built explicit block; then shared-argument propagation, which never
//! crosses an explicit block boundary.

use super::modifier::parse_modifiers;
use super::tokenizer::{extract_blocks, split_cli_text, RawBlock};
use super::{ArgumentBlock, BlockArena, BlockId};
use crate::errors::ParseError;
use crate::types::TaskCall;
use tracing::warn;

enum Item {
    Call(TaskCall),
    Explicit(BlockId),
}

/// Group a token stream into ordered blocks inside `arena`.
///
/// Bare invocations each get an implicit singleton block; `{@...}...{/@}`
/// spans become one explicit block holding every invocation in their body.
pub fn group_tokens(
    tokens: &[String],
    arena: &mut BlockArena,
) -> Result<Vec<BlockId>, ParseError> {
    let (clean, raw_blocks) = extract_blocks(tokens)?;

    let mut items: Vec<Item> = Vec::new();
    let mut current: Option<TaskCall> = None;
    for token in &clean {
        if let Some(raw) = raw_blocks.get(token) {
            if let Some(call) = current.take() {
                items.push(Item::Call(call));
            }
            items.push(Item::Explicit(build_explicit_block(raw, arena)?));
        } else if token.starts_with(':') || token == "@" {
            if let Some(call) = current.take() {
                items.push(Item::Call(call));
            }
            current = Some(TaskCall::new(token));
        } else if let Some(call) = current.as_mut() {
            call.args.push(token.clone());
        } else {
            warn!("ignoring token '{}' before any task invocation", token);
        }
    }
    if let Some(call) = current {
        items.push(Item::Call(call));
    }

    // Propagation pass: a bare `@` item replaces the active shared set (empty
    // args clear it); explicit blocks reset it and handle their own interior.
    let mut shared: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for item in items {
        match item {
            Item::Call(call) if call.name == "@" => shared = call.args,
            Item::Call(mut call) => {
                call.args.extend_from_slice(&shared);
                out.push(arena.insert(ArgumentBlock::singleton(call)));
            }
            Item::Explicit(id) => {
                shared.clear();
                out.push(id);
            }
        }
    }
    Ok(out)
}

/// Build one explicit block from its raw span: parse modifiers, group the
/// body's invocations into a single merged list, and group each handler's
/// raw text into its own invocation list.
fn build_explicit_block(raw: &RawBlock, arena: &mut BlockArena) -> Result<BlockId, ParseError> {
    let modifiers = parse_modifiers(&raw.header)?;
    let tasks = apply_shared_args(collect_calls(&raw.body));
    let on_rescue = parse_handler_calls(&modifiers.rescue)?;
    let on_error = parse_handler_calls(&modifiers.error)?;
    Ok(arena.insert(ArgumentBlock {
        tasks,
        retry_per_task: modifiers.retry,
        retry_whole_block: modifiers.retry_block,
        on_rescue,
        on_error,
        explicit: true,
    }))
}

/// Group a rescue/error modifier's raw text into task invocations. The text
/// goes through the same tokenize-then-group path as the command line; if it
/// is itself written as a block, that block's invocation list is taken (its
/// own modifiers are not honored here).
pub fn parse_handler_calls(text: &str) -> Result<Vec<TaskCall>, ParseError> {
    let tokens = split_cli_text(text)?;
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    let (clean, raw_blocks) = extract_blocks(&tokens)?;
    if let Some(first) = clean.first() {
        if let Some(raw) = raw_blocks.get(first) {
            return Ok(apply_shared_args(collect_calls(&raw.body)));
        }
    }
    Ok(apply_shared_args(collect_calls(&clean)))
}

/// State machine over block-free tokens: every `:`-prefixed token (or `@`)
/// opens an invocation, everything else is an argument of the open one.
fn collect_calls(tokens: &[String]) -> Vec<TaskCall> {
    let mut calls = Vec::new();
    let mut current: Option<TaskCall> = None;
    for token in tokens {
        if token.starts_with(':') || token == "@" {
            if let Some(call) = current.take() {
                calls.push(call);
            }
            current = Some(TaskCall::new(token));
        } else if let Some(call) = current.as_mut() {
            call.args.push(token.clone());
        } else {
            warn!("ignoring token '{}' before any task invocation", token);
        }
    }
    if let Some(call) = current {
        calls.push(call);
    }
    calls
}

/// Per-list shared-argument propagation: `@ args...` sets the shared set for
/// every later invocation (own args first), bare `@` clears it.
fn apply_shared_args(calls: Vec<TaskCall>) -> Vec<TaskCall> {
    let mut shared: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for mut call in calls {
        if call.name == "@" {
            shared = call.args;
            continue;
        }
        call.args.extend_from_slice(&shared);
        out.push(call);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(input: &[&str]) -> Vec<String> {
        input.iter().map(|s| s.to_string()).collect()
    }

    fn group(input: &[&str]) -> (Vec<BlockId>, BlockArena) {
        let mut arena = BlockArena::new();
        let ids = group_tokens(&toks(input), &mut arena).unwrap();
        (ids, arena)
    }

    #[test]
    fn test_block_free_input_yields_one_singleton_block_per_task() {
        let (ids, arena) = group(&[":lint", ":build", "--release", ":test", "unit"]);

        assert_eq!(ids.len(), 3);
        for id in &ids {
            let block = arena.get(*id);
            assert!(!block.explicit);
            assert_eq!(block.tasks.len(), 1);
        }
        assert_eq!(arena.get(ids[0]).tasks[0], TaskCall::new(":lint"));
        assert_eq!(
            arena.get(ids[1]).tasks[0],
            TaskCall::with_args(":build", vec!["--release".into()])
        );
        assert_eq!(
            arena.get(ids[2]).tasks[0],
            TaskCall::with_args(":test", vec!["unit".into()])
        );
    }

    #[test]
    fn test_flags_and_positionals_attach_to_open_call() {
        let (ids, arena) = group(&[":deploy", "--env", "prod", "-v", "eu-west-1"]);
        assert_eq!(ids.len(), 1);
        assert_eq!(
            arena.get(ids[0]).tasks[0].args,
            toks(&["--env", "prod", "-v", "eu-west-1"])
        );
    }

    #[test]
    fn test_explicit_block_merges_body_into_one_block() {
        let (ids, arena) = group(&[
            ":before", "{@retry", "2}", ":migrate", ":seed", "{/@}", ":after",
        ]);
        assert_eq!(ids.len(), 3);

        let block = arena.get(ids[1]);
        assert!(block.explicit);
        assert_eq!(block.retry_per_task, 2);
        assert_eq!(block.tasks.len(), 2);
        assert_eq!(block.tasks[0].name, ":migrate");
        assert_eq!(block.tasks[1].name, ":seed");

        assert_eq!(arena.get(ids[0]).tasks[0].name, ":before");
        assert_eq!(arena.get(ids[2]).tasks[0].name, ":after");
    }

    #[test]
    fn test_rescue_text_grouped_into_handler_calls() {
        let (ids, arena) = group(&[
            "{@rescue", "\":rollback", "--fast\"}", ":migrate", "{/@}",
        ]);
        let block = arena.get(ids[0]);
        assert_eq!(block.on_rescue.len(), 1);
        assert_eq!(
            block.on_rescue[0],
            TaskCall::with_args(":rollback", vec!["--fast".into()])
        );
        assert!(block.on_error.is_empty());
    }

    #[test]
    fn test_error_text_with_two_calls() {
        let (ids, arena) = group(&[
            "{@error", "\":notify", "ops", ":page\"}", ":deploy", "{/@}",
        ]);
        let block = arena.get(ids[0]);
        assert_eq!(block.on_error.len(), 2);
        assert_eq!(
            block.on_error[0],
            TaskCall::with_args(":notify", vec!["ops".into()])
        );
        assert_eq!(block.on_error[1], TaskCall::new(":page"));
    }

    #[test]
    fn test_shared_args_propagate_until_reset() {
        let (ids, arena) = group(&["@", "--x", ":a", "own", ":b", "@", ":c"]);
        assert_eq!(ids.len(), 3);
        // own args first, then propagated
        assert_eq!(arena.get(ids[0]).tasks[0].args, toks(&["own", "--x"]));
        assert_eq!(arena.get(ids[1]).tasks[0].args, toks(&["--x"]));
        assert_eq!(arena.get(ids[2]).tasks[0].args, Vec::<String>::new());
    }

    #[test]
    fn test_shared_args_do_not_cross_explicit_block_boundary() {
        let (ids, arena) = group(&[
            "@", "--x", ":a", "{@retry", "1}", ":b", "{/@}", ":c",
        ]);
        assert_eq!(ids.len(), 3);
        assert_eq!(arena.get(ids[0]).tasks[0].args, toks(&["--x"]));
        // inside the block: no propagation from outside
        assert_eq!(arena.get(ids[1]).tasks[0].args, Vec::<String>::new());
        // after the block: the set was reset
        assert_eq!(arena.get(ids[2]).tasks[0].args, Vec::<String>::new());
    }

    #[test]
    fn test_shared_args_inside_block_stay_inside() {
        let (ids, arena) = group(&[
            "{@retry", "1}", "@", "--y", ":a", ":b", "{/@}", ":c",
        ]);
        let block = arena.get(ids[0]);
        assert_eq!(block.tasks[0].args, toks(&["--y"]));
        assert_eq!(block.tasks[1].args, toks(&["--y"]));
        assert_eq!(arena.get(ids[1]).tasks[0].args, Vec::<String>::new());
    }

    #[test]
    fn test_nested_block_in_body_is_parse_error() {
        let mut arena = BlockArena::new();
        let err = group_tokens(
            &toks(&["{@retry", "1}", ":a", "{@retry", "2}", ":b", "{/@}", "{/@}"]),
            &mut arena,
        )
        .unwrap_err();
        assert_eq!(err, ParseError::NestedBlock);
    }

    #[test]
    fn test_parse_handler_calls_empty_text() {
        assert!(parse_handler_calls("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_handler_calls_block_text_takes_body_calls() {
        let calls = parse_handler_calls("{@retry 5}:x :y{/@}").unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, ":x");
        assert_eq!(calls[1].name, ":y");
    }
}

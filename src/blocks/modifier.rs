//! Parsing of block header text into typed modifiers.
//!
//! A header looks like `retry 2 @retry-block 1 @rescue ":rollback"` (the
//! leading `@` of the first modifier is consumed by the tokenizer together
//! with `{`). Counts are lenient: a non-integer value falls back to 0.
//! Rescue/error values stay raw; the grouper re-tokenizes them later.

use crate::errors::ParseError;
use super::tokenizer::split_cli_text;

/// Typed view of a block header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockModifiers {
    pub retry: u32,
    pub retry_block: u32,
    pub rescue: String,
    pub error: String,
}

impl BlockModifiers {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Parse a raw header into modifiers. Empty headers are valid (a block may
/// exist purely for grouping); anything else must be a known modifier, each
/// declared at most once.
pub fn parse_modifiers(header: &str) -> Result<BlockModifiers, ParseError> {
    let header = header.trim();
    let mut modifiers = BlockModifiers::default();
    if header.is_empty() {
        return Ok(modifiers);
    }

    let mut seen: Vec<String> = Vec::new();
    // `@` separates modifiers; the first one arrives without it.
    for clause in split_clauses(header) {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        let (name, value) = match clause.split_once(char::is_whitespace) {
            Some((n, v)) => (n, v.trim()),
            None => (clause, ""),
        };

        if seen.iter().any(|s| s == name) {
            return Err(ParseError::DuplicateModifier(name.to_string()));
        }
        seen.push(name.to_string());

        match name {
            "retry" => modifiers.retry = parse_count(value),
            "retry-block" => modifiers.retry_block = parse_count(value),
            "rescue" => modifiers.rescue = unquote(value)?,
            "error" => modifiers.error = unquote(value)?,
            _ => return Err(ParseError::UnknownModifier(name.to_string())),
        }
    }

    if seen.is_empty() {
        // Non-empty header that produced no modifier at all.
        return Err(ParseError::InvalidHeader(header.to_string()));
    }

    Ok(modifiers)
}

/// Split a header on `@`, ignoring `@` inside quoted values so a rescue text
/// like `":notify @admins"` stays one clause.
fn split_clauses(header: &str) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in header.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '@' => clauses.push(std::mem::take(&mut current)),
                _ => current.push(c),
            },
        }
    }
    clauses.push(current);
    clauses
}

/// Lenient count parsing: `@retry banana` means `@retry 0`.
fn parse_count(value: &str) -> u32 {
    value.parse().unwrap_or(0)
}

/// Strip one level of surrounding quotes from a rescue/error value, keeping
/// the inner text raw for later grouping.
fn unquote(value: &str) -> Result<String, ParseError> {
    let tokens = split_cli_text(value)?;
    if tokens.len() == 1 {
        return Ok(tokens.into_iter().next().unwrap_or_default());
    }
    // Unquoted multi-token value: keep verbatim.
    Ok(value.to_string())
}

//! Extraction of `{@...}...{/@}` spans from the CLI token stream.
//!
//! The shell has already quote-split the tokens, so brace matching happens on
//! a string built by joining tokens with a private separator character; quoted
//! values that happen to contain braces or spaces survive untouched. Each
//! block span is replaced by a unique placeholder token, preserving order and
//! position, and the placeholder maps to the raw (not yet parsed) block.

use crate::errors::ParseError;
use indexmap::IndexMap;

/// Joins and re-splits tokens around brace matching. Unit separator: will not
/// appear in shell-split argv content.
const TOKEN_SEPARATOR: char = '\u{1f}';

const BLOCK_OPEN: &str = "{@";
const BLOCK_CLOSE: &str = "{/@}";

/// An extracted, not yet parsed block: the header text between `{@` and `}`
/// and the body tokens between `}` and `{/@}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub header: String,
    pub body: Vec<String>,
}

/// Scan the token stream for block spans, replacing each with a placeholder
/// token and recording placeholder → raw block. Token order is preserved.
pub fn extract_blocks(
    tokens: &[String],
) -> Result<(Vec<String>, IndexMap<String, RawBlock>), ParseError> {
    let mut joined: String = tokens
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(&TOKEN_SEPARATOR.to_string());
    let mut blocks = IndexMap::new();
    let mut counter = 0usize;

    while let Some(open) = joined.find(BLOCK_OPEN) {
        let header_end = find_unescaped_close(&joined[open..])
            .map(|off| open + off)
            .ok_or(ParseError::ClosingNotFound)?;

        // The header's `}` must come before any other block marker; a `}`
        // borrowed from a later `{/@}` (or a second `{@`) means this opener
        // never closed.
        let header_span = &joined[open + BLOCK_OPEN.len()..header_end];
        if header_span.contains(BLOCK_OPEN) || header_span.contains("{/@") {
            return Err(ParseError::ClosingNotFound);
        }

        let body_start = header_end + 1;
        let close = joined[body_start..]
            .find(BLOCK_CLOSE)
            .map(|off| body_start + off)
            .ok_or(ParseError::EndingNotFound)?;

        // Another opener before this block's closer means syntactic nesting.
        if joined[body_start..close].contains(BLOCK_OPEN) {
            return Err(ParseError::NestedBlock);
        }

        let header = joined[open + BLOCK_OPEN.len()..header_end]
            .replace(TOKEN_SEPARATOR, " ")
            .trim()
            .to_string();
        let body = split_separated(&joined[body_start..close]);

        counter += 1;
        let placeholder = format!("%ritmo_block_{}%", counter);
        blocks.insert(placeholder.clone(), RawBlock { header, body });

        let tail = &joined[close + BLOCK_CLOSE.len()..];
        joined = format!(
            "{}{sep}{}{sep}{}",
            &joined[..open],
            placeholder,
            tail,
            sep = TOKEN_SEPARATOR
        );
    }

    if joined.contains(BLOCK_CLOSE) {
        // A closer with no opener before it.
        return Err(ParseError::EndingNotFound);
    }

    Ok((split_separated(&joined), blocks))
}

/// Offset of the first `}` not preceded by a backslash, within `s`.
fn find_unescaped_close(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'}' && (i == 0 || bytes[i - 1] != b'\\') {
            return Some(i);
        }
    }
    None
}

/// Split on the private separator, dropping empty fragments produced by
/// consecutive separators at splice points.
fn split_separated(s: &str) -> Vec<String> {
    s.split(TOKEN_SEPARATOR)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Quote-aware split of raw modifier text (e.g. a `@rescue` value) into
/// tokens, the same way a shell would: double/single quotes group, backslash
/// escapes inside double quotes.
pub fn split_cli_text(text: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' && q == '"' {
                    if let Some(&next) = chars.peek() {
                        current.push(next);
                        chars.next();
                        continue;
                    }
                }
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err(ParseError::UnterminatedQuote(text.to_string()));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(input: &[&str]) -> Vec<String> {
        input.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_blocks_passes_tokens_through() {
        let input = toks(&[":build", "--release", ":test"]);
        let (out, blocks) = extract_blocks(&input).unwrap();
        assert_eq!(out, input);
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_extracts_single_block_in_position() {
        let input = toks(&[":before", "{@retry", "2}", ":deploy", "{/@}", ":after"]);
        let (out, blocks) = extract_blocks(&input).unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0], ":before");
        assert_eq!(out[2], ":after");

        let raw = blocks.get(&out[1]).expect("placeholder recorded");
        assert_eq!(raw.header, "retry 2");
        assert_eq!(raw.body, toks(&[":deploy"]));
    }

    #[test]
    fn test_extracts_two_blocks_in_order() {
        let input = toks(&[
            "{@retry", "1}", ":a", "{/@}", "{@error", "\":notify\"}", ":b", "{/@}",
        ]);
        let (out, blocks) = extract_blocks(&input).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks.get(&out[0]).unwrap().body, toks(&[":a"]));
        assert_eq!(blocks.get(&out[1]).unwrap().body, toks(&[":b"]));
    }

    #[test]
    fn test_header_and_body_may_share_a_token() {
        // The shell may hand us "{@retry 2}:deploy {/@}" as fewer tokens.
        let input = toks(&["{@retry 2}:deploy", "{/@}"]);
        let (out, blocks) = extract_blocks(&input).unwrap();
        assert_eq!(out.len(), 1);
        let raw = blocks.get(&out[0]).unwrap();
        assert_eq!(raw.header, "retry 2");
        assert_eq!(raw.body, toks(&[":deploy"]));
    }

    #[test]
    fn test_unmatched_open_is_closing_not_found() {
        let input = toks(&["{@retry", "2", ":deploy", "{/@}"]);
        assert_eq!(
            extract_blocks(&input).unwrap_err(),
            ParseError::ClosingNotFound
        );
    }

    #[test]
    fn test_missing_ending_is_ending_not_found() {
        let input = toks(&["{@retry", "2}", ":deploy"]);
        assert_eq!(
            extract_blocks(&input).unwrap_err(),
            ParseError::EndingNotFound
        );
    }

    #[test]
    fn test_nested_block_rejected() {
        let input = toks(&[
            "{@retry", "2}", ":a", "{@error", "\":x\"}", ":b", "{/@}", "{/@}",
        ]);
        assert_eq!(extract_blocks(&input).unwrap_err(), ParseError::NestedBlock);
    }

    #[test]
    fn test_stray_ending_rejected() {
        let input = toks(&[":a", "{/@}"]);
        assert_eq!(
            extract_blocks(&input).unwrap_err(),
            ParseError::EndingNotFound
        );
    }

    #[test]
    fn test_escaped_close_brace_in_header() {
        let input = toks(&["{@rescue", "\":fix", "\\}\"}", ":a", "{/@}"]);
        let (out, blocks) = extract_blocks(&input).unwrap();
        let raw = blocks.get(&out[0]).unwrap();
        assert!(raw.header.contains("\\}"));
        assert_eq!(raw.body, toks(&[":a"]));
    }

    #[test]
    fn test_split_cli_text_respects_quotes() {
        let tokens = split_cli_text(":rollback --msg \"db is down\" -v").unwrap();
        assert_eq!(tokens, toks(&[":rollback", "--msg", "db is down", "-v"]));
    }

    #[test]
    fn test_split_cli_text_single_quotes_and_empty() {
        assert_eq!(split_cli_text("  ").unwrap(), Vec::<String>::new());
        let tokens = split_cli_text(":a 'x y'").unwrap();
        assert_eq!(tokens, toks(&[":a", "x y"]));
    }

    #[test]
    fn test_split_cli_text_unterminated_quote() {
        assert!(matches!(
            split_cli_text(":a \"oops").unwrap_err(),
            ParseError::UnterminatedQuote(_)
        ));
    }
}

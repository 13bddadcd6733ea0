//! Error taxonomy for the planning half of a run.
//!
//! Both enums are fatal before any task executes: `ParseError` while turning
//! CLI tokens into blocks, `ResolutionError` while expanding names against
//! the registry. Execution-time failures are not errors in this sense; they
//! flow through the engine's retry/rescue state machine as `StepOutcome`.

/// Errors produced while tokenizing and grouping the CLI mini-language.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("block closing not found, '{{@' has no matching '}}'")]
    ClosingNotFound,

    #[error("block ending not found, expected '{{/@}}'")]
    EndingNotFound,

    #[error("nesting of blocks is not allowed")]
    NestedBlock,

    #[error("modifier '@{0}' declared twice in one block")]
    DuplicateModifier(String),

    #[error("unknown modifier '@{0}'")]
    UnknownModifier(String),

    #[error("cannot parse block header '{0}'")]
    InvalidHeader(String),

    #[error("unterminated quote in '{0}'")]
    UnterminatedQuote(String),
}

/// Errors produced while resolving grouped calls against the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("task or pipeline '{0}' not found")]
    TaskNotFound(String),

    #[error("a block cannot declare both @rescue and @error")]
    ConflictingHandlers,

    #[error("pipeline nesting exceeds {0} levels")]
    DepthExceeded(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_messages() {
        assert_eq!(
            ParseError::NestedBlock.to_string(),
            "nesting of blocks is not allowed"
        );
        assert_eq!(
            ParseError::UnknownModifier("retyr".into()).to_string(),
            "unknown modifier '@retyr'"
        );
    }

    #[test]
    fn test_resolution_error_messages() {
        assert_eq!(
            ResolutionError::TaskNotFound(":missing".into()).to_string(),
            "task or pipeline ':missing' not found"
        );
    }
}

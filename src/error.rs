use thiserror::Error;

use crate::LLMError;

/// everything that can go wrong while driving a turn or a purchase.
///
/// cloneable so a failure can ride inside a fragment's state and reach every
/// observer of that fragment.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversationError {
    #[error("model request failed: {0}")]
    Model(String),
    #[error("model stream failed: {0}")]
    Stream(String),
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments for `{tool}`: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("invalid purchase: {0}")]
    InvalidPurchase(String),
    #[error("fragment already finalized")]
    AlreadyDone,
    #[error("finalize may only append history entries")]
    HistoryRewrite,
    #[error("producer dropped before the fragment settled")]
    Abandoned,
    #[error("provider construction failed: {0}")]
    Provider(String),
}

impl From<LLMError> for ConversationError {
    fn from(err: LLMError) -> Self {
        Self::Model(err.to_string())
    }
}

impl ConversationError {
    pub(crate) fn invalid_arguments(tool: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            reason: reason.to_string(),
        }
    }
}

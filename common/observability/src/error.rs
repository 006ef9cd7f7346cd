use thiserror::Error;

#[derive(Debug, Error)]
pub enum AspectError {
    /// A configuration value failed validation. Nothing was applied.
    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: String, reason: String },

    /// Valid settings could not be put into effect.
    #[error("failed to apply settings: {0}")]
    Apply(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AspectError {
    pub fn invalid(key: impl Into<String>, reason: impl ToString) -> Self {
        AspectError::Invalid {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn result_label(&self) -> &'static str {
        match self {
            AspectError::Invalid { .. } => "invalid",
            AspectError::Apply(_) | AspectError::Io(_) => "failed",
        }
    }
}

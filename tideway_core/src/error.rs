use std::error::Error as StdError;
use std::time::Duration;

/// Common error type for `tideway_core`.
///
/// External collaborators (query engines, cache providers) should preserve the
/// underlying error chain where possible via `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A mapping or query expression is structurally invalid. Surfaced at
    /// build time, fatal to the mapping that carries it.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A compiled expression raised against one item. Recovered locally: the
    /// field resolves to null and the batch continues.
    #[error("evaluation of '{field}' failed: {message}")]
    Evaluation { field: String, message: String },

    /// The retry budget ran out before an attempt succeeded. Carries every
    /// intermediate error observed across attempts.
    #[error("retry budget of {timeout:?} exhausted after {attempts} attempts ({} errors)", errors.len())]
    RetryTimeout {
        timeout: Duration,
        attempts: usize,
        errors: Vec<Error>,
    },

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    pub fn backend(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn evaluation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Evaluation {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

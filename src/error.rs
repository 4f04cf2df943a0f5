use thiserror::Error;

/// The outcome of a single guarded load that did not produce a value.
///
/// `Cancelled` and `DeadlineExceeded` are scoped to the one caller whose
/// [`RequestContext`](crate::RequestContext) ended; the batch it joined
/// carries on for everyone else. `Fetch` is the batch function's error,
/// handed identically to every waiter of the failed batch.
///
/// A key the batch function simply did not return is *not* an error: the
/// caller receives the value type's default instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError<E> {
    #[error("load cancelled by the caller")]
    Cancelled,

    #[error("load deadline exceeded")]
    DeadlineExceeded,

    #[error("batch fetch failed: {0}")]
    Fetch(E),
}

impl<E> LoadError<E> {
    /// True for the caller-scoped outcomes (cancellation and deadline).
    pub fn is_caller_abort(&self) -> bool {
        matches!(self, LoadError::Cancelled | LoadError::DeadlineExceeded)
    }

    /// The batch function's error, if this was a batch failure.
    pub fn fetch_error(&self) -> Option<&E> {
        match self {
            LoadError::Fetch(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse loader config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid loader config `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

use thiserror::Error;

/// Errors produced by the replicated text engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Update bytes could not be decoded.
    ///
    /// The update must be dropped as a whole; callers disconnect the
    /// sender or request a resync.
    #[error("malformed update: {0}")]
    MalformedUpdate(String),

    /// An update could not be serialized into a frame.
    #[error("failed to encode update: {0}")]
    Encode(String),
}

impl CoreError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedUpdate(reason.into())
    }
}

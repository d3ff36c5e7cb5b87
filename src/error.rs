use thiserror::Error;

/// Failures surfaced by the document store and the code allocator.
///
/// `DuplicateCode` is the only variant the create flow recovers from on its
/// own (by allocating a fresh code and retrying the insert); everything else
/// propagates unchanged to the HTTP layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("short code {0} is already taken")]
    DuplicateCode(String),

    #[error("no document with code {0}")]
    NotFound(String),

    #[error("could not allocate a free short code after {0} attempts")]
    AllocationExhausted(u32),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<libsql::Error> for StoreError {
    fn from(error: libsql::Error) -> Self {
        StoreError::Unavailable(error.to_string())
    }
}

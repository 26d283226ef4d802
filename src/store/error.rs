use thiserror::Error;

/// Typed failures surfaced by the storage core.
///
/// Only these reach collaborators; advisory diagnostics are logged and
/// never alter control flow.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("mailbox has an invalid format")]
    BadFormat,

    #[error("operation is not supported on mailbox")]
    NotSupported,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("quota root does not exist")]
    QuotaRootNonexistent,

    #[error("mailbox is locked by POP")]
    PopLocked,

    #[error("mailbox does not exist")]
    MailboxNonexistent,

    #[error("mailbox path too long")]
    PathTooLong,

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Build an [StoreError::Io] from anything displayable.
    pub fn io<E: std::fmt::Display>(context: &str, err: E) -> Self {
        StoreError::Io(format!("{}: {}", context, err))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

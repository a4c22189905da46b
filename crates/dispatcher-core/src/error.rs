//! The error taxonomy a worker classifies every job failure into before
//! writing a terminal `failed` status.

use thiserror::Error;

/// The kind half of `error_message`. Stored as the `<KIND>: <detail>` prefix
/// so `list`/`get` callers can match on it without parsing prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    DbConnect,
    DbExecute,
    ExportFormat,
    ExportIo,
    SshAuth,
    SshConnect,
    SshTransfer,
    Timeout,
    Canceled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::DbConnect => "DB_CONNECT",
            ErrorKind::DbExecute => "DB_EXECUTE",
            ErrorKind::ExportFormat => "EXPORT_FORMAT",
            ErrorKind::ExportIo => "EXPORT_IO",
            ErrorKind::SshAuth => "SSH_AUTH",
            ErrorKind::SshConnect => "SSH_CONNECT",
            ErrorKind::SshTransfer => "SSH_TRANSFER",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Canceled => "CANCELED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// Implemented by every leaf error type (query runner, exporter, transfer
/// agent) so the dispatcher worker can fold them into a classified
/// `error_message` without knowing their concrete type.
pub trait Categorizable {
    fn kind(&self) -> ErrorKind;

    /// A short, credential-free description safe to persist and log.
    fn redacted_message(&self) -> String;

    /// The `<KIND>: <detail>` string written to `Job::error_message`.
    fn classified_message(&self) -> String {
        format!("{}: {}", self.kind().as_str(), self.redacted_message())
    }
}

/// Crate-wide error type for the dispatcher itself (admission, store
/// transitions, recovery). Leaf crates define their own narrow error enums
/// and implement [`Categorizable`] directly; this type is what the worker
/// folds everything into at the job boundary.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("VALIDATION: {0}")]
    Validation(String),

    #[error("DB_CONNECT: {0}")]
    DbConnect(String),

    #[error("DB_EXECUTE: {0}")]
    DbExecute(String),

    #[error("EXPORT_FORMAT: {0}")]
    ExportFormat(String),

    #[error("EXPORT_IO: {0}")]
    ExportIo(String),

    #[error("SSH_AUTH: {0}")]
    SshAuth(String),

    #[error("SSH_CONNECT: {0}")]
    SshConnect(String),

    #[error("SSH_TRANSFER: {0}")]
    SshTransfer(String),

    #[error("TIMEOUT: job exceeded its wall-clock budget")]
    Timeout,

    #[error("CANCELED: {0}")]
    Canceled(String),

    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl Categorizable for DispatchError {
    fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Validation(_) => ErrorKind::Validation,
            DispatchError::DbConnect(_) => ErrorKind::DbConnect,
            DispatchError::DbExecute(_) => ErrorKind::DbExecute,
            DispatchError::ExportFormat(_) => ErrorKind::ExportFormat,
            DispatchError::ExportIo(_) => ErrorKind::ExportIo,
            DispatchError::SshAuth(_) => ErrorKind::SshAuth,
            DispatchError::SshConnect(_) => ErrorKind::SshConnect,
            DispatchError::SshTransfer(_) => ErrorKind::SshTransfer,
            DispatchError::Timeout => ErrorKind::Timeout,
            DispatchError::Canceled(_) => ErrorKind::Canceled,
            DispatchError::Internal(_) => ErrorKind::Internal,
        }
    }

    fn redacted_message(&self) -> String {
        match self {
            DispatchError::Validation(m)
            | DispatchError::DbConnect(m)
            | DispatchError::DbExecute(m)
            | DispatchError::ExportFormat(m)
            | DispatchError::ExportIo(m)
            | DispatchError::SshAuth(m)
            | DispatchError::SshConnect(m)
            | DispatchError::SshTransfer(m)
            | DispatchError::Canceled(m)
            | DispatchError::Internal(m) => m.clone(),
            DispatchError::Timeout => "exceeded wall-clock budget".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classified_message_has_kind_prefix() {
        let e = DispatchError::SshConnect("connection refused".into());
        assert_eq!(e.classified_message(), "SSH_CONNECT: connection refused");
    }
}

use thiserror::Error;

/// The single error type the core sync engine exposes.
///
/// Mirrors the embedded CRDT engine's own `LoroError`/`LoroResult` split:
/// one enum, one alias, short messages.
#[derive(Error, Debug)]
pub enum PlutusError {
    /// A wire envelope or replica update blob could not be parsed.
    #[error("decode error: {0}")]
    Decode(String),

    /// A value written through a [`crate::namespace::Namespace`] is outside
    /// the supported recursive shape, or the underlying write failed.
    #[error("value error: {0}")]
    Value(String),

    /// The transport was already closed when the caller tried to use it.
    #[error("transport is closed")]
    Closed,

    /// The transport's connection failed or was terminated by the remote.
    #[error("connection error: {0}")]
    Connection(String),

    /// A deadline passed before the operation completed.
    #[error("operation timed out")]
    Timeout,

    /// Admission to the hub was refused (bad or missing credentials).
    #[error("authentication error: {0}")]
    Auth(String),

    /// Event-log file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// `Result` alias for fallible core operations.
pub type PlutusResult<T> = Result<T, PlutusError>;

//! Error types surfaced to the embedding application.

use thiserror::Error;

/// Error type returned from client construction and lookup.
///
/// Nothing on the request ingestion path ever returns an error; internal
/// failures there are logged and swallowed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ApitallyError {
    /// Configured client id is not a valid version 4 UUID.
    #[error("invalid client id: {0:?}")]
    InvalidClientId(String),
    /// Configured environment name is empty, too long or contains invalid characters.
    #[error("invalid environment name: {0:?}")]
    InvalidEnv(String),
    /// A client instance already exists in this process.
    #[error("client is already initialized")]
    AlreadyInitialized,
    /// No client instance exists in this process.
    #[error("client is not initialized")]
    NotInitialized,
    /// The HTTP transport could not be initialized.
    #[error("failed to initialize HTTP transport: {0}")]
    Transport(String),
}

//! Client errors.

use sockio_transport::TransportError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced synchronously by the client API.
///
/// Everything that happens on the connection itself is reported through
/// listeners instead.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The target URL cannot be used.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The transport rejected a request.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The client task has shut down.
    #[error("Client is shut down")]
    Shutdown,
}

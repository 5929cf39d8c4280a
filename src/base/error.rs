//! Error taxonomy of the digest core.

use thiserror::Error;

use super::types::ServerId;

/// Errors surfaced by the configuration store, the producer and the command layer.
#[derive(Debug, Error)]
pub enum DigestError {
    /// Bad user input to a command. Reported back to the issuer.
    #[error("{0}")]
    Validation(String),
    /// The operation referenced an unknown server.
    #[error("Server `{0}` has no configuration.")]
    NotFound(ServerId),
    /// Render or send failure during a digest cycle.
    #[error("Digest production failed for server `{server_id}`: {cause:#}")]
    Production { server_id: ServerId, cause: anyhow::Error },
    /// The configuration could not be written durably.
    #[error("Failed to persist configuration: {0:#}")]
    Persistence(anyhow::Error),
}

impl DigestError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn production(server_id: &str, cause: impl Into<anyhow::Error>) -> Self {
        Self::Production {
            server_id: server_id.to_string(),
            cause: cause.into(),
        }
    }
}

pub type DigestResult<T> = Result<T, DigestError>;

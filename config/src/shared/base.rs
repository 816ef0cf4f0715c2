use thiserror::Error;

/// Errors that can occur during configuration validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,

    /// The change source configuration is invalid.
    #[error("Invalid source configuration: {0}")]
    InvalidSource(String),

    /// The destination configuration is invalid.
    #[error("Invalid destination configuration: {0}")]
    InvalidDestination(String),

    /// The pipeline configuration is invalid.
    #[error("Invalid pipeline configuration: {0}")]
    InvalidPipeline(String),
}

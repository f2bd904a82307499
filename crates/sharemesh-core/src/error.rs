//! Error types for sharemesh core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Public key is not base64 or not a compressed P-256 point
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Signature is not base64 or not a P-256 ECDSA signature
    #[error("invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),

    /// Signature does not verify for the given key and body
    #[error("signature does not verify")]
    InvalidSignature,
}

impl Error {
    /// Whether this error rejects a submission's credentials.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Error::InvalidPublicKey(_) | Error::InvalidSignatureEncoding(_) | Error::InvalidSignature
        )
    }
}

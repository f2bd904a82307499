//! Signature authentication at ingress
//!
//! A client submits a body together with its compressed P-256 public key and
//! an ECDSA signature over `SHA-256(body)`, both base64 encoded. Verification
//! runs over the exact bytes received, never over a re-serialized record.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};

/// Length of a SEC1 compressed P-256 point.
pub const COMPRESSED_KEY_LEN: usize = 33;

/// An authenticated submitter key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    key: VerifyingKey,
    encoded: String,
}

impl PublicKey {
    /// Decode a base64 SEC1 compressed public key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
        if bytes.len() != COMPRESSED_KEY_LEN {
            return Err(Error::InvalidPublicKey(format!(
                "expected {COMPRESSED_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let key = VerifyingKey::from_sec1_bytes(&bytes)
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
        Ok(Self {
            key,
            encoded: STANDARD.encode(&bytes),
        })
    }

    /// Canonical base64 form, as stored in `SharedRecord::public_key`.
    pub fn as_base64(&self) -> &str {
        &self.encoded
    }

    /// Verify a base64 signature over `SHA-256(message)`.
    pub fn verify(&self, message: &[u8], signature_b64: &str) -> Result<()> {
        let signature = decode_signature(signature_b64)?;
        let digest = Sha256::digest(message);
        self.key
            .verify_prehash(&digest, &signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

/// Authenticate a submission: decode the key and verify the signature over
/// the raw body.
pub fn authenticate(raw_body: &[u8], public_key_b64: &str, signature_b64: &str) -> Result<PublicKey> {
    let key = PublicKey::from_base64(public_key_b64)?;
    key.verify(raw_body, signature_b64)?;
    Ok(key)
}

/// Fixed-width `r || s` first, DER as fallback.
fn decode_signature(encoded: &str) -> Result<Signature> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidSignatureEncoding(e.to_string()))?;
    Signature::from_slice(&bytes)
        .or_else(|_| Signature::from_der(&bytes))
        .map_err(|e| Error::InvalidSignatureEncoding(e.to_string()))
}

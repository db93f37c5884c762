//! # Signing Primitives
//!
//! Domain-separated Ed25519 signing shared by the token issuer and verifier.
//!
//! Every signed payload in capsync is prefixed with a unique domain string
//! before signing, so a signature produced for one purpose (for example the
//! read-identity half of a token) can never be replayed as another (the
//! write-authority half).

use ed25519_dalek::{Signature, VerifyingKey};

use crate::keys::{Identity, Keypair};

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Domain prefix for the read-identity signature inside an auth token.
pub const TOKEN_SIGNATURE_DOMAIN: &[u8] = b"capsync-token-v1:";

/// Domain prefix for the write-authority signature inside an auth token.
pub const TOKEN_WRITE_SIGNATURE_DOMAIN: &[u8] = b"capsync-token-write-v1:";

/// Sign `data` with `keypair` after prepending `domain`.
///
/// Returns the 64-byte Ed25519 signature as a `Vec<u8>`.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.sign(&prefixed(domain, data)).to_bytes().to_vec()
}

/// Verify a signature produced by [`sign_with_domain`].
pub fn verify_with_domain(
    identity: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(identity.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify_strict(&prefixed(domain, data), &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

fn prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(domain.len() + data.len());
    out.extend_from_slice(domain);
    out.extend_from_slice(data);
    out
}

//! # Authentication Tokens
//!
//! An [`AuthToken`] proves to other peers that a network node legitimately
//! holds the read secret (and optionally the write secret) of a document,
//! without revealing either secret.
//!
//! ## Binding
//!
//! The read-identity key signs
//! `TOKEN_SIGNATURE_DOMAIN || pad || node || document || write_authority?`.
//! When write authority is present, the write key additionally signs
//! `TOKEN_WRITE_SIGNATURE_DOMAIN || pad || node`.
//!
//! Binding the pad identifier stops a captured token from being replayed
//! against another document; binding the node identity stops it from being
//! presented by another network peer. Ed25519 signatures are deterministic,
//! so the same inputs always produce the same token.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{
    SignatureError, TOKEN_SIGNATURE_DOMAIN, TOKEN_WRITE_SIGNATURE_DOMAIN, sign_with_domain,
    verify_with_domain,
};
use crate::error::AccessError;
use crate::keys::{Identity, KeyBundle, PadIdentifier};

/// Capability level proven by a token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessLevel {
    Read,
    Write,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    /// Network identity the token is bound to.
    pub node: Identity,
    /// Public identity derived from the read secret.
    pub document: Identity,
    pub pad: PadIdentifier,
    /// Public half of the write-authority key, if the issuer holds it.
    pub write_authority: Option<Identity>,
    pub signature: Vec<u8>,
    pub write_signature: Option<Vec<u8>>,
}

/// Reason a token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    WrongPad,
    WrongNode,
    WrongDocument,
    MissingWriteSignature,
    Signature(SignatureError),
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WrongPad => write!(f, "token is bound to a different pad"),
            Self::WrongNode => write!(f, "token is bound to a different network identity"),
            Self::WrongDocument => write!(f, "token carries a different document identity"),
            Self::MissingWriteSignature => write!(f, "write authority claimed without signature"),
            Self::Signature(e) => write!(f, "token signature invalid: {}", e),
        }
    }
}

impl std::error::Error for TokenError {}

impl From<SignatureError> for TokenError {
    fn from(e: SignatureError) -> Self {
        Self::Signature(e)
    }
}

/// Issue a token binding `node` to the document described by `keys`.
///
/// # Errors
/// `AccessError::KeyUnavailable` if `keys` is `None`.
pub fn issue(node: Identity, keys: Option<&KeyBundle>) -> Result<AuthToken, AccessError> {
    let keys = keys.ok_or(AccessError::KeyUnavailable)?;
    let pad = keys.pad_identifier();
    let document = keys.public_identity();
    let write_authority = keys.write_authority().map(|kp| kp.identity());

    let payload = build_signed_payload(&pad, &node, &document, write_authority.as_ref());
    let signature = sign_with_domain(keys.identity_keypair(), TOKEN_SIGNATURE_DOMAIN, &payload);
    let write_signature = keys.write_authority().map(|kp| {
        sign_with_domain(kp, TOKEN_WRITE_SIGNATURE_DOMAIN, &build_write_payload(&pad, &node))
    });

    debug!(node = ?node, pad = ?pad, write = write_authority.is_some(), "issued auth token");

    Ok(AuthToken {
        node,
        document,
        pad,
        write_authority,
        signature,
        write_signature,
    })
}

impl AuthToken {
    /// Verify a token presented by network peer `presenter`.
    ///
    /// `keys` is the verifier's own bundle. `AccessLevel::Write` is reported
    /// only when the verifier itself knows the write-authority key and the
    /// token proves possession of it; a read-only verifier cannot confirm a
    /// write claim and reports `Read`.
    pub fn verify(&self, keys: &KeyBundle, presenter: &Identity) -> Result<AccessLevel, TokenError> {
        if self.pad != keys.pad_identifier() {
            return Err(TokenError::WrongPad);
        }
        if &self.node != presenter {
            return Err(TokenError::WrongNode);
        }
        if self.document != keys.public_identity() {
            return Err(TokenError::WrongDocument);
        }

        let payload = build_signed_payload(&self.pad, &self.node, &self.document, self.write_authority.as_ref());
        verify_with_domain(&self.document, TOKEN_SIGNATURE_DOMAIN, &payload, &self.signature)?;

        let Some(claimed) = self.write_authority else {
            return Ok(AccessLevel::Read);
        };
        let signature = self
            .write_signature
            .as_deref()
            .ok_or(TokenError::MissingWriteSignature)?;
        verify_with_domain(&claimed, TOKEN_WRITE_SIGNATURE_DOMAIN, &build_write_payload(&self.pad, &self.node), signature)?;

        match keys.write_authority() {
            Some(ours) if ours.identity() == claimed => Ok(AccessLevel::Write),
            _ => Ok(AccessLevel::Read),
        }
    }
}

fn build_signed_payload(
    pad: &PadIdentifier,
    node: &Identity,
    document: &Identity,
    write_authority: Option<&Identity>,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 * 4 + 1);
    payload.extend_from_slice(pad.as_bytes());
    payload.extend_from_slice(node.as_bytes());
    payload.extend_from_slice(document.as_bytes());
    match write_authority {
        Some(write) => {
            payload.push(1);
            payload.extend_from_slice(write.as_bytes());
        }
        None => payload.push(0),
    }
    payload
}

fn build_write_payload(pad: &PadIdentifier, node: &Identity) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(pad.as_bytes());
    payload.extend_from_slice(node.as_bytes());
    payload
}

//! # Key Derivation
//!
//! Turns the base-58 encoded document secrets into a [`KeyBundle`]:
//!
//! - [`Keypair`]: Ed25519 signing keypair seeded from a 32-byte secret
//! - [`Identity`]: 32-byte Ed25519 public key
//! - [`PadIdentifier`]: one-way discovery identifier for the document
//! - [`SymmetricKey`]: 32-byte content key derived from the read secret
//!
//! ## Derivation Model
//!
//! | Input | Output |
//! |-------|--------|
//! | read secret (32 bytes) | identity keypair, symmetric key, pad identifier |
//! | write secret (32 bytes, optional) | write-authority keypair |
//!
//! Derivation is deterministic: every peer holding the same read secret
//! arrives at the same public identity and the same pad identifier without
//! any registration step.
//!
//! ## Security Invariants
//!
//! - K1: `pad_identifier = BLAKE3(BLAKE3(read))`; the raw secret never leaves
//!   this module through the discovery path
//! - K2: a bundle without write authority stays read-only for its lifetime
//! - K3: `Debug` output never contains secret material

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{AccessError, SecretKind};

/// Length in bytes of every decoded secret.
pub const SECRET_LEN: usize = 32;

/// Context string for the symmetric key derivation (BLAKE3 KDF mode).
const SYMMETRIC_KEY_CONTEXT: &str = "capsync symmetric key v1";

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministically build a keypair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; SECRET_LEN]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key used both for network nodes and document identities.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// One-way identifier peers rendezvous under.
///
/// Computed as `BLAKE3(BLAKE3(read_secret))`. Only this value is ever handed
/// to the discovery collaborator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PadIdentifier([u8; 32]);

impl PadIdentifier {
    pub fn from_secret(read_secret: &[u8]) -> Self {
        let inner = blake3::hash(read_secret);
        Self(*blake3::hash(inner.as_bytes()).as_bytes())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PadIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PadIdentifier({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PadIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Base-58 form suitable for embedding in a shareable link.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Key material for one document, owned by the local peer for its lifetime.
#[derive(Clone)]
pub struct KeyBundle {
    identity: Keypair,
    write_authority: Option<Keypair>,
    symmetric_key: SymmetricKey,
    pad: PadIdentifier,
}

impl KeyBundle {
    pub fn public_identity(&self) -> Identity {
        self.identity.identity()
    }

    /// The private identity keypair shared by every holder of the read secret.
    pub fn identity_keypair(&self) -> &Keypair {
        &self.identity
    }

    pub fn write_authority(&self) -> Option<&Keypair> {
        self.write_authority.as_ref()
    }

    /// Whether this bundle may administer capabilities.
    pub fn can_write(&self) -> bool {
        self.write_authority.is_some()
    }

    pub fn symmetric_key(&self) -> &SymmetricKey {
        &self.symmetric_key
    }

    pub fn pad_identifier(&self) -> PadIdentifier {
        self.pad
    }
}

impl std::fmt::Debug for KeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBundle")
            .field("public_identity", &self.public_identity())
            .field("write_authority", &self.write_authority.as_ref().map(Keypair::identity))
            .field("pad", &self.pad)
            .finish_non_exhaustive()
    }
}

/// Derive a [`KeyBundle`] from the encoded read secret and optional write secret.
///
/// # Errors
/// `AccessError::MalformedKey` if either secret is not valid base-58 or does not
/// decode to exactly [`SECRET_LEN`] bytes.
pub fn derive(read_secret: &str, write_secret: Option<&str>) -> Result<KeyBundle, AccessError> {
    let read = decode_secret(read_secret, SecretKind::Read)?;
    let write_authority = write_secret
        .map(|encoded| decode_secret(encoded, SecretKind::Write))
        .transpose()?
        .map(|seed| Keypair::from_seed(&seed));

    Ok(KeyBundle {
        identity: Keypair::from_seed(&read),
        write_authority,
        symmetric_key: SymmetricKey(blake3::derive_key(SYMMETRIC_KEY_CONTEXT, &read)),
        pad: PadIdentifier::from_secret(&read),
    })
}

/// Decode a base-58 secret into its raw 32 bytes.
pub fn decode_secret(encoded: &str, kind: SecretKind) -> Result<[u8; SECRET_LEN], AccessError> {
    let bytes = bs58::decode(encoded.trim())
        .into_vec()
        .map_err(|e| AccessError::MalformedKey {
            kind,
            reason: e.to_string(),
        })?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| AccessError::MalformedKey {
        kind,
        reason: format!("expected {} bytes, got {}", SECRET_LEN, len),
    })
}

/// Produce a fresh random symmetric key, unrelated to any existing key.
pub fn generate_symmetrical_key() -> SymmetricKey {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    SymmetricKey(bytes)
}

/// Produce a fresh base-58 encoded secret usable as a read or write secret.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);
    bs58::encode(bytes).into_string()
}

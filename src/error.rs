//! Error taxonomy for capability synchronization.
//!
//! | Variant | Severity | Handling |
//! |---------|----------|----------|
//! | `MalformedKey` | fatal at startup | not retried |
//! | `KeyUnavailable` | ordering bug | fatal |
//! | `Forbidden` | recoverable | rejected locally, never reaches the replicated map |
//! | `Transport` | non-fatal | forwarded as a backend error event |
//! | `DialFailure` | non-fatal | logged, peer may be rediscovered |

/// Which secret a [`AccessError::MalformedKey`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    Read,
    Write,
}

impl std::fmt::Display for SecretKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecretKind::Read => write!(f, "read"),
            SecretKind::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// A secret failed to decode or has the wrong length.
    MalformedKey { kind: SecretKind, reason: String },
    /// A token was requested before key derivation completed.
    KeyUnavailable,
    /// Grant or revoke attempted without write authority.
    Forbidden,
    /// Error surfaced by the network transport.
    Transport(String),
    /// A discovered peer could not be dialed.
    DialFailure { peer: String, reason: String },
}

impl std::fmt::Display for AccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedKey { kind, reason } => write!(f, "malformed {} key: {}", kind, reason),
            Self::KeyUnavailable => write!(f, "keys are not available yet"),
            Self::Forbidden => write!(f, "write authority required to change capabilities"),
            Self::Transport(reason) => write!(f, "transport error: {}", reason),
            Self::DialFailure { peer, reason } => write!(f, "failed to dial {}: {}", peer, reason),
        }
    }
}

impl std::error::Error for AccessError {}

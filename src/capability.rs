//! Capability records and the events that carry them.
//!
//! A capability record is an open set of named boolean flags. The well-known
//! names are [`CAN_READ`], [`CAN_WRITE`] and [`CAN_ADMIN`]; any other name is
//! carried through untouched so newer peers can introduce flags without
//! breaking older ones.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::keys::Identity;

pub const CAN_READ: &str = "canRead";
pub const CAN_WRITE: &str = "canWrite";
pub const CAN_ADMIN: &str = "canAdmin";

/// Key of the replicated access map.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Identity> for PeerId {
    fn from(identity: Identity) -> Self {
        Self(identity.to_hex())
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = self.0.get(..16).unwrap_or(&self.0);
        write!(f, "PeerId({})", short)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named boolean permission set for one peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(BTreeMap<String, bool>);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style flag setter.
    pub fn with(mut self, name: impl Into<String>, value: bool) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: bool) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy every flag of `other` over this set.
    pub fn overlay(&mut self, other: &Capabilities) {
        for (name, value) in other.iter() {
            self.0.insert(name.to_string(), value);
        }
    }

    pub fn can_read(&self) -> bool {
        self.get(CAN_READ).unwrap_or(false)
    }

    pub fn can_write(&self) -> bool {
        self.get(CAN_WRITE).unwrap_or(false)
    }

    pub fn can_admin(&self) -> bool {
        self.get(CAN_ADMIN).unwrap_or(false)
    }
}

impl<S: Into<String>> FromIterator<(S, bool)> for Capabilities {
    fn from_iter<I: IntoIterator<Item = (S, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(name, value)| (name.into(), value)).collect())
    }
}

/// Change to local policy emitted by the capability store.
///
/// `capabilities == None` signals full revocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthEvent {
    pub peer: PeerId,
    pub capabilities: Option<Capabilities>,
}

/// Local belief about one peer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PeerState {
    #[default]
    Unknown,
    Granted(Capabilities),
    Revoked,
}

impl PeerState {
    pub fn capabilities(&self) -> Option<&Capabilities> {
        match self {
            PeerState::Granted(caps) => Some(caps),
            PeerState::Unknown | PeerState::Revoked => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_flags_are_preserved() {
        let caps = Capabilities::new()
            .with(CAN_WRITE, true)
            .with("canComment", true);

        let json_like: Vec<_> = caps.iter().collect();
        assert_eq!(json_like, vec![(CAN_WRITE, true), ("canComment", true)]);
        assert!(caps.can_write());
        assert!(!caps.can_read());
        assert_eq!(caps.get("canComment"), Some(true));
    }

    #[test]
    fn overlay_replaces_and_extends() {
        let mut base = Capabilities::new().with(CAN_READ, true).with(CAN_WRITE, true);
        base.overlay(&Capabilities::new().with(CAN_WRITE, false).with(CAN_ADMIN, true));

        assert_eq!(base.get(CAN_READ), Some(true));
        assert_eq!(base.get(CAN_WRITE), Some(false));
        assert_eq!(base.get(CAN_ADMIN), Some(true));
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn only_granted_state_exposes_capabilities() {
        assert!(PeerState::Unknown.capabilities().is_none());
        assert!(PeerState::Revoked.capabilities().is_none());
        let granted = PeerState::Granted(Capabilities::new().with(CAN_READ, true));
        assert!(granted.capabilities().is_some_and(Capabilities::can_read));
    }

    #[test]
    fn peer_id_from_identity_is_hex() {
        let identity = Identity::from_bytes([0xab; 32]);
        assert_eq!(PeerId::from(identity).as_str(), "ab".repeat(32));
    }
}

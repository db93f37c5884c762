//! # capsync - Capability Synchronization for Replicated Documents
//!
//! capsync keeps a per-document access-control map consistent across peers
//! that share a document's secrets:
//!
//! - **Keys**: a base-58 read secret yields the public identity, symmetric key
//!   and pad identifier; an optional write secret yields write authority
//! - **Tokens**: Ed25519-signed, bound to a network identity and a pad
//! - **Capabilities**: named boolean flags per peer, granted and revoked only
//!   by holders of write authority
//! - **Sync**: local grants flow out to a replicated map, remote changes flow
//!   back in, and a peer never re-applies its own echoed writes
//! - **Rendezvous**: peers register the hashed pad identifier and dial each
//!   other on discovery
//!
//! ## Architecture
//!
//! Capability state is owned by a single actor ([`Access`]) that processes
//! local commands and replicated map notifications in order. The network,
//! discovery and replication engine are collaborators behind traits in
//! [`protocols`]; [`memory`] provides in-process implementations of all of
//! them.
//!
//! ## Security Model
//!
//! - The read secret never leaves the peer; only its double hash is registered
//! - Signatures are domain-separated so token signatures cannot be replayed
//!   as write proofs
//! - Write proof only counts if it matches the verifier's own write authority
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `backend` | Startup pipeline and lifecycle for one document |
//! | `access` | Actor owning capability state and its replication |
//! | `keys` | Secret decoding and key derivation |
//! | `token` | Auth token issuance and verification |
//! | `capability` | Peer ids, capability records, peer states |
//! | `store` | Authoritative local capability store |
//! | `bridge` | Two-way sync between the store and the replicated map |
//! | `rendezvous` | Pad registration and deduplicated dialing |
//! | `protocols` | Collaborator traits |
//! | `memory` | In-process collaborator implementations |
//! | `crypto` | Domain-separated signatures |
//! | `messages` | Bounded wire encoding for tokens |

mod access;
mod backend;
mod bridge;
mod capability;
mod crypto;
mod error;
mod keys;
mod messages;
pub mod memory;
pub mod protocols;
mod rendezvous;
mod store;
mod token;

pub use access::{Access, AccessUpdate};
pub use backend::{Backend, BackendConfig, BackendEvent, BackendOptions, LIFECYCLE_RESERVE};
pub use bridge::{OutboundWrites, ReplicatedAccessBridge};
pub use capability::{AuthEvent, CAN_ADMIN, CAN_READ, CAN_WRITE, Capabilities, PeerId, PeerState};
pub use crypto::SignatureError;
pub use error::{AccessError, SecretKind};
pub use keys::{
    Identity, KeyBundle, Keypair, PadIdentifier, SymmetricKey, derive, generate_secret,
    generate_symmetrical_key,
};
pub use messages::{decode_token, encode_token};
pub use rendezvous::RendezvousConfig;
pub use store::CapabilityStore;
pub use token::{AccessLevel, AuthToken, TokenError, issue};

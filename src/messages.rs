//! # Wire Encoding
//!
//! Tokens cross the network as bincode. Decoding always goes through
//! [`deserialize_bounded`] so a hostile peer cannot make us allocate more
//! than [`MAX_TOKEN_SIZE`] bytes.

use bincode::Options;
use serde::de::DeserializeOwned;

use crate::token::AuthToken;

/// Upper bound on an encoded token. A token is four 32-byte keys, two
/// 64-byte signatures and framing, well under this limit.
pub const MAX_TOKEN_SIZE: u64 = 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_TOKEN_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn encode_token(token: &AuthToken) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(token)
}

pub fn decode_token(bytes: &[u8]) -> Result<AuthToken, bincode::Error> {
    deserialize_bounded(bytes)
}

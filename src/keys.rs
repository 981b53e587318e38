//! Federation key sets.

use jsonwebtoken::jwk::{Jwk, JwkSet};
use thiserror::Error;

/// The federation keys an entity uses to sign statements, as published in
/// the `jwks` claim of its entity configuration.
///
/// Keys are looked up by `kid`; keys without a `kid` can still be matched by
/// algorithm family during verification.
#[derive(Debug, Clone, PartialEq)]
pub struct FederationKeys {
    keys: Vec<Jwk>,
}

/// An error that can arise building a [`FederationKeys`] set.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeysError {
    /// There was a problem deserializing bytes into a JSON JWK set.
    #[error("cannot deserialize json jwk set")]
    Deserialize(#[from] serde_json::Error),
}

impl FederationKeys {
    /// Wraps an already-parsed RFC 7517 key set.
    pub fn from_jwk_set(set: JwkSet) -> Self {
        Self { keys: set.keys }
    }

    /// Parses a `FederationKeys` set from bytes holding an RFC 7517 JWKS
    /// document.
    ///
    /// # Errors
    ///
    /// Returns a [`KeysError`] if the bytes are not a valid JWKS document.
    pub fn from_json(jwks: &[u8]) -> Result<Self, KeysError> {
        let set: JwkSet = serde_json::from_slice(jwks)?;
        Ok(Self::from_jwk_set(set))
    }

    /// Returns the key with the given key ID.
    pub fn find(&self, key_id: &str) -> Option<&Jwk> {
        self.keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(key_id))
    }

    /// Iterates over all keys in the set.
    pub fn iter(&self) -> impl Iterator<Item = &Jwk> {
        self.keys.iter()
    }

    /// Returns the number of keys in the set.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

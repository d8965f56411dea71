// Identifiers and key management
//
// Every identifier is 32 bytes. Feed, actor and document ids are ed25519
// public keys; a document id is the feed id of its root actor. Discovery ids
// are a one-way derivation of a feed key, safe to announce on the network.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// Context string for discovery id derivation. Changing it splits the network.
const DISCOVERY_CONTEXT: &str = "meshmerge 2024-05 discovery id v1";

/// Key and identifier errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid identifier encoding: {0}")]
    InvalidEncoding(String),
    #[error("Invalid identifier length: {0} bytes (expected 32)")]
    InvalidLength(usize),
    #[error("Not a valid ed25519 public key")]
    InvalidPublicKey,
    #[error("Invalid secret key bytes")]
    InvalidSecretKey,
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; 32]);

        impl $name {
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
                let array: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
                Ok(Self(array))
            }

            /// Short form for log lines
            pub fn short(&self) -> String {
                let mut s = self.to_string();
                s.truncate(6);
                s
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&bs58::encode(self.0).into_string())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl FromStr for $name {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = bs58::decode(s)
                    .into_vec()
                    .map_err(|e| KeyError::InvalidEncoding(e.to_string()))?;
                Self::from_slice(&bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_string())
                } else {
                    self.0.serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    s.parse().map_err(serde::de::Error::custom)
                } else {
                    <[u8; 32]>::deserialize(deserializer).map(Self)
                }
            }
        }
    };
}

define_id!(
    /// Public key of a feed. An actor is identified by its feed.
    FeedId
);
define_id!(
    /// Document id: the feed id of the document's root actor.
    DocId
);
define_id!(
    /// Identity of a node (repo) on the network.
    PeerId
);
define_id!(
    /// One-way derivation of a feed key, announced instead of the key itself.
    DiscoveryId
);

/// Actors write exactly one feed, so they share its id.
pub type ActorId = FeedId;

/// A repo is identified on the network by its peer id.
pub type RepoId = PeerId;

impl FeedId {
    /// Derive the discovery id announced for this feed.
    pub fn discovery_id(&self) -> DiscoveryId {
        let mut hasher = blake3::Hasher::new_derive_key(DISCOVERY_CONTEXT);
        hasher.update(&self.0);
        DiscoveryId(*hasher.finalize().as_bytes())
    }

    /// Parse the id as an ed25519 key. Ids from peers are untrusted, so this
    /// is the point where garbage gets rejected.
    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| KeyError::InvalidPublicKey)
    }
}

impl From<DocId> for FeedId {
    fn from(id: DocId) -> Self {
        FeedId(id.0)
    }
}

impl From<FeedId> for DocId {
    fn from(id: FeedId) -> Self {
        DocId(id.0)
    }
}

impl DocId {
    pub fn root_actor(&self) -> ActorId {
        FeedId(self.0)
    }
}

/// Key pair owning a feed (or a repo identity)
#[derive(Clone)]
pub struct KeyPair {
    pub signing_key: SigningKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.feed_id())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying_key().to_bytes()
    }

    pub fn feed_id(&self) -> FeedId {
        FeedId(self.public_bytes())
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.public_bytes())
    }

    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }

    /// Secret bytes, wiped on drop
    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing_key.to_bytes().to_vec())
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let mut secret: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        let signing_key = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Ok(Self { signing_key })
    }
}

/// Verify an ed25519 signature made by `key`
pub fn verify(key: &VerifyingKey, data: &[u8], signature: &[u8]) -> bool {
    let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    key.verify(data, &Signature::from_bytes(&bytes)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation_unique() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.feed_id(), b.feed_id());
    }

    #[test]
    fn test_id_string_round_trip() {
        let id = KeyPair::generate().feed_id();
        let parsed: FeedId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_id_rejects_bad_input() {
        assert!(matches!(
            "0OIl".parse::<FeedId>(),
            Err(KeyError::InvalidEncoding(_))
        ));
        let short = bs58::encode([1u8; 8]).into_string();
        assert_eq!(short.parse::<FeedId>(), Err(KeyError::InvalidLength(8)));
    }

    #[test]
    fn test_discovery_id_deterministic_and_distinct() {
        let id = KeyPair::generate().feed_id();
        assert_eq!(id.discovery_id(), id.discovery_id());
        assert_ne!(id.discovery_id().as_bytes(), id.as_bytes());
    }

    #[test]
    fn test_sign_and_verify() {
        let keys = KeyPair::generate();
        let sig = keys.sign(b"block");
        let vk = keys.feed_id().verifying_key().unwrap();
        assert!(verify(&vk, b"block", &sig));
        assert!(!verify(&vk, b"other", &sig));
        assert!(!verify(&vk, b"block", &sig[..10]));
    }

    #[test]
    fn test_secret_round_trip() {
        let keys = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&keys.secret_bytes()).unwrap();
        assert_eq!(keys.feed_id(), restored.feed_id());
        assert_eq!(
            KeyPair::from_secret_bytes(&[0u8; 5]).err(),
            Some(KeyError::InvalidSecretKey)
        );
    }

    #[test]
    fn test_json_uses_base58() {
        let id = KeyPair::generate().feed_id();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: FeedId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_doc_root_actor() {
        let feed = KeyPair::generate().feed_id();
        let doc: DocId = feed.into();
        assert_eq!(doc.root_actor(), feed);
    }
}

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Size of archive, discovery and secret keys in bytes
pub const KEY_SIZE: usize = 32;

/// Context string used when deriving a discovery key from an archive key.
const DISCOVERY_CONTEXT: &[u8] = b"dat-share discovery v1";

/// Errors that can occur during key operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key length, expected 32 bytes, got {0}")]
    InvalidLength(usize),
    #[error("key hex decode error: {0}")]
    InvalidHex(String),
    #[error("invalid signature: {0}")]
    Signature(String),
}

fn decode_key(hex: &str) -> Result<[u8; KEY_SIZE], KeyError> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    if hex.len() != KEY_SIZE * 2 {
        return Err(KeyError::InvalidLength(hex.len() / 2));
    }
    let mut buff = [0; KEY_SIZE];
    hex::decode_to_slice(hex, &mut buff).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
    Ok(buff)
}

macro_rules! hex_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; KEY_SIZE]);

        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self(bytes)
            }

            /// Parse the key from a hexadecimal string
            ///
            /// Accepts both plain hex and "0x"-prefixed hex strings.
            pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
                decode_key(hex).map(Self)
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = KeyError;
            fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
                let buff: [u8; KEY_SIZE] = bytes
                    .try_into()
                    .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
                Ok(Self(buff))
            }
        }

        impl FromStr for $name {
            type Err = KeyError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let hex = String::deserialize(deserializer)?;
                Self::from_hex(&hex).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_key! {
    /// Stable public identifier of an archive's content history.
    ///
    /// This is the verifying half of the archive's ed25519 keypair; every
    /// manifest version is signed by the matching [`ArchiveSecret`].
    ArchiveKey
}

hex_key! {
    /// Network rendezvous identifier for an archive.
    ///
    /// Derived from the [`ArchiveKey`] with a keyed BLAKE3 hash, so peers can
    /// find each other without the archive key ever being announced.
    DiscoveryKey
}

impl ArchiveKey {
    /// Verify a signature produced by the archive's secret.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<(), KeyError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|e| KeyError::Signature(e.to_string()))?;
        let signature =
            Signature::from_slice(signature).map_err(|e| KeyError::Signature(e.to_string()))?;
        verifying_key
            .verify(msg, &signature)
            .map_err(|e| KeyError::Signature(e.to_string()))
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        DiscoveryKey::from(self)
    }
}

impl From<&ArchiveKey> for DiscoveryKey {
    fn from(key: &ArchiveKey) -> Self {
        let hash = blake3::keyed_hash(key.as_bytes(), DISCOVERY_CONTEXT);
        DiscoveryKey(*hash.as_bytes())
    }
}

/// Secret half of an archive's keypair.
///
/// Persisted next to the archive metadata and never sent over the network.
#[derive(Clone)]
pub struct ArchiveSecret(SigningKey);

impl ArchiveSecret {
    /// Generate a new random secret
    pub fn generate() -> Self {
        let bytes: [u8; KEY_SIZE] = rand::random();
        Self(SigningKey::from_bytes(&bytes))
    }

    pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
        decode_key(hex.trim()).map(|bytes| Self(SigningKey::from_bytes(&bytes)))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn archive_key(&self) -> ArchiveKey {
        ArchiveKey(self.0.verifying_key().to_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.0.sign(msg).to_bytes().to_vec()
    }
}

impl fmt::Debug for ArchiveSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ArchiveSecret")
            .field(&self.archive_key())
            .finish()
    }
}
